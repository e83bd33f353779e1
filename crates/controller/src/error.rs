//! Errors returned to callers of the control surface.

use thiserror::Error;

/// A rejected control request. The controller state is left untouched
/// whenever one of these is returned.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControlError {
    #[error("unknown zone '{0}'")]
    InvalidZone(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("{0} parameter required")]
    MissingParameter(&'static str),
}

impl ControlError {
    pub(crate) fn invalid_value(msg: impl Into<String>) -> Self {
        Self::InvalidValue(msg.into())
    }
}
