use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::actuation::DynPort;
use crate::controller::{
    ConfigUpdate, IrrigationController, IrrigationState, MoistureBand, StartCause, StopCause,
    Transition, ZoneId,
};
use crate::error::ControlError;
use crate::sampler::SensorSnapshot;
use crate::scheduler::Clock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub controller: IrrigationController<DynPort>,
    pub snapshot: SensorSnapshot,
    pub events: VecDeque<SystemEvent>,
    clock: Arc<dyn Clock>,
    started_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Irrigation,
    Safety,
    Control,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON responses (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorsResponse {
    #[serde(flatten)]
    pub snapshot: SensorSnapshot,
    pub irrigation_active: bool,
    pub auto_mode: bool,
    pub manual_override: bool,
    pub power_save: bool,
    pub moisture_band: MoistureBand,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    pub auto_mode: bool,
    pub moisture_low_threshold: f32,
    pub moisture_high_threshold: f32,
    pub temp_high_threshold: f32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub sensors: SensorSnapshot,
    pub moisture_band: MoistureBand,
    pub irrigation: IrrigationState,
    pub config: ConfigResponse,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(
        controller: IrrigationController<DynPort>,
        snapshot: SensorSnapshot,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let started_ms = clock.now_ms();
        Self {
            controller,
            snapshot,
            events: VecDeque::with_capacity(MAX_EVENTS),
            clock,
            started_ms,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Replace the current snapshot with a fresh sample.
    pub fn record_reading(&mut self, snapshot: SensorSnapshot) {
        let mean = snapshot
            .mean_moisture()
            .map_or_else(|| "unknown".to_string(), |m| format!("{m:.1}%"));
        let detail = format!(
            "moisture {mean}, temp {:.1}°C{}",
            snapshot.temperature,
            if snapshot.is_raining { ", raining" } else { "" }
        );
        self.snapshot = snapshot;
        self.push_event(EventKind::Reading, detail);
    }

    /// Moisture rule against the current snapshot.
    pub fn run_auto_check(&mut self) {
        let now = self.now_ms();
        if let Some(t) = self.controller.auto_check(&self.snapshot, now) {
            self.record_transition(&t);
        }
    }

    /// Safety rules against the current snapshot.
    pub fn run_safety_tick(&mut self) {
        let now = self.now_ms();
        for t in self.controller.safety_tick(&self.snapshot, now) {
            self.record_transition(&t);
        }
    }

    // -- Control surface ------------------------------------------------------

    pub fn start_zone(&mut self, zone: ZoneId, duration_min: Option<u32>) -> Result<(), ControlError> {
        let now = self.now_ms();
        match self.controller.start_zone(zone, duration_min, now) {
            Ok(t) => {
                self.record_transition(&t);
                Ok(())
            }
            Err(e) => {
                self.record_rejected("start", &e);
                Err(e)
            }
        }
    }

    pub fn stop_all(&mut self) {
        let now = self.now_ms();
        match self.controller.stop_all(now) {
            Some(t) => self.record_transition(&t),
            None => self.push_event(EventKind::Control, "stop requested, already idle".into()),
        }
    }

    pub fn set_config(&mut self, update: ConfigUpdate) -> Result<(), ControlError> {
        match self.controller.set_config(update) {
            Ok(()) => {
                let c = self.config_view();
                self.push_event(
                    EventKind::Control,
                    format!(
                        "config updated: auto {}, moisture {}..{}%, temp high {}°C",
                        c.auto_mode,
                        c.moisture_low_threshold,
                        c.moisture_high_threshold,
                        c.temp_high_threshold
                    ),
                );
                Ok(())
            }
            Err(e) => {
                self.record_rejected("config", &e);
                Err(e)
            }
        }
    }

    /// Log a command that was refused before or by the controller.
    pub fn record_rejected(&mut self, command: &str, err: &ControlError) {
        tracing::warn!(command, "rejected: {err}");
        self.push_event(EventKind::Error, format!("{command} rejected: {err}"));
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    // -- Views ----------------------------------------------------------------

    pub fn sensors_view(&self) -> SensorsResponse {
        let st = self.controller.state();
        SensorsResponse {
            snapshot: self.snapshot.clone(),
            irrigation_active: st.is_irrigating(),
            auto_mode: st.auto_mode,
            manual_override: st.manual_override,
            power_save: st.power_save,
            moisture_band: self.controller.moisture_band(&self.snapshot),
        }
    }

    pub fn config_view(&self) -> ConfigResponse {
        let t = &self.controller.settings().thresholds;
        ConfigResponse {
            auto_mode: self.controller.state().auto_mode,
            moisture_low_threshold: t.moisture_low,
            moisture_high_threshold: t.moisture_high,
            temp_high_threshold: t.temp_high,
        }
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        let now = self.now_ms();
        StatusResponse {
            uptime_secs: now.saturating_sub(self.started_ms) / 1000,
            sensors: self.snapshot.clone(),
            moisture_band: self.controller.moisture_band(&self.snapshot),
            irrigation: self.controller.snapshot(now),
            config: self.config_view(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn record_transition(&mut self, t: &Transition) {
        let kind = match t {
            t if t.is_safety() => EventKind::Safety,
            Transition::Started {
                cause: StartCause::Manual,
                ..
            }
            | Transition::Stopped {
                cause: StopCause::Manual,
                ..
            } => EventKind::Control,
            _ => EventKind::Irrigation,
        };
        self.push_event(kind, t.to_string());
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
