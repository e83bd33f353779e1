//! The irrigation state machine.
//!
//! ```text
//!            ┌──[mean < low, auto]──────────▶ Irrigating ──┐
//!  Idle ◀────┤──[temp > high, dry]──────────▶ Irrigating   ├──[mean > high | planned | ceiling]──▶ Idle
//!            └──[manual start]──────────────▶ ManualOverride ──[stop | planned | ceiling]──────────▶ Idle
//! ```
//!
//! Only one session exists at a time. A manual start during a session adds
//! its zone to that session and never resets the start time, so the hard
//! ceiling always bounds the total watering time.
//!
//! The controller never reads the clock itself; every operation is handed
//! `now_ms` by its caller.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::actuation::ActuationPort;
use crate::config::{Config, Thresholds, HARD_CEILING_MIN};
use crate::error::ControlError;
use crate::sampler::SensorSnapshot;

const MS_PER_MIN: u64 = 60_000;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ZoneId(pub u8);

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ZoneId {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u8>()
            .map(ZoneId)
            .map_err(|_| ControlError::InvalidZone(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub zones: BTreeSet<ZoneId>,
    pub started_ms: u64,
    /// Session length measured from `started_ms`.
    pub planned_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Phase {
    Idle,
    Irrigating(Session),
    ManualOverride(Session),
}

impl Phase {
    pub fn session(&self) -> Option<&Session> {
        match self {
            Phase::Idle => None,
            Phase::Irrigating(s) | Phase::ManualOverride(s) => Some(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneState {
    pub zone_id: ZoneId,
    pub name: String,
    pub active: bool,
    pub duration_min: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IrrigationState {
    pub phase: Phase,
    pub zones: Vec<ZoneState>,
    pub pump_active: bool,
    pub auto_mode: bool,
    pub manual_override: bool,
    pub power_save: bool,
    pub water_used_liters: f32,
}

impl IrrigationState {
    pub fn is_irrigating(&self) -> bool {
        self.phase != Phase::Idle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StartCause {
    LowMoisture,
    HighTemperature,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StopCause {
    MoistureRestored,
    DurationComplete,
    SafetyTimeout,
    Manual,
}

impl fmt::Display for StartCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StartCause::LowMoisture => "low moisture",
            StartCause::HighTemperature => "high temperature",
            StartCause::Manual => "manual",
        })
    }
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopCause::MoistureRestored => "moisture restored",
            StopCause::DurationComplete => "duration complete",
            StopCause::SafetyTimeout => "emergency duration exceeded",
            StopCause::Manual => "manual stop",
        })
    }
}

/// Something the controller did. Returned to the caller for the event log.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Started {
        zones: Vec<ZoneId>,
        duration_min: u32,
        cause: StartCause,
    },
    Stopped {
        cause: StopCause,
        elapsed_ms: u64,
    },
    PowerSave(bool),
}

impl Transition {
    /// Raised by a safety rule rather than by moisture or an operator.
    pub fn is_safety(&self) -> bool {
        matches!(
            self,
            Transition::Started {
                cause: StartCause::HighTemperature,
                ..
            } | Transition::Stopped {
                cause: StopCause::SafetyTimeout,
                ..
            } | Transition::PowerSave(_)
        )
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Started {
                zones,
                duration_min,
                cause,
            } => {
                let zones: Vec<String> = zones.iter().map(ToString::to_string).collect();
                write!(
                    f,
                    "irrigation started zone {} for {duration_min} min ({cause})",
                    zones.join(",")
                )
            }
            Transition::Stopped { cause, elapsed_ms } => {
                write!(f, "irrigation stopped after {} s ({cause})", elapsed_ms / 1000)
            }
            Transition::PowerSave(true) => f.write_str("battery critical, power save on"),
            Transition::PowerSave(false) => f.write_str("battery recovered, power save off"),
        }
    }
}

/// Mean moisture relative to the thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MoistureBand {
    Low,
    Optimal,
    High,
    Unknown,
}

/// Fields a control request may change. `None` keeps the current value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ConfigUpdate {
    pub auto_mode: Option<bool>,
    pub moisture_low: Option<f32>,
    pub moisture_high: Option<f32>,
    pub temp_high: Option<f32>,
}

/// The decision parameters, derived from a validated [`Config`].
#[derive(Debug, Clone, PartialEq)]
pub struct ControlSettings {
    pub thresholds: Thresholds,
    pub auto_zone: ZoneId,
    pub default_duration_min: u32,
    pub max_duration_min: u32,
    pub flow_lpm: f32,
    pub release_override_on_timeout: bool,
}

impl ControlSettings {
    pub fn from_config(cfg: &Config) -> Self {
        let irr = &cfg.irrigation;
        Self {
            thresholds: cfg.thresholds,
            auto_zone: ZoneId(irr.auto_zone),
            default_duration_min: irr.default_duration_min,
            max_duration_min: irr.max_duration_min.min(HARD_CEILING_MIN),
            flow_lpm: irr.flow_lpm,
            release_override_on_timeout: irr.release_override_on_timeout,
        }
    }

    fn ceiling_ms(&self) -> u64 {
        u64::from(self.max_duration_min) * MS_PER_MIN
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct IrrigationController<P> {
    settings: ControlSettings,
    state: IrrigationState,
    port: P,
}

impl<P: ActuationPort> IrrigationController<P> {
    pub fn new(cfg: &Config, port: P) -> Self {
        let settings = ControlSettings::from_config(cfg);
        let zones = cfg
            .zones
            .iter()
            .map(|z| ZoneState {
                zone_id: ZoneId(z.zone_id),
                name: z.name.clone(),
                active: false,
                duration_min: settings.default_duration_min,
            })
            .collect();

        Self {
            state: IrrigationState {
                phase: Phase::Idle,
                zones,
                pump_active: false,
                auto_mode: cfg.irrigation.auto_mode,
                manual_override: false,
                power_save: false,
                water_used_liters: 0.0,
            },
            settings,
            port,
        }
    }

    /// Current state. `water_used_liters` only counts finished sessions;
    /// see [`Self::snapshot`] for the live figure.
    pub fn state(&self) -> &IrrigationState {
        &self.state
    }

    /// Copy of the state with the running session's water included.
    pub fn snapshot(&self, now_ms: u64) -> IrrigationState {
        let mut st = self.state.clone();
        st.water_used_liters = self.water_used_liters(now_ms);
        st
    }

    pub fn settings(&self) -> &ControlSettings {
        &self.settings
    }

    #[cfg(test)]
    pub(crate) fn port(&self) -> &P {
        &self.port
    }

    pub fn moisture_band(&self, snap: &SensorSnapshot) -> MoistureBand {
        let t = &self.settings.thresholds;
        match snap.mean_moisture() {
            None => MoistureBand::Unknown,
            Some(m) if m < t.moisture_low => MoistureBand::Low,
            Some(m) if m > t.moisture_high => MoistureBand::High,
            Some(_) => MoistureBand::Optimal,
        }
    }

    /// Litres used so far, including the share of a running session.
    pub fn water_used_liters(&self, now_ms: u64) -> f32 {
        let running = self
            .state
            .phase
            .session()
            .map_or(0.0, |s| self.session_water(s, now_ms));
        self.state.water_used_liters + running
    }

    fn session_water(&self, s: &Session, now_ms: u64) -> f32 {
        let elapsed_min = now_ms.saturating_sub(s.started_ms) as f32 / MS_PER_MIN as f32;
        elapsed_min * s.zones.len() as f32 * self.settings.flow_lpm
    }

    // -- Periodic rules -----------------------------------------------------

    /// Moisture-driven start/stop. Skipped entirely while raining, in manual
    /// override, with auto mode off, or when the mean is unknown.
    pub fn auto_check(&mut self, snap: &SensorSnapshot, now_ms: u64) -> Option<Transition> {
        if !self.state.auto_mode || self.state.manual_override {
            return None;
        }
        if snap.is_raining {
            tracing::debug!("auto check: raining, no decision");
            return None;
        }
        let Some(mean) = snap.mean_moisture() else {
            tracing::warn!(soil = ?snap.soil_moisture, "auto check: moisture unknown, skipped");
            return None;
        };

        let t = self.settings.thresholds;
        match self.state.phase {
            Phase::Idle if mean < t.moisture_low => {
                tracing::info!(mean, low = t.moisture_low, "soil dry");
                Some(self.begin(self.settings.auto_zone, StartCause::LowMoisture, now_ms))
            }
            Phase::Irrigating(_) if mean > t.moisture_high => {
                tracing::info!(mean, high = t.moisture_high, "soil wet enough");
                self.stop(StopCause::MoistureRestored, now_ms)
            }
            _ => None,
        }
    }

    /// Battery, duration and temperature rules, in that order.
    pub fn safety_tick(&mut self, snap: &SensorSnapshot, now_ms: u64) -> Vec<Transition> {
        let mut out = Vec::new();
        let t = self.settings.thresholds;

        if let Some(v) = snap.valid_battery() {
            let low = v < t.battery_critical;
            if low != self.state.power_save {
                self.state.power_save = low;
                if low {
                    tracing::warn!(volts = v, critical = t.battery_critical, "battery critical");
                } else {
                    tracing::info!(volts = v, "battery recovered");
                }
                out.push(Transition::PowerSave(low));
            }
        }

        let ceiling_ms = self.settings.ceiling_ms();
        let due = self.state.phase.session().and_then(|s| {
            let elapsed = now_ms.saturating_sub(s.started_ms);
            if elapsed >= ceiling_ms {
                tracing::error!(
                    elapsed_ms = elapsed,
                    ceiling_ms,
                    "emergency duration exceeded, forcing stop"
                );
                Some(StopCause::SafetyTimeout)
            } else if elapsed >= s.planned_ms {
                Some(StopCause::DurationComplete)
            } else {
                None
            }
        });
        if let Some(cause) = due {
            out.extend(self.stop(cause, now_ms));
            if self.settings.release_override_on_timeout {
                self.state.manual_override = false;
            }
        }

        if let Some(temp) = snap.valid_temperature() {
            if temp > t.temp_high && self.state.phase == Phase::Idle && !snap.is_raining {
                tracing::warn!(temp, high = t.temp_high, "temperature above threshold");
                out.push(self.begin(self.settings.auto_zone, StartCause::HighTemperature, now_ms));
            }
        }

        out
    }

    // -- Commands -------------------------------------------------------------

    /// Start `zone` for `duration_min` (default when `None`), regardless of
    /// moisture and rain. Joins a running session if there is one.
    pub fn start_zone(
        &mut self,
        zone: ZoneId,
        duration_min: Option<u32>,
        now_ms: u64,
    ) -> Result<Transition, ControlError> {
        if !self.state.zones.iter().any(|z| z.zone_id == zone) {
            return Err(ControlError::InvalidZone(zone.to_string()));
        }
        let max = self.settings.max_duration_min;
        let d = duration_min.unwrap_or(self.settings.default_duration_min);
        if d == 0 || d > max {
            return Err(ControlError::invalid_value(format!(
                "duration must be between 1 and {max} minutes, got {d}"
            )));
        }
        let want_ms = u64::from(d) * MS_PER_MIN;

        let session = match std::mem::replace(&mut self.state.phase, Phase::Idle) {
            Phase::Idle => Session {
                zones: BTreeSet::from([zone]),
                started_ms: now_ms,
                planned_ms: want_ms,
            },
            Phase::Irrigating(mut s) | Phase::ManualOverride(mut s) => {
                let elapsed = now_ms.saturating_sub(s.started_ms);
                s.zones.insert(zone);
                s.planned_ms = s.planned_ms.max(elapsed + want_ms);
                s
            }
        };
        self.state.phase = Phase::ManualOverride(session);
        self.state.manual_override = true;
        self.activate(zone, d);

        tracing::info!(%zone, duration_min = d, "manual start");
        Ok(Transition::Started {
            zones: vec![zone],
            duration_min: d,
            cause: StartCause::Manual,
        })
    }

    /// Close everything and leave manual override. `None` when already idle.
    pub fn stop_all(&mut self, now_ms: u64) -> Option<Transition> {
        self.state.manual_override = false;
        self.stop(StopCause::Manual, now_ms)
    }

    /// Apply a runtime config change atomically: either every field is
    /// applied or none is.
    pub fn set_config(&mut self, update: ConfigUpdate) -> Result<(), ControlError> {
        let mut candidate = self.settings.thresholds;
        if let Some(v) = update.moisture_low {
            candidate.moisture_low = v;
        }
        if let Some(v) = update.moisture_high {
            candidate.moisture_high = v;
        }
        if let Some(v) = update.temp_high {
            candidate.temp_high = v;
        }

        let problems = candidate.problems();
        if !problems.is_empty() {
            return Err(ControlError::invalid_value(problems.join("; ")));
        }

        self.settings.thresholds = candidate;
        if let Some(a) = update.auto_mode {
            self.state.auto_mode = a;
        }
        tracing::info!(
            auto_mode = self.state.auto_mode,
            low = candidate.moisture_low,
            high = candidate.moisture_high,
            temp_high = candidate.temp_high,
            "config updated"
        );
        Ok(())
    }

    // -- Internals ------------------------------------------------------------

    /// Open a new automatic session from `Idle`.
    fn begin(&mut self, zone: ZoneId, cause: StartCause, now_ms: u64) -> Transition {
        let d = self.settings.default_duration_min;
        self.state.phase = Phase::Irrigating(Session {
            zones: BTreeSet::from([zone]),
            started_ms: now_ms,
            planned_ms: u64::from(d) * MS_PER_MIN,
        });
        self.activate(zone, d);
        tracing::info!(%zone, duration_min = d, %cause, "irrigation started");
        Transition::Started {
            zones: vec![zone],
            duration_min: d,
            cause,
        }
    }

    /// Drive the zone and pump on. Outputs already on are not re-driven.
    fn activate(&mut self, zone: ZoneId, duration_min: u32) {
        if let Some(z) = self.state.zones.iter_mut().find(|z| z.zone_id == zone) {
            z.duration_min = duration_min;
            if !z.active {
                self.port.set_zone(zone, true);
                z.active = true;
            }
        }
        if !self.state.pump_active {
            self.port.set_pump(true);
            self.state.pump_active = true;
        }
    }

    fn stop(&mut self, cause: StopCause, now_ms: u64) -> Option<Transition> {
        let session = match std::mem::replace(&mut self.state.phase, Phase::Idle) {
            Phase::Idle => return None,
            Phase::Irrigating(s) | Phase::ManualOverride(s) => s,
        };

        for z in self.state.zones.iter_mut().filter(|z| z.active) {
            self.port.set_zone(z.zone_id, false);
            z.active = false;
        }
        if self.state.pump_active {
            self.port.set_pump(false);
            self.state.pump_active = false;
        }

        let elapsed_ms = now_ms.saturating_sub(session.started_ms);
        let liters = self.session_water(&session, now_ms);
        self.state.water_used_liters += liters;

        tracing::info!(elapsed_ms, liters, %cause, "irrigation stopped");
        Some(Transition::Stopped { cause, elapsed_ms })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
