//! TOML config file loading and validation.
//!
//! Every field has a compiled default, so an empty file (or no file at all)
//! yields a working two-zone setup. Runtime changes made through the control
//! API are never written back: a restart always returns to what is loaded
//! here.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Config file used when `CONFIG_PATH` is not set.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Absolute ceiling on a single irrigation session. The configurable
/// `max_duration_min` may lower it but never raise it.
pub const HARD_CEILING_MIN: u32 = 30;

/// Temperatures outside this band are treated as a failed read.
pub const PLAUSIBLE_TEMP_C: std::ops::RangeInclusive<f32> = -50.0..=150.0;

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[u8] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// Valid 7-bit I2C addresses for an ADS1115 (ADDR pin strapping).
const ADS1115_ADDRS: &[u16] = &[0x48, 0x49, 0x4a, 0x4b];

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub thresholds: Thresholds,
    pub timing: Timing,
    pub irrigation: IrrigationSettings,
    pub zones: Vec<ZoneEntry>,
    pub actuation: ActuationSettings,
    pub sensors: SensorSettings,
    pub web: WebSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            timing: Timing::default(),
            irrigation: IrrigationSettings::default(),
            zones: default_zones(),
            actuation: ActuationSettings::default(),
            sensors: SensorSettings::default(),
            web: WebSettings::default(),
        }
    }
}

/// Decision thresholds. The moisture and temperature values may be changed
/// at runtime through the control API.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Mean soil moisture (%) below which automatic irrigation starts.
    pub moisture_low: f32,
    /// Mean soil moisture (%) above which automatic irrigation stops.
    pub moisture_high: f32,
    /// Air temperature (°C) above which emergency irrigation starts.
    pub temp_high: f32,
    /// Battery voltage below which the controller reports power-save.
    pub battery_critical: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            moisture_low: 30.0,
            moisture_high: 70.0,
            temp_high: 35.0,
            battery_critical: 11.0,
        }
    }
}

/// Cadences of the main loop. All tasks run on the same thread; these only
/// decide how often each one is due.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub sample_interval_sec: u64,
    /// Minimum time between two automatic moisture checks.
    pub irrigation_check_interval_sec: u64,
    pub safety_monitor_interval_ms: u64,
    pub loop_sleep_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            sample_interval_sec: 30,
            irrigation_check_interval_sec: 300,
            safety_monitor_interval_ms: 1000,
            loop_sleep_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IrrigationSettings {
    pub auto_mode: bool,
    /// Zone opened by automatic and emergency starts.
    pub auto_zone: u8,
    pub default_duration_min: u32,
    pub max_duration_min: u32,
    /// Estimated flow through one open zone, litres per minute.
    pub flow_lpm: f32,
    /// Clear the manual-override flag when a manual session ends on its own
    /// timer instead of through an explicit stop.
    pub release_override_on_timeout: bool,
}

impl Default for IrrigationSettings {
    fn default() -> Self {
        Self {
            auto_mode: true,
            auto_zone: 1,
            default_duration_min: 15,
            max_duration_min: HARD_CEILING_MIN,
            flow_lpm: 4.0,
            release_override_on_timeout: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneEntry {
    pub zone_id: u8,
    pub name: String,
    pub valve_gpio_pin: u8,
}

fn default_zones() -> Vec<ZoneEntry> {
    vec![
        ZoneEntry {
            zone_id: 1,
            name: "Zone 1".into(),
            valve_gpio_pin: 18,
        },
        ZoneEntry {
            zone_id: 2,
            name: "Zone 2".into(),
            valve_gpio_pin: 19,
        },
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorKind {
    /// One relay per zone valve plus a pump relay.
    Relay,
    /// A single servo-driven valve shared by every zone, no pump.
    Servo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActuationSettings {
    pub kind: ActuatorKind,
    /// Many common relay boards are active-low.
    pub active_low: bool,
    pub pump_gpio_pin: Option<u8>,
    pub servo_gpio_pin: u8,
    pub servo_open_deg: f32,
    pub servo_closed_deg: f32,
}

impl Default for ActuationSettings {
    fn default() -> Self {
        Self {
            kind: ActuatorKind::Relay,
            active_low: true,
            pump_gpio_pin: Some(21),
            servo_gpio_pin: 12,
            servo_open_deg: 90.0,
            servo_closed_deg: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Sim,
    Adc,
}

/// How temperature is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TemperatureSensor {
    /// Combined digital temperature/humidity sensor. Reads may fail.
    Digital,
    /// Analog sensor with a linear transfer: `(volts - offset_v) * scale`.
    Linear {
        adc_max: u16,
        vref: f32,
        offset_v: f32,
        scale: f32,
    },
}

impl TemperatureSensor {
    /// TMP36 on a 10-bit, 5 V ADC.
    #[cfg(test)]
    pub const TMP36: Self = Self::Linear {
        adc_max: 1023,
        vref: 5.0,
        offset_v: 0.5,
        scale: 100.0,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct BatteryDivider {
    pub adc_max: u16,
    pub vref: f32,
    /// Input voltage over ADC voltage.
    pub ratio: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct AdcInput {
    pub addr: u16,
    pub channel: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    pub source: SourceKind,
    pub soil_channels: usize,
    /// Raw reading of a sensor in completely dry soil (0 %).
    pub soil_raw_dry: u16,
    /// Raw reading of a sensor in saturated soil (100 %).
    pub soil_raw_wet: u16,
    /// Rain modules usually pull their digital output low when wet.
    pub rain_active_low: bool,
    pub temperature: TemperatureSensor,
    pub battery: Option<BatteryDivider>,
    pub sim_scenario: String,
    pub adc: AdcWiring,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            source: SourceKind::Sim,
            soil_channels: 5,
            soil_raw_dry: 4095,
            soil_raw_wet: 0,
            rain_active_low: true,
            temperature: TemperatureSensor::Digital,
            battery: Some(BatteryDivider {
                adc_max: 4095,
                vref: 3.3,
                ratio: 5.0,
            }),
            sim_scenario: "drying".into(),
            adc: AdcWiring::default(),
        }
    }
}

/// Channel assignment for the `adc` source.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdcWiring {
    pub soil: Vec<AdcInput>,
    pub light: Option<AdcInput>,
    pub battery: Option<AdcInput>,
    pub temperature: Option<AdcInput>,
    pub rain_gpio_pin: Option<u8>,
}

impl Default for AdcWiring {
    fn default() -> Self {
        let a = |addr, channel| AdcInput { addr, channel };
        Self {
            soil: vec![a(0x48, 0), a(0x48, 1), a(0x48, 2), a(0x48, 3), a(0x49, 0)],
            light: Some(a(0x49, 1)),
            battery: Some(a(0x49, 2)),
            temperature: Some(a(0x49, 3)),
            rain_gpio_pin: Some(4),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSettings {
    pub port: u16,
}

impl Default for WebSettings {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Thresholds {
    /// Every reason these thresholds are unusable. Empty means valid.
    pub fn problems(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for (name, v) in [
            ("moisture_low", self.moisture_low),
            ("moisture_high", self.moisture_high),
        ] {
            if !v.is_finite() || !(0.0..=100.0).contains(&v) {
                errors.push(format!("{name} {v} out of range [0, 100]"));
            }
        }
        if self.moisture_low.is_finite()
            && self.moisture_high.is_finite()
            && self.moisture_low >= self.moisture_high
        {
            errors.push(format!(
                "moisture_low ({}) must be less than moisture_high ({})",
                self.moisture_low, self.moisture_high
            ));
        }

        if !self.temp_high.is_finite() || !PLAUSIBLE_TEMP_C.contains(&self.temp_high) {
            errors.push(format!(
                "temp_high {} out of range [{}, {}]",
                self.temp_high,
                PLAUSIBLE_TEMP_C.start(),
                PLAUSIBLE_TEMP_C.end()
            ));
        }

        if !self.battery_critical.is_finite() || self.battery_critical < 0.0 {
            errors.push(format!(
                "battery_critical {} must be a non-negative voltage",
                self.battery_critical
            ));
        }

        errors
    }
}

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        errors.extend(self.thresholds.problems());
        self.validate_timing(&mut errors);
        self.validate_irrigation(&mut errors);
        self.validate_outputs(&mut errors);
        self.validate_sensors(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        let t = &self.timing;
        for (name, v) in [
            ("sample_interval_sec", t.sample_interval_sec),
            ("irrigation_check_interval_sec", t.irrigation_check_interval_sec),
            ("safety_monitor_interval_ms", t.safety_monitor_interval_ms),
            ("loop_sleep_ms", t.loop_sleep_ms),
        ] {
            if v == 0 {
                errors.push(format!("timing: {name} must be positive"));
            }
        }

        // The safety monitor must run at least as often as new samples arrive.
        if t.safety_monitor_interval_ms > t.sample_interval_sec.saturating_mul(1000) {
            errors.push(format!(
                "timing: safety_monitor_interval_ms ({}) exceeds the sample interval ({} ms)",
                t.safety_monitor_interval_ms,
                t.sample_interval_sec.saturating_mul(1000)
            ));
        }
        if t.loop_sleep_ms > t.safety_monitor_interval_ms {
            errors.push(format!(
                "timing: loop_sleep_ms ({}) exceeds safety_monitor_interval_ms ({})",
                t.loop_sleep_ms, t.safety_monitor_interval_ms
            ));
        }
    }

    fn validate_irrigation(&self, errors: &mut Vec<String>) {
        let irr = &self.irrigation;

        if irr.max_duration_min == 0 || irr.max_duration_min > HARD_CEILING_MIN {
            errors.push(format!(
                "irrigation: max_duration_min {} out of range [1, {HARD_CEILING_MIN}]",
                irr.max_duration_min
            ));
        }
        if irr.default_duration_min == 0 || irr.default_duration_min > irr.max_duration_min {
            errors.push(format!(
                "irrigation: default_duration_min {} out of range [1, max_duration_min]",
                irr.default_duration_min
            ));
        }
        if !irr.flow_lpm.is_finite() || irr.flow_lpm < 0.0 {
            errors.push(format!(
                "irrigation: flow_lpm {} must be a non-negative rate",
                irr.flow_lpm
            ));
        }
        if !self.zones.iter().any(|z| z.zone_id == irr.auto_zone) {
            errors.push(format!(
                "irrigation: auto_zone {} does not match any defined zone",
                irr.auto_zone
            ));
        }
    }

    fn validate_outputs(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<u8> = HashSet::new();
        let mut seen_pins: HashSet<u8> = HashSet::new();

        if self.zones.is_empty() {
            errors.push("at least one zone must be defined".into());
        }

        let act = &self.actuation;
        if act.kind == ActuatorKind::Relay {
            if let Some(pin) = act.pump_gpio_pin {
                check_pin("pump", pin, &mut seen_pins, errors);
            }
        } else {
            check_pin("servo", act.servo_gpio_pin, &mut seen_pins, errors);
            for (name, deg) in [
                ("servo_open_deg", act.servo_open_deg),
                ("servo_closed_deg", act.servo_closed_deg),
            ] {
                if !deg.is_finite() || !(0.0..=180.0).contains(&deg) {
                    errors.push(format!("actuation: {name} {deg} out of range [0, 180]"));
                }
            }
        }

        for (i, z) in self.zones.iter().enumerate() {
            let ctx = format!("zone {}", z.zone_id);

            if z.zone_id == 0 {
                errors.push(format!("zones[{i}]: zone_id must be 1 or greater"));
            } else if !seen_ids.insert(z.zone_id) {
                errors.push(format!("{ctx}: duplicate zone_id"));
            }

            if z.name.trim().is_empty() {
                errors.push(format!("{ctx}: name is empty"));
            }

            // Servo builds drive one shared valve; zone pins are unused.
            if act.kind == ActuatorKind::Relay {
                check_pin(&ctx, z.valve_gpio_pin, &mut seen_pins, errors);
            }
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let s = &self.sensors;

        if s.soil_channels == 0 {
            errors.push("sensors: soil_channels must be positive".into());
        }
        if s.soil_raw_dry == s.soil_raw_wet {
            errors.push(format!(
                "sensors: soil_raw_dry and soil_raw_wet are both {}: calibration range is zero",
                s.soil_raw_dry
            ));
        }

        if let TemperatureSensor::Linear {
            adc_max,
            vref,
            scale,
            offset_v,
        } = s.temperature
        {
            if adc_max == 0 || !(vref > 0.0) || !scale.is_finite() || !offset_v.is_finite() {
                errors.push("sensors: linear temperature transfer is degenerate".into());
            }
        }

        if let Some(b) = s.battery {
            if b.adc_max == 0 || !(b.vref > 0.0) || !(b.ratio > 0.0) {
                errors.push("sensors: battery divider is degenerate".into());
            }
        }

        if s.source == SourceKind::Adc {
            let w = &s.adc;
            if w.soil.len() != s.soil_channels {
                errors.push(format!(
                    "sensors.adc: {} soil input(s) wired but soil_channels is {}",
                    w.soil.len(),
                    s.soil_channels
                ));
            }
            let inputs = w
                .soil
                .iter()
                .chain(w.light.iter())
                .chain(w.battery.iter())
                .chain(w.temperature.iter());
            for input in inputs {
                if !ADS1115_ADDRS.contains(&input.addr) || input.channel > 3 {
                    errors.push(format!(
                        "sensors.adc: input 0x{:02x}/{} is not a valid ADS1115 channel",
                        input.addr, input.channel
                    ));
                }
            }
            if s.temperature == TemperatureSensor::Digital {
                errors.push(
                    "sensors: the adc source needs a linear temperature sensor".into(),
                );
            }
            if let Some(pin) = w.rain_gpio_pin {
                if !VALID_GPIO_PINS.contains(&pin) {
                    errors.push(format!(
                        "sensors.adc: rain_gpio_pin {pin} is not a valid BCM GPIO pin"
                    ));
                }
            }
        }
    }

    /// Apply environment overrides. `lookup` is `std::env::var` in production.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("RELAY_ACTIVE_LOW") {
            self.actuation.active_low = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Some(port) = lookup("WEB_PORT").and_then(|s| s.parse().ok()) {
            self.web.port = port;
        }
        match lookup("SENSOR_SOURCE").as_deref() {
            Some("sim") => self.sensors.source = SourceKind::Sim,
            Some("adc") => self.sensors.source = SourceKind::Adc,
            Some(other) => tracing::warn!(value = other, "ignoring unknown SENSOR_SOURCE"),
            None => {}
        }
        if let Some(scenario) = lookup("SIM_SCENARIO") {
            self.sensors.sim_scenario = scenario;
        }
    }
}

fn check_pin(ctx: &str, pin: u8, seen: &mut HashSet<u8>, errors: &mut Vec<String>) {
    if !VALID_GPIO_PINS.contains(&pin) {
        errors.push(format!(
            "{ctx}: gpio pin {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
        ));
    } else if !seen.insert(pin) {
        errors.push(format!("{ctx}: gpio pin {pin} is already in use"));
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Load `path` when given. Otherwise load [`DEFAULT_CONFIG_PATH`] if it
/// exists, falling back to compiled defaults.
pub fn load_or_default(path: Option<&str>) -> Result<Config> {
    if let Some(path) = path {
        return load(path);
    }
    if Path::new(DEFAULT_CONFIG_PATH).exists() {
        return load(DEFAULT_CONFIG_PATH);
    }
    tracing::warn!(
        path = DEFAULT_CONFIG_PATH,
        "no config file found, using compiled defaults"
    );
    let config = Config::default();
    config.validate().context("invalid compiled defaults")?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid_config() -> Config {
        toml::from_str("").unwrap()
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = valid_config();
        assert_eq!(cfg.zones.len(), 2);
        assert_eq!(cfg.thresholds.moisture_low, 30.0);
        assert_eq!(cfg.thresholds.moisture_high, 70.0);
        assert_eq!(cfg.thresholds.temp_high, 35.0);
        assert_eq!(cfg.irrigation.default_duration_min, 15);
        assert_eq!(cfg.irrigation.max_duration_min, HARD_CEILING_MIN);
        assert_eq!(cfg.sensors.soil_channels, 5);
        cfg.validate().unwrap();
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[thresholds]
moisture_low = 25.0
moisture_high = 60.0
temp_high = 38.0

[timing]
sample_interval_sec = 10
irrigation_check_interval_sec = 60

[irrigation]
auto_zone = 3
default_duration_min = 10
max_duration_min = 20

[[zones]]
zone_id = 3
name = "Beds"
valve_gpio_pin = 17

[actuation]
kind = "servo"
servo_gpio_pin = 13

[sensors]
source = "adc"
soil_channels = 2
soil_raw_dry = 26000
soil_raw_wet = 12000
temperature = { kind = "linear", adc_max = 32767, vref = 4.096, offset_v = 0.5, scale = 100.0 }

[sensors.adc]
soil = [{ addr = 0x48, channel = 0 }, { addr = 0x48, channel = 1 }]
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.zones.len(), 1);
        assert_eq!(cfg.zones[0].zone_id, 3);
        assert_eq!(cfg.actuation.kind, ActuatorKind::Servo);
        assert_eq!(cfg.sensors.source, SourceKind::Adc);
        assert_eq!(cfg.sensors.adc.soil.len(), 2);
        assert!(matches!(
            cfg.sensors.temperature,
            TemperatureSensor::Linear { adc_max: 32767, .. }
        ));
        cfg.validate().unwrap();
    }

    // -- Thresholds -------------------------------------------------------

    #[test]
    fn thresholds_low_above_high_rejected() {
        let mut cfg = valid_config();
        cfg.thresholds.moisture_low = 80.0;
        cfg.thresholds.moisture_high = 30.0;
        assert_validation_err(&cfg, "moisture_low (80) must be less than moisture_high (30)");
    }

    #[test]
    fn thresholds_equal_rejected() {
        let t = Thresholds {
            moisture_low: 50.0,
            moisture_high: 50.0,
            ..Thresholds::default()
        };
        assert_eq!(t.problems().len(), 1);
    }

    #[test]
    fn thresholds_non_finite_rejected() {
        let t = Thresholds {
            moisture_high: f32::NAN,
            temp_high: f32::INFINITY,
            ..Thresholds::default()
        };
        let problems = t.problems();
        assert!(problems.iter().any(|p| p.contains("moisture_high")));
        assert!(problems.iter().any(|p| p.contains("temp_high")));
    }

    #[test]
    fn thresholds_negative_moisture_rejected() {
        let mut cfg = valid_config();
        cfg.thresholds.moisture_low = -5.0;
        assert_validation_err(&cfg, "moisture_low -5 out of range");
    }

    // -- Timing -----------------------------------------------------------

    #[test]
    fn timing_zero_interval_rejected() {
        let mut cfg = valid_config();
        cfg.timing.sample_interval_sec = 0;
        assert_validation_err(&cfg, "sample_interval_sec must be positive");
    }

    #[test]
    fn safety_monitor_slower_than_sampling_rejected() {
        let mut cfg = valid_config();
        cfg.timing.sample_interval_sec = 1;
        cfg.timing.safety_monitor_interval_ms = 5000;
        assert_validation_err(&cfg, "exceeds the sample interval");
    }

    // -- Irrigation -------------------------------------------------------

    #[test]
    fn ceiling_above_hard_limit_rejected() {
        let mut cfg = valid_config();
        cfg.irrigation.max_duration_min = 45;
        assert_validation_err(&cfg, "max_duration_min 45 out of range");
    }

    #[test]
    fn default_duration_above_ceiling_rejected() {
        let mut cfg = valid_config();
        cfg.irrigation.max_duration_min = 10;
        cfg.irrigation.default_duration_min = 15;
        assert_validation_err(&cfg, "default_duration_min 15 out of range");
    }

    #[test]
    fn auto_zone_must_exist() {
        let mut cfg = valid_config();
        cfg.irrigation.auto_zone = 9;
        assert_validation_err(&cfg, "auto_zone 9 does not match any defined zone");
    }

    // -- Zones / outputs --------------------------------------------------

    #[test]
    fn duplicate_zone_id_rejected() {
        let mut cfg = valid_config();
        cfg.zones[1].zone_id = 1;
        assert_validation_err(&cfg, "duplicate zone_id");
    }

    #[test]
    fn zone_id_zero_rejected() {
        let mut cfg = valid_config();
        cfg.zones[1].zone_id = 0;
        assert_validation_err(&cfg, "zone_id must be 1 or greater");
    }

    #[test]
    fn zone_gpio_pin_1_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].valve_gpio_pin = 1;
        assert_validation_err(&cfg, "not a valid BCM GPIO pin");
    }

    #[test]
    fn zone_pin_shared_with_pump_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].valve_gpio_pin = 21;
        assert_validation_err(&cfg, "gpio pin 21 is already in use");
    }

    #[test]
    fn no_zones_rejected() {
        let mut cfg = valid_config();
        cfg.zones.clear();
        assert_validation_err(&cfg, "at least one zone must be defined");
    }

    // -- Sensors ----------------------------------------------------------

    #[test]
    fn zero_calibration_range_rejected() {
        let mut cfg = valid_config();
        cfg.sensors.soil_raw_dry = 2000;
        cfg.sensors.soil_raw_wet = 2000;
        assert_validation_err(&cfg, "calibration range is zero");
    }

    #[test]
    fn adc_source_requires_linear_temperature() {
        let mut cfg = valid_config();
        cfg.sensors.source = SourceKind::Adc;
        assert_validation_err(&cfg, "needs a linear temperature sensor");
    }

    #[test]
    fn adc_soil_wiring_must_match_channel_count() {
        let mut cfg = valid_config();
        cfg.sensors.source = SourceKind::Adc;
        cfg.sensors.temperature = TemperatureSensor::TMP36;
        cfg.sensors.soil_channels = 3;
        assert_validation_err(&cfg, "5 soil input(s) wired but soil_channels is 3");
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = valid_config();
        cfg.thresholds.moisture_low = 90.0;
        cfg.timing.loop_sleep_ms = 0;
        cfg.zones[0].name = " ".into();
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("must be less than moisture_high"), "{msg}");
        assert!(msg.contains("loop_sleep_ms must be positive"), "{msg}");
        assert!(msg.contains("name is empty"), "{msg}");
    }

    // -- Environment overrides --------------------------------------------

    #[test]
    fn env_overrides_applied() {
        let env: HashMap<&str, &str> = [
            ("RELAY_ACTIVE_LOW", "false"),
            ("WEB_PORT", "9090"),
            ("SENSOR_SOURCE", "adc"),
            ("SIM_SCENARIO", "wet"),
        ]
        .into_iter()
        .collect();

        let mut cfg = valid_config();
        cfg.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert!(!cfg.actuation.active_low);
        assert_eq!(cfg.web.port, 9090);
        assert_eq!(cfg.sensors.source, SourceKind::Adc);
        assert_eq!(cfg.sensors.sim_scenario, "wet");
    }

    #[test]
    fn unparseable_port_keeps_default() {
        let mut cfg = valid_config();
        cfg.apply_env_overrides(|k| (k == "WEB_PORT").then(|| "http".to_string()));
        assert_eq!(cfg.web.port, 8080);
    }

    #[test]
    fn load_missing_explicit_path_fails() {
        let err = load_or_default(Some("/nonexistent/irrigation.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("failed to read config"));
    }
}
