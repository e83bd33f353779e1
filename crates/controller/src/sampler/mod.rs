//! Sensor sampling. A [`SensorSource`] produces raw transducer values; the
//! [`Calibration`] turns them into a [`SensorSnapshot`] in engineering units.
//!
//! Sources never retry. A failed channel surfaces as NaN (or `None` where the
//! quantity is optional) and it is up to the controller to treat it as
//! unknown.

#[cfg(feature = "adc")]
pub mod adc;
#[cfg(feature = "sim")]
pub mod sim;

use anyhow::Result;
use serde::Serialize;

use crate::config::{BatteryDivider, SensorSettings, SourceKind, TemperatureSensor, PLAUSIBLE_TEMP_C};

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// One calibrated sample of every sensor. Replaced wholesale each tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSnapshot {
    /// Percent per soil channel, NaN for a failed channel.
    pub soil_moisture: Vec<f32>,
    /// Degrees Celsius, NaN when the read failed.
    pub temperature: f32,
    /// Relative humidity, `None` on variants without a humidity sensor.
    pub humidity: Option<f32>,
    pub is_raining: bool,
    pub light_intensity: Option<u16>,
    /// Volts, `None` when no battery monitor is fitted.
    pub battery_voltage: Option<f32>,
    /// Milliseconds since boot.
    pub timestamp: u64,
}

impl SensorSnapshot {
    /// Mean soil moisture, or `None` when any channel is missing or out of
    /// range. A single bad channel must not be allowed to drag the mean.
    pub fn mean_moisture(&self) -> Option<f32> {
        if self.soil_moisture.is_empty() {
            return None;
        }
        let mut sum = 0.0;
        for &m in &self.soil_moisture {
            if !m.is_finite() || !(0.0..=100.0).contains(&m) {
                return None;
            }
            sum += m;
        }
        Some(sum / self.soil_moisture.len() as f32)
    }

    /// Temperature if the reading is plausible.
    pub fn valid_temperature(&self) -> Option<f32> {
        let t = self.temperature;
        (t.is_finite() && PLAUSIBLE_TEMP_C.contains(&t)).then_some(t)
    }

    /// Battery voltage if fitted and readable.
    pub fn valid_battery(&self) -> Option<f32> {
        self.battery_voltage.filter(|v| v.is_finite() && *v >= 0.0)
    }
}

// ---------------------------------------------------------------------------
// Raw frames and sources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum TemperatureRaw {
    /// ADC counts from an analog sensor.
    Analog(Option<u16>),
    /// Already in °C from a digital sensor.
    Digital(Option<f32>),
}

/// Uncalibrated values as read from the hardware. `None` marks a failed read.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub soil: Vec<Option<u16>>,
    pub temperature: TemperatureRaw,
    pub humidity: Option<f32>,
    /// Level of the rain sensor's digital output.
    pub rain_line_high: bool,
    pub light: Option<u16>,
    pub battery: Option<u16>,
}

/// Anything that can produce raw sensor frames.
pub trait SensorSource: Send {
    fn read(&mut self) -> RawFrame;

    /// Told after every control pass whether water is flowing. Only the
    /// simulator cares.
    fn set_irrigating(&mut self, _active: bool) {}
}

/// What the main loop samples through.
pub trait SensorSampler {
    fn sample(&mut self, now_ms: u64) -> SensorSnapshot;

    fn observe_irrigation(&mut self, _active: bool) {}
}

// ---------------------------------------------------------------------------
// Calibration
// ---------------------------------------------------------------------------

/// Convert a raw reading to a 0..=100 moisture percentage using the sensor's
/// dry/wet calibration endpoints. Result is clamped so out-of-range readings
/// don't produce nonsensical values.
pub fn compute_moisture(raw: u16, raw_dry: u16, raw_wet: u16) -> f32 {
    let range = raw_dry as f64 - raw_wet as f64;
    if range == 0.0 {
        return f32::NAN; // degenerate calibration, rejected by config validation
    }
    let m = (raw_dry as f64 - raw as f64) / range * 100.0;
    m.clamp(0.0, 100.0) as f32
}

/// `(volts - offset_v) * scale` where `volts = raw / adc_max * vref`.
pub fn linear_temperature(raw: u16, adc_max: u16, vref: f32, offset_v: f32, scale: f32) -> f32 {
    let volts = raw as f32 / adc_max as f32 * vref;
    (volts - offset_v) * scale
}

pub fn battery_volts(raw: u16, divider: &BatteryDivider) -> f32 {
    raw as f32 / divider.adc_max as f32 * divider.vref * divider.ratio
}

#[derive(Debug, Clone)]
pub struct Calibration {
    pub soil_raw_dry: u16,
    pub soil_raw_wet: u16,
    pub rain_active_low: bool,
    pub temperature: TemperatureSensor,
    pub battery: Option<BatteryDivider>,
}

impl Calibration {
    pub fn from_settings(s: &SensorSettings) -> Self {
        Self {
            soil_raw_dry: s.soil_raw_dry,
            soil_raw_wet: s.soil_raw_wet,
            rain_active_low: s.rain_active_low,
            temperature: s.temperature,
            battery: s.battery,
        }
    }

    pub fn apply(&self, raw: &RawFrame, now_ms: u64) -> SensorSnapshot {
        let soil_moisture = raw
            .soil
            .iter()
            .map(|r| match r {
                Some(v) => compute_moisture(*v, self.soil_raw_dry, self.soil_raw_wet),
                None => f32::NAN,
            })
            .collect();

        let temperature = match (&raw.temperature, self.temperature) {
            (TemperatureRaw::Digital(t), _) => t.unwrap_or(f32::NAN),
            (
                TemperatureRaw::Analog(Some(r)),
                TemperatureSensor::Linear {
                    adc_max,
                    vref,
                    offset_v,
                    scale,
                },
            ) => linear_temperature(*r, adc_max, vref, offset_v, scale),
            (TemperatureRaw::Analog(_), _) => f32::NAN,
        };

        let battery_voltage = self
            .battery
            .map(|div| raw.battery.map_or(f32::NAN, |r| battery_volts(r, &div)));

        SensorSnapshot {
            soil_moisture,
            temperature,
            humidity: raw.humidity,
            is_raining: raw.rain_line_high != self.rain_active_low,
            light_intensity: raw.light,
            battery_voltage,
            timestamp: now_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Sampler
// ---------------------------------------------------------------------------

pub struct Sampler {
    source: Box<dyn SensorSource>,
    calibration: Calibration,
}

impl Sampler {
    pub fn new(source: Box<dyn SensorSource>, calibration: Calibration) -> Self {
        Self {
            source,
            calibration,
        }
    }
}

impl SensorSampler for Sampler {
    fn sample(&mut self, now_ms: u64) -> SensorSnapshot {
        let raw = self.source.read();
        let snap = self.calibration.apply(&raw, now_ms);
        tracing::debug!(
            soil = ?snap.soil_moisture,
            temperature = snap.temperature,
            raining = snap.is_raining,
            battery = ?snap.battery_voltage,
            "sampled sensors"
        );
        snap
    }

    fn observe_irrigation(&mut self, active: bool) {
        self.source.set_irrigating(active);
    }
}

/// Build the sampler selected by `settings.source`.
pub fn build(settings: &SensorSettings) -> Result<Sampler> {
    let calibration = Calibration::from_settings(settings);
    let source: Box<dyn SensorSource> = match settings.source {
        #[cfg(feature = "sim")]
        SourceKind::Sim => Box::new(sim::SimSource::new(
            sim::Scenario::from_str_lossy(&settings.sim_scenario),
            settings,
        )),
        #[cfg(feature = "adc")]
        SourceKind::Adc => Box::new(adc::AdcSource::new(&settings.adc)?),
        #[allow(unreachable_patterns)]
        other => anyhow::bail!("sensor source {other:?} is not compiled into this build"),
    };
    tracing::info!(source = ?settings.source, channels = settings.soil_channels, "sampler ready");
    Ok(Sampler::new(source, calibration))
}

// ===========================================================================
// Tests
// ===========================================================================
