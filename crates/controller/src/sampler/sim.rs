//! Stateful sensor field simulator for local development.
//!
//! Models the behaviour the controller has to cope with:
//! - Soil moisture random walk with mean reversion and drying drift
//! - Per-channel calibration offsets and ADC noise
//! - Occasional spikes and temperature read dropouts (sensor flakiness)
//! - Diurnal temperature, humidity and light curves
//! - Rain showers
//! - Closed-loop watering response (moisture rises while irrigating)
//!
//! Output is raw ADC counts so the frames go through the same calibration
//! path as real hardware.

use std::fmt;

use super::{RawFrame, SensorSource, TemperatureRaw};
use crate::config::{BatteryDivider, SensorSettings};

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range, slow drift toward dry. Realistic warm day.
    Drying,
    /// Hovers in the dead band. Good for testing the UI without irrigating.
    Stable,
    /// High noise, frequent spikes and dropouts. Exercises the unknown-input
    /// handling of the controller.
    Flaky,
    /// Starts near saturation and it rains often.
    Wet,
    /// Moist soil but temperatures well above the emergency threshold.
    Heatwave,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            "heatwave" => Self::Heatwave,
            _ => Self::Drying, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
            Self::Heatwave => write!(f, "heatwave"),
        }
    }
}

struct Profile {
    /// Starting moisture, percent.
    start_pct: f64,
    /// Percent lost per sample.
    drift: f64,
    walk_sigma: f64,
    noise_sigma: f64,
    spike_prob: f32,
    dropout_prob: f32,
    rain_start_prob: f32,
    mean_temp_c: f64,
}

impl Scenario {
    fn profile(self) -> Profile {
        match self {
            Self::Drying => Profile {
                start_pct: 45.0,
                drift: 0.4,
                walk_sigma: 0.8,
                noise_sigma: 0.6,
                spike_prob: 0.02,
                dropout_prob: 0.01,
                rain_start_prob: 0.005,
                mean_temp_c: 27.0,
            },
            Self::Stable => Profile {
                start_pct: 50.0,
                drift: 0.0,
                walk_sigma: 0.3,
                noise_sigma: 0.3,
                spike_prob: 0.0,
                dropout_prob: 0.0,
                rain_start_prob: 0.0,
                mean_temp_c: 22.0,
            },
            Self::Flaky => Profile {
                start_pct: 40.0,
                drift: 0.3,
                walk_sigma: 2.0,
                noise_sigma: 3.0,
                spike_prob: 0.10,
                dropout_prob: 0.10,
                rain_start_prob: 0.01,
                mean_temp_c: 25.0,
            },
            Self::Wet => Profile {
                start_pct: 80.0,
                drift: 0.1,
                walk_sigma: 0.5,
                noise_sigma: 0.5,
                spike_prob: 0.01,
                dropout_prob: 0.0,
                rain_start_prob: 0.05,
                mean_temp_c: 18.0,
            },
            Self::Heatwave => Profile {
                start_pct: 60.0,
                drift: 0.6,
                walk_sigma: 0.8,
                noise_sigma: 0.6,
                spike_prob: 0.01,
                dropout_prob: 0.01,
                rain_start_prob: 0.0,
                mean_temp_c: 39.0,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// Samples per simulated day. At the default 30 s cadence this is a full
/// day/night cycle every 48 minutes.
const SAMPLES_PER_DAY: f64 = 96.0;

/// Percent gained per sample while water is flowing.
const WET_RATE: f64 = 2.5;

pub struct SimSource {
    profile: Profile,

    /// "True" moisture per channel, percent.
    soil: Vec<f64>,
    /// Permanent per-channel calibration offset, percent.
    offsets: Vec<f64>,

    raw_dry: f64,
    raw_wet: f64,
    battery: Option<BatteryDivider>,
    battery_v: f64,

    ticks: u64,
    raining_for: u32,
    irrigating: bool,
}

impl SimSource {
    pub fn new(scenario: Scenario, settings: &SensorSettings) -> Self {
        let profile = scenario.profile();
        let n = settings.soil_channels;
        let soil = (0..n)
            .map(|_| (profile.start_pct + gaussian(0.0, 3.0)).clamp(0.0, 100.0))
            .collect();
        let offsets = (0..n).map(|_| gaussian(0.0, 1.5)).collect();

        tracing::info!(%scenario, channels = n, "sensor simulator initialised");

        Self {
            profile,
            soil,
            offsets,
            raw_dry: settings.soil_raw_dry as f64,
            raw_wet: settings.soil_raw_wet as f64,
            battery: settings.battery,
            battery_v: 12.6,
            ticks: 0,
            raining_for: 0,
            irrigating: false,
        }
    }

    /// Diurnal phase in [-1, 1], peaking mid-afternoon.
    fn day_phase(&self) -> f64 {
        let phase = 2.0 * std::f64::consts::PI * self.ticks as f64 / SAMPLES_PER_DAY;
        phase.sin()
    }

    fn pct_to_raw(&self, pct: f64) -> u16 {
        let raw = self.raw_dry - pct / 100.0 * (self.raw_dry - self.raw_wet);
        raw.round().clamp(0.0, u16::MAX as f64) as u16
    }

    fn step_weather(&mut self) {
        if self.raining_for > 0 {
            self.raining_for -= 1;
        } else if fastrand::f32() < self.profile.rain_start_prob {
            self.raining_for = fastrand::u32(5..30);
        }
    }

    fn step_soil(&mut self) {
        let p = &self.profile;
        let heat = (self.day_phase() + 1.0) / 2.0; // dries faster in the afternoon
        let wet = if self.irrigating {
            WET_RATE
        } else if self.raining_for > 0 {
            WET_RATE / 2.0
        } else {
            0.0
        };
        for m in &mut self.soil {
            let pull = 0.01 * (p.start_pct - *m);
            let walk = gaussian(0.0, p.walk_sigma);
            *m = (*m - p.drift * (0.5 + heat) + pull + walk + wet).clamp(0.0, 100.0);
        }
    }

    fn read_soil(&self) -> Vec<Option<u16>> {
        self.soil
            .iter()
            .zip(&self.offsets)
            .map(|(m, off)| {
                let spike = if fastrand::f32() < self.profile.spike_prob {
                    gaussian(0.0, 25.0)
                } else {
                    0.0
                };
                let pct = m + off + gaussian(0.0, self.profile.noise_sigma) + spike;
                Some(self.pct_to_raw(pct))
            })
            .collect()
    }
}

impl SensorSource for SimSource {
    fn read(&mut self) -> RawFrame {
        self.ticks += 1;
        self.step_weather();
        self.step_soil();

        let phase = self.day_phase();
        let raining = self.raining_for > 0;

        let dropout = fastrand::f32() < self.profile.dropout_prob;
        let temperature = if dropout {
            None
        } else {
            let rain_cooling = if raining { 4.0 } else { 0.0 };
            Some((self.profile.mean_temp_c + 6.0 * phase - rain_cooling + gaussian(0.0, 0.3)) as f32)
        };
        let humidity = if dropout {
            Some(f32::NAN)
        } else {
            let base = if raining { 92.0 } else { 55.0 - 15.0 * phase };
            Some((base + gaussian(0.0, 2.0)).clamp(0.0, 100.0) as f32)
        };

        let light = if raining { 150.0 } else { 500.0 + 450.0 * phase };
        let light = (light + gaussian(0.0, 20.0)).clamp(0.0, 4095.0) as u16;

        // Slow sag, recovering during the "day" (solar charging).
        self.battery_v = (self.battery_v - 0.002 + 0.004 * phase.max(0.0)).clamp(10.0, 13.2);
        let battery = self.battery.map(|div| {
            let adc_v = self.battery_v / div.ratio as f64;
            let raw = adc_v / div.vref as f64 * div.adc_max as f64;
            raw.round().clamp(0.0, div.adc_max as f64) as u16
        });

        RawFrame {
            soil: self.read_soil(),
            temperature: TemperatureRaw::Digital(temperature),
            humidity,
            // Active-low wiring is the common case: the line drops when wet.
            rain_line_high: !raining,
            light: Some(light),
            battery,
        }
    }

    fn set_irrigating(&mut self, active: bool) {
        self.irrigating = active;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::Calibration;

    fn sim(scenario: Scenario) -> SimSource {
        SimSource::new(scenario, &SensorSettings::default())
    }

    fn mean_soil(sim: &SimSource) -> f64 {
        sim.soil.iter().sum::<f64>() / sim.soil.len() as f64
    }

    #[test]
    fn frame_has_configured_channel_count() {
        let mut s = sim(Scenario::Drying);
        assert_eq!(s.read().soil.len(), 5);
    }

    #[test]
    fn calibrated_readings_stay_in_range() {
        let settings = SensorSettings::default();
        let cal = Calibration::from_settings(&settings);
        let mut s = SimSource::new(Scenario::Flaky, &settings);
        for tick in 0..500 {
            let snap = cal.apply(&s.read(), tick);
            for m in &snap.soil_moisture {
                assert!((0.0..=100.0).contains(m), "moisture out of range: {m}");
            }
        }
    }

    #[test]
    fn irrigating_raises_moisture() {
        let mut s = sim(Scenario::Drying);
        for _ in 0..10 {
            s.read();
        }
        let before = mean_soil(&s);
        s.set_irrigating(true);
        for _ in 0..20 {
            s.read();
        }
        let after = mean_soil(&s);
        assert!(
            after > before,
            "irrigation should raise moisture: before={before:.1} after={after:.1}"
        );
    }

    #[test]
    fn stable_scenario_stays_in_dead_band() {
        let mut s = sim(Scenario::Stable);
        for _ in 0..200 {
            s.read();
        }
        let m = mean_soil(&s);
        assert!((30.0..=70.0).contains(&m), "stable drifted to {m:.1}");
    }

    #[test]
    fn heatwave_runs_hot() {
        let mut s = sim(Scenario::Heatwave);
        let temps: Vec<f32> = (0..50)
            .filter_map(|_| match s.read().temperature {
                TemperatureRaw::Digital(t) => t,
                TemperatureRaw::Analog(_) => None,
            })
            .collect();
        let avg = temps.iter().sum::<f32>() / temps.len() as f32;
        assert!(avg > 33.0, "heatwave average temperature {avg:.1}");
    }

    #[test]
    fn battery_raw_round_trips_through_divider() {
        let settings = SensorSettings::default();
        let cal = Calibration::from_settings(&settings);
        let mut s = SimSource::new(Scenario::Stable, &settings);
        let v = cal.apply(&s.read(), 0).battery_voltage.unwrap();
        assert!((10.0..=13.3).contains(&v), "battery {v}");
    }

    #[test]
    fn scenario_from_str_lossy() {
        assert_eq!(Scenario::from_str_lossy("drying"), Scenario::Drying);
        assert_eq!(Scenario::from_str_lossy("STABLE"), Scenario::Stable);
        assert_eq!(Scenario::from_str_lossy("Flaky"), Scenario::Flaky);
        assert_eq!(Scenario::from_str_lossy("wet"), Scenario::Wet);
        assert_eq!(Scenario::from_str_lossy("heatwave"), Scenario::Heatwave);
        assert_eq!(Scenario::from_str_lossy(""), Scenario::Drying);
    }

    #[test]
    fn scenario_display() {
        assert_eq!(Scenario::Drying.to_string(), "drying");
        assert_eq!(Scenario::Heatwave.to_string(), "heatwave");
    }
}
