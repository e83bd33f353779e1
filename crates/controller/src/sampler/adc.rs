//! ADS1115 16-bit ADC source over I2C, plus the rain sensor on a GPIO input.
//!
//! Reads single-ended channels at PGA ±4.096 V, 128 SPS, single-shot mode.
//! Up to four converters share the bus (addresses 0x48-0x4b), which covers
//! five soil probes, the light sensor, the battery divider and an analog
//! temperature sensor.

use rppal::gpio::{Gpio, InputPin};
use rppal::i2c::I2c;
use std::{thread, time::Duration};

use super::{RawFrame, SensorSource, TemperatureRaw};
use crate::config::{AdcInput, AdcWiring};

// ── ADS1115 register addresses ──────────────────────────────────────────────

/// Conversion result register (read-only, 16-bit signed).
const REG_CONVERSION: u8 = 0x00;
/// Configuration register (read/write).
const REG_CONFIG: u8 = 0x01;

// ── Config register bit fields ──────────────────────────────────────────────
//
// Layout (MSB first):
//   [15]    OS      : write 1 to start single-shot conversion
//   [14:12] MUX     : input multiplexer (channel selection)
//   [11:9]  PGA     : programmable gain amplifier
//   [8]     MODE    : 0 = continuous, 1 = single-shot
//   [7:5]   DR      : data rate
//   [4:2]   comparator mode/polarity/latch
//   [1:0]   COMP_QUE: 11 = disable comparator (default)

/// OS=1, PGA=001 (±4.096 V), MODE=1, DR=100 (128 SPS), COMP_QUE=11.
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

/// MUX values for single-ended reads (AINx vs GND).
const MUX_SHIFT: u8 = 12;
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

/// Conversion time at 128 SPS is ~7.8 ms.
const CONVERSION_WAIT: Duration = Duration::from_millis(9);

/// Bit 15 of the config register: conversion-ready flag when read.
const OS_READY_BIT: u16 = 1 << 15;

fn config_for_channel(channel: u8) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[channel as usize & 0b11] << MUX_SHIFT)
}

// ── Source ──────────────────────────────────────────────────────────────────

pub struct AdcSource {
    i2c: I2c,
    current_addr: Option<u16>,
    wiring: AdcWiring,
    rain: Option<InputPin>,
}

impl AdcSource {
    /// Open I2C bus 1 and the rain input. Channel numbers have already been
    /// checked by config validation.
    pub fn new(wiring: &AdcWiring) -> anyhow::Result<Self> {
        let i2c = I2c::new()?;

        let rain = match wiring.rain_gpio_pin {
            Some(pin) => Some(Gpio::new()?.get(pin)?.into_input_pullup()),
            None => None,
        };

        tracing::info!(
            soil = wiring.soil.len(),
            rain_pin = ?wiring.rain_gpio_pin,
            "ads1115 source initialised"
        );

        Ok(Self {
            i2c,
            current_addr: None,
            wiring: wiring.clone(),
            rain,
        })
    }

    /// Single-shot read of one input, returning the raw value (0-32767 for
    /// single-ended).
    fn read_input(&mut self, input: AdcInput) -> anyhow::Result<u16> {
        if self.current_addr != Some(input.addr) {
            self.i2c.set_slave_address(input.addr)?;
            self.current_addr = Some(input.addr);
        }

        let config = config_for_channel(input.channel);
        self.i2c.block_write(REG_CONFIG, &config.to_be_bytes())?;

        thread::sleep(CONVERSION_WAIT);

        for _ in 0..3 {
            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONFIG, &mut buf)?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }

        let mut buf = [0u8; 2];
        self.i2c.block_read(REG_CONVERSION, &mut buf)?;
        // Single-ended reads are non-negative; clamp against bus corruption.
        Ok(i16::from_be_bytes(buf).max(0) as u16)
    }

    /// Read `input`, logging and swallowing failures.
    fn read_logged(&mut self, input: AdcInput, what: &str) -> Option<u16> {
        match self.read_input(input) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::error!(
                    addr = format_args!("0x{:02x}", input.addr),
                    channel = input.channel,
                    what,
                    "adc read failed: {e}"
                );
                // Force re-addressing on the next read.
                self.current_addr = None;
                None
            }
        }
    }
}

impl SensorSource for AdcSource {
    fn read(&mut self) -> RawFrame {
        let soil_inputs = self.wiring.soil.clone();
        let soil = soil_inputs
            .into_iter()
            .map(|input| self.read_logged(input, "soil"))
            .collect();

        let temperature = match self.wiring.temperature {
            Some(input) => TemperatureRaw::Analog(self.read_logged(input, "temperature")),
            None => TemperatureRaw::Analog(None),
        };
        let light = self
            .wiring
            .light
            .and_then(|input| self.read_logged(input, "light"));
        let battery = self
            .wiring
            .battery
            .and_then(|input| self.read_logged(input, "battery"));

        // Pulled up: a disconnected sensor reads high, i.e. "dry" when the
        // module is active-low.
        let rain_line_high = self.rain.as_ref().map_or(true, |pin| pin.is_high());

        RawFrame {
            soil,
            temperature,
            humidity: None,
            rain_line_high,
            light,
            battery,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_register_per_channel() {
        assert_eq!(config_for_channel(0), 0xC383);
        assert_eq!(config_for_channel(1), 0xD383);
        assert_eq!(config_for_channel(2), 0xE383);
        assert_eq!(config_for_channel(3), 0xF383);
    }

    #[test]
    fn config_base_has_correct_pga() {
        let pga = (CONFIG_BASE >> 9) & 0b111;
        assert_eq!(pga, 0b001, "PGA should be ±4.096 V");
    }

    #[test]
    fn config_base_is_single_shot_128sps() {
        assert_eq!((CONFIG_BASE >> 8) & 1, 1);
        assert_eq!((CONFIG_BASE >> 5) & 0b111, 0b100);
        assert_eq!((CONFIG_BASE >> 15) & 1, 1);
    }
}
