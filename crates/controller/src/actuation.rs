//! Valve and pump outputs. The `gpio` feature gates the real rppal drivers;
//! without it, mock implementations track state and log changes.
//!
//! Two back-ends exist: a relay board with one output per zone plus a pump
//! relay, and a single servo-driven valve that opens whenever any zone is
//! active.

use anyhow::Result;
use std::collections::{BTreeSet, HashMap};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

use crate::config::{ActuationSettings, ActuatorKind, ZoneEntry};
use crate::controller::ZoneId;

/// Fire-and-forget output toggles. Implementations never fail: a write that
/// cannot be delivered is logged and dropped.
pub trait ActuationPort {
    fn set_zone(&mut self, zone: ZoneId, on: bool);
    fn set_pump(&mut self, on: bool);
    /// Drive every output to its safe state.
    fn all_off(&mut self);
}

impl<P: ActuationPort + ?Sized> ActuationPort for Box<P> {
    fn set_zone(&mut self, zone: ZoneId, on: bool) {
        (**self).set_zone(zone, on)
    }

    fn set_pump(&mut self, on: bool) {
        (**self).set_pump(on)
    }

    fn all_off(&mut self) {
        (**self).all_off()
    }
}

pub type DynPort = Box<dyn ActuationPort + Send + Sync>;

/// Build the back-end selected by `settings.kind`, with every output off.
pub fn build(zones: &[ZoneEntry], settings: &ActuationSettings) -> Result<DynPort> {
    let mut port: DynPort = match settings.kind {
        ActuatorKind::Relay => Box::new(ValveBoard::new(zones, settings)?),
        ActuatorKind::Servo => Box::new(ServoValve::new(zones, settings)?),
    };
    port.all_off();
    Ok(port)
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

// ---------------------------------------------------------------------------
// Relay board (production: requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub struct ValveBoard {
    pins: HashMap<ZoneId, OutputPin>,
    pump: Option<OutputPin>,
    active_low: bool, // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl ValveBoard {
    pub fn new(zones: &[ZoneEntry], settings: &ActuationSettings) -> Result<Self> {
        let gpio = Gpio::new()?;
        let active_low = settings.active_low;
        let mut pins = HashMap::new();

        for zone in zones {
            let mut pin = gpio.get(zone.valve_gpio_pin)?.into_output();
            drive(&mut pin, active_low, false);
            pins.insert(ZoneId(zone.zone_id), pin);
        }

        let pump = match settings.pump_gpio_pin {
            Some(n) => {
                let mut pin = gpio.get(n)?.into_output();
                drive(&mut pin, active_low, false);
                Some(pin)
            }
            None => None,
        };

        tracing::info!(zones = pins.len(), active_low, "relay board initialised");
        Ok(Self {
            pins,
            pump,
            active_low,
        })
    }
}

/// Active-low relay: LOW = ON, HIGH = OFF. Active-high is the reverse.
#[cfg(feature = "gpio")]
fn drive(pin: &mut OutputPin, active_low: bool, on: bool) {
    if on != active_low {
        pin.set_high()
    } else {
        pin.set_low()
    }
}

#[cfg(feature = "gpio")]
impl ActuationPort for ValveBoard {
    fn set_zone(&mut self, zone: ZoneId, on: bool) {
        match self.pins.get_mut(&zone) {
            Some(pin) => {
                drive(pin, self.active_low, on);
                tracing::info!(%zone, "valve set {}", on_off(on));
            }
            None => tracing::warn!(%zone, "no valve wired for zone"),
        }
    }

    fn set_pump(&mut self, on: bool) {
        if let Some(pin) = self.pump.as_mut() {
            drive(pin, self.active_low, on);
            tracing::info!("pump set {}", on_off(on));
        }
    }

    fn all_off(&mut self) {
        let active_low = self.active_low;
        for pin in self.pins.values_mut() {
            drive(pin, active_low, false);
        }
        if let Some(pin) = self.pump.as_mut() {
            drive(pin, active_low, false);
        }
        tracing::info!("all outputs off");
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (development: no hardware, tracks and logs state)
// ---------------------------------------------------------------------------

#[cfg(not(feature = "gpio"))]
pub struct ValveBoard {
    pub(crate) zones: HashMap<ZoneId, bool>,
    pub(crate) pump: Option<bool>,
}

#[cfg(not(feature = "gpio"))]
impl ValveBoard {
    pub fn new(zones: &[ZoneEntry], settings: &ActuationSettings) -> Result<Self> {
        let mut map = HashMap::new();
        for zone in zones {
            tracing::info!(
                zone = zone.zone_id,
                gpio = zone.valve_gpio_pin,
                "[mock-gpio] registered valve (not wired)"
            );
            map.insert(ZoneId(zone.zone_id), false);
        }
        tracing::info!("[mock-gpio] relay board initialised (no hardware)");
        Ok(Self {
            zones: map,
            pump: settings.pump_gpio_pin.map(|_| false),
        })
    }
}

#[cfg(not(feature = "gpio"))]
impl ActuationPort for ValveBoard {
    fn set_zone(&mut self, zone: ZoneId, on: bool) {
        match self.zones.get_mut(&zone) {
            Some(state) => {
                *state = on;
                tracing::info!(%zone, "[mock-gpio] valve set {}", on_off(on));
            }
            None => tracing::warn!(%zone, "[mock-gpio] no valve wired for zone"),
        }
    }

    fn set_pump(&mut self, on: bool) {
        if let Some(state) = self.pump.as_mut() {
            *state = on;
            tracing::info!("[mock-gpio] pump set {}", on_off(on));
        }
    }

    fn all_off(&mut self) {
        for state in self.zones.values_mut() {
            *state = false;
        }
        if let Some(state) = self.pump.as_mut() {
            *state = false;
        }
        tracing::info!("[mock-gpio] all outputs off");
    }
}

// ---------------------------------------------------------------------------
// Servo valve
// ---------------------------------------------------------------------------

/// Hobby-servo frame: 50 Hz, 1.0-2.0 ms pulse for 0-180°.
#[cfg(feature = "gpio")]
const SERVO_PERIOD: std::time::Duration = std::time::Duration::from_millis(20);

fn servo_pulse_us(angle_deg: f32) -> u64 {
    let a = angle_deg.clamp(0.0, 180.0);
    1000 + (a / 180.0 * 1000.0).round() as u64
}

/// One valve for every zone. Open while any zone is on; there is no pump.
pub struct ServoValve {
    known: BTreeSet<ZoneId>,
    active: BTreeSet<ZoneId>,
    open_deg: f32,
    closed_deg: f32,
    angle: f32,
    #[cfg(feature = "gpio")]
    pin: OutputPin,
}

impl ServoValve {
    pub fn new(zones: &[ZoneEntry], settings: &ActuationSettings) -> Result<Self> {
        #[cfg(feature = "gpio")]
        let pin = Gpio::new()?.get(settings.servo_gpio_pin)?.into_output();

        tracing::info!(
            gpio = settings.servo_gpio_pin,
            open = settings.servo_open_deg,
            closed = settings.servo_closed_deg,
            "servo valve initialised"
        );

        let mut valve = Self {
            known: zones.iter().map(|z| ZoneId(z.zone_id)).collect(),
            active: BTreeSet::new(),
            open_deg: settings.servo_open_deg,
            closed_deg: settings.servo_closed_deg,
            angle: f32::NAN,
            #[cfg(feature = "gpio")]
            pin,
        };
        valve.move_to(settings.servo_closed_deg);
        Ok(valve)
    }

    #[cfg(test)]
    pub(crate) fn angle(&self) -> f32 {
        self.angle
    }

    fn move_to(&mut self, angle: f32) {
        if self.angle == angle {
            return;
        }
        let pulse_us = servo_pulse_us(angle);

        #[cfg(feature = "gpio")]
        if let Err(e) = self
            .pin
            .set_pwm(SERVO_PERIOD, std::time::Duration::from_micros(pulse_us))
        {
            tracing::error!(angle, "servo pwm write failed: {e}");
            return;
        }

        self.angle = angle;
        tracing::info!(angle, pulse_us, "servo moved");
    }

    fn sync(&mut self) {
        let target = if self.active.is_empty() {
            self.closed_deg
        } else {
            self.open_deg
        };
        self.move_to(target);
    }
}

impl ActuationPort for ServoValve {
    fn set_zone(&mut self, zone: ZoneId, on: bool) {
        if !self.known.contains(&zone) {
            tracing::warn!(%zone, "servo valve has no such zone");
            return;
        }
        if on {
            self.active.insert(zone);
        } else {
            self.active.remove(&zone);
        }
        self.sync();
    }

    fn set_pump(&mut self, on: bool) {
        tracing::debug!("servo variant has no pump (requested {})", on_off(on));
    }

    fn all_off(&mut self) {
        self.active.clear();
        self.sync();
    }
}

// ---------------------------------------------------------------------------
// Recording port (tests)
// ---------------------------------------------------------------------------

#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Write {
    Zone(ZoneId, bool),
    Pump(bool),
    AllOff,
}

/// Records every write and tracks resulting output levels.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingPort {
    pub writes: Vec<Write>,
    pub zones: std::collections::BTreeMap<ZoneId, bool>,
    pub pump: bool,
}

#[cfg(test)]
impl RecordingPort {
    pub fn zone_on(&self, zone: u8) -> bool {
        self.zones.get(&ZoneId(zone)).copied().unwrap_or(false)
    }
}

#[cfg(test)]
impl ActuationPort for RecordingPort {
    fn set_zone(&mut self, zone: ZoneId, on: bool) {
        self.writes.push(Write::Zone(zone, on));
        self.zones.insert(zone, on);
    }

    fn set_pump(&mut self, on: bool) {
        self.writes.push(Write::Pump(on));
        self.pump = on;
    }

    fn all_off(&mut self) {
        self.writes.push(Write::AllOff);
        for v in self.zones.values_mut() {
            *v = false;
        }
        self.pump = false;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
