//! NXP PCA9685 16-channel, 12-bit PWM controller.
//!
//! Duty cycles live only in the device registers: reads go back to the chip
//! and derive the fraction from the programmed on/off tick pair.

use crate::bus::{Claim, Resource, SharedBus};
use crate::clock::SharedClock;
use crate::error::{Result, SensorError};
use crate::interfaces::Pwm;
use serde::{Deserialize, Serialize};
use static_assertions::{const_assert, const_assert_eq};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const CHANNELS: usize = 16;

const REG_MODE1: u8 = 0x00;
const REG_LED0_ON_L: u8 = 0x06;
const REG_ALL_LED_ON_L: u8 = 0xFA;
const REG_PRE_SCALE: u8 = 0xFE;
const LED_STRIDE: u8 = 4;

const_assert_eq!(CHANNELS, 16);
const_assert!(REG_LED0_ON_L as usize + LED_STRIDE as usize * CHANNELS <= REG_ALL_LED_ON_L as usize);

const MODE1_AUTO_INCREMENT: u8 = 0x20;
const MODE1_SLEEP: u8 = 0x10;

/// Bit 12 of an ON or OFF count: output fully on or fully off.
const FULL: u16 = 0x1000;
const TICKS: f32 = 4096.0;
const MAX_TICK: u16 = 4095;

const OSCILLATOR_HZ: f64 = 25_000_000.0;
const MIN_FREQUENCY_HZ: f64 = 24.0;
const MAX_FREQUENCY_HZ: f64 = 1526.0;
const OSCILLATOR_STARTUP: Duration = Duration::from_micros(500);

/// A validated output index, 0 to 15.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct PwmChannel(u8);

impl PwmChannel {
    pub fn new(index: u8) -> Result<Self> {
        if usize::from(index) < CHANNELS {
            Ok(Self(index))
        } else {
            Err(SensorError::out_of_range("PWM channel", index))
        }
    }

    pub fn index(self) -> u8 {
        self.0
    }

    fn on_register(self) -> u8 {
        REG_LED0_ON_L + LED_STRIDE * self.0
    }
}

impl TryFrom<u8> for PwmChannel {
    type Error = SensorError;

    fn try_from(index: u8) -> Result<Self> {
        Self::new(index)
    }
}

impl From<PwmChannel> for u8 {
    fn from(channel: PwmChannel) -> u8 {
        channel.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pca9685Config {
    pub address: u8,
    pub frequency_hz: f64,
}

impl Default for Pca9685Config {
    fn default() -> Self {
        Self {
            address: 0x40,
            frequency_hz: 200.0,
        }
    }
}

impl Pca9685Config {
    pub fn validate(&self) -> Result<()> {
        if !(0x40..=0x7F).contains(&self.address) {
            return Err(SensorError::out_of_range("PCA9685 address", self.address));
        }
        check_frequency(self.frequency_hz)
    }
}

fn check_frequency(hz: f64) -> Result<()> {
    if (MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&hz) {
        Ok(())
    } else {
        Err(SensorError::out_of_range("PWM frequency", hz))
    }
}

fn prescale(hz: f64) -> u8 {
    ((OSCILLATOR_HZ / (4096.0 * hz)).round() - 1.0).clamp(3.0, 255.0) as u8
}

/// (ON, OFF) tick counts for a duty cycle in `[0, 1]`.
fn encode(duty_cycle: f32) -> (u16, u16) {
    if duty_cycle >= 1.0 {
        return (FULL, 0);
    }
    let off = ((duty_cycle * TICKS).round() as u16).min(MAX_TICK);
    if off == 0 {
        (0, FULL)
    } else {
        (0, off)
    }
}

fn decode(on: u16, off: u16) -> f32 {
    if off & FULL != 0 {
        0.0
    } else if on & FULL != 0 {
        1.0
    } else {
        f32::from(off.wrapping_sub(on) & MAX_TICK) / TICKS
    }
}

fn pair_bytes(on: u16, off: u16) -> [u8; 4] {
    let [on_l, on_h] = on.to_le_bytes();
    let [off_l, off_h] = off.to_le_bytes();
    [on_l, on_h, off_l, off_h]
}

struct Pca9685Inner {
    bus: SharedBus,
    clock: SharedClock,
    addr: u8,
    _claim: Claim,
}

impl Pca9685Inner {
    fn program_frequency(&self, hz: f64) -> Result<()> {
        check_frequency(hz)?;
        let prescale = prescale(hz);
        // The prescaler only accepts writes while the oscillator is asleep.
        let mut tx = self.bus.begin(self.addr)?;
        tx.write_u8(REG_MODE1, MODE1_AUTO_INCREMENT | MODE1_SLEEP)?;
        tx.write_u8(REG_PRE_SCALE, prescale)?;
        tx.write_u8(REG_MODE1, MODE1_AUTO_INCREMENT)?;
        drop(tx);
        self.clock.sleep(OSCILLATOR_STARTUP);
        debug!(addr = self.addr, hz, prescale, "PWM frequency programmed");
        Ok(())
    }

    fn set_duty_cycle(&self, channel: PwmChannel, duty_cycle: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&duty_cycle) {
            return Err(SensorError::out_of_range("duty cycle", duty_cycle));
        }
        let (on, off) = encode(duty_cycle);
        self.bus
            .begin(self.addr)?
            .write(channel.on_register(), &pair_bytes(on, off))?;
        Ok(())
    }

    fn duty_cycle(&self, channel: PwmChannel) -> Result<f32> {
        let bytes = self.bus.begin(self.addr)?.read(channel.on_register(), 4)?;
        let on = u16::from_le_bytes([bytes[0], bytes[1]]);
        let off = u16::from_le_bytes([bytes[2], bytes[3]]);
        Ok(decode(on, off))
    }
}

pub struct Pca9685 {
    inner: Arc<Pca9685Inner>,
}

impl Pca9685 {
    /// Programs the frequency and turns every output fully off.
    pub fn new(bus: SharedBus, clock: SharedClock, config: &Pca9685Config) -> Result<Self> {
        config.validate()?;
        let claim = bus.claim(Resource::Device(config.address), "PCA9685")?;
        let inner = Pca9685Inner {
            bus,
            clock,
            addr: config.address,
            _claim: claim,
        };

        // Sets auto-increment, which the four byte ALL_LED write relies on.
        inner.program_frequency(config.frequency_hz)?;
        inner
            .bus
            .begin(inner.addr)?
            .write(REG_ALL_LED_ON_L, &pair_bytes(0, FULL))?;
        info!(addr = inner.addr, hz = config.frequency_hz, "PCA9685 initialised");

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn addr(&self) -> u8 {
        self.inner.addr
    }

    pub fn set_frequency(&self, hz: f64) -> Result<()> {
        self.inner.program_frequency(hz)
    }

    /// Output frequency the programmed prescaler actually produces.
    pub fn frequency(&self) -> Result<f64> {
        let prescale = self.inner.bus.begin(self.inner.addr)?.read_u8(REG_PRE_SCALE)?;
        Ok(OSCILLATOR_HZ / (4096.0 * (f64::from(prescale) + 1.0)))
    }

    pub fn set_duty_cycle(&self, channel: u8, duty_cycle: f32) -> Result<()> {
        self.inner
            .set_duty_cycle(PwmChannel::new(channel)?, duty_cycle)
    }

    pub fn duty_cycle(&self, channel: u8) -> Result<f32> {
        self.inner.duty_cycle(PwmChannel::new(channel)?)
    }

    /// One output as a standalone [`Pwm`].
    pub fn as_pwm(&self, channel: u8) -> Result<Pca9685Pwm> {
        Ok(Pca9685Pwm {
            inner: Arc::clone(&self.inner),
            channel: PwmChannel::new(channel)?,
        })
    }
}

impl fmt::Debug for Pca9685 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pca9685")
            .field("addr", &self.inner.addr)
            .finish_non_exhaustive()
    }
}

pub struct Pca9685Pwm {
    inner: Arc<Pca9685Inner>,
    channel: PwmChannel,
}

impl Pca9685Pwm {
    pub fn channel(&self) -> PwmChannel {
        self.channel
    }
}

impl Pwm for Pca9685Pwm {
    fn set_duty_cycle(&self, duty_cycle: f32) -> Result<()> {
        self.inner.set_duty_cycle(self.channel, duty_cycle)
    }

    fn duty_cycle(&self) -> Result<f32> {
        self.inner.duty_cycle(self.channel)
    }
}

impl fmt::Debug for Pca9685Pwm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pca9685Pwm")
            .field("addr", &self.inner.addr)
            .field("channel", &self.channel)
            .finish()
    }
}
