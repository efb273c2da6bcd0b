//! Switch, binary input and software PWM capabilities over raw bus pins.

use crate::bus::{Claim, Resource, SharedBus};
use crate::clock::{SharedClock, Shutdown};
use crate::engine::SamplingEngine;
use crate::error::{Result, SensorError};
use crate::interfaces::{BinaryInput, Pwm, Switch};
use crate::observer::{Observable, ObserverRegistry};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

pub const GPIO_MIN: u8 = 2;
pub const GPIO_MAX: u8 = 28;

const DEFAULT_POLL_MS: u64 = 10;

pub const DEFAULT_PWM_FREQUENCY_HZ: f32 = 800.0;
pub const MAX_PWM_FREQUENCY_HZ: f32 = 10_000.0;

fn reserve(bus: &SharedBus, pin: u8) -> Result<Claim> {
    if !(GPIO_MIN..=GPIO_MAX).contains(&pin) {
        return Err(SensorError::out_of_range("GPIO number", pin));
    }
    bus.claim(Resource::Pin(pin), "GPIO")
}

/// Output pin driven through the bus.
#[derive(Debug)]
pub struct GpioSwitch {
    bus: SharedBus,
    pin: u8,
    _claim: Claim,
}

impl GpioSwitch {
    pub fn new(bus: SharedBus, pin: u8) -> Result<Self> {
        let claim = reserve(&bus, pin)?;
        Ok(Self {
            bus,
            pin,
            _claim: claim,
        })
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }
}

impl Switch for GpioSwitch {
    fn set(&self, on: bool) -> Result<()> {
        self.bus.set_pin(self.pin, on)?;
        Ok(())
    }
}

/// Pin and carrier frequency of one software PWM output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpioPwmConfig {
    pub pin: u8,
    #[serde(default = "default_pwm_frequency")]
    pub frequency_hz: f32,
}

fn default_pwm_frequency() -> f32 {
    DEFAULT_PWM_FREQUENCY_HZ
}

impl GpioPwmConfig {
    pub fn new(pin: u8) -> Self {
        Self {
            pin,
            frequency_hz: DEFAULT_PWM_FREQUENCY_HZ,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(GPIO_MIN..=GPIO_MAX).contains(&self.pin) {
            return Err(SensorError::out_of_range("GPIO number", self.pin));
        }
        let valid = self.frequency_hz > 0.0 && self.frequency_hz <= MAX_PWM_FREQUENCY_HZ;
        if !valid {
            return Err(SensorError::out_of_range("PWM frequency", self.frequency_hz));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PwmShared {
    duty_bits: AtomicU32,
    cycles: AtomicU64,
    shutdown: Shutdown,
}

impl PwmShared {
    fn duty(&self) -> f32 {
        f32::from_bits(self.duty_bits.load(Ordering::Relaxed))
    }
}

/// Software PWM: a thread toggles the pin once per period.
///
/// A duty cycle of 0 or 1 holds the pin steady. The pin is driven low when
/// the output is dropped.
pub struct GpioPwm {
    bus: SharedBus,
    pin: u8,
    frequency_hz: f32,
    shared: Arc<PwmShared>,
    handle: Option<JoinHandle<()>>,
    _claim: Claim,
}

impl GpioPwm {
    pub fn new(bus: SharedBus, clock: SharedClock, config: &GpioPwmConfig) -> Result<Self> {
        config.validate()?;
        let (pin, frequency_hz) = (config.pin, config.frequency_hz);
        let claim = reserve(&bus, pin)?;
        bus.set_pin(pin, false)?;

        let period = Duration::from_secs_f64(1.0 / f64::from(frequency_hz));
        let shared = Arc::new(PwmShared::default());
        let loop_shared = Arc::clone(&shared);
        let loop_bus = bus.clone();
        let handle = thread::Builder::new()
            .name(format!("gpio{pin}-pwm"))
            .spawn(move || run_pwm(&loop_bus, pin, period, &clock, &loop_shared))
            .map_err(|err| SensorError::Spawn(err.to_string()))?;
        debug!(pin, frequency_hz, "software PWM started");

        Ok(Self {
            bus,
            pin,
            frequency_hz,
            shared,
            handle: Some(handle),
            _claim: claim,
        })
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub fn frequency_hz(&self) -> f32 {
        self.frequency_hz
    }

    /// Completed PWM periods.
    pub fn cycles(&self) -> u64 {
        self.shared.cycles.load(Ordering::Relaxed)
    }
}

fn run_pwm(bus: &SharedBus, pin: u8, period: Duration, clock: &SharedClock, shared: &PwmShared) {
    // The constructor leaves the pin low.
    let mut level = Some(false);
    let mut drive = |on: bool| {
        if level == Some(on) {
            return;
        }
        match bus.set_pin(pin, on) {
            Ok(()) => level = Some(on),
            Err(err) => {
                level = None;
                warn!(pin, %err, "PWM edge lost");
            }
        }
    };

    loop {
        let high = period.mul_f32(shared.duty());
        let low = period.saturating_sub(high);
        if !high.is_zero() {
            drive(true);
            if clock.wait_for(&shared.shutdown, high) {
                break;
            }
        }
        if !low.is_zero() {
            drive(false);
            if clock.wait_for(&shared.shutdown, low) {
                break;
            }
        }
        shared.cycles.fetch_add(1, Ordering::Relaxed);
    }
}

impl Pwm for GpioPwm {
    fn set_duty_cycle(&self, duty_cycle: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&duty_cycle) {
            return Err(SensorError::out_of_range("duty cycle", duty_cycle));
        }
        self.shared
            .duty_bits
            .store(duty_cycle.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    fn duty_cycle(&self) -> Result<f32> {
        Ok(self.shared.duty())
    }
}

impl Drop for GpioPwm {
    fn drop(&mut self) {
        self.shared.shutdown.raise();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(pin = self.pin, "PWM thread panicked");
            }
        }
        if let Err(err) = self.bus.set_pin(self.pin, false) {
            warn!(pin = self.pin, %err, "could not drive PWM pin low");
        }
    }
}

impl fmt::Debug for GpioPwm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpioPwm")
            .field("pin", &self.pin)
            .field("frequency_hz", &self.frequency_hz)
            .field("duty_cycle", &self.shared.duty())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpioChannel {
    Level,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpioInputConfig {
    pub pin: u8,
    #[serde(default = "default_poll_ms")]
    pub poll_period_ms: u64,
}

fn default_poll_ms() -> u64 {
    DEFAULT_POLL_MS
}

impl GpioInputConfig {
    pub fn new(pin: u8) -> Self {
        Self {
            pin,
            poll_period_ms: DEFAULT_POLL_MS,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(GPIO_MIN..=GPIO_MAX).contains(&self.pin) {
            return Err(SensorError::out_of_range("GPIO number", self.pin));
        }
        if self.poll_period_ms == 0 {
            return Err(SensorError::InvalidConfig(
                "GPIO poll period must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Input pin that can also be polled in the background and observed.
#[derive(Debug)]
pub struct GpioBinaryInput {
    engine: SamplingEngine<GpioChannel, bool>,
    bus: SharedBus,
    pin: u8,
    _claim: Claim,
}

impl GpioBinaryInput {
    pub fn new(bus: SharedBus, clock: SharedClock, config: &GpioInputConfig) -> Result<Self> {
        config.validate()?;
        let claim = reserve(&bus, config.pin)?;
        let engine = SamplingEngine::new(
            "gpio",
            Arc::new(ObserverRegistry::new()),
            clock,
            Duration::from_millis(config.poll_period_ms),
        );
        Ok(Self {
            engine,
            bus,
            pin: config.pin,
            _claim: claim,
        })
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    /// Polls the pin every configured period and notifies observers.
    pub fn start(&self) -> Result<()> {
        self.start_with_period(self.engine.default_period())
    }

    pub fn start_with_period(&self, period: Duration) -> Result<()> {
        let bus = self.bus.clone();
        let pin = self.pin;
        self.engine
            .start(Some(period), move |_| Ok(bus.get_pin(pin)?))
    }

    pub fn stop(&self) {
        self.engine.stop();
    }

    pub fn engine(&self) -> &SamplingEngine<GpioChannel, bool> {
        &self.engine
    }
}

impl BinaryInput for GpioBinaryInput {
    fn is_on(&self) -> Result<bool> {
        Ok(self.bus.get_pin(self.pin)?)
    }
}

impl Observable<bool> for GpioBinaryInput {
    type Channel = GpioChannel;

    fn observers(&self) -> &ObserverRegistry<GpioChannel, bool> {
        self.engine.observers()
    }
}
