//! HC-SR04 ultrasonic range finder.
//!
//! A 10 µs trigger pulse makes the module emit a burst; the echo line then
//! stays high for as long as the sound took to come back. Distance is half the
//! echo duration times the speed of sound.
//!
//! An echo that never rises or never falls within the timeout means nothing
//! was in range, which is reported as the configured maximum distance rather
//! than as an error.

use crate::bus::SharedBus;
use crate::clock::SharedClock;
use crate::engine::SamplingEngine;
use crate::error::{Result, SensorError};
use crate::gpio::{GpioBinaryInput, GpioInputConfig, GpioSwitch};
use crate::interfaces::{AnalogInput, BinaryInput, Switch};
use crate::modules::SPEED_OF_SOUND;
use crate::observer::{Observable, ObserverRegistry};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, trace};

const TRIGGER_PULSE: Duration = Duration::from_micros(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeChannel {
    Distance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hcsr04Config {
    /// Metres. Also the value reported when no echo is seen.
    pub max_distance_m: f64,
    /// Bound on each of the echo rise and echo fall waits.
    pub timeout_ms: u64,
    pub sampling_period_ms: u64,
}

impl Default for Hcsr04Config {
    fn default() -> Self {
        Self {
            max_distance_m: 4.0,
            timeout_ms: 100,
            sampling_period_ms: 60,
        }
    }
}

impl Hcsr04Config {
    pub fn validate(&self) -> Result<()> {
        if !self.max_distance_m.is_finite() || self.max_distance_m <= 0.0 {
            return Err(SensorError::out_of_range("maximum distance", self.max_distance_m));
        }
        if self.timeout_ms == 0 {
            return Err(SensorError::InvalidConfig("echo timeout must be non-zero".to_string()));
        }
        if self.sampling_period_ms == 0 {
            return Err(SensorError::InvalidConfig(
                "sampling period must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

struct Hcsr04Inner {
    trigger: Box<dyn Switch>,
    echo: Box<dyn BinaryInput>,
    clock: SharedClock,
    max_distance_m: f64,
    timeout: Duration,
    pulsing: Mutex<()>,
}

impl Hcsr04Inner {
    fn read_distance(&self) -> Result<f64> {
        let _pulsing = self.pulsing.lock().unwrap_or_else(PoisonError::into_inner);

        self.trigger.turn_on()?;
        self.clock.sleep(TRIGGER_PULSE);
        self.trigger.turn_off()?;
        let triggered = self.clock.now();

        let Some(rise) = self.wait_for_echo(true, triggered)? else {
            debug!("echo never asserted");
            return Ok(self.max_distance_m);
        };
        let Some(fall) = self.wait_for_echo(false, rise)? else {
            debug!("echo never de-asserted");
            return Ok(self.max_distance_m);
        };

        let echo = fall.saturating_sub(rise);
        let distance = echo.as_secs_f64() * SPEED_OF_SOUND / 2.0;
        trace!(echo_us = echo.as_micros() as u64, distance, "echo timed");
        Ok(distance.min(self.max_distance_m))
    }

    /// Time at which the echo line reached `level`, or `None` on timeout.
    fn wait_for_echo(&self, level: bool, since: Duration) -> Result<Option<Duration>> {
        loop {
            let now = self.clock.now();
            if self.echo.is_on()? == level {
                return Ok(Some(now));
            }
            if now.saturating_sub(since) >= self.timeout {
                return Ok(None);
            }
            self.clock.tick();
        }
    }
}

pub struct Hcsr04 {
    engine: SamplingEngine<RangeChannel, f64>,
    inner: Arc<Hcsr04Inner>,
}

impl Hcsr04 {
    pub fn new<S, E>(trigger: S, echo: E, clock: SharedClock, config: &Hcsr04Config) -> Result<Self>
    where
        S: Switch + 'static,
        E: BinaryInput + 'static,
    {
        config.validate()?;
        // The first pulse must start from a low trigger line.
        trigger.turn_off()?;
        let engine = SamplingEngine::new(
            "hcsr04",
            Arc::new(ObserverRegistry::new()),
            Arc::clone(&clock),
            Duration::from_millis(config.sampling_period_ms),
        );
        Ok(Self {
            engine,
            inner: Arc::new(Hcsr04Inner {
                trigger: Box::new(trigger),
                echo: Box::new(echo),
                clock,
                max_distance_m: config.max_distance_m,
                timeout: Duration::from_millis(config.timeout_ms),
                pulsing: Mutex::new(()),
            }),
        })
    }

    /// Wires the module to two bus GPIO pins.
    pub fn with_pins(
        bus: SharedBus,
        clock: SharedClock,
        trigger_pin: u8,
        echo_pin: u8,
        config: &Hcsr04Config,
    ) -> Result<Self> {
        let trigger = GpioSwitch::new(bus.clone(), trigger_pin)?;
        let echo = GpioBinaryInput::new(bus, Arc::clone(&clock), &GpioInputConfig::new(echo_pin))?;
        Self::new(trigger, echo, clock, config)
    }

    pub fn max_distance(&self) -> f64 {
        self.inner.max_distance_m
    }

    /// One trigger/echo cycle, in metres.
    pub fn read_distance(&self) -> Result<f64> {
        self.inner.read_distance()
    }

    pub fn start(&self) -> Result<()> {
        self.start_with_period(self.engine.default_period())
    }

    pub fn start_with_period(&self, period: Duration) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.engine
            .start(Some(period), move |_| inner.read_distance())
    }

    pub fn stop(&self) {
        self.engine.stop();
    }

    pub fn engine(&self) -> &SamplingEngine<RangeChannel, f64> {
        &self.engine
    }
}

impl AnalogInput for Hcsr04 {
    fn read_value(&self) -> Result<f32> {
        Ok(self.read_distance()? as f32)
    }
}

impl Observable<f64> for Hcsr04 {
    type Channel = RangeChannel;

    fn observers(&self) -> &ObserverRegistry<RangeChannel, f64> {
        self.engine.observers()
    }
}

impl fmt::Debug for Hcsr04 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hcsr04")
            .field("max_distance_m", &self.inner.max_distance_m)
            .field("timeout", &self.inner.timeout)
            .finish_non_exhaustive()
    }
}
