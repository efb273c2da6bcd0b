//! # pihwctrl
//!
//! Sampling and observation framework for single-board-computer GPIO/I2C
//! peripherals.
//!
//! Drivers turn single-shot, blocking register transactions into values in
//! physical units, and a per-driver background sampling loop turns those into
//! a stream of notifications for registered observers.
//!
//! ## Features
//!
//! - **Capability traits**: [`AnalogInput`], [`BinaryInput`], [`Switch`], [`Pwm`]
//!   and [`Observable`], so drivers compose by ownership
//! - **Sampling engine**: one owned thread per driver, joined on `stop()` and on drop
//! - **Filters**: [`StateChangeFilter`] for observers, [`MeanFilter`] for analog inputs
//! - **Drivers**: ADS1115 (auto-ranging ADC), BMP180 (pressure/altitude),
//!   HC-SR04 (ultrasonic range), LSM303DLHC (magnetometer), PCA9685
//!   (16 channel PWM), GPIO pins and software PWM
//! - **Test doubles**: [`mock`] bus, clock and pins, plus register-level [`sim`] chips
//!
//! ## Quick Start
//!
//! ```rust
//! use pihwctrl::mock::{MockBus, MockClock};
//! use pihwctrl::sim::Pca9685Sim;
//! use pihwctrl::{Pca9685, Pca9685Config, SharedBus};
//!
//! let bus = MockBus::strict();
//! bus.attach(0x40, Pca9685Sim::new());
//!
//! let pwm = Pca9685::new(SharedBus::new(bus), MockClock::shared(), &Pca9685Config::default())?;
//! pwm.set_duty_cycle(12, 0.7)?;
//! assert!((pwm.duty_cycle(12)? - 0.7).abs() < 1.0 / 4096.0);
//! # Ok::<(), pihwctrl::SensorError>(())
//! ```
//!
//! ## Architecture
//!
//! - [`bus`] - bus capability, shared handle and address/pin claims
//! - [`clock`] - time source; virtual in tests
//! - [`observer`] - observer registry and the [`Observable`] capability
//! - [`engine`] - the background sampling loop
//! - [`controls`] - filter decorators
//! - [`modules`] - chip drivers
//! - [`gpio`] - pin-level switch, input and software PWM
//! - [`config`] - JSON rig configuration

#![forbid(unsafe_code)]
#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![cfg_attr(test, allow(clippy::float_cmp))]

pub mod bus;
pub mod clock;
pub mod config;
pub mod controls;
pub mod engine;
pub mod error;
pub mod gpio;
pub mod interfaces;
pub mod mock;
pub mod modules;
pub mod observer;
pub mod sim;

pub use bus::{Bus, SharedBus};
pub use clock::{Clock, SharedClock, SystemClock};
pub use config::RigConfig;
pub use controls::{MeanFilter, StateChangeFilter};
pub use engine::{EngineStats, LoopState, SamplingEngine};
pub use error::{BusError, Result, SensorError};
pub use gpio::{GpioBinaryInput, GpioPwm, GpioSwitch};
pub use interfaces::{AnalogInput, BinaryInput, FunctionAnalogInput, Pwm, Switch, Vector};
pub use modules::{Ads1115, Bmp180, Hcsr04, Lsm303dlhc, Pca9685};
pub use modules::{Ads1115Config, Bmp180Config, Hcsr04Config, Lsm303dlhcConfig, Pca9685Config};
pub use observer::{Observable, Observer, ObserverId};
