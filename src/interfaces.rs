//! Capability traits every driver is exposed through.
//!
//! Drivers implement only the capabilities they support, and compose other
//! drivers by owning boxed capability objects (the HC-SR04 owns a `Switch`
//! and a `BinaryInput`, for instance).

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Anything that yields a numeric reading.
pub trait AnalogInput: Send + Sync {
    fn read_value(&self) -> Result<f32>;
}

/// Anything with an on/off state that can be read.
pub trait BinaryInput: Send + Sync {
    fn is_on(&self) -> Result<bool>;

    fn is_off(&self) -> Result<bool> {
        self.is_on().map(|on| !on)
    }
}

/// Anything that can be turned on and off.
pub trait Switch: Send + Sync {
    fn set(&self, on: bool) -> Result<()>;

    fn turn_on(&self) -> Result<()> {
        self.set(true)
    }

    fn turn_off(&self) -> Result<()> {
        self.set(false)
    }
}

/// A pulse-width-modulated output. The duty cycle is a fraction in `[0, 1]`.
pub trait Pwm: Send + Sync {
    fn set_duty_cycle(&self, duty_cycle: f32) -> Result<()>;
    fn duty_cycle(&self) -> Result<f32>;
}

impl<T: AnalogInput + ?Sized> AnalogInput for Box<T> {
    fn read_value(&self) -> Result<f32> {
        (**self).read_value()
    }
}

impl<T: AnalogInput + ?Sized> AnalogInput for std::sync::Arc<T> {
    fn read_value(&self) -> Result<f32> {
        (**self).read_value()
    }
}

impl<T: BinaryInput + ?Sized> BinaryInput for Box<T> {
    fn is_on(&self) -> Result<bool> {
        (**self).is_on()
    }
}

impl<T: Switch + ?Sized> Switch for Box<T> {
    fn set(&self, on: bool) -> Result<()> {
        (**self).set(on)
    }
}

/// A three-axis reading, such as a magnetic field in gauss.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vector {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn magnitude(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

impl fmt::Display for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3})", self.x, self.y, self.z)
    }
}

/// An [`AnalogInput`] backed by a closure.
pub struct FunctionAnalogInput<F> {
    function: F,
}

impl<F> FunctionAnalogInput<F>
where
    F: Fn() -> Result<f32> + Send + Sync,
{
    pub fn new(function: F) -> Self {
        Self { function }
    }
}

impl<F> AnalogInput for FunctionAnalogInput<F>
where
    F: Fn() -> Result<f32> + Send + Sync,
{
    fn read_value(&self) -> Result<f32> {
        (self.function)()
    }
}

impl<F> fmt::Debug for FunctionAnalogInput<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FunctionAnalogInput")
    }
}
