pub mod ads1115;
pub mod bmp180;
pub mod hcsr04;
pub mod lsm303dlhc;
pub mod pca9685;

pub use ads1115::{Ads1115, Ads1115Config, AddressPin, DataRate, Gain, GainSetting, Input};
pub use bmp180::{Bmp180, Bmp180Config, Measurement, SamplingMode};
pub use hcsr04::{Hcsr04, Hcsr04Config, RangeChannel};
pub use lsm303dlhc::{
    FieldBounds, Lsm303dlhc, Lsm303dlhcConfig, MagChannel, MagGain, MagGainSetting, OutputRate,
};
pub use pca9685::{Pca9685, Pca9685Config, Pca9685Pwm, PwmChannel};

/// Speed of sound in air at roughly 20 °C, in metres per second.
pub const SPEED_OF_SOUND: f64 = 343.0;

/// Standard atmospheric pressure at sea level, in hPa.
pub const STANDARD_SEA_LEVEL_HPA: f64 = 1013.25;
