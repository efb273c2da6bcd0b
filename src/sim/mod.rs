//! Register-level simulators of the supported chips, for use with
//! [`crate::mock::MockBus`].
//!
//! Each simulator is a cheap handle around shared state: attach one clone to
//! the bus and keep another to drive inputs and inspect what the driver did.

pub mod ads1115;
pub mod bmp180;
pub mod lsm303dlhc;
pub mod pca9685;

pub use ads1115::Ads1115Sim;
pub use bmp180::Bmp180Sim;
pub use lsm303dlhc::Lsm303dlhcSim;
pub use pca9685::Pca9685Sim;
