//! JSON configuration for a whole sensor rig.
//!
//! Every section is optional; a missing driver section means that driver is
//! not instantiated. Values are validated at load time, so a rig built from a
//! loaded [`RigConfig`] fails only on bus errors.

use crate::bus::{Claim, Resource, SharedBus};
use crate::error::{Result, SensorError};
use crate::gpio::{GpioInputConfig, GpioPwmConfig, GPIO_MAX, GPIO_MIN};
use crate::modules::{
    Ads1115Config, Bmp180Config, Hcsr04Config, Lsm303dlhcConfig, Pca9685Config,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// HC-SR04 wiring plus its driver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeFinderConfig {
    pub trigger_pin: u8,
    pub echo_pin: u8,
    #[serde(flatten)]
    pub sensor: Hcsr04Config,
}

impl RangeFinderConfig {
    /// Holds both pins without driving them, for a rig whose echo is simulated.
    pub fn reserve_pins(&self, bus: &SharedBus) -> Result<[Claim; 2]> {
        Ok([
            bus.claim(Resource::Pin(self.trigger_pin), "HC-SR04")?,
            bus.claim(Resource::Pin(self.echo_pin), "HC-SR04")?,
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RigConfig {
    pub ads1115: Option<Ads1115Config>,
    pub bmp180: Option<Bmp180Config>,
    pub hcsr04: Option<RangeFinderConfig>,
    pub lsm303dlhc: Option<Lsm303dlhcConfig>,
    pub pca9685: Option<Pca9685Config>,
    pub inputs: Vec<GpioInputConfig>,
    pub pwm_outputs: Vec<GpioPwmConfig>,
}

impl RigConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: RigConfig = serde_json::from_str(json)
            .map_err(|err| SensorError::InvalidConfig(format!("malformed rig config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|err| SensorError::InvalidConfig(format!("{}: {err}", path.display())))?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|err| SensorError::InvalidConfig(err.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(ads) = &self.ads1115 {
            ads.validate()?;
        }
        if let Some(bmp) = &self.bmp180 {
            bmp.validate()?;
        }
        if let Some(mag) = &self.lsm303dlhc {
            mag.validate()?;
        }
        if let Some(pwm) = &self.pca9685 {
            pwm.validate()?;
        }
        for input in &self.inputs {
            input.validate()?;
        }
        for output in &self.pwm_outputs {
            output.validate()?;
        }

        let mut pins: Vec<u8> = self
            .inputs
            .iter()
            .map(|input| input.pin)
            .chain(self.pwm_outputs.iter().map(|output| output.pin))
            .collect();
        if let Some(range) = &self.hcsr04 {
            range.sensor.validate()?;
            for pin in [range.trigger_pin, range.echo_pin] {
                if !(GPIO_MIN..=GPIO_MAX).contains(&pin) {
                    return Err(SensorError::out_of_range("GPIO number", pin));
                }
                pins.push(pin);
            }
        }
        let mut seen = HashSet::new();
        if let Some(pin) = pins.iter().find(|pin| !seen.insert(**pin)) {
            return Err(SensorError::InvalidConfig(format!("GPIO {pin} assigned twice")));
        }
        Ok(())
    }
}
