//! Bosch BMP180 barometric pressure and temperature sensor.
//!
//! Temperature and pressure share one output register, so every measurement
//! holds a device lock from the start command until the result is read.
//! Pressure compensation needs the current temperature, which means a pressure
//! reading always performs a temperature conversion first.

use crate::bus::{Claim, Resource, SharedBus, MAX_TRANSFER_LEN};
use crate::clock::SharedClock;
use crate::engine::SamplingEngine;
use crate::error::{Result, SensorError};
use crate::interfaces::{AnalogInput, FunctionAnalogInput};
use crate::modules::STANDARD_SEA_LEVEL_HPA;
use crate::observer::{Observable, ObserverRegistry};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

pub const BMP180_ADDR: u8 = 0x77;
pub const BMP180_CHIP_ID: u8 = 0x55;

const REG_CALIBRATION: u8 = 0xAA;
const REG_CHIP_ID: u8 = 0xD0;
const REG_SOFT_RESET: u8 = 0xE0;
const REG_CONTROL: u8 = 0xF4;
const REG_OUT: u8 = 0xF6;

const CALIBRATION_LEN: usize = 22;
const_assert!(CALIBRATION_LEN <= MAX_TRANSFER_LEN);
const_assert!(REG_CALIBRATION as usize + CALIBRATION_LEN <= 0xC0);

const CMD_TEMPERATURE: u8 = 0x2E;
const CMD_PRESSURE: u8 = 0x34;
const CMD_SOFT_RESET: u8 = 0xB6;

const TEMPERATURE_WAIT: Duration = Duration::from_micros(4_500);
const STARTUP_WAIT: Duration = Duration::from_millis(10);

/// Barometric formula constants (international standard atmosphere).
const ALTITUDE_SCALE_M: f64 = 44_330.0;
const ALTITUDE_EXPONENT: f64 = 5.255;

/// Oversampling setting; trades conversion time for resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SamplingMode {
    UltraLowPower,
    #[default]
    Standard,
    HighResolution,
    UltraHighResolution,
}

impl SamplingMode {
    pub fn oversampling(self) -> u8 {
        self as u8
    }

    pub fn pressure_wait(self) -> Duration {
        Duration::from_micros(match self {
            SamplingMode::UltraLowPower => 4_500,
            SamplingMode::Standard => 7_500,
            SamplingMode::HighResolution => 13_500,
            SamplingMode::UltraHighResolution => 25_500,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Measurement {
    /// Degrees Celsius.
    Temperature,
    /// Hectopascal.
    Pressure,
    /// Metres above the calibrated sea level.
    Altitude,
    RawTemperature,
    RawPressure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bmp180Config {
    pub mode: SamplingMode,
    pub sea_level_hpa: f64,
    /// Issue a soft reset before reading the calibration data.
    pub reset: bool,
}

impl Default for Bmp180Config {
    fn default() -> Self {
        Self {
            mode: SamplingMode::default(),
            sea_level_hpa: STANDARD_SEA_LEVEL_HPA,
            reset: false,
        }
    }
}

impl Bmp180Config {
    pub fn validate(&self) -> Result<()> {
        check_sea_level(self.sea_level_hpa)
    }
}

fn check_sea_level(hpa: f64) -> Result<()> {
    if hpa.is_finite() && hpa > 0.0 {
        Ok(())
    } else {
        Err(SensorError::out_of_range("sea level pressure", hpa))
    }
}

/// Factory calibration coefficients from the device EEPROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calibration {
    pub ac1: i16,
    pub ac2: i16,
    pub ac3: i16,
    pub ac4: u16,
    pub ac5: u16,
    pub ac6: u16,
    pub b1: i16,
    pub b2: i16,
    pub mb: i16,
    pub mc: i16,
    pub md: i16,
}

impl Calibration {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != CALIBRATION_LEN {
            return Err(SensorError::InvalidCalibration("wrong length"));
        }
        let mut words = [0u16; CALIBRATION_LEN / 2];
        for (word, pair) in words.iter_mut().zip(bytes.chunks_exact(2)) {
            *word = u16::from_be_bytes([pair[0], pair[1]]);
        }
        // An erased or disconnected EEPROM reads back as all zeros or all ones.
        if words.iter().any(|&word| word == 0x0000 || word == 0xFFFF) {
            return Err(SensorError::InvalidCalibration("blank coefficient"));
        }

        Ok(Self {
            ac1: words[0] as i16,
            ac2: words[1] as i16,
            ac3: words[2] as i16,
            ac4: words[3],
            ac5: words[4],
            ac6: words[5],
            b1: words[6] as i16,
            b2: words[7] as i16,
            mb: words[8] as i16,
            mc: words[9] as i16,
            md: words[10] as i16,
        })
    }

    /// Returns `B5`, the intermediate both compensations use.
    fn b5(&self, ut: i32) -> Result<i64> {
        let x1 = ((i64::from(ut) - i64::from(self.ac6)) * i64::from(self.ac5)) >> 15;
        let divisor = x1 + i64::from(self.md);
        if divisor == 0 {
            return Err(SensorError::InvalidCalibration("temperature divisor is zero"));
        }
        let x2 = (i64::from(self.mc) << 11) / divisor;
        Ok(x1 + x2)
    }

    /// True temperature in 0.1 °C.
    pub fn temperature(&self, ut: i32) -> Result<i32> {
        let tenths = (self.b5(ut)? + 8) >> 4;
        i32::try_from(tenths).map_err(|_| SensorError::out_of_range("raw temperature", ut))
    }

    /// True pressure in Pa, following the datasheet integer algorithm.
    ///
    /// Intermediates are 64-bit so that no raw reading can overflow. A raw
    /// pressure below the `B3` offset has no physical meaning and is rejected.
    pub fn pressure(&self, ut: i32, up: i32, oss: u8) -> Result<i32> {
        let b6 = self.b5(ut)? - 4000;

        let x1 = (i64::from(self.b2) * ((b6 * b6) >> 12)) >> 11;
        let x2 = (i64::from(self.ac2) * b6) >> 11;
        let x3 = x1 + x2;
        let b3 = (((i64::from(self.ac1) * 4 + x3) << oss) + 2) / 4;

        let x1 = (i64::from(self.ac3) * b6) >> 13;
        let x2 = (i64::from(self.b1) * ((b6 * b6) >> 12)) >> 16;
        let x3 = (x1 + x2 + 2) >> 2;
        let b4 = (i64::from(self.ac4) * (x3 + 32768)) >> 15;
        if b4 <= 0 {
            return Err(SensorError::InvalidCalibration("pressure divisor is not positive"));
        }

        if i64::from(up) < b3 {
            return Err(SensorError::out_of_range("raw pressure", up));
        }
        let b7 = (i64::from(up) - b3) * (50_000 >> oss);
        let p = if b7 < 0x8000_0000 {
            (b7 * 2) / b4
        } else {
            (b7 / b4) * 2
        };

        let x1 = (p >> 8) * (p >> 8);
        let x1 = (x1 * 3038) >> 16;
        let x2 = (-7357 * p) >> 16;
        let pa = p + ((x1 + x2 + 3791) >> 4);
        i32::try_from(pa).map_err(|_| SensorError::out_of_range("raw pressure", up))
    }
}

/// Altitude in metres for pressure `hpa` given the sea-level reference.
pub fn altitude(hpa: f64, sea_level_hpa: f64) -> f64 {
    ALTITUDE_SCALE_M * (1.0 - (hpa / sea_level_hpa).powf(1.0 / ALTITUDE_EXPONENT))
}

/// Sea-level pressure that makes `hpa` correspond to `altitude_m`.
pub fn sea_level_pressure(hpa: f64, altitude_m: f64) -> f64 {
    hpa / (1.0 - altitude_m / ALTITUDE_SCALE_M).powf(ALTITUDE_EXPONENT)
}

struct Bmp180Inner {
    bus: SharedBus,
    clock: SharedClock,
    mode: SamplingMode,
    calibration: Calibration,
    sea_level_hpa: Mutex<f64>,
    // Shared output register.
    measuring: Mutex<()>,
    _claim: Claim,
}

impl Bmp180Inner {
    fn raw_temperature(&self) -> Result<i32> {
        self.bus
            .begin(BMP180_ADDR)?
            .write_u8(REG_CONTROL, CMD_TEMPERATURE)?;
        self.clock.sleep(TEMPERATURE_WAIT);
        Ok(i32::from(self.bus.begin(BMP180_ADDR)?.read_u16_be(REG_OUT)?))
    }

    fn raw_pressure(&self) -> Result<i32> {
        let oss = self.mode.oversampling();
        self.bus
            .begin(BMP180_ADDR)?
            .write_u8(REG_CONTROL, CMD_PRESSURE + (oss << 6))?;
        self.clock.sleep(self.mode.pressure_wait());
        let bytes = self.bus.begin(BMP180_ADDR)?.read(REG_OUT, 3)?;
        let up = (i32::from(bytes[0]) << 16) | (i32::from(bytes[1]) << 8) | i32::from(bytes[2]);
        Ok(up >> (8 - oss))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.measuring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_temperature(&self) -> Result<f64> {
        let _measuring = self.lock();
        let ut = self.raw_temperature()?;
        Ok(f64::from(self.calibration.temperature(ut)?) / 10.0)
    }

    fn read_pressure(&self) -> Result<f64> {
        let _measuring = self.lock();
        let ut = self.raw_temperature()?;
        let up = self.raw_pressure()?;
        let pa = self
            .calibration
            .pressure(ut, up, self.mode.oversampling())?;
        debug!(ut, up, pa, "pressure compensated");
        Ok(f64::from(pa) / 100.0)
    }

    fn sea_level(&self) -> f64 {
        *self.sea_level_hpa.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_altitude(&self) -> Result<f64> {
        Ok(altitude(self.read_pressure()?, self.sea_level()))
    }

    fn measure(&self, measurement: Measurement) -> Result<f64> {
        match measurement {
            Measurement::Temperature => self.read_temperature(),
            Measurement::Pressure => self.read_pressure(),
            Measurement::Altitude => self.read_altitude(),
            Measurement::RawTemperature => {
                let _measuring = self.lock();
                Ok(f64::from(self.raw_temperature()?))
            }
            Measurement::RawPressure => {
                let _measuring = self.lock();
                Ok(f64::from(self.raw_pressure()?))
            }
        }
    }
}

pub struct Bmp180 {
    engine: SamplingEngine<Measurement, f64>,
    inner: Arc<Bmp180Inner>,
}

impl Bmp180 {
    /// Verifies the chip id and loads the factory calibration.
    pub fn new(bus: SharedBus, clock: SharedClock, config: &Bmp180Config) -> Result<Self> {
        config.validate()?;
        let claim = bus.claim(Resource::Device(BMP180_ADDR), "BMP180")?;

        let found = bus.begin(BMP180_ADDR)?.read_u8(REG_CHIP_ID)?;
        if found != BMP180_CHIP_ID {
            return Err(SensorError::WrongModule {
                expected: "BMP180",
                found,
            });
        }
        if config.reset {
            bus.begin(BMP180_ADDR)?
                .write_u8(REG_SOFT_RESET, CMD_SOFT_RESET)?;
            clock.sleep(STARTUP_WAIT);
        }
        let bytes = bus
            .begin(BMP180_ADDR)?
            .read(REG_CALIBRATION, CALIBRATION_LEN)?;
        let calibration = Calibration::from_bytes(&bytes)?;
        info!(mode = ?config.mode, "BMP180 initialised");

        let engine = SamplingEngine::new(
            "bmp180",
            Arc::new(ObserverRegistry::new()),
            Arc::clone(&clock),
            TEMPERATURE_WAIT + config.mode.pressure_wait(),
        );
        Ok(Self {
            engine,
            inner: Arc::new(Bmp180Inner {
                bus,
                clock,
                mode: config.mode,
                calibration,
                sea_level_hpa: Mutex::new(config.sea_level_hpa),
                measuring: Mutex::new(()),
                _claim: claim,
            }),
        })
    }

    pub fn mode(&self) -> SamplingMode {
        self.inner.mode
    }

    pub fn calibration(&self) -> Calibration {
        self.inner.calibration
    }

    /// Restarts the chip. Calibration data survives a reset.
    pub fn reset(&self) -> Result<()> {
        let _measuring = self.inner.lock();
        self.inner
            .bus
            .begin(BMP180_ADDR)?
            .write_u8(REG_SOFT_RESET, CMD_SOFT_RESET)?;
        self.inner.clock.sleep(STARTUP_WAIT);
        Ok(())
    }

    /// Uncompensated temperature value `UT`.
    pub fn read_raw_temperature(&self) -> Result<i32> {
        let _measuring = self.inner.lock();
        self.inner.raw_temperature()
    }

    /// Uncompensated pressure value `UP` at the configured oversampling.
    pub fn read_raw_pressure(&self) -> Result<i32> {
        let _measuring = self.inner.lock();
        self.inner.raw_pressure()
    }

    pub fn read_temperature(&self) -> Result<f64> {
        self.inner.read_temperature()
    }

    pub fn read_pressure(&self) -> Result<f64> {
        self.inner.read_pressure()
    }

    pub fn read_altitude(&self) -> Result<f64> {
        self.inner.read_altitude()
    }

    pub fn sea_level_pressure(&self) -> f64 {
        self.inner.sea_level()
    }

    pub fn set_sea_level_pressure(&self, hpa: f64) -> Result<()> {
        check_sea_level(hpa)?;
        *self
            .inner
            .sea_level_hpa
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = hpa;
        Ok(())
    }

    /// Derives and stores the sea-level reference from a known altitude.
    pub fn calibrate_sea_level_pressure(&self, altitude_m: f64) -> Result<f64> {
        if !altitude_m.is_finite() || altitude_m >= ALTITUDE_SCALE_M {
            return Err(SensorError::out_of_range("altitude", altitude_m));
        }
        let hpa = sea_level_pressure(self.read_pressure()?, altitude_m);
        self.set_sea_level_pressure(hpa)?;
        info!(altitude_m, sea_level_hpa = hpa, "sea level pressure calibrated");
        Ok(hpa)
    }

    pub fn temperature_input(&self) -> impl AnalogInput + 'static {
        self.measurement_input(Measurement::Temperature)
    }

    pub fn pressure_input(&self) -> impl AnalogInput + 'static {
        self.measurement_input(Measurement::Pressure)
    }

    pub fn altitude_input(&self) -> impl AnalogInput + 'static {
        self.measurement_input(Measurement::Altitude)
    }

    fn measurement_input(&self, measurement: Measurement) -> impl AnalogInput + 'static {
        let inner = Arc::clone(&self.inner);
        FunctionAnalogInput::new(move || Ok(inner.measure(measurement)? as f32))
    }

    pub fn start(&self) -> Result<()> {
        self.start_with_period(self.engine.default_period())
    }

    pub fn start_with_period(&self, period: Duration) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.engine
            .start(Some(period), move |measurement| inner.measure(measurement))
    }

    pub fn stop(&self) {
        self.engine.stop();
    }

    pub fn engine(&self) -> &SamplingEngine<Measurement, f64> {
        &self.engine
    }
}

impl Observable<f64> for Bmp180 {
    type Channel = Measurement;

    fn observers(&self) -> &ObserverRegistry<Measurement, f64> {
        self.engine.observers()
    }
}

impl fmt::Debug for Bmp180 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bmp180")
            .field("mode", &self.inner.mode)
            .field("sea_level_hpa", &self.inner.sea_level())
            .finish_non_exhaustive()
    }
}
