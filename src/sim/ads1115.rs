use crate::bus::RegisterBytes;
use crate::error::BusError;
use crate::mock::MockDevice;
use crate::modules::ads1115::Input;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const FULL_SCALE: [f32; 8] = [6.144, 4.096, 2.048, 1.024, 0.512, 0.256, 0.256, 0.256];

#[derive(Default)]
struct State {
    config: u16,
    conversion: i16,
    busy: bool,
    stuck: bool,
    voltages: [f32; 8],
    fixed_code: Option<i16>,
    conversions: u32,
}

impl State {
    fn start_conversion(&mut self, config: u16) {
        let mux = usize::from((config >> 12) & 0x7);
        let full_scale = FULL_SCALE[usize::from((config >> 9) & 0x7)];
        self.conversion = match self.fixed_code {
            Some(code) => code,
            None => (self.voltages[mux] / full_scale * 32767.0)
                .round()
                .clamp(-32768.0, 32767.0) as i16,
        };
        self.conversions += 1;
        self.busy = true;
    }
}

/// ADS1115 model: one voltage per multiplexer setting, single-shot only.
///
/// The first config-register read after a conversion starts reports the
/// device busy, so drivers exercise their ready poll.
#[derive(Clone, Default)]
pub struct Ads1115Sim {
    state: Arc<Mutex<State>>,
}

impl Ads1115Sim {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_voltage(&self, input: Input, volts: f32) {
        let index = Input::ALL
            .iter()
            .position(|candidate| *candidate == input)
            .unwrap_or_default();
        self.state().voltages[index] = volts;
    }

    /// Every conversion returns `code` regardless of input and gain.
    pub fn set_fixed_code(&self, code: Option<i16>) {
        self.state().fixed_code = code;
    }

    /// A stuck device never clears its busy flag.
    pub fn set_stuck(&self, stuck: bool) {
        self.state().stuck = stuck;
    }

    pub fn conversions(&self) -> u32 {
        self.state().conversions
    }

    /// Config register as last written, start bit excluded.
    pub fn config(&self) -> u16 {
        self.state().config
    }
}

impl MockDevice for Ads1115Sim {
    fn write(&mut self, reg: u8, bytes: &[u8]) -> Result<(), BusError> {
        let [hi, lo] = bytes else {
            return Err(BusError::Io(format!("ADS1115 expects 2 byte writes, got {}", bytes.len())));
        };
        let value = u16::from_be_bytes([*hi, *lo]);
        let mut state = self.state();
        match reg {
            0x01 => {
                state.config = value & 0x7FFF;
                if value & 0x8000 != 0 {
                    state.start_conversion(value);
                }
                Ok(())
            }
            0x02 | 0x03 => Ok(()),
            _ => Err(BusError::Io(format!("ADS1115 register 0x{reg:02X} is read-only"))),
        }
    }

    fn read(&mut self, reg: u8, len: usize) -> Result<RegisterBytes, BusError> {
        let mut state = self.state();
        let value = match reg {
            0x00 => state.conversion as u16,
            0x01 => {
                let ready = !state.busy && !state.stuck;
                state.busy = false;
                if ready {
                    state.config | 0x8000
                } else {
                    state.config
                }
            }
            _ => 0,
        };
        Ok(value.to_be_bytes().iter().copied().take(len).collect())
    }
}

impl fmt::Debug for Ads1115Sim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ads1115Sim")
            .field("conversions", &self.conversions())
            .finish_non_exhaustive()
    }
}
