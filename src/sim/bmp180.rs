use crate::bus::RegisterBytes;
use crate::error::BusError;
use crate::mock::{MockDevice, RegisterFile};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Calibration block of the datasheet's worked example.
pub const DATASHEET_CALIBRATION: [u8; 22] = [
    0x01, 0x98, // AC1 408
    0xFF, 0xB8, // AC2 -72
    0xC7, 0xD1, // AC3 -14383
    0x7F, 0xE5, // AC4 32741
    0x7F, 0xF5, // AC5 32757
    0x5A, 0x71, // AC6 23153
    0x18, 0x2E, // B1 6190
    0x00, 0x04, // B2 4
    0x80, 0x00, // MB -32768
    0xDD, 0xF9, // MC -8711
    0x0B, 0x34, // MD 2868
];

/// Datasheet example raw temperature (15.0 °C).
pub const DATASHEET_UT: u16 = 27898;
/// Datasheet example raw pressure (69964 Pa).
pub const DATASHEET_UP: u32 = 23843;

struct State {
    regs: RegisterFile,
    ut: u16,
    up: u32,
    last_command: Option<u8>,
    resets: u32,
}

/// BMP180 model. Defaults to the datasheet example values.
#[derive(Clone)]
pub struct Bmp180Sim {
    state: Arc<Mutex<State>>,
}

impl Bmp180Sim {
    pub fn new() -> Self {
        let mut regs = RegisterFile::new();
        regs.set(0xD0, 0x55);
        regs.store(0xAA, &DATASHEET_CALIBRATION);
        Self {
            state: Arc::new(Mutex::new(State {
                regs,
                ut: DATASHEET_UT,
                up: DATASHEET_UP,
                last_command: None,
                resets: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_chip_id(&self, id: u8) {
        self.state().regs.set(0xD0, id);
    }

    pub fn set_calibration(&self, bytes: &[u8; 22]) {
        self.state().regs.store(0xAA, bytes);
    }

    /// Raw values the next conversions produce. `up` is at the requested oversampling.
    pub fn set_raw(&self, ut: u16, up: u32) {
        let mut state = self.state();
        state.ut = ut;
        state.up = up;
    }

    pub fn last_command(&self) -> Option<u8> {
        self.state().last_command
    }

    pub fn resets(&self) -> u32 {
        self.state().resets
    }
}

impl Default for Bmp180Sim {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice for Bmp180Sim {
    fn write(&mut self, reg: u8, bytes: &[u8]) -> Result<(), BusError> {
        let mut state = self.state();
        match (reg, bytes) {
            (0xE0, [0xB6]) => {
                state.resets += 1;
                Ok(())
            }
            (0xF4, [command]) => {
                let command = *command;
                state.last_command = Some(command);
                if command == 0x2E {
                    let ut = state.ut;
                    state.regs.store(0xF6, &[(ut >> 8) as u8, ut as u8, 0]);
                } else if command & 0x3F == 0x34 {
                    let oss = command >> 6;
                    let up = state.up << (8 - oss);
                    state
                        .regs
                        .store(0xF6, &[(up >> 16) as u8, (up >> 8) as u8, up as u8]);
                }
                Ok(())
            }
            (0xE0 | 0xF4, _) => Err(BusError::Io(format!("bad BMP180 write to 0x{reg:02X}"))),
            _ => {
                state.regs.store(reg, bytes);
                Ok(())
            }
        }
    }

    fn read(&mut self, reg: u8, len: usize) -> Result<RegisterBytes, BusError> {
        Ok(self.state().regs.load(reg, len))
    }
}

impl fmt::Debug for Bmp180Sim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bmp180Sim")
            .field("last_command", &self.last_command())
            .finish_non_exhaustive()
    }
}
