use crate::bus::RegisterBytes;
use crate::error::BusError;
use crate::mock::{MockDevice, RegisterFile};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const MODE1: u8 = 0x00;
const LED0_ON_L: u8 = 0x06;
const ALL_LED_ON_L: u8 = 0xFA;
const PRE_SCALE: u8 = 0xFE;
const AUTO_INCREMENT: u8 = 0x20;
const SLEEP: u8 = 0x10;

/// PCA9685 model with the power-on register state of the real chip.
///
/// Multi-byte writes need auto-increment enabled, the prescaler only accepts
/// writes while asleep, and writes to the ALL_LED registers fan out to every
/// channel.
#[derive(Clone)]
pub struct Pca9685Sim {
    regs: Arc<Mutex<RegisterFile>>,
}

impl Pca9685Sim {
    pub fn new() -> Self {
        let mut regs = RegisterFile::new();
        regs.set(MODE1, 0x11);
        regs.set(PRE_SCALE, 0x1E);
        Self {
            regs: Arc::new(Mutex::new(regs)),
        }
    }

    fn regs(&self) -> MutexGuard<'_, RegisterFile> {
        self.regs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mode1(&self) -> u8 {
        self.regs().get(MODE1)
    }

    pub fn prescale(&self) -> u8 {
        self.regs().get(PRE_SCALE)
    }

    /// Raw (ON, OFF) counts of `channel`.
    pub fn channel(&self, channel: u8) -> (u16, u16) {
        let regs = self.regs();
        let base = LED0_ON_L + 4 * channel;
        (regs.u16_le(base), regs.u16_le(base + 2))
    }
}

impl Default for Pca9685Sim {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice for Pca9685Sim {
    fn write(&mut self, reg: u8, bytes: &[u8]) -> Result<(), BusError> {
        let mut regs = self.regs();
        if bytes.len() > 1 && regs.get(MODE1) & AUTO_INCREMENT == 0 {
            return Err(BusError::Io("PCA9685 auto-increment disabled".to_string()));
        }
        for (offset, &byte) in bytes.iter().enumerate() {
            let target = reg.wrapping_add(offset as u8);
            match target {
                PRE_SCALE if regs.get(MODE1) & SLEEP == 0 => {}
                ALL_LED_ON_L..=0xFD => {
                    let lane = target - ALL_LED_ON_L;
                    for channel in 0..16u8 {
                        regs.set(LED0_ON_L + 4 * channel + lane, byte);
                    }
                }
                _ => regs.set(target, byte),
            }
        }
        Ok(())
    }

    fn read(&mut self, reg: u8, len: usize) -> Result<RegisterBytes, BusError> {
        Ok(self.regs().load(reg, len))
    }
}

impl fmt::Debug for Pca9685Sim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pca9685Sim")
            .field("mode1", &self.mode1())
            .field("prescale", &self.prescale())
            .finish()
    }
}
