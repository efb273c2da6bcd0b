use crate::bus::RegisterBytes;
use crate::error::BusError;
use crate::interfaces::Vector;
use crate::mock::{MockDevice, RegisterFile};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const CRA: u8 = 0x00;
const CRB: u8 = 0x01;
const MR: u8 = 0x02;
const OUT_X_H: u8 = 0x03;
const OUT_Y_L: u8 = 0x08;
const IRA: u8 = 0x0A;

/// LSB per gauss as (X and Y, Z), indexed by the CRB gain bits minus one.
const SENSITIVITY: [(f32, f32); 7] = [
    (1100.0, 980.0),
    (855.0, 760.0),
    (670.0, 600.0),
    (450.0, 400.0),
    (400.0, 355.0),
    (330.0, 295.0),
    (230.0, 205.0),
];

/// Saturated axes read as -4096.
fn counts(gauss: f32, lsb_per_gauss: f32) -> i16 {
    let counts = (gauss * lsb_per_gauss).round();
    if (-2048.0..=2047.0).contains(&counts) {
        counts as i16
    } else {
        -4096
    }
}

struct State {
    regs: RegisterFile,
    field: Vector,
    output_reads: u32,
}

impl State {
    /// Latches the current field into the output registers, in X, Z, Y order.
    fn convert(&mut self) {
        let index = usize::from(self.regs.get(CRB) >> 5).saturating_sub(1);
        let (xy, z) = SENSITIVITY[index];
        let x = counts(self.field.x, xy);
        let y = counts(self.field.y, xy);
        let z = counts(self.field.z, z);
        let mut out = [0u8; 6];
        out[..2].copy_from_slice(&x.to_be_bytes());
        out[2..4].copy_from_slice(&z.to_be_bytes());
        out[4..].copy_from_slice(&y.to_be_bytes());
        self.regs.store(OUT_X_H, &out);
    }
}

/// LSM303DLHC magnetometer model with the chip's power-on registers.
///
/// Output registers follow the field only in continuous-conversion mode;
/// in any other mode they hold the last conversion.
#[derive(Clone)]
pub struct Lsm303dlhcSim {
    state: Arc<Mutex<State>>,
}

impl Lsm303dlhcSim {
    pub fn new() -> Self {
        let mut regs = RegisterFile::new();
        regs.set(CRA, 0x10);
        regs.set(CRB, 0x20);
        regs.set(MR, 0x03);
        regs.store(IRA, &[0x48, 0x34, 0x33]);
        Self {
            state: Arc::new(Mutex::new(State {
                regs,
                field: Vector::default(),
                output_reads: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Field seen by the chip, in gauss.
    pub fn set_field(&self, field: Vector) {
        self.state().field = field;
    }

    pub fn set_identity(&self, identity: [u8; 3]) {
        self.state().regs.store(IRA, &identity);
    }

    pub fn set_cra(&self, value: u8) {
        self.state().regs.set(CRA, value);
    }

    pub fn cra(&self) -> u8 {
        self.state().regs.get(CRA)
    }

    pub fn crb(&self) -> u8 {
        self.state().regs.get(CRB)
    }

    /// Operating mode bits of the mode register.
    pub fn mode(&self) -> u8 {
        self.state().regs.get(MR) & 0x03
    }

    /// Number of reads that started inside the output registers.
    pub fn output_reads(&self) -> u32 {
        self.state().output_reads
    }
}

impl Default for Lsm303dlhcSim {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice for Lsm303dlhcSim {
    fn write(&mut self, reg: u8, bytes: &[u8]) -> Result<(), BusError> {
        let mut state = self.state();
        match reg {
            CRA..=MR if usize::from(reg) + bytes.len() <= usize::from(MR) + 1 => {
                state.regs.store(reg, bytes);
                Ok(())
            }
            _ => Err(BusError::Io(format!("LSM303DLHC register 0x{reg:02X} is read-only"))),
        }
    }

    fn read(&mut self, reg: u8, len: usize) -> Result<RegisterBytes, BusError> {
        let mut state = self.state();
        if (OUT_X_H..=OUT_Y_L).contains(&reg) {
            state.output_reads += 1;
            if state.regs.get(MR) & 0x03 == 0 {
                state.convert();
            }
        }
        Ok(state.regs.load(reg, len))
    }
}

impl fmt::Debug for Lsm303dlhcSim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Lsm303dlhcSim")
            .field("field", &state.field)
            .field("crb", &state.regs.get(CRB))
            .finish_non_exhaustive()
    }
}
