//! Error types shared by the bus layer, the sampling engine and the drivers.

use thiserror::Error;

/// Failure of a single bus transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The addressed device did not acknowledge.
    #[error("no acknowledge from device 0x{addr:02X}")]
    Nack { addr: u8 },

    /// The transport reported a failure.
    #[error("bus I/O failure: {0}")]
    Io(String),

    /// The requested transfer exceeds what one transaction can carry.
    #[error("transfer of {len} bytes exceeds the {max} byte limit")]
    TransferTooLong { len: usize, max: usize },

    /// The device never signalled completion within its hardware bound.
    #[error("device 0x{addr:02X} did not complete within {waited_us} us")]
    Timeout { addr: u8, waited_us: u64 },

    /// A thread panicked while holding the bus lock.
    #[error("bus lock poisoned")]
    LockPoisoned,
}

/// Errors surfaced by drivers and by the sampling framework.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SensorError {
    #[error(transparent)]
    Bus(#[from] BusError),

    /// An argument (channel, duty cycle, pin, address...) is outside its valid range.
    #[error("{what} out of range: {value}")]
    OutOfRange { what: &'static str, value: f64 },

    /// A configuration combination was rejected at construction.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("sampling loop already running")]
    AlreadyRunning,

    #[error("sampling loop not running")]
    NotRunning,

    /// The operating system refused to start the sampling thread.
    #[error("failed to spawn sampling thread: {0}")]
    Spawn(String),

    /// Another driver instance already owns this device on the bus.
    #[error("module {0} is already in use")]
    ModuleAlreadyInUse(String),

    /// Another object already reserved this GPIO pin.
    #[error("GPIO {0} already reserved")]
    PinAlreadyReserved(u8),

    /// The device at the address identified itself as something else.
    #[error("attached module is not a {expected} (chip id 0x{found:02X})")]
    WrongModule { expected: &'static str, found: u8 },

    /// Factory calibration data read back from the device is unusable.
    #[error("invalid calibration data: {0}")]
    InvalidCalibration(&'static str),
}

impl SensorError {
    pub(crate) fn out_of_range(what: &'static str, value: impl Into<f64>) -> Self {
        Self::OutOfRange {
            what,
            value: value.into(),
        }
    }
}

pub type Result<T> = core::result::Result<T, SensorError>;
