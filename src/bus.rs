//! Bus capability and the shared, lock-protected handle the drivers use.
//!
//! A [`Bus`] performs single synchronous transactions. Drivers never own a
//! bus; they hold a [`SharedBus`] and open a short [`Transaction`] for each
//! register sequence, so the lock is held for one transaction and never for a
//! whole measurement (conversion waits happen with the bus released).

use crate::error::{BusError, SensorError};
use heapless::Vec;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

pub const MAX_TRANSFER_LEN: usize = 32;

pub type RegisterBytes = Vec<u8, MAX_TRANSFER_LEN>;

/// Opaque synchronous transport for I2C registers and raw GPIO pins.
pub trait Bus: Send {
    fn write_register(&mut self, addr: u8, reg: u8, bytes: &[u8]) -> Result<(), BusError>;
    fn read_register(&mut self, addr: u8, reg: u8, len: usize) -> Result<RegisterBytes, BusError>;
    fn set_pin(&mut self, pin: u8, level: bool) -> Result<(), BusError>;
    fn get_pin(&mut self, pin: u8) -> Result<bool, BusError>;
}

/// Something on the bus that at most one driver object may own at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Device(u8),
    Pin(u8),
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Device(addr) => write!(f, "device 0x{addr:02X}"),
            Resource::Pin(pin) => write!(f, "GPIO {pin}"),
        }
    }
}

struct BusInner {
    bus: Mutex<Box<dyn Bus>>,
    claims: Mutex<HashSet<Resource>>,
}

/// Cloneable handle to one physical bus.
#[derive(Clone)]
pub struct SharedBus {
    inner: Arc<BusInner>,
}

impl SharedBus {
    pub fn new(bus: impl Bus + 'static) -> Self {
        Self {
            inner: Arc::new(BusInner {
                bus: Mutex::new(Box::new(bus)),
                claims: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Locks the bus for a transaction sequence with the device at `addr`.
    pub fn begin(&self, addr: u8) -> Result<Transaction<'_>, BusError> {
        let bus = self.inner.bus.lock().map_err(|_| BusError::LockPoisoned)?;
        Ok(Transaction { bus, addr })
    }

    pub fn set_pin(&self, pin: u8, level: bool) -> Result<(), BusError> {
        let mut bus = self.inner.bus.lock().map_err(|_| BusError::LockPoisoned)?;
        trace!(pin, level, "set pin");
        bus.set_pin(pin, level)
    }

    pub fn get_pin(&self, pin: u8) -> Result<bool, BusError> {
        let mut bus = self.inner.bus.lock().map_err(|_| BusError::LockPoisoned)?;
        bus.get_pin(pin)
    }

    /// Reserves `resource` for the lifetime of the returned [`Claim`].
    pub fn claim(&self, resource: Resource, module: &str) -> Result<Claim, SensorError> {
        let mut claims = self
            .inner
            .claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if !claims.insert(resource) {
            return Err(match resource {
                Resource::Pin(pin) => SensorError::PinAlreadyReserved(pin),
                Resource::Device(addr) => {
                    SensorError::ModuleAlreadyInUse(format!("{module}-0x{addr:02X}"))
                }
            });
        }

        debug!(%resource, module, "claimed");
        Ok(Claim {
            bus: Arc::clone(&self.inner),
            resource,
        })
    }

    pub fn is_claimed(&self, resource: Resource) -> bool {
        self.inner
            .claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&resource)
    }
}

impl fmt::Debug for SharedBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBus").finish_non_exhaustive()
    }
}

/// Ownership token for a device address or GPIO pin; released on drop.
pub struct Claim {
    bus: Arc<BusInner>,
    resource: Resource,
}

impl Claim {
    pub fn resource(&self) -> Resource {
        self.resource
    }
}

impl fmt::Debug for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Claim").field(&self.resource).finish()
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut claims = self.bus.claims.lock().unwrap_or_else(PoisonError::into_inner);
        claims.remove(&self.resource);
        debug!(resource = %self.resource, "released");
    }
}

/// Exclusive access to the bus, addressed to one device.
pub struct Transaction<'a> {
    bus: MutexGuard<'a, Box<dyn Bus>>,
    addr: u8,
}

impl Transaction<'_> {
    pub fn addr(&self) -> u8 {
        self.addr
    }

    pub fn write(&mut self, reg: u8, bytes: &[u8]) -> Result<(), BusError> {
        if bytes.len() > MAX_TRANSFER_LEN {
            return Err(BusError::TransferTooLong {
                len: bytes.len(),
                max: MAX_TRANSFER_LEN,
            });
        }
        trace!(addr = self.addr, reg, ?bytes, "write");
        self.bus.write_register(self.addr, reg, bytes)
    }

    pub fn read(&mut self, reg: u8, len: usize) -> Result<RegisterBytes, BusError> {
        if len > MAX_TRANSFER_LEN {
            return Err(BusError::TransferTooLong {
                len,
                max: MAX_TRANSFER_LEN,
            });
        }
        let bytes = self.bus.read_register(self.addr, reg, len)?;
        if bytes.len() != len {
            return Err(BusError::Io(format!(
                "short read from 0x{:02X}/0x{reg:02X}: {} of {len} bytes",
                self.addr,
                bytes.len()
            )));
        }
        trace!(addr = self.addr, reg, ?bytes, "read");
        Ok(bytes)
    }

    pub fn write_u8(&mut self, reg: u8, value: u8) -> Result<(), BusError> {
        self.write(reg, &[value])
    }

    pub fn read_u8(&mut self, reg: u8) -> Result<u8, BusError> {
        Ok(self.read(reg, 1)?[0])
    }

    pub fn write_u16_be(&mut self, reg: u8, value: u16) -> Result<(), BusError> {
        self.write(reg, &value.to_be_bytes())
    }

    pub fn read_u16_be(&mut self, reg: u8) -> Result<u16, BusError> {
        let bytes = self.read(reg, 2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_i16_be(&mut self, reg: u8) -> Result<i16, BusError> {
        let bytes = self.read(reg, 2)?;
        Ok(i16::from_be_bytes([bytes[0], bytes[1]]))
    }
}
