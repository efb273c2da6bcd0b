//! Test doubles: an in-memory bus with pluggable device simulators and fault
//! injection, a virtual clock, and mock switch/binary-input capabilities.

use crate::bus::{Bus, RegisterBytes, MAX_TRANSFER_LEN};
use crate::clock::{Clock, Shutdown};
use crate::error::{BusError, Result, SensorError};
use crate::interfaces::{BinaryInput, Switch};
use heapless::HistoryBuffer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Register-level model of one chip on a [`MockBus`].
pub trait MockDevice: Send {
    fn write(&mut self, reg: u8, bytes: &[u8]) -> core::result::Result<(), BusError>;
    fn read(&mut self, reg: u8, len: usize) -> core::result::Result<RegisterBytes, BusError>;
}

/// 256 byte register map with address auto-increment.
#[derive(Clone)]
pub struct RegisterFile {
    regs: [u8; 256],
}

impl RegisterFile {
    pub fn new() -> Self {
        Self { regs: [0; 256] }
    }

    pub fn get(&self, reg: u8) -> u8 {
        self.regs[reg as usize]
    }

    pub fn set(&mut self, reg: u8, value: u8) {
        self.regs[reg as usize] = value;
    }

    pub fn set_u16_be(&mut self, reg: u8, value: u16) {
        self.store(reg, &value.to_be_bytes());
    }

    pub fn u16_be(&self, reg: u8) -> u16 {
        u16::from_be_bytes([self.get(reg), self.get(reg.wrapping_add(1))])
    }

    pub fn u16_le(&self, reg: u8) -> u16 {
        u16::from_le_bytes([self.get(reg), self.get(reg.wrapping_add(1))])
    }

    pub fn store(&mut self, reg: u8, bytes: &[u8]) {
        for (offset, byte) in bytes.iter().enumerate() {
            self.regs[reg.wrapping_add(offset as u8) as usize] = *byte;
        }
    }

    pub fn load(&self, reg: u8, len: usize) -> RegisterBytes {
        (0..len.min(MAX_TRANSFER_LEN))
            .map(|offset| self.regs[reg.wrapping_add(offset as u8) as usize])
            .collect()
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RegisterFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RegisterFile")
    }
}

impl MockDevice for RegisterFile {
    fn write(&mut self, reg: u8, bytes: &[u8]) -> core::result::Result<(), BusError> {
        self.store(reg, bytes);
        Ok(())
    }

    fn read(&mut self, reg: u8, len: usize) -> core::result::Result<RegisterBytes, BusError> {
        Ok(self.load(reg, len))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    Write,
    Read,
    SetPin,
    GetPin,
}

/// One recorded bus operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusTransaction {
    pub kind: TransactionKind,
    pub addr: u8,
    pub reg: u8,
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FaultInjectionStats {
    pub faults_pending: u32,
    pub faults_injected: u32,
}

/// Number of most recent transactions a [`MockBus`] remembers.
pub const LOG_CAPACITY: usize = 1024;

struct MockState {
    devices: HashMap<u8, Box<dyn MockDevice>>,
    pins: HashMap<u8, bool>,
    log: HistoryBuffer<BusTransaction, LOG_CAPACITY>,
    strict: bool,
    pending_faults: u32,
    fault: BusError,
    stats: FaultInjectionStats,
}

impl MockState {
    fn take_fault(&mut self) -> core::result::Result<(), BusError> {
        if self.pending_faults == 0 {
            return Ok(());
        }
        self.pending_faults -= 1;
        self.stats.faults_injected += 1;
        self.stats.faults_pending = self.pending_faults;
        Err(self.fault.clone())
    }

    fn device(&mut self, addr: u8) -> core::result::Result<&mut Box<dyn MockDevice>, BusError> {
        if self.strict && !self.devices.contains_key(&addr) {
            return Err(BusError::Nack { addr });
        }
        Ok(self
            .devices
            .entry(addr)
            .or_insert_with(|| Box::new(RegisterFile::new())))
    }
}

/// In-memory [`Bus`]. Clones share state, so a test can keep a handle after
/// moving one clone into a [`crate::bus::SharedBus`].
#[derive(Clone)]
pub struct MockBus {
    state: Arc<Mutex<MockState>>,
}

impl MockBus {
    /// A permissive bus: unknown addresses behave as blank register files.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                devices: HashMap::new(),
                pins: HashMap::new(),
                log: HistoryBuffer::new(),
                strict: false,
                pending_faults: 0,
                fault: BusError::Io("injected fault".to_string()),
                stats: FaultInjectionStats::default(),
            })),
        }
    }

    /// A bus on which only attached devices acknowledge.
    pub fn strict() -> Self {
        let bus = Self::new();
        bus.state().strict = true;
        bus
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn attach(&self, addr: u8, device: impl MockDevice + 'static) {
        self.state().devices.insert(addr, Box::new(device));
    }

    pub fn set_pin_level(&self, pin: u8, level: bool) {
        self.state().pins.insert(pin, level);
    }

    pub fn pin_level(&self, pin: u8) -> Option<bool> {
        self.state().pins.get(&pin).copied()
    }

    /// The next `count` transactions fail with `error`.
    pub fn inject_faults(&self, count: u32, error: BusError) {
        let mut state = self.state();
        state.pending_faults = count;
        state.fault = error;
        state.stats.faults_pending = count;
    }

    pub fn fault_stats(&self) -> FaultInjectionStats {
        self.state().stats.clone()
    }

    /// The last [`LOG_CAPACITY`] transactions, oldest first.
    pub fn transactions(&self) -> Vec<BusTransaction> {
        self.state().log.oldest_ordered().cloned().collect()
    }

    pub fn clear_transactions(&self) {
        self.state().log.clear();
    }

    /// Writes recorded against `addr`, oldest first.
    pub fn writes_to(&self, addr: u8) -> Vec<BusTransaction> {
        self.state()
            .log
            .oldest_ordered()
            .filter(|t| t.kind == TransactionKind::Write && t.addr == addr)
            .cloned()
            .collect()
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MockBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockBus").finish_non_exhaustive()
    }
}

impl Bus for MockBus {
    fn write_register(&mut self, addr: u8, reg: u8, bytes: &[u8]) -> core::result::Result<(), BusError> {
        let mut state = self.state();
        state.take_fault()?;
        state.device(addr)?.write(reg, bytes)?;
        state.log.write(BusTransaction {
            kind: TransactionKind::Write,
            addr,
            reg,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    fn read_register(&mut self, addr: u8, reg: u8, len: usize) -> core::result::Result<RegisterBytes, BusError> {
        let mut state = self.state();
        state.take_fault()?;
        let bytes = state.device(addr)?.read(reg, len)?;
        state.log.write(BusTransaction {
            kind: TransactionKind::Read,
            addr,
            reg,
            bytes: bytes.to_vec(),
        });
        Ok(bytes)
    }

    fn set_pin(&mut self, pin: u8, level: bool) -> core::result::Result<(), BusError> {
        let mut state = self.state();
        state.take_fault()?;
        state.pins.insert(pin, level);
        state.log.write(BusTransaction {
            kind: TransactionKind::SetPin,
            addr: pin,
            reg: 0,
            bytes: vec![u8::from(level)],
        });
        Ok(())
    }

    fn get_pin(&mut self, pin: u8) -> core::result::Result<bool, BusError> {
        let mut state = self.state();
        state.take_fault()?;
        let level = state.pins.get(&pin).copied().unwrap_or(false);
        state.log.write(BusTransaction {
            kind: TransactionKind::GetPin,
            addr: pin,
            reg: 0,
            bytes: vec![u8::from(level)],
        });
        Ok(level)
    }
}

/// Virtual time. `sleep` advances the clock instead of blocking, and each
/// busy-wait `tick` advances it by a fixed step.
#[derive(Debug)]
pub struct MockClock {
    now_ns: AtomicU64,
    tick_ns: AtomicU64,
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            now_ns: AtomicU64::new(0),
            tick_ns: AtomicU64::new(1_000),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn advance(&self, duration: Duration) {
        self.now_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set_tick(&self, step: Duration) {
        self.tick_ns.store(step.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.now_ns.load(Ordering::SeqCst))
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
        std::thread::yield_now();
    }

    fn tick(&self) {
        self.now_ns
            .fetch_add(self.tick_ns.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    fn wait_for(&self, shutdown: &Shutdown, timeout: Duration) -> bool {
        self.sleep(timeout);
        shutdown.is_raised()
    }
}

#[derive(Debug, Default)]
struct SwitchState {
    on: AtomicBool,
    failing: AtomicBool,
    pulses: AtomicU64,
    last_fall: Mutex<Option<Duration>>,
}

/// In-memory [`Switch`] that remembers when it was last turned off.
#[derive(Clone)]
pub struct MockSwitch {
    clock: Arc<dyn Clock>,
    state: Arc<SwitchState>,
}

impl MockSwitch {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Arc::new(SwitchState::default()),
        }
    }

    pub fn is_set(&self) -> bool {
        self.state.on.load(Ordering::SeqCst)
    }

    /// Number of on→off transitions seen.
    pub fn pulses(&self) -> u64 {
        self.state.pulses.load(Ordering::SeqCst)
    }

    pub fn last_fall(&self) -> Option<Duration> {
        *self
            .state
            .last_fall
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }
}

impl Switch for MockSwitch {
    fn set(&self, on: bool) -> Result<()> {
        if self.state.failing.load(Ordering::SeqCst) {
            return Err(SensorError::Bus(BusError::Io("mock switch failure".to_string())));
        }
        let was_on = self.state.on.swap(on, Ordering::SeqCst);
        if was_on && !on {
            self.state.pulses.fetch_add(1, Ordering::SeqCst);
            *self
                .state
                .last_fall
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(self.clock.now());
        }
        Ok(())
    }
}

impl BinaryInput for MockSwitch {
    fn is_on(&self) -> Result<bool> {
        Ok(self.is_set())
    }
}

type LevelFn = dyn Fn(Duration) -> bool + Send + Sync;

/// [`BinaryInput`] whose level is a function of the clock's current time.
pub struct MockBinaryInput {
    clock: Arc<dyn Clock>,
    level: Box<LevelFn>,
}

impl MockBinaryInput {
    pub fn from_fn<F>(clock: Arc<dyn Clock>, level: F) -> Self
    where
        F: Fn(Duration) -> bool + Send + Sync + 'static,
    {
        Self {
            clock,
            level: Box::new(level),
        }
    }

    pub fn constant(clock: Arc<dyn Clock>, on: bool) -> Self {
        Self::from_fn(clock, move |_| on)
    }

    /// Echo-style input: goes high `delay` after `trigger`'s last falling edge
    /// and stays high for `width`.
    pub fn echo_of(clock: Arc<dyn Clock>, trigger: &MockSwitch, delay: Duration, width: Duration) -> Self {
        let trigger = trigger.clone();
        Self::from_fn(clock, move |now| match trigger.last_fall() {
            Some(fall) => now >= fall + delay && now < fall + delay + width,
            None => false,
        })
    }
}

impl BinaryInput for MockBinaryInput {
    fn is_on(&self) -> Result<bool> {
        Ok((self.level)(self.clock.now()))
    }
}

impl fmt::Debug for MockBinaryInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MockBinaryInput")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_injection_fails_exactly_n_transactions() {
        let mut bus = MockBus::new();
        bus.inject_faults(2, BusError::Nack { addr: 0x40 });

        assert_eq!(bus.write_register(0x40, 0, &[1]), Err(BusError::Nack { addr: 0x40 }));
        assert!(bus.read_register(0x40, 0, 1).is_err());
        assert!(bus.read_register(0x40, 0, 1).is_ok());

        let stats = bus.fault_stats();
        assert_eq!(stats.faults_injected, 2);
        assert_eq!(stats.faults_pending, 0);
    }

    #[test]
    fn test_strict_bus_nacks_unknown_devices() {
        let mut bus = MockBus::strict();
        assert_eq!(bus.read_register(0x10, 0, 1), Err(BusError::Nack { addr: 0x10 }));
        bus.attach(0x10, RegisterFile::new());
        assert!(bus.read_register(0x10, 0, 1).is_ok());
    }

    #[test]
    fn test_transaction_log_serializes_bytes() {
        let mut bus = MockBus::new();
        bus.write_register(0x40, 0x06, &[0x00, 0x10]).unwrap();
        let json = serde_json::to_string(&bus.transactions()).unwrap();
        assert!(json.contains("\"bytes\":[0,16]"));
    }

    #[test]
    fn test_transaction_log_keeps_only_the_most_recent() {
        let mut bus = MockBus::new();
        for value in 0..(LOG_CAPACITY + 10) {
            bus.set_pin(4, value % 2 == 0).unwrap();
        }
        bus.write_register(0x40, 0x01, &[0xAB]).unwrap();

        let log = bus.transactions();
        assert_eq!(log.len(), LOG_CAPACITY);
        assert_eq!(log[LOG_CAPACITY - 1].kind, TransactionKind::Write);
        assert_eq!(log[LOG_CAPACITY - 2].bytes, vec![u8::from((LOG_CAPACITY + 9) % 2 == 0)]);

        bus.clear_transactions();
        assert!(bus.transactions().is_empty());
    }

    #[test]
    fn test_mock_clock_advances_only_on_sleep_and_tick() {
        let clock = MockClock::new();
        assert_eq!(clock.now(), Duration::ZERO);
        clock.sleep(Duration::from_millis(3));
        clock.tick();
        assert_eq!(clock.now(), Duration::from_micros(3_001));
    }

    #[test]
    fn test_echo_follows_trigger_fall() {
        let clock = MockClock::shared();
        let trigger = MockSwitch::new(clock.clone());
        let echo = MockBinaryInput::echo_of(
            clock.clone(),
            &trigger,
            Duration::from_micros(100),
            Duration::from_micros(50),
        );

        trigger.turn_on().unwrap();
        trigger.turn_off().unwrap();
        assert!(echo.is_off().unwrap());
        clock.advance(Duration::from_micros(120));
        assert!(echo.is_on().unwrap());
        clock.advance(Duration::from_micros(40));
        assert!(echo.is_off().unwrap());
        assert_eq!(trigger.pulses(), 1);
    }
}
