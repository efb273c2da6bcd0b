//! Background sampling loop shared by every observable driver.
//!
//! A [`SamplingEngine`] owns at most one thread. On every cycle it measures
//! each channel that currently has at least one observer and hands the result
//! to that channel's observers in registration order.
//!
//! # Concurrency contract
//!
//! Observers run synchronously on the sampling thread, one after the other.
//! A slow observer delays every later notification and the next cycle.
//! Observers must
//! not register or remove observers on the driver that is notifying them
//! (the registry is locked during dispatch), and must not call `stop()` on
//! it while another thread is stopping or restarting it.
//!
//! A measurement that fails is logged and skipped; the loop never exits
//! because of a bus error. [`SamplingEngine::stop`] joins the thread before
//! returning, so no observer runs after it returns.

use crate::clock::{SharedClock, Shutdown};
use crate::error::{Result, SensorError};
use crate::observer::ObserverRegistry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Wait used between cycles when nothing is observed.
const IDLE_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopState {
    Stopped,
    Running,
}

/// Counters accumulated over the lifetime of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineStats {
    pub cycles: u64,
    pub samples: u64,
    pub failures: u64,
    pub starts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    cycles: AtomicU64,
    samples: AtomicU64,
    failures: AtomicU64,
    starts: AtomicU64,
}

struct Worker {
    shutdown: Arc<Shutdown>,
    period_us: Arc<AtomicU64>,
    handle: JoinHandle<()>,
}

pub struct SamplingEngine<C, T> {
    name: &'static str,
    observers: Arc<ObserverRegistry<C, T>>,
    clock: SharedClock,
    default_period: Duration,
    counters: Arc<Counters>,
    worker: Mutex<Option<Worker>>,
}

impl<C, T> SamplingEngine<C, T>
where
    C: Copy + PartialEq + Send + Sync + fmt::Debug + 'static,
    T: Send + 'static,
{
    pub fn new(
        name: &'static str,
        observers: Arc<ObserverRegistry<C, T>>,
        clock: SharedClock,
        default_period: Duration,
    ) -> Self {
        Self {
            name,
            observers,
            clock,
            default_period,
            counters: Arc::new(Counters::default()),
            worker: Mutex::new(None),
        }
    }

    fn worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn default_period(&self) -> Duration {
        self.default_period
    }

    pub fn observers(&self) -> &ObserverRegistry<C, T> {
        &self.observers
    }

    /// Spawns the sampling thread. `period` overrides the device default.
    ///
    /// `measure` is called once per observed channel per cycle.
    pub fn start<F>(&self, period: Option<Duration>, mut measure: F) -> Result<()>
    where
        F: FnMut(C) -> Result<T> + Send + 'static,
    {
        let mut worker = self.worker();

        if let Some(current) = worker.as_ref() {
            let stopping = current.shutdown.is_raised() || current.handle.is_finished();
            if !stopping || current.handle.thread().id() == thread::current().id() {
                return Err(SensorError::AlreadyRunning);
            }
        }
        // A loop stopped from its own observer, or ended by an observer panic,
        // is joined here so that two loops never overlap.
        if let Some(previous) = worker.take() {
            if previous.handle.join().is_err() {
                warn!(engine = self.name, "previous sampling thread had panicked");
            }
        }

        let period = period.unwrap_or(self.default_period);
        let shutdown = Arc::new(Shutdown::new());
        let period_us = Arc::new(AtomicU64::new(period.as_micros() as u64));

        let name = self.name;
        let observers = Arc::clone(&self.observers);
        let clock = Arc::clone(&self.clock);
        let counters = Arc::clone(&self.counters);
        let loop_shutdown = Arc::clone(&shutdown);
        let loop_period = Arc::clone(&period_us);

        let handle = thread::Builder::new()
            .name(format!("{name}-sampler"))
            .spawn(move || {
                'sampling: loop {
                    if loop_shutdown.is_raised() {
                        break;
                    }
                    counters.cycles.fetch_add(1, Ordering::Relaxed);

                    let channels = observers.active_channels();
                    for &channel in &channels {
                        if loop_shutdown.is_raised() {
                            break 'sampling;
                        }
                        match measure(channel) {
                            Ok(value) => {
                                observers.notify(channel, &value);
                                counters.samples.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(err) => {
                                counters.failures.fetch_add(1, Ordering::Relaxed);
                                warn!(engine = name, ?channel, %err, "measurement failed, cycle skipped");
                            }
                        }
                    }

                    let mut wait = Duration::from_micros(loop_period.load(Ordering::Relaxed));
                    if channels.is_empty() {
                        wait = wait.max(IDLE_PERIOD);
                    }
                    if clock.wait_for(&loop_shutdown, wait) {
                        break;
                    }
                }
                debug!(engine = name, "sampling thread exiting");
            })
            .map_err(|err| SensorError::Spawn(err.to_string()))?;

        self.counters.starts.fetch_add(1, Ordering::Relaxed);
        info!(engine = self.name, period_us = period.as_micros() as u64, "sampling started");

        *worker = Some(Worker {
            shutdown,
            period_us,
            handle,
        });
        Ok(())
    }

    /// Signals the loop to exit and waits for its thread. Idempotent.
    ///
    /// From one of this engine's own observers the thread cannot be joined:
    /// the loop exits once the current notification returns, and the engine
    /// reports [`LoopState::Running`] until it has. A later `start` joins it.
    pub fn stop(&self) {
        let mut worker = self.worker();
        let Some(current) = worker.as_ref() else {
            return;
        };

        current.shutdown.raise();
        if current.handle.thread().id() == thread::current().id() {
            debug!(engine = self.name, "stop requested from the sampling thread");
            return;
        }
        let Some(current) = worker.take() else {
            return;
        };
        if current.handle.join().is_err() {
            warn!(engine = self.name, "sampling thread panicked");
        }
        info!(engine = self.name, "sampling stopped");
    }

    pub fn state(&self) -> LoopState {
        match self.worker().as_ref() {
            Some(current) if !current.handle.is_finished() => LoopState::Running,
            _ => LoopState::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == LoopState::Running
    }

    /// Changes the period of the running loop, effective from the next wait.
    pub fn set_period(&self, period: Duration) -> Result<()> {
        match self.worker().as_ref() {
            Some(current) if !current.handle.is_finished() && !current.shutdown.is_raised() => {
                current
                    .period_us
                    .store(period.as_micros() as u64, Ordering::Relaxed);
                Ok(())
            }
            _ => Err(SensorError::NotRunning),
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            cycles: self.counters.cycles.load(Ordering::Relaxed),
            samples: self.counters.samples.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            starts: self.counters.starts.load(Ordering::Relaxed),
        }
    }
}

impl<C, T> Drop for SamplingEngine<C, T> {
    fn drop(&mut self) {
        let worker = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(current) = worker {
            current.shutdown.raise();
            if current.handle.thread().id() != thread::current().id() {
                let _ = current.handle.join();
            }
        }
    }
}

impl<C, T> fmt::Debug for SamplingEngine<C, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplingEngine")
            .field("name", &self.name)
            .field("default_period", &self.default_period)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BusError;
    use crate::mock::MockClock;
    use std::sync::atomic::AtomicBool;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Channel {
        Only,
    }

    fn engine() -> SamplingEngine<Channel, u32> {
        SamplingEngine::new(
            "test",
            Arc::new(ObserverRegistry::new()),
            MockClock::shared(),
            Duration::from_millis(10),
        )
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..10_000 {
            if condition() {
                return;
            }
            thread::sleep(Duration::from_micros(100));
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let engine = engine();
        engine.start(None, |_| Ok(1)).unwrap();
        assert_eq!(engine.start(None, |_| Ok(2)), Err(SensorError::AlreadyRunning));
        engine.stop();
        assert_eq!(engine.state(), LoopState::Stopped);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let engine = engine();
        engine.stop();
        engine.start(None, |_| Ok(1)).unwrap();
        engine.stop();
        engine.stop();
        assert!(!engine.is_running());
    }

    #[test]
    fn test_set_period_requires_running_loop() {
        let engine = engine();
        assert_eq!(
            engine.set_period(Duration::from_millis(5)),
            Err(SensorError::NotRunning)
        );
        engine.start(None, |_| Ok(1)).unwrap();
        assert!(engine.set_period(Duration::from_millis(5)).is_ok());
    }

    #[test]
    fn test_failed_measurements_do_not_end_the_loop() {
        let engine = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine
            .observers()
            .add(Channel::Only, Box::new(move |v: &u32| sink.lock().unwrap().push(*v)));

        let mut calls = 0u32;
        engine
            .start(None, move |_| {
                calls += 1;
                if calls % 2 == 0 {
                    Err(BusError::Nack { addr: 0x48 }.into())
                } else {
                    Ok(calls)
                }
            })
            .unwrap();

        wait_until(|| seen.lock().unwrap().len() >= 3);
        engine.stop();

        let seen = seen.lock().unwrap();
        assert!(seen.iter().all(|v| v % 2 == 1));
        assert!(engine.stats().failures >= 2);
    }

    #[test]
    fn test_unobserved_channels_are_not_measured() {
        let engine = engine();
        let measured = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&measured);
        engine
            .start(None, move |_| {
                flag.store(true, Ordering::SeqCst);
                Ok(0)
            })
            .unwrap();

        wait_until(|| engine.stats().cycles >= 5);
        engine.stop();
        assert!(!measured.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drop_joins_the_thread() {
        let engine = engine();
        let alive = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&alive);
        engine
            .observers()
            .add(Channel::Only, Box::new(move |_: &u32| flag.store(true, Ordering::SeqCst)));
        engine.start(None, |_| Ok(1)).unwrap();
        wait_until(|| alive.load(Ordering::SeqCst));

        drop(engine);
        alive.store(false, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(5));
        assert!(!alive.load(Ordering::SeqCst));
    }
}
