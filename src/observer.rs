//! Observer registration and dispatch.
//!
//! Each observable driver owns an [`ObserverRegistry`] keyed by its channel
//! selector. Registration order is notification order, and removal is by the
//! [`ObserverId`] returned from registration.
//!
//! Dispatch holds the registry lock, so once [`ObserverRegistry::remove`]
//! returns the removed observer is never invoked again. The flip side is that
//! an observer must not add or remove observers on the registry that is
//! currently notifying it; doing so deadlocks.

use arrayvec::ArrayVec;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Upper bound on distinct channels a single observable exposes.
pub const MAX_OBSERVED_CHANNELS: usize = 8;

/// Receives every new value produced for the channel it is registered on.
pub trait Observer<T>: Send {
    fn event(&mut self, value: &T);
}

impl<T, F> Observer<T> for F
where
    F: FnMut(&T) + Send,
{
    fn event(&mut self, value: &T) {
        self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

struct Registration<C, T> {
    id: ObserverId,
    channel: C,
    observer: Box<dyn Observer<T>>,
}

pub struct ObserverRegistry<C, T> {
    entries: Mutex<Vec<Registration<C, T>>>,
    next_id: AtomicU64,
}

impl<C, T> ObserverRegistry<C, T>
where
    C: Copy + PartialEq,
    T: 'static,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Registration<C, T>>> {
        // A panicking observer poisons the lock; the list itself stays consistent.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, channel: C, observer: Box<dyn Observer<T>>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries().push(Registration {
            id,
            channel,
            observer,
        });
        id
    }

    /// Removes the observer registered under `id`. Returns `false` if unknown.
    pub fn remove(&self, id: ObserverId) -> bool {
        let mut entries = self.entries();
        match entries.iter().position(|entry| entry.id == id) {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn count(&self, channel: C) -> usize {
        self.entries()
            .iter()
            .filter(|entry| entry.channel == channel)
            .count()
    }

    /// Distinct channels that currently have observers, in first-registration order.
    pub fn active_channels(&self) -> ArrayVec<C, MAX_OBSERVED_CHANNELS> {
        let mut channels = ArrayVec::new();
        for entry in self.entries().iter() {
            if channels.contains(&entry.channel) {
                continue;
            }
            debug_assert!(
                !channels.is_full(),
                "more than {} distinct observed channels",
                MAX_OBSERVED_CHANNELS
            );
            if channels.try_push(entry.channel).is_err() {
                break;
            }
        }
        channels
    }

    /// Delivers `value` to every observer of `channel`. Returns how many were notified.
    pub fn notify(&self, channel: C, value: &T) -> usize {
        let mut notified = 0;
        for entry in self.entries().iter_mut() {
            if entry.channel == channel {
                entry.observer.event(value);
                notified += 1;
            }
        }
        notified
    }
}

impl<C, T> Default for ObserverRegistry<C, T>
where
    C: Copy + PartialEq,
    T: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<C, T> fmt::Debug for ObserverRegistry<C, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self
            .entries
            .lock()
            .map(|entries| entries.len())
            .unwrap_or_default();
        f.debug_struct("ObserverRegistry")
            .field("observers", &len)
            .finish()
    }
}

/// Capability of producing a stream of values observers can subscribe to.
pub trait Observable<T: 'static> {
    type Channel: Copy + PartialEq + Send + 'static;

    fn observers(&self) -> &ObserverRegistry<Self::Channel, T>;

    fn add_observer<O>(&self, channel: Self::Channel, observer: O) -> ObserverId
    where
        O: Observer<T> + 'static,
    {
        self.observers().add(channel, Box::new(observer))
    }

    fn remove_observer(&self, id: ObserverId) -> bool {
        self.observers().remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Channel {
        A,
        B,
    }

    fn recorder(log: &Arc<Mutex<Vec<(&'static str, i32)>>>, name: &'static str) -> Box<dyn Observer<i32>> {
        let log = Arc::clone(log);
        Box::new(move |value: &i32| log.lock().unwrap().push((name, *value)))
    }

    #[test]
    fn test_notification_follows_registration_order() {
        let registry = ObserverRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.add(Channel::A, recorder(&log, "first"));
        registry.add(Channel::B, recorder(&log, "other"));
        registry.add(Channel::A, recorder(&log, "second"));

        assert_eq!(registry.notify(Channel::A, &7), 2);
        assert_eq!(*log.lock().unwrap(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn test_remove_by_identity() {
        let registry = ObserverRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let first = registry.add(Channel::A, recorder(&log, "first"));
        registry.add(Channel::A, recorder(&log, "second"));

        assert!(registry.remove(first));
        assert!(!registry.remove(first));
        registry.notify(Channel::A, &1);

        assert_eq!(*log.lock().unwrap(), vec![("second", 1)]);
        assert_eq!(registry.count(Channel::A), 1);
    }

    #[test]
    fn test_active_channels_are_distinct_and_ordered() {
        let registry = ObserverRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        registry.add(Channel::B, recorder(&log, "b1"));
        registry.add(Channel::A, recorder(&log, "a1"));
        registry.add(Channel::B, recorder(&log, "b2"));

        assert_eq!(registry.active_channels().as_slice(), &[Channel::B, Channel::A]);
        registry.clear();
        assert!(registry.active_channels().is_empty());
    }
}
