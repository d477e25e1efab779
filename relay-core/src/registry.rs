//! Process-wide observer registry
//!
//! Observers are stored in slots that are never removed from the backing
//! vector. Unregistering tombstones a slot; a later registration may reuse
//! it under a new generation, so a stale handle can never reach the new
//! occupant.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use relay_core::registry::{LogMessage, ObserverRegistry};
//!
//! let registry = ObserverRegistry::new();
//! let handle = registry.register(Arc::new(|message: &LogMessage| -> relay_core::Result<()> {
//!     println!("{message}");
//!     Ok(())
//! }));
//!
//! registry.dispatch(&LogMessage::from("hello"));
//! registry.unregister(handle);
//! registry.unregister(handle); // no-op
//! ```

use std::cell::Cell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::error::{panic_message, Error, Result};

/// The fully rendered text of one log record
pub type LogMessage = Arc<str>;

/// Receives every log line emitted in the process.
///
/// Implementations run synchronously inside a logging call. They must not
/// block and must not log themselves; a log call made from inside an
/// observer is written to the log destinations but is not fanned out again.
pub trait LogObserver: Send + Sync {
    /// Handle one emitted message
    fn on_message(&self, message: &LogMessage) -> Result<()>;
}

impl<F> LogObserver for F
where
    F: Fn(&LogMessage) -> Result<()> + Send + Sync,
{
    fn on_message(&self, message: &LogMessage) -> Result<()> {
        self(message)
    }
}

/// Opaque identifier of one registered observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

impl ObserverHandle {
    fn new(index: u32, generation: u32) -> Self {
        Self((u64::from(generation) << 32) | u64::from(index))
    }

    fn index(self) -> usize {
        (self.0 & u64::from(u32::MAX)) as usize
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Raw integer value, useful for log fields
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for ObserverHandle {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ObserverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index(), self.generation())
    }
}

struct Slot {
    generation: u32,
    observer: Option<Arc<dyn LogObserver>>,
}

#[derive(Default)]
struct Slots {
    entries: Vec<Slot>,
    free: Vec<u32>,
}

/// Counters describing registry activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Observers currently registered
    pub active: usize,
    /// Successful deliveries since creation
    pub delivered: u64,
    /// Observer failures (errors and panics) contained by dispatch
    pub failures: u64,
}

thread_local! {
    static DISPATCHING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside a dispatch pass
struct DispatchGuard;

impl DispatchGuard {
    fn enter() -> Option<Self> {
        DISPATCHING.with(|flag| {
            if flag.get() {
                None
            } else {
                flag.set(true);
                Some(Self)
            }
        })
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        DISPATCHING.with(|flag| flag.set(false));
    }
}

/// Registry of log observers shared by the Emission Sink and every stream.
///
/// Created once at process start and shared by reference (`Arc`).
#[derive(Default)]
pub struct ObserverRegistry {
    slots: RwLock<Slots>,
    active: AtomicUsize,
    delivered: AtomicU64,
    failures: AtomicU64,
}

impl ObserverRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer and return its handle
    pub fn register(&self, observer: Arc<dyn LogObserver>) -> ObserverHandle {
        let mut slots = self.slots.write();
        let handle = match slots.free.pop() {
            Some(index) => {
                let slot = &mut slots.entries[index as usize];
                slot.observer = Some(observer);
                ObserverHandle::new(index, slot.generation)
            }
            None => {
                let index = slots.entries.len() as u32;
                slots.entries.push(Slot {
                    generation: 0,
                    observer: Some(observer),
                });
                ObserverHandle::new(index, 0)
            }
        };
        self.active.fetch_add(1, Ordering::Relaxed);
        handle
    }

    /// Tombstone the slot behind `handle`.
    ///
    /// Returns `false` without touching anything when the handle is stale,
    /// already unregistered or was never issued.
    pub fn unregister(&self, handle: ObserverHandle) -> bool {
        let mut slots = self.slots.write();
        let index = handle.index();
        let Some(slot) = slots.entries.get_mut(index) else {
            return false;
        };
        if slot.generation != handle.generation() || slot.observer.is_none() {
            return false;
        }
        slot.observer = None;
        slot.generation = slot.generation.wrapping_add(1);
        slots.free.push(index as u32);
        self.active.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Deliver `message` to every observer active at the time of the call.
    ///
    /// Failures and panics inside observers are contained here. Returns the
    /// number of observers that accepted the message. Nested calls on the
    /// same thread (an observer that logs) deliver nothing.
    pub fn dispatch(&self, message: &LogMessage) -> usize {
        let Some(_guard) = DispatchGuard::enter() else {
            return 0;
        };

        let observers: Vec<(usize, Arc<dyn LogObserver>)> = {
            let slots = self.slots.read();
            slots
                .entries
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| slot.observer.clone().map(|o| (index, o)))
                .collect()
        };

        let mut delivered = 0;
        for (index, observer) in observers {
            let failure = match catch_unwind(AssertUnwindSafe(|| observer.on_message(message))) {
                Ok(Ok(())) => {
                    delivered += 1;
                    continue;
                }
                // The observer was unregistered after the snapshot was taken.
                Ok(Err(Error::QueueClosed)) => continue,
                Ok(Err(e)) => e,
                Err(panic) => Error::observer_dispatch(format!(
                    "observer panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!(slot = index, "Observer failed to handle log message: {}", failure);
        }
        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Number of observers currently registered
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Snapshot of the registry counters
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active: self.active_count(),
            delivered: self.delivered.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for ObserverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverRegistry")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::bridge;
    use parking_lot::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, Arc<dyn LogObserver>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer: Arc<dyn LogObserver> = Arc::new(move |message: &LogMessage| -> Result<()> {
            sink.lock().push(message.to_string());
            Ok(())
        });
        (seen, observer)
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = ObserverRegistry::new();
        let (kept, kept_observer) = recorder();
        let (_, dropped_observer) = recorder();

        let keep = registry.register(kept_observer);
        let drop_me = registry.register(dropped_observer);

        assert!(registry.unregister(drop_me));
        assert!(!registry.unregister(drop_me));
        assert!(!registry.unregister(ObserverHandle::from(9_999)));
        assert!(!registry.unregister(ObserverHandle::from(u64::MAX)));

        registry.dispatch(&LogMessage::from("still here"));
        assert_eq!(kept.lock().as_slice(), ["still here"]);
        assert_eq!(registry.active_count(), 1);
        assert!(registry.unregister(keep));
    }

    #[test]
    fn test_dispatch_reaches_every_observer_once() {
        let registry = ObserverRegistry::new();
        let recorders: Vec<_> = (0..8).map(|_| recorder()).collect();
        for (_, observer) in &recorders {
            registry.register(Arc::clone(observer));
        }

        assert_eq!(registry.dispatch(&LogMessage::from("tick")), 8);
        for (seen, _) in &recorders {
            assert_eq!(seen.lock().as_slice(), ["tick"]);
        }
    }

    #[test]
    fn test_recycled_slot_does_not_alias_stale_handle() {
        let registry = ObserverRegistry::new();
        let (_, first) = recorder();
        let (second_seen, second) = recorder();

        let stale = registry.register(first);
        registry.unregister(stale);
        let fresh = registry.register(second);

        assert_ne!(stale, fresh);
        assert!(!registry.unregister(stale));

        registry.dispatch(&LogMessage::from("for the new occupant"));
        assert_eq!(second_seen.lock().len(), 1);
    }

    #[test]
    fn test_failing_observers_do_not_block_others() {
        let registry = ObserverRegistry::new();
        registry.register(Arc::new(|_: &LogMessage| -> Result<()> {
            Err(Error::observer_dispatch("nope"))
        }));
        registry.register(Arc::new(|_: &LogMessage| -> Result<()> { panic!("observer bug") }));
        let (seen, observer) = recorder();
        registry.register(observer);

        assert_eq!(registry.dispatch(&LogMessage::from("survives")), 1);
        assert_eq!(seen.lock().as_slice(), ["survives"]);
        assert_eq!(registry.stats().failures, 2);
    }

    #[test]
    fn test_closed_queue_is_not_a_failure() {
        let registry = ObserverRegistry::new();
        let (observer, mut queue) = bridge(None);
        registry.register(Arc::new(observer));
        queue.close();

        assert_eq!(registry.dispatch(&LogMessage::from("late line")), 0);
        assert_eq!(registry.stats().failures, 0);
        assert_eq!(registry.stats().delivered, 0);
    }

    #[test]
    fn test_nested_dispatch_is_suppressed() {
        let registry = Arc::new(ObserverRegistry::new());
        let inner = Arc::clone(&registry);
        let nested = Arc::new(Mutex::new(None));
        let nested_result = Arc::clone(&nested);
        registry.register(Arc::new(move |_: &LogMessage| -> Result<()> {
            *nested_result.lock() = Some(inner.dispatch(&LogMessage::from("echo")));
            Ok(())
        }));

        assert_eq!(registry.dispatch(&LogMessage::from("outer")), 1);
        assert_eq!(*nested.lock(), Some(0));
    }

    #[test]
    fn test_concurrent_register_dispatch_unregister() {
        let registry = Arc::new(ObserverRegistry::new());
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for j in 0..200 {
                        let (_, observer) = recorder();
                        let handle = registry.register(observer);
                        registry.dispatch(&LogMessage::from(format!("{i}-{j}")));
                        assert!(registry.unregister(handle));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(registry.active_count(), 0);
        assert_eq!(registry.stats().failures, 0);
    }
}
