//! Master-resident registry of named synchronization primitives.
//!
//! Barriers, counting semaphores, and auto/manual-reset events are named
//! by object key and materialized lazily: the first message that
//! references a key reads the primitive's initial state from the shared
//! store and creates the registry entry. Entries live until the registry
//! is dropped at cluster shutdown.
//!
//! One mutex guards the whole registry and is held across the outbound
//! wakes an operation performs. That is deliberate: a waiter must be
//! either woken or enqueued before the next message touching the same
//! primitive is processed, or arrival order — which the wake order of
//! every primitive is defined in terms of — would be lost.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use starmem_types::limits::{SLOT_EVENT_SIGNALED, SLOT_PRIMITIVE_INIT};
use starmem_types::{NodeId, ObjectKey, ThreadId};
use tracing::{debug, warn};

/// Destination-agnostic wake delivery.
///
/// On the master the sink signals the local wakeup registry; for any
/// other node it sends `WakeSync` down that node's control link. Tests
/// substitute a recording sink.
pub trait WakeSink: Send + Sync {
    /// Wake `thread` on `node` for wait `generation`.
    fn wake(&self, node: NodeId, thread: ThreadId, generation: u32);
}

/// A thread suspended on a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Waiter {
    pub node: NodeId,
    pub thread: ThreadId,
    pub generation: u32,
}

#[derive(Debug)]
enum SyncPrimitive {
    Barrier {
        threshold: i32,
        count: i32,
        waiters: Vec<Waiter>,
    },
    Semaphore {
        value: i32,
        waiters: VecDeque<Waiter>,
    },
    Event {
        auto_reset: bool,
        signaled: bool,
        waiters: VecDeque<Waiter>,
    },
}

/// Reinterpret a store word as the signed 32-bit value its low half
/// carries (thresholds and initial counts are written as `i32`).
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
const fn slot_as_i32(word: u64) -> i32 {
    word as u32 as i32
}

/// The central sync registry. Master-only.
pub struct SyncManager {
    primitives: Mutex<HashMap<ObjectKey, SyncPrimitive>>,
    store: Arc<dyn crate::store::SharedStore>,
    sink: Arc<dyn WakeSink>,
}

impl SyncManager {
    /// Create an empty registry over `store`, delivering wakes to `sink`.
    #[must_use]
    pub fn new(store: Arc<dyn crate::store::SharedStore>, sink: Arc<dyn WakeSink>) -> Self {
        Self {
            primitives: Mutex::new(HashMap::new()),
            store,
            sink,
        }
    }

    /// Barrier arrival from `thread` on `src`.
    ///
    /// The threshold is read from store slot 0 at materialization. When
    /// the arrival completes the group, the caller is woken first and
    /// then every earlier arrival in insertion order; the counter resets,
    /// so the barrier is immediately reusable.
    pub fn barrier_enter(&self, src: NodeId, key: ObjectKey, thread: ThreadId, generation: u32) {
        let mut primitives = self.primitives.lock();
        let node = primitives.entry(key).or_insert_with(|| {
            let threshold = slot_as_i32(self.store.get(key, SLOT_PRIMITIVE_INIT));
            debug!(%key, threshold, "barrier materialized");
            SyncPrimitive::Barrier {
                threshold,
                count: 0,
                waiters: Vec::new(),
            }
        });
        let SyncPrimitive::Barrier {
            threshold,
            count,
            waiters,
        } = node
        else {
            warn!(%key, "barrier message for a non-barrier primitive");
            return;
        };
        *count += 1;
        if *count >= *threshold {
            *count = 0;
            self.sink.wake(src, thread, generation);
            for waiter in waiters.drain(..) {
                self.sink.wake(waiter.node, waiter.thread, waiter.generation);
            }
        } else {
            waiters.push(Waiter {
                node: src,
                thread,
                generation,
            });
        }
    }

    /// Semaphore acquire from `thread` on `src`.
    pub fn semaphore_enter(&self, src: NodeId, key: ObjectKey, thread: ThreadId, generation: u32) {
        let mut primitives = self.primitives.lock();
        let node = primitives
            .entry(key)
            .or_insert_with(|| self.materialize_semaphore(key));
        let SyncPrimitive::Semaphore { value, waiters } = node else {
            warn!(%key, "semaphore message for a non-semaphore primitive");
            return;
        };
        *value -= 1;
        if *value >= 0 {
            self.sink.wake(src, thread, generation);
        } else {
            waiters.push_back(Waiter {
                node: src,
                thread,
                generation,
            });
        }
    }

    /// Semaphore release.
    ///
    /// Wakes at most one waiter (FIFO), so a semaphore with initial
    /// count 1 behaves as a mutex. The head is granted only when a slot
    /// is genuinely free: with queued count `q`, `value + q` equals
    /// `initial` minus outstanding grants, so the release hands off iff
    /// `value + q > 0`. (A negative initial count thus absorbs releases
    /// until it has been paid down.)
    pub fn semaphore_leave(&self, _src: NodeId, key: ObjectKey) {
        let mut primitives = self.primitives.lock();
        let node = primitives
            .entry(key)
            .or_insert_with(|| self.materialize_semaphore(key));
        let SyncPrimitive::Semaphore { value, waiters } = node else {
            warn!(%key, "semaphore message for a non-semaphore primitive");
            return;
        };
        *value += 1;
        let queued = i32::try_from(waiters.len()).unwrap_or(i32::MAX);
        if queued > 0 && value.saturating_add(queued) > 0 {
            if let Some(waiter) = waiters.pop_front() {
                self.sink.wake(waiter.node, waiter.thread, waiter.generation);
            }
        }
    }

    /// Event wait from `thread` on `src`.
    pub fn event_wait(&self, src: NodeId, key: ObjectKey, thread: ThreadId, generation: u32) {
        let mut primitives = self.primitives.lock();
        let node = Self::materialize_event(&mut primitives, &*self.store, key);
        let SyncPrimitive::Event {
            auto_reset,
            signaled,
            waiters,
        } = node
        else {
            warn!(%key, "event message for a non-event primitive");
            return;
        };
        if *signaled {
            if *auto_reset {
                *signaled = false;
            }
            self.sink.wake(src, thread, generation);
        } else {
            waiters.push_back(Waiter {
                node: src,
                thread,
                generation,
            });
        }
    }

    /// Event signal.
    ///
    /// Auto-reset: hand the signal to exactly one waiter (FIFO) and
    /// clear it, or leave it latched when nobody waits. Manual-reset:
    /// wake everybody and stay signaled until an explicit reset.
    pub fn event_set(&self, _src: NodeId, key: ObjectKey) {
        let mut primitives = self.primitives.lock();
        let node = Self::materialize_event(&mut primitives, &*self.store, key);
        let SyncPrimitive::Event {
            auto_reset,
            signaled,
            waiters,
        } = node
        else {
            warn!(%key, "event message for a non-event primitive");
            return;
        };
        *signaled = true;
        if *auto_reset {
            if let Some(waiter) = waiters.pop_front() {
                *signaled = false;
                self.sink.wake(waiter.node, waiter.thread, waiter.generation);
            }
        } else {
            for waiter in waiters.drain(..) {
                self.sink.wake(waiter.node, waiter.thread, waiter.generation);
            }
        }
    }

    /// Event reset. Clears the signal; nobody is woken.
    pub fn event_reset(&self, _src: NodeId, key: ObjectKey) {
        let mut primitives = self.primitives.lock();
        let node = Self::materialize_event(&mut primitives, &*self.store, key);
        let SyncPrimitive::Event { signaled, .. } = node else {
            warn!(%key, "event message for a non-event primitive");
            return;
        };
        *signaled = false;
    }

    fn materialize_semaphore(&self, key: ObjectKey) -> SyncPrimitive {
        let initial = slot_as_i32(self.store.get(key, SLOT_PRIMITIVE_INIT));
        debug!(%key, initial, "semaphore materialized");
        SyncPrimitive::Semaphore {
            value: initial,
            waiters: VecDeque::new(),
        }
    }

    fn materialize_event<'a>(
        primitives: &'a mut HashMap<ObjectKey, SyncPrimitive>,
        store: &dyn crate::store::SharedStore,
        key: ObjectKey,
    ) -> &'a mut SyncPrimitive {
        primitives.entry(key).or_insert_with(|| {
            let auto_reset = store.get(key, SLOT_PRIMITIVE_INIT) != 0;
            let signaled = store.get(key, SLOT_EVENT_SIGNALED) != 0;
            debug!(%key, auto_reset, signaled, "event materialized");
            SyncPrimitive::Event {
                auto_reset,
                signaled,
                waiters: VecDeque::new(),
            }
        })
    }

    /// Snapshot of a semaphore's `(value, queue_len)` for diagnostics
    /// and invariant checks; `None` if the key is not a semaphore.
    #[must_use]
    pub fn semaphore_state(&self, key: ObjectKey) -> Option<(i32, usize)> {
        let primitives = self.primitives.lock();
        match primitives.get(&key) {
            Some(SyncPrimitive::Semaphore { value, waiters }) => Some((*value, waiters.len())),
            _ => None,
        }
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        let primitives = self.primitives.lock();
        let abandoned: usize = primitives
            .values()
            .map(|p| match p {
                SyncPrimitive::Barrier { waiters, .. } => waiters.len(),
                SyncPrimitive::Semaphore { waiters, .. }
                | SyncPrimitive::Event { waiters, .. } => waiters.len(),
            })
            .sum();
        if abandoned > 0 {
            warn!(abandoned, "sync registry dropped with suspended waiters");
        }
    }
}
