//! Per-thread wakeup events for cross-node sync suspension.
//!
//! Every registered thread owns one binary event. A suspending sync call
//! arms the event (clearing the signal and opening a fresh *wait
//! generation*), makes its request visible to the master, and blocks on
//! the event. The master — or the local sync registry, on the master
//! itself — later signals the event to resume the call.
//!
//! The generation exists because the master never forgets a waiter: a
//! call that times out leaves its `(node, thread)` entry in the master's
//! wait structures, and the wake that entry eventually absorbs must not
//! fire whatever the thread happens to be waiting on by then. A wake
//! carries the generation it was requested under and is dropped when the
//! event has since been re-armed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use starmem_error::{Result, StarmemError};
use starmem_types::ThreadId;
use tracing::{trace, warn};

thread_local! {
    static CURRENT_THREAD: std::cell::Cell<Option<ThreadId>> =
        const { std::cell::Cell::new(None) };
}

/// The calling thread's cluster thread id, if it has registered.
#[must_use]
pub fn current_thread_id() -> Option<ThreadId> {
    CURRENT_THREAD.with(std::cell::Cell::get)
}

#[derive(Debug)]
struct EventState {
    signaled: bool,
    generation: u32,
}

/// A one-shot wakeup event with an explicit arm step.
#[derive(Debug)]
pub struct WakeEvent {
    state: Mutex<EventState>,
    cv: Condvar,
}

impl WakeEvent {
    fn new() -> Self {
        Self {
            state: Mutex::new(EventState {
                signaled: false,
                generation: 0,
            }),
            cv: Condvar::new(),
        }
    }

    /// Clear the signal and open a new wait generation.
    ///
    /// Must happen before the wait request becomes visible to the
    /// master, so a wake can never race ahead of the suspension.
    pub fn arm(&self) -> u32 {
        let mut state = self.state.lock();
        state.signaled = false;
        state.generation = state.generation.wrapping_add(1);
        state.generation
    }

    /// Signal the event, provided `generation` is still the current one.
    pub fn set(&self, generation: u32) {
        let mut state = self.state.lock();
        if state.generation != generation {
            trace!(
                generation,
                current = state.generation,
                "dropping stale wake"
            );
            return;
        }
        state.signaled = true;
        self.cv.notify_all();
    }

    /// Block until signaled or `timeout` elapses. Returns `true` on
    /// signal, `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        match Instant::now().checked_add(timeout) {
            Some(deadline) => {
                while !state.signaled {
                    if self.cv.wait_until(&mut state, deadline).timed_out() {
                        return state.signaled;
                    }
                }
                true
            }
            // Timeout too large to represent as a deadline: wait forever.
            None => {
                while !state.signaled {
                    self.cv.wait(&mut state);
                }
                true
            }
        }
    }
}

/// Process-wide map from thread id to wakeup event.
///
/// Reads (wake, arm, wait) vastly outnumber writes (thread create and
/// exit), hence the RW lock. The event is `Arc`-cloned out under the
/// read lock, so a concurrent deregistration can never free an event
/// another thread is about to signal or block on.
pub struct WakeupRegistry {
    events: RwLock<HashMap<ThreadId, Arc<WakeEvent>>>,
    next_id: AtomicU32,
}

impl Default for WakeupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeupRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Allocate a thread id for the calling thread and install its
    /// wakeup event. Must run before the thread touches any sync API.
    pub fn register_current_thread(&self) -> ThreadId {
        let id = ThreadId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        CURRENT_THREAD.with(|cell| cell.set(Some(id)));
        self.events.write().insert(id, Arc::new(WakeEvent::new()));
        trace!(thread = %id, "thread registered");
        id
    }

    /// Remove the calling thread's event. Call on thread exit; a wake
    /// that arrives afterwards is dropped with a warning.
    pub fn deregister_current_thread(&self) {
        if let Some(id) = CURRENT_THREAD.with(std::cell::Cell::take) {
            self.events.write().remove(&id);
            trace!(thread = %id, "thread deregistered");
        }
    }

    /// Signal `thread`'s event for wait `generation`.
    pub fn wake(&self, thread: ThreadId, generation: u32) {
        let event = self.events.read().get(&thread).cloned();
        match event {
            Some(event) => event.set(generation),
            None => warn!(%thread, "wake for unregistered thread"),
        }
    }

    /// Re-arm the calling thread's event; returns `(thread, generation)`
    /// for embedding into the outgoing sync request.
    pub fn arm_current(&self) -> Result<(ThreadId, u32)> {
        let id = current_thread_id().ok_or(StarmemError::ThreadNotRegistered)?;
        let event = self.event_for(id)?;
        Ok((id, event.arm()))
    }

    /// Block the calling thread on its event. Returns `Ok(true)` on
    /// wake, `Ok(false)` on timeout.
    pub fn wait_current(&self, timeout: Duration) -> Result<bool> {
        let id = current_thread_id().ok_or(StarmemError::ThreadNotRegistered)?;
        let event = self.event_for(id)?;
        Ok(event.wait(timeout))
    }

    fn event_for(&self, id: ThreadId) -> Result<Arc<WakeEvent>> {
        self.events
            .read()
            .get(&id)
            .cloned()
            .ok_or(StarmemError::ThreadNotRegistered)
    }
}
