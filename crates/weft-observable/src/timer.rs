// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Timer port used by [`crate::Observable::poll`].

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Opaque handle for a scheduled timeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle(pub u64);

/// Deferred task execution on the embedder's event loop.
pub trait Timer {
    /// Schedules `task` to run after `delay`.
    fn set_timeout(&self, delay: Duration, task: Box<dyn FnOnce()>) -> TimerHandle;
    /// Cancels a scheduled task. Unknown or already-run handles are ignored.
    fn clear_timeout(&self, handle: TimerHandle);
}

/// Deterministic virtual-time [`Timer`].
///
/// Time only moves when [`ManualTimer::advance`] is called. Tasks due at the
/// same instant run in scheduling order.
#[derive(Default)]
pub struct ManualTimer {
    now: Cell<Duration>,
    next_id: Cell<u64>,
    queue: RefCell<BTreeMap<(Duration, u64), Box<dyn FnOnce()>>>,
    deadlines: RefCell<BTreeMap<u64, Duration>>,
}

impl ManualTimer {
    /// Creates a timer at virtual time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.now.get()
    }

    /// Number of scheduled, not yet run tasks.
    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Advances virtual time by `by`, running every task that becomes due.
    ///
    /// Tasks scheduled by running tasks are honoured if they fall inside the
    /// window.
    pub fn advance(&self, by: Duration) {
        let target = self.now.get() + by;
        loop {
            let due = {
                let mut queue = self.queue.borrow_mut();
                let first = queue.keys().next().copied();
                match first {
                    Some(key) if key.0 <= target => queue.remove(&key).map(|task| (key, task)),
                    _ => None,
                }
            };
            let Some(((deadline, id), task)) = due else {
                break;
            };
            self.deadlines.borrow_mut().remove(&id);
            self.now.set(deadline);
            task();
        }
        self.now.set(target);
    }
}

impl Timer for ManualTimer {
    fn set_timeout(&self, delay: Duration, task: Box<dyn FnOnce()>) -> TimerHandle {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let deadline = self.now.get() + delay;
        self.queue.borrow_mut().insert((deadline, id), task);
        self.deadlines.borrow_mut().insert(id, deadline);
        TimerHandle(id)
    }

    fn clear_timeout(&self, handle: TimerHandle) {
        let deadline = self.deadlines.borrow_mut().remove(&handle.0);
        if let Some(deadline) = deadline {
            let removed = self.queue.borrow_mut().remove(&(deadline, handle.0));
            drop(removed);
        }
    }
}

impl fmt::Debug for ManualTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualTimer")
            .field("now", &self.now.get())
            .field("pending", &self.pending())
            .finish()
    }
}
