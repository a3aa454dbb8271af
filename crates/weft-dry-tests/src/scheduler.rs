// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Deterministic scheduling and time for tests.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

use weft_runtime::{Clock, TaskHandle, TaskScheduler};

/// [`TaskScheduler`] that queues tasks until the test runs them.
///
/// Lets a test observe the window between "GC scheduled" and "GC ran".
#[derive(Default)]
pub struct QueueScheduler {
    tasks: RefCell<BTreeMap<u64, Box<dyn FnOnce()>>>,
    next_handle: Cell<u64>,
    ran: Cell<usize>,
}

impl std::fmt::Debug for QueueScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueScheduler")
            .field("pending", &self.pending())
            .field("ran", &self.ran.get())
            .finish()
    }
}

impl QueueScheduler {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Tasks run so far.
    pub fn ran(&self) -> usize {
        self.ran.get()
    }

    /// Runs queued tasks in scheduling order, including tasks scheduled
    /// while running. Returns how many ran.
    pub fn run_all(&self) -> usize {
        let mut count = 0;
        loop {
            // Pop before running; a task may schedule or cancel others.
            let task = self.tasks.borrow_mut().pop_first();
            let Some((_, task)) = task else {
                break;
            };
            task();
            count += 1;
        }
        self.ran.set(self.ran.get() + count);
        count
    }
}

impl TaskScheduler for QueueScheduler {
    fn schedule(&self, task: Box<dyn FnOnce()>) -> TaskHandle {
        let id = self.next_handle.get();
        self.next_handle.set(id + 1);
        self.tasks.borrow_mut().insert(id, task);
        TaskHandle(id)
    }

    fn cancel(&self, handle: TaskHandle) {
        let removed = self.tasks.borrow_mut().remove(&handle.0);
        drop(removed);
    }
}

/// [`Clock`] that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<u64>,
}

impl ManualClock {
    /// Clock starting at `start_ms`.
    pub fn starting_at(start_ms: u64) -> Self {
        Self {
            now: Cell::new(start_ms),
        }
    }

    /// Moves time forward.
    pub fn advance(&self, by_ms: u64) {
        self.now.set(self.now.get().saturating_add(by_ms));
    }

    /// Jumps to `now_ms`.
    pub fn set(&self, now_ms: u64) {
        self.now.set(now_ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::rc::Rc;

    use super::*;

    #[test]
    fn tasks_wait_until_run_and_can_be_cancelled() {
        let scheduler = Rc::new(QueueScheduler::new());
        let hits = Rc::new(Cell::new(0));
        let first = Rc::clone(&hits);
        let second = Rc::clone(&hits);
        scheduler.schedule(Box::new(move || first.set(first.get() + 1)));
        let cancelled = scheduler.schedule(Box::new(move || second.set(second.get() + 10)));
        scheduler.cancel(cancelled);

        assert_eq!(hits.get(), 0);
        assert_eq!(scheduler.pending(), 1);
        assert_eq!(scheduler.run_all(), 1);
        assert_eq!(hits.get(), 1);
        assert_eq!(scheduler.ran(), 1);
    }

    #[test]
    fn tasks_scheduled_while_running_also_run() {
        let scheduler = Rc::new(QueueScheduler::new());
        let hits = Rc::new(Cell::new(0));
        let inner_hits = Rc::clone(&hits);
        let inner_scheduler = Rc::clone(&scheduler);
        scheduler.schedule(Box::new(move || {
            let hits = Rc::clone(&inner_hits);
            inner_scheduler.schedule(Box::new(move || hits.set(hits.get() + 1)));
        }));
        assert_eq!(scheduler.run_all(), 2);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::starting_at(100);
        assert_eq!(clock.now_ms(), 100);
        clock.advance(50);
        assert_eq!(clock.now_ms(), 150);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }
}
