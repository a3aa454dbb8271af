// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Task scheduling and wall-clock ports.
use std::time::{SystemTime, UNIX_EPOCH};

/// Handle for a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(pub u64);

/// Defers work such as garbage collection.
pub trait TaskScheduler {
    /// Schedules `task`. Implementations may run it before returning.
    fn schedule(&self, task: Box<dyn FnOnce()>) -> TaskHandle;

    /// Cancels a task that has not run yet.
    fn cancel(&self, handle: TaskHandle);
}

/// Runs every task immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateScheduler;

impl TaskScheduler for ImmediateScheduler {
    fn schedule(&self, task: Box<dyn FnOnce()>) -> TaskHandle {
        task();
        TaskHandle(0)
    }

    fn cancel(&self, _handle: TaskHandle) {}
}

/// Millisecond clock used for query expiration.
pub trait Clock {
    /// Milliseconds since an arbitrary fixed origin.
    fn now_ms(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn immediate_scheduler_runs_before_returning() {
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        let handle = ImmediateScheduler.schedule(Box::new(move || flag.set(true)));
        assert!(ran.get());
        ImmediateScheduler.cancel(handle);
    }

    #[test]
    fn system_clock_moves_forward() {
        let first = SystemClock.now_ms();
        assert!(first > 0);
        assert!(SystemClock.now_ms() >= first);
    }
}
