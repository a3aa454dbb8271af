// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Recorders that capture callbacks for later assertions.

use std::cell::RefCell;
use std::rc::Rc;

use weft_observable::Observer;
use weft_runtime::{LogEvent, LogFunction, Snapshot};

/// Collects snapshots delivered to a store subscription callback.
#[derive(Clone, Default)]
pub struct SnapshotRecorder {
    seen: Rc<RefCell<Vec<Snapshot>>>,
}

impl std::fmt::Debug for SnapshotRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotRecorder")
            .field("count", &self.count())
            .finish()
    }
}

impl SnapshotRecorder {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Callback to hand to `subscribe`.
    pub fn callback(&self) -> impl Fn(&Snapshot) + 'static {
        let seen = Rc::clone(&self.seen);
        move |snapshot| seen.borrow_mut().push(snapshot.clone())
    }

    /// Number of deliveries.
    pub fn count(&self) -> usize {
        self.seen.borrow().len()
    }

    /// Most recent delivery.
    pub fn last(&self) -> Option<Snapshot> {
        self.seen.borrow().last().cloned()
    }

    /// Drains everything recorded so far.
    pub fn take(&self) -> Vec<Snapshot> {
        std::mem::take(&mut *self.seen.borrow_mut())
    }
}

/// Events observed on an observable.
#[derive(Debug, Clone)]
pub struct Recorded<T, E> {
    /// Values in delivery order.
    pub values: Vec<T>,
    /// Terminal error, if any.
    pub error: Option<E>,
    /// True after completion.
    pub completed: bool,
    /// True after the consumer unsubscribed.
    pub unsubscribed: bool,
}

impl<T, E> Default for Recorded<T, E> {
    fn default() -> Self {
        Self {
            values: Vec::new(),
            error: None,
            completed: false,
            unsubscribed: false,
        }
    }
}

/// Records every event of an observable subscription.
pub struct StreamRecorder<T, E> {
    events: Rc<RefCell<Recorded<T, E>>>,
}

impl<T, E> Clone for StreamRecorder<T, E> {
    fn clone(&self) -> Self {
        Self {
            events: Rc::clone(&self.events),
        }
    }
}

impl<T, E> Default for StreamRecorder<T, E> {
    fn default() -> Self {
        Self {
            events: Rc::new(RefCell::new(Recorded::default())),
        }
    }
}

impl<T, E> std::fmt::Debug for StreamRecorder<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let events = self.events.borrow();
        f.debug_struct("StreamRecorder")
            .field("values", &events.values.len())
            .field("errored", &events.error.is_some())
            .field("completed", &events.completed)
            .finish()
    }
}

impl<T: Clone + 'static, E: Clone + 'static> StreamRecorder<T, E> {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Observer that feeds this recorder.
    pub fn observer(&self) -> Observer<T, E> {
        let next = Rc::clone(&self.events);
        let error = Rc::clone(&self.events);
        let complete = Rc::clone(&self.events);
        let unsubscribe = Rc::clone(&self.events);
        Observer::new()
            .on_next(move |value| next.borrow_mut().values.push(value))
            .on_error(move |e| error.borrow_mut().error = Some(e))
            .on_complete(move || complete.borrow_mut().completed = true)
            .on_unsubscribe(move || unsubscribe.borrow_mut().unsubscribed = true)
    }

    /// Copy of everything recorded.
    pub fn recorded(&self) -> Recorded<T, E> {
        self.events.borrow().clone()
    }

    /// Values in delivery order.
    pub fn values(&self) -> Vec<T> {
        self.events.borrow().values.clone()
    }

    /// Terminal error, if any.
    pub fn error(&self) -> Option<E> {
        self.events.borrow().error.clone()
    }

    /// True after completion.
    pub fn completed(&self) -> bool {
        self.events.borrow().completed
    }

    /// True once completed, errored or unsubscribed.
    pub fn terminated(&self) -> bool {
        let events = self.events.borrow();
        events.completed || events.error.is_some() || events.unsubscribed
    }
}

/// Collects [`LogEvent`]s.
#[derive(Clone, Default)]
pub struct LogRecorder {
    events: Rc<RefCell<Vec<LogEvent>>>,
}

impl std::fmt::Debug for LogRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogRecorder")
            .field("events", &self.events.borrow().len())
            .finish()
    }
}

impl LogRecorder {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Log function to hand to the store or environment builder.
    pub fn log_function(&self) -> LogFunction {
        let events = Rc::clone(&self.events);
        Rc::new(move |event: &LogEvent| events.borrow_mut().push(event.clone()))
    }

    /// Every event so far.
    pub fn events(&self) -> Vec<LogEvent> {
        self.events.borrow().clone()
    }

    /// Events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&LogEvent) -> bool) -> usize {
        self.events.borrow().iter().filter(|e| predicate(e)).count()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use weft_observable::Observable;

    use super::*;

    #[test]
    fn stream_recorder_captures_values_and_completion() {
        let recorder = StreamRecorder::<u32, String>::new();
        let _sub = Observable::from_iter([1, 2, 3]).subscribe(recorder.observer());
        assert_eq!(recorder.values(), vec![1, 2, 3]);
        assert!(recorder.completed());
        assert!(recorder.terminated());
        assert_eq!(recorder.error(), None);
    }

    #[test]
    fn stream_recorder_captures_errors() {
        let recorder = StreamRecorder::<u32, String>::new();
        let _sub = Observable::from_error("boom".to_string()).subscribe(recorder.observer());
        assert_eq!(recorder.error().as_deref(), Some("boom"));
        assert!(!recorder.completed());
    }

    #[test]
    fn log_recorder_counts_matching_events() {
        let recorder = LogRecorder::new();
        let log = recorder.log_function();
        log(&LogEvent::StoreSnapshot);
        log(&LogEvent::StoreRestore);
        log(&LogEvent::StoreSnapshot);
        assert_eq!(recorder.count(|e| matches!(e, LogEvent::StoreSnapshot)), 2);
        assert_eq!(recorder.events().len(), 3);
    }
}
