// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Multicast subject with full replay.
//!
//! A [`ReplaySubject`] records every event it is given and replays the whole
//! history to each new subscriber before forwarding live events. After a
//! terminal event, new subscribers receive the history and the terminal
//! event synchronously.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::observable::Observable;
use crate::subscription::{Cleanup, Sink};

#[derive(Clone)]
enum Event<T, E> {
    Next(T),
    Error(E),
    Complete,
}

struct SubjectInner<T, E> {
    events: Vec<Event<T, E>>,
    sinks: BTreeMap<u64, Sink<T, E>>,
    next_id: u64,
    terminated: bool,
}

/// Multicast source that replays its history to late subscribers.
pub struct ReplaySubject<T, E> {
    inner: Rc<RefCell<SubjectInner<T, E>>>,
}

impl<T, E> Clone for ReplaySubject<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T, E> Default for ReplaySubject<T, E> {
    fn default() -> Self {
        Self {
            inner: Rc::new(RefCell::new(SubjectInner {
                events: Vec::new(),
                sinks: BTreeMap::new(),
                next_id: 0,
                terminated: false,
            })),
        }
    }
}

impl<T: Clone + 'static, E: Clone + 'static> ReplaySubject<T, E> {
    /// Creates an empty subject.
    pub fn new() -> Self {
        Self::default()
    }

    fn live_sinks(&self) -> Vec<Sink<T, E>> {
        self.inner.borrow().sinks.values().cloned().collect()
    }

    /// Records and forwards a value.
    pub fn next(&self, value: T) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.terminated {
                return;
            }
            inner.events.push(Event::Next(value.clone()));
        }
        for sink in self.live_sinks() {
            sink.next(value.clone());
        }
    }

    /// Records and forwards an error; the subject is terminated afterwards.
    pub fn error(&self, error: E) {
        let sinks = {
            let mut inner = self.inner.borrow_mut();
            if inner.terminated {
                return;
            }
            inner.terminated = true;
            inner.events.push(Event::Error(error.clone()));
            std::mem::take(&mut inner.sinks)
        };
        for sink in sinks.into_values() {
            sink.error(error.clone());
        }
    }

    /// Records and forwards completion; the subject is terminated afterwards.
    pub fn complete(&self) {
        let sinks = {
            let mut inner = self.inner.borrow_mut();
            if inner.terminated {
                return;
            }
            inner.terminated = true;
            inner.events.push(Event::Complete);
            std::mem::take(&mut inner.sinks)
        };
        for sink in sinks.into_values() {
            sink.complete();
        }
    }

    /// Returns true once a terminal event was recorded.
    pub fn is_terminated(&self) -> bool {
        self.inner.borrow().terminated
    }

    /// Number of live subscribers.
    pub fn observer_count(&self) -> usize {
        self.inner.borrow().sinks.len()
    }

    /// Detaches every live subscriber without delivering a terminal event.
    pub fn unsubscribe_all(&self) {
        let sinks = std::mem::take(&mut self.inner.borrow_mut().sinks);
        for sink in sinks.into_values() {
            sink.subscription().unsubscribe();
        }
    }

    /// Returns an observable view of this subject.
    pub fn observable(&self) -> Observable<T, E> {
        let inner = Rc::clone(&self.inner);
        Observable::create(move |sink: Sink<T, E>| {
            let history = inner.borrow().events.clone();
            for event in history {
                if sink.closed() {
                    return Cleanup::None;
                }
                match event {
                    Event::Next(value) => sink.next(value),
                    Event::Error(error) => {
                        sink.error(error);
                        return Cleanup::None;
                    }
                    Event::Complete => {
                        sink.complete();
                        return Cleanup::None;
                    }
                }
            }
            if sink.closed() {
                return Cleanup::None;
            }
            let id = {
                let mut state = inner.borrow_mut();
                let id = state.next_id;
                state.next_id += 1;
                state.sinks.insert(id, sink);
                id
            };
            let inner = Rc::downgrade(&inner);
            Cleanup::from_fn(move || {
                if let Some(inner) = inner.upgrade() {
                    let removed = inner.borrow_mut().sinks.remove(&id);
                    drop(removed);
                }
            })
        })
    }
}

impl<T, E> fmt::Debug for ReplaySubject<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ReplaySubject")
            .field("events", &inner.events.len())
            .field("observers", &inner.sinks.len())
            .field("terminated", &inner.terminated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::observer::Observer;

    #[test]
    fn late_subscribers_receive_history_then_live_values() {
        let subject: ReplaySubject<u32, ()> = ReplaySubject::new();
        subject.next(1);
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sub = subject.observable().subscribe_next({
            let seen = Rc::clone(&seen);
            move |v| seen.borrow_mut().push(v)
        });
        subject.next(2);
        assert_eq!(*seen.borrow(), vec![1, 2]);
        assert_eq!(subject.observer_count(), 1);
        sub.unsubscribe();
        assert_eq!(subject.observer_count(), 0);
    }

    #[test]
    fn terminal_events_are_replayed() {
        let subject: ReplaySubject<u32, ()> = ReplaySubject::new();
        subject.next(1);
        subject.complete();
        subject.next(2);
        let done = Rc::new(Cell::new(false));
        subject.observable().subscribe(Observer::new().on_complete({
            let done = Rc::clone(&done);
            move || done.set(true)
        }));
        assert!(done.get());
        assert!(subject.is_terminated());
    }
}
