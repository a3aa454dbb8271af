// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The [`Observable`] type and its constructors.
//!
//! Contract
//! - Cold: the producer runs once per `subscribe` call and not before.
//! - Values may be delivered synchronously (before `subscribe` returns) or
//!   later, from whatever callback holds the [`Sink`].
//! - At most one terminal event (`error` xor `complete`) is delivered.
//! - `unsubscribe` stops delivery and runs the producer's [`Cleanup`] once.

use std::fmt;
use std::rc::Rc;

use crate::observer::Observer;
use crate::subscription::{Cleanup, Sink, Subscription, SubscriptionState};

/// A deferred, possibly multi-value computation.
///
/// `T` is the value type and `E` the error type. Cloning an observable
/// clones the producer reference, not any running subscription.
pub struct Observable<T, E> {
    source: Rc<dyn Fn(Sink<T, E>) -> Cleanup>,
}

impl<T, E> Clone for Observable<T, E> {
    fn clone(&self) -> Self {
        Self {
            source: Rc::clone(&self.source),
        }
    }
}

impl<T, E> fmt::Debug for Observable<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Observable(..)")
    }
}

impl<T: 'static, E: 'static> Observable<T, E> {
    /// Creates an observable from a producer.
    ///
    /// The producer receives a [`Sink`] and returns the cleanup to run when
    /// the subscription ends.
    pub fn create(source: impl Fn(Sink<T, E>) -> Cleanup + 'static) -> Self {
        Self {
            source: Rc::new(source),
        }
    }

    /// Subscribes an observer, running the producer.
    pub fn subscribe(&self, observer: Observer<T, E>) -> Subscription {
        let state = SubscriptionState::new(observer);
        state.start();
        if state.is_closed() {
            return state.subscription();
        }
        let cleanup = (self.source)(Sink::new(Rc::clone(&state)));
        state.install_cleanup(cleanup);
        state.subscription()
    }

    /// Subscribes with only a `next` callback.
    pub fn subscribe_next(&self, next: impl FnMut(T) + 'static) -> Subscription {
        self.subscribe(Observer::new().on_next(next))
    }

    /// An observable that completes immediately without values.
    pub fn empty() -> Self {
        Self::create(|sink| {
            sink.complete();
            Cleanup::None
        })
    }

    /// An observable that never emits and never terminates.
    pub fn never() -> Self {
        Self::create(|_sink| Cleanup::None)
    }

    /// An observable that errors immediately.
    pub fn from_error(error: E) -> Self
    where
        E: Clone,
    {
        Self::create(move |sink| {
            sink.error(error.clone());
            Cleanup::None
        })
    }
}

impl<T: Clone + 'static, E: 'static> Observable<T, E> {
    /// An observable that synchronously emits one value, then completes.
    pub fn from_value(value: T) -> Self {
        Self::create(move |sink| {
            sink.next(value.clone());
            sink.complete();
            Cleanup::None
        })
    }

    /// An observable that synchronously emits every item, then completes.
    ///
    /// Emission stops early if the consumer unsubscribes mid-way.
    pub fn from_iter(items: impl IntoIterator<Item = T>) -> Self {
        let items: Rc<[T]> = items.into_iter().collect();
        Self::create(move |sink| {
            for item in items.iter() {
                if sink.closed() {
                    return Cleanup::None;
                }
                sink.next(item.clone());
            }
            sink.complete();
            Cleanup::None
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::cell::{Cell, RefCell};

    use super::*;

    #[test]
    fn producer_does_not_run_until_subscribed() {
        let runs = Rc::new(Cell::new(0));
        let observable: Observable<u32, ()> = Observable::create({
            let runs = Rc::clone(&runs);
            move |sink| {
                runs.set(runs.get() + 1);
                sink.complete();
                Cleanup::None
            }
        });
        assert_eq!(runs.get(), 0);
        observable.subscribe(Observer::new());
        observable.subscribe(Observer::new());
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn synchronous_values_arrive_before_subscribe_returns() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let observable: Observable<u32, ()> = Observable::from_iter([1, 2, 3]);
        let sub = observable.subscribe_next({
            let seen = Rc::clone(&seen);
            move |v| seen.borrow_mut().push(v)
        });
        assert_eq!(*seen.borrow(), vec![1, 2, 3]);
        assert!(sub.closed());
    }

    #[test]
    fn only_one_terminal_event_is_delivered() {
        let completes = Rc::new(Cell::new(0));
        let errors = Rc::new(Cell::new(0));
        let observable: Observable<u32, &'static str> = Observable::create(|sink| {
            sink.complete();
            sink.error("late");
            sink.complete();
            sink.next(1);
            Cleanup::None
        });
        observable.subscribe(
            Observer::new()
                .on_complete({
                    let completes = Rc::clone(&completes);
                    move || completes.set(completes.get() + 1)
                })
                .on_error({
                    let errors = Rc::clone(&errors);
                    move |_| errors.set(errors.get() + 1)
                }),
        );
        assert_eq!(completes.get(), 1);
        assert_eq!(errors.get(), 0);
    }

    #[test]
    fn unsubscribe_runs_cleanup_once_and_stops_delivery() {
        let cleanups = Rc::new(Cell::new(0));
        let held: Rc<RefCell<Option<Sink<u32, ()>>>> = Rc::default();
        let observable: Observable<u32, ()> = Observable::create({
            let cleanups = Rc::clone(&cleanups);
            let held = Rc::clone(&held);
            move |sink| {
                *held.borrow_mut() = Some(sink);
                let cleanups = Rc::clone(&cleanups);
                Cleanup::from_fn(move || cleanups.set(cleanups.get() + 1))
            }
        });
        let seen = Rc::new(Cell::new(0));
        let sub = observable.subscribe_next({
            let seen = Rc::clone(&seen);
            move |_| seen.set(seen.get() + 1)
        });
        let sink = held.borrow().clone().expect("producer ran");
        sink.next(1);
        sub.unsubscribe();
        sub.unsubscribe();
        sink.next(2);
        sink.complete();
        assert_eq!(seen.get(), 1);
        assert_eq!(cleanups.get(), 1);
        assert!(sink.closed());
    }

    #[test]
    fn unsubscribing_in_start_skips_the_producer() {
        let ran = Rc::new(Cell::new(false));
        let observable: Observable<u32, ()> = Observable::create({
            let ran = Rc::clone(&ran);
            move |_sink| {
                ran.set(true);
                Cleanup::None
            }
        });
        let sub = observable.subscribe(Observer::new().on_start(Subscription::unsubscribe));
        assert!(sub.closed());
        assert!(!ran.get());
    }

    #[test]
    fn cleanup_runs_immediately_when_producer_finished_synchronously() {
        let cleaned = Rc::new(Cell::new(false));
        let observable: Observable<u32, ()> = Observable::create({
            let cleaned = Rc::clone(&cleaned);
            move |sink| {
                sink.next(7);
                sink.complete();
                let cleaned = Rc::clone(&cleaned);
                Cleanup::from_fn(move || cleaned.set(true))
            }
        });
        observable.subscribe(Observer::new());
        assert!(cleaned.get());
    }
}
