// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Combinators on [`Observable`].
//!
//! Every combinator returns a new cold observable; subscribing to it
//! subscribes upstream, and unsubscribing from it unsubscribes upstream
//! (and any inner observables) exactly once.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use crate::observable::Observable;
use crate::observer::{Observer, Tap};
use crate::subscription::{Cleanup, Sink, Subscription};
use crate::timer::{Timer, TimerHandle};

fn forward<T: 'static, E: 'static>(sink: &Sink<T, E>) -> Observer<T, E> {
    let on_next = sink.clone();
    let on_error = sink.clone();
    let on_complete = sink.clone();
    Observer::new()
        .on_next(move |value| on_next.next(value))
        .on_error(move |error| on_error.error(error))
        .on_complete(move || on_complete.complete())
}

impl<T: 'static, E: 'static> Observable<T, E> {
    /// Transforms each value.
    pub fn map<U: 'static>(&self, f: impl Fn(T) -> U + 'static) -> Observable<U, E> {
        let source = self.clone();
        let f = Rc::new(f);
        Observable::create(move |sink: Sink<U, E>| {
            let f = Rc::clone(&f);
            let on_next = sink.clone();
            let on_error = sink.clone();
            let on_complete = sink;
            source
                .subscribe(
                    Observer::new()
                        .on_next(move |value| on_next.next(f(value)))
                        .on_error(move |error| on_error.error(error))
                        .on_complete(move || on_complete.complete()),
                )
                .into()
        })
    }

    /// Transforms the error.
    pub fn map_err<F: 'static>(&self, f: impl Fn(E) -> F + 'static) -> Observable<T, F> {
        let source = self.clone();
        let f = Rc::new(f);
        Observable::create(move |sink: Sink<T, F>| {
            let f = Rc::clone(&f);
            let on_next = sink.clone();
            let on_error = sink.clone();
            let on_complete = sink;
            source
                .subscribe(
                    Observer::new()
                        .on_next(move |value| on_next.next(value))
                        .on_error(move |error| on_error.error(f(error)))
                        .on_complete(move || on_complete.complete()),
                )
                .into()
        })
    }

    /// Forwards only values matching `predicate`.
    pub fn filter(&self, predicate: impl Fn(&T) -> bool + 'static) -> Self {
        let source = self.clone();
        let predicate = Rc::new(predicate);
        Observable::create(move |sink: Sink<T, E>| {
            let predicate = Rc::clone(&predicate);
            let on_next = sink.clone();
            let on_error = sink.clone();
            let on_complete = sink;
            source
                .subscribe(
                    Observer::new()
                        .on_next(move |value| {
                            if predicate(&value) {
                                on_next.next(value);
                            }
                        })
                        .on_error(move |error| on_error.error(error))
                        .on_complete(move || on_complete.complete()),
                )
                .into()
        })
    }

    /// Maps every value to an inner observable and merges their values.
    ///
    /// Completes once the outer observable and every inner observable have
    /// completed. The first error from any of them terminates the result and
    /// cancels everything else. Unsubscribing cancels outer and inner.
    pub fn merge_map<U: 'static>(
        &self,
        f: impl Fn(T) -> Observable<U, E> + 'static,
    ) -> Observable<U, E> {
        let source = self.clone();
        let f = Rc::new(f);
        Observable::create(move |sink: Sink<U, E>| {
            let inner: Rc<RefCell<Vec<Subscription>>> = Rc::default();
            let outer_done = Rc::new(Cell::new(false));
            let active = Rc::new(Cell::new(0usize));

            let on_next = {
                let f = Rc::clone(&f);
                let sink = sink.clone();
                let inner = Rc::clone(&inner);
                let outer_done = Rc::clone(&outer_done);
                let active = Rc::clone(&active);
                move |value: T| {
                    active.set(active.get() + 1);
                    let on_complete = {
                        let sink = sink.clone();
                        let outer_done = Rc::clone(&outer_done);
                        let active = Rc::clone(&active);
                        move || {
                            active.set(active.get().saturating_sub(1));
                            if outer_done.get() && active.get() == 0 {
                                sink.complete();
                            }
                        }
                    };
                    let inner_next = sink.clone();
                    let inner_error = sink.clone();
                    let subscription = f(value).subscribe(
                        Observer::new()
                            .on_next(move |v| inner_next.next(v))
                            .on_error(move |e| inner_error.error(e))
                            .on_complete(on_complete),
                    );
                    let mut inner = inner.borrow_mut();
                    inner.retain(|s| !s.closed());
                    if !subscription.closed() {
                        inner.push(subscription);
                    }
                }
            };
            let on_complete = {
                let sink = sink.clone();
                let outer_done = Rc::clone(&outer_done);
                let active = Rc::clone(&active);
                move || {
                    outer_done.set(true);
                    if active.get() == 0 {
                        sink.complete();
                    }
                }
            };
            let on_error = sink.clone();
            let outer = source.subscribe(
                Observer::new()
                    .on_next(on_next)
                    .on_error(move |e| on_error.error(e))
                    .on_complete(on_complete),
            );
            Cleanup::from_fn(move || {
                outer.unsubscribe();
                let inner = std::mem::take(&mut *inner.borrow_mut());
                for subscription in inner {
                    subscription.unsubscribe();
                }
            })
        })
    }

    /// Runs side effects without altering the stream.
    #[doc(alias = "do")]
    pub fn tap(&self, hooks: Tap<T, E>) -> Self {
        let source = self.clone();
        Observable::create(move |sink: Sink<T, E>| {
            if let Some(start) = &hooks.start {
                start();
            }
            let next_hook = hooks.next.clone();
            let error_hook = hooks.error.clone();
            let complete_hook = hooks.complete.clone();
            let on_next = sink.clone();
            let on_error = sink.clone();
            let on_complete = sink.clone();
            let upstream = source.subscribe(
                Observer::new()
                    .on_next(move |value| {
                        if let Some(hook) = &next_hook {
                            hook(&value);
                        }
                        on_next.next(value);
                    })
                    .on_error(move |error| {
                        if let Some(hook) = &error_hook {
                            hook(&error);
                        }
                        on_error.error(error);
                    })
                    .on_complete(move || {
                        if let Some(hook) = &complete_hook {
                            hook();
                        }
                        on_complete.complete();
                    }),
            );
            let unsubscribe_hook = hooks.unsubscribe.clone();
            Cleanup::from_fn(move || {
                // Upstream still open at cleanup time means the consumer
                // cancelled rather than the stream terminating.
                let cancelled = !upstream.closed();
                upstream.unsubscribe();
                if cancelled {
                    if let Some(hook) = &unsubscribe_hook {
                        hook();
                    }
                }
            })
        })
    }

    /// Runs `f` once when the subscription ends for any reason: completion,
    /// error, or unsubscribe.
    pub fn finally(&self, f: impl Fn() + 'static) -> Self {
        let source = self.clone();
        let f = Rc::new(f);
        Observable::create(move |sink: Sink<T, E>| {
            let upstream = source.subscribe(forward(&sink));
            let f = Rc::clone(&f);
            Cleanup::from_fn(move || {
                upstream.unsubscribe();
                f();
            })
        })
    }

    /// Replaces an error with the observable returned by `f`.
    pub fn catch(&self, f: impl Fn(E) -> Self + 'static) -> Self {
        let source = self.clone();
        let f = Rc::new(f);
        Observable::create(move |sink: Sink<T, E>| {
            let fallback: Rc<RefCell<Option<Subscription>>> = Rc::default();
            let on_error = {
                let f = Rc::clone(&f);
                let sink = sink.clone();
                let fallback = Rc::clone(&fallback);
                move |error| {
                    let subscription = f(error).subscribe(forward(&sink));
                    *fallback.borrow_mut() = Some(subscription);
                }
            };
            let on_next = sink.clone();
            let on_complete = sink.clone();
            let upstream = source.subscribe(
                Observer::new()
                    .on_next(move |value| on_next.next(value))
                    .on_error(on_error)
                    .on_complete(move || on_complete.complete()),
            );
            Cleanup::from_fn(move || {
                upstream.unsubscribe();
                if let Some(subscription) = fallback.borrow_mut().take() {
                    subscription.unsubscribe();
                }
            })
        })
    }

    /// Emits all values of `self`, then all values of `next`.
    pub fn concat(&self, next: Self) -> Self {
        let source = self.clone();
        Observable::create(move |sink: Sink<T, E>| {
            let second: Rc<RefCell<Option<Subscription>>> = Rc::default();
            let on_complete = {
                let next = next.clone();
                let sink = sink.clone();
                let second = Rc::clone(&second);
                move || {
                    let subscription = next.subscribe(forward(&sink));
                    *second.borrow_mut() = Some(subscription);
                }
            };
            let on_next = sink.clone();
            let on_error = sink.clone();
            let first = source.subscribe(
                Observer::new()
                    .on_next(move |value| on_next.next(value))
                    .on_error(move |error| on_error.error(error))
                    .on_complete(on_complete),
            );
            Cleanup::from_fn(move || {
                first.unsubscribe();
                if let Some(subscription) = second.borrow_mut().take() {
                    subscription.unsubscribe();
                }
            })
        })
    }

    /// Re-subscribes to `self` `interval` after each completion, forever.
    ///
    /// Values and errors are forwarded; an error ends polling.
    pub fn poll(&self, interval: Duration, timer: Rc<dyn Timer>) -> Self {
        let source = self.clone();
        Observable::create(move |sink: Sink<T, E>| {
            let poller = Rc::new(Poller {
                source: source.clone(),
                sink,
                interval,
                timer: Rc::clone(&timer),
                current: RefCell::new(None),
                timeout: Cell::new(None),
                stopped: Cell::new(false),
            });
            poller.run();
            Cleanup::from_fn(move || poller.stop())
        })
    }
}

struct Poller<T, E> {
    source: Observable<T, E>,
    sink: Sink<T, E>,
    interval: Duration,
    timer: Rc<dyn Timer>,
    current: RefCell<Option<Subscription>>,
    timeout: Cell<Option<TimerHandle>>,
    stopped: Cell<bool>,
}

impl<T: 'static, E: 'static> Poller<T, E> {
    fn run(self: &Rc<Self>) {
        if self.stopped.get() {
            return;
        }
        let on_next = self.sink.clone();
        let on_error = self.sink.clone();
        let weak = Rc::downgrade(self);
        let subscription = self.source.subscribe(
            Observer::new()
                .on_next(move |value| on_next.next(value))
                .on_error(move |error| on_error.error(error))
                .on_complete(move || {
                    if let Some(poller) = weak.upgrade() {
                        poller.schedule();
                    }
                }),
        );
        *self.current.borrow_mut() = Some(subscription);
    }

    fn schedule(self: &Rc<Self>) {
        if self.stopped.get() {
            return;
        }
        let this = Rc::clone(self);
        let handle = self
            .timer
            .set_timeout(self.interval, Box::new(move || this.run()));
        self.timeout.set(Some(handle));
    }

    fn stop(&self) {
        self.stopped.set(true);
        if let Some(handle) = self.timeout.take() {
            self.timer.clear_timeout(handle);
        }
        let current = self.current.borrow_mut().take();
        if let Some(subscription) = current {
            subscription.unsubscribe();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::timer::ManualTimer;

    fn collect<T: Clone + 'static, E: 'static>(
        observable: &Observable<T, E>,
    ) -> (Rc<RefCell<Vec<T>>>, Rc<Cell<bool>>, Subscription) {
        let values = Rc::new(RefCell::new(Vec::new()));
        let done = Rc::new(Cell::new(false));
        let sub = observable.subscribe(
            Observer::new()
                .on_next({
                    let values = Rc::clone(&values);
                    move |v| values.borrow_mut().push(v)
                })
                .on_complete({
                    let done = Rc::clone(&done);
                    move || done.set(true)
                }),
        );
        (values, done, sub)
    }

    #[test]
    fn map_and_filter_compose() {
        let source: Observable<u32, ()> = Observable::from_iter([1, 2, 3, 4]);
        let (values, done, _) = collect(&source.map(|v| v * 10).filter(|v| *v > 15));
        assert_eq!(*values.borrow(), vec![20, 30, 40]);
        assert!(done.get());
    }

    #[test]
    fn merge_map_waits_for_inner_completion() {
        let held: Rc<RefCell<Vec<Sink<u32, ()>>>> = Rc::default();
        let source: Observable<u32, ()> = Observable::from_iter([1, 2]);
        let merged = source.merge_map({
            let held = Rc::clone(&held);
            move |v| {
                let held = Rc::clone(&held);
                Observable::create(move |sink: Sink<u32, ()>| {
                    sink.next(v);
                    held.borrow_mut().push(sink);
                    Cleanup::None
                })
            }
        });
        let (values, done, _) = collect(&merged);
        assert_eq!(*values.borrow(), vec![1, 2]);
        assert!(!done.get());
        let sinks = held.borrow().clone();
        sinks[1].next(20);
        sinks[1].complete();
        assert!(!done.get());
        sinks[0].complete();
        assert!(done.get());
        assert_eq!(*values.borrow(), vec![1, 2, 20]);
    }

    #[test]
    fn merge_map_unsubscribe_cancels_inner() {
        let cancelled = Rc::new(Cell::new(0));
        let source: Observable<u32, ()> = Observable::from_iter([1, 2, 3]);
        let merged = source.merge_map({
            let cancelled = Rc::clone(&cancelled);
            move |_| {
                let cancelled = Rc::clone(&cancelled);
                Observable::create(move |_sink: Sink<u32, ()>| {
                    let cancelled = Rc::clone(&cancelled);
                    Cleanup::from_fn(move || cancelled.set(cancelled.get() + 1))
                })
            }
        });
        let (_, _, sub) = collect(&merged);
        sub.unsubscribe();
        assert_eq!(cancelled.get(), 3);
    }

    #[test]
    fn tap_reports_unsubscribe_but_not_completion_as_cancel() {
        let unsubscribed = Rc::new(Cell::new(0));
        let completed = Rc::new(Cell::new(0));
        let hooks = Tap::new()
            .on_unsubscribe({
                let unsubscribed = Rc::clone(&unsubscribed);
                move || unsubscribed.set(unsubscribed.get() + 1)
            })
            .on_complete({
                let completed = Rc::clone(&completed);
                move || completed.set(completed.get() + 1)
            });
        let finite: Observable<u32, ()> = Observable::from_value(1);
        collect(&finite.tap(hooks.clone()));
        assert_eq!(completed.get(), 1);
        assert_eq!(unsubscribed.get(), 0);

        let endless: Observable<u32, ()> = Observable::never();
        let (_, _, sub) = collect(&endless.tap(hooks));
        sub.unsubscribe();
        assert_eq!(unsubscribed.get(), 1);
    }

    #[test]
    fn finally_runs_once_for_every_ending() {
        let count = Rc::new(Cell::new(0));
        let bump = {
            let count = Rc::clone(&count);
            move || count.set(count.get() + 1)
        };
        let ok: Observable<u32, ()> = Observable::from_value(1);
        collect(&ok.finally(bump.clone()));
        let failing: Observable<u32, ()> = Observable::from_error(());
        collect(&failing.finally(bump.clone()));
        let endless: Observable<u32, ()> = Observable::never();
        let (_, _, sub) = collect(&endless.finally(bump));
        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn catch_and_concat() {
        let failing: Observable<u32, &'static str> = Observable::from_error("boom");
        let recovered = failing.catch(|_| Observable::from_value(9));
        let joined = recovered.concat(Observable::from_iter([10, 11]));
        let (values, done, _) = collect(&joined);
        assert_eq!(*values.borrow(), vec![9, 10, 11]);
        assert!(done.get());
    }

    #[test]
    fn poll_resubscribes_after_each_completion() {
        let timer = Rc::new(ManualTimer::new());
        let runs = Rc::new(Cell::new(0u32));
        let source: Observable<u32, ()> = Observable::create({
            let runs = Rc::clone(&runs);
            move |sink| {
                runs.set(runs.get() + 1);
                sink.next(runs.get());
                sink.complete();
                Cleanup::None
            }
        });
        let (values, done, sub) = collect(&source.poll(Duration::from_millis(100), timer.clone()));
        assert_eq!(*values.borrow(), vec![1]);
        timer.advance(Duration::from_millis(99));
        assert_eq!(runs.get(), 1);
        timer.advance(Duration::from_millis(1));
        assert_eq!(runs.get(), 2);
        timer.advance(Duration::from_millis(250));
        assert_eq!(*values.borrow(), vec![1, 2, 3, 4]);
        sub.unsubscribe();
        assert_eq!(timer.pending(), 0);
        timer.advance(Duration::from_secs(10));
        assert_eq!(runs.get(), 4);
        assert!(!done.get());
    }
}
