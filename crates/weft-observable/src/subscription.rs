// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Subscription handles, sinks and producer cleanup.
//!
//! A subscription is a small state machine with two states: open and closed.
//! Every transition to closed (complete, error, unsubscribe) happens exactly
//! once and runs the producer cleanup exactly once. Observer callbacks are
//! dropped on close, which breaks any `Rc` cycle between an observer and the
//! subscription it captured.
//!
//! Values pushed while a `next` callback is running are queued and delivered
//! in order once it returns.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use crate::observer::Observer;

/// Teardown returned by a producer.
///
/// Runs at most once: when the subscription completes, errors, or is
/// unsubscribed, whichever happens first.
#[derive(Default)]
pub enum Cleanup {
    /// Nothing to tear down.
    #[default]
    None,
    /// Run a closure.
    Callback(Box<dyn FnOnce()>),
    /// Unsubscribe from an upstream subscription.
    Subscription(Subscription),
    /// Several teardowns, run in order.
    Many(Vec<Cleanup>),
}

impl Cleanup {
    /// Wraps a closure as a cleanup.
    pub fn from_fn(f: impl FnOnce() + 'static) -> Self {
        Self::Callback(Box::new(f))
    }

    /// Runs the teardown.
    pub fn run(self) {
        match self {
            Self::None => {}
            Self::Callback(f) => f(),
            Self::Subscription(subscription) => subscription.unsubscribe(),
            Self::Many(all) => {
                for cleanup in all {
                    cleanup.run();
                }
            }
        }
    }
}

impl From<Subscription> for Cleanup {
    fn from(subscription: Subscription) -> Self {
        Self::Subscription(subscription)
    }
}

impl fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("Cleanup::None"),
            Self::Callback(_) => f.write_str("Cleanup::Callback(..)"),
            Self::Subscription(s) => write!(f, "Cleanup::Subscription({s:?})"),
            Self::Many(all) => write!(f, "Cleanup::Many({})", all.len()),
        }
    }
}

/// Type-erased control surface shared by [`Subscription`] handles.
pub(crate) trait SubscriptionControl {
    fn unsubscribe(&self);
    fn closed(&self) -> bool;
}

/// Per-subscription state shared by the [`Sink`] and the [`Subscription`].
pub(crate) struct SubscriptionState<T, E> {
    closed: Cell<bool>,
    delivering: Cell<bool>,
    pending: RefCell<VecDeque<T>>,
    observer: RefCell<Observer<T, E>>,
    cleanup: RefCell<Option<Cleanup>>,
}

impl<T: 'static, E: 'static> SubscriptionState<T, E> {
    pub(crate) fn new(observer: Observer<T, E>) -> Rc<Self> {
        Rc::new(Self {
            closed: Cell::new(false),
            delivering: Cell::new(false),
            pending: RefCell::new(VecDeque::new()),
            observer: RefCell::new(observer),
            cleanup: RefCell::new(None),
        })
    }

    pub(crate) fn subscription(self: &Rc<Self>) -> Subscription {
        let control: Rc<dyn SubscriptionControl> = Rc::clone(self) as Rc<dyn SubscriptionControl>;
        Subscription { inner: control }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub(crate) fn start(self: &Rc<Self>) {
        let start = self.observer.borrow_mut().start.take();
        if let Some(mut start) = start {
            start(&self.subscription());
        }
    }

    pub(crate) fn install_cleanup(&self, cleanup: Cleanup) {
        if self.closed.get() {
            cleanup.run();
        } else {
            *self.cleanup.borrow_mut() = Some(cleanup);
        }
    }

    fn next(&self, mut value: T) {
        if self.closed.get() {
            return;
        }
        if self.delivering.get() {
            self.pending.borrow_mut().push_back(value);
            return;
        }
        let Some(mut callback) = self.observer.borrow_mut().next.take() else {
            tracing::trace!("observable value dropped: no next handler");
            return;
        };
        self.delivering.set(true);
        loop {
            callback(value);
            if self.closed.get() {
                break;
            }
            let queued = self.pending.borrow_mut().pop_front();
            match queued {
                Some(queued) => value = queued,
                None => break,
            }
        }
        self.delivering.set(false);
        if !self.closed.get() {
            let mut observer = self.observer.borrow_mut();
            if observer.next.is_none() {
                observer.next = Some(callback);
            }
        }
    }

    fn error(&self, error: E) {
        if self.closed.replace(true) {
            return;
        }
        let callback = self.observer.borrow_mut().error.take();
        match callback {
            Some(mut callback) => callback(error),
            None => {
                tracing::debug!("observable error delivered to an observer without an error handler");
            }
        }
        self.close();
    }

    fn complete(&self) {
        if self.closed.replace(true) {
            return;
        }
        let callback = self.observer.borrow_mut().complete.take();
        if let Some(mut callback) = callback {
            callback();
        }
        self.close();
    }

    fn close(&self) {
        let cleanup = self.cleanup.borrow_mut().take();
        let queued = std::mem::take(&mut *self.pending.borrow_mut());
        drop(queued);
        // Observer closures may capture this subscription; dropping them here
        // releases the cycle.
        let dropped = std::mem::take(&mut *self.observer.borrow_mut());
        drop(dropped);
        if let Some(cleanup) = cleanup {
            cleanup.run();
        }
    }
}

impl<T: 'static, E: 'static> SubscriptionControl for SubscriptionState<T, E> {
    fn unsubscribe(&self) {
        if self.closed.replace(true) {
            return;
        }
        let callback = self.observer.borrow_mut().unsubscribe.take();
        if let Some(mut callback) = callback {
            callback();
        }
        self.close();
    }

    fn closed(&self) -> bool {
        self.closed.get()
    }
}

/// Handle returned by [`crate::Observable::subscribe`].
///
/// Cloning the handle does not create a new subscription; all clones control
/// the same one. `unsubscribe` is idempotent.
#[derive(Clone)]
pub struct Subscription {
    inner: Rc<dyn SubscriptionControl>,
}

impl Subscription {
    /// A handle that is already closed. Unsubscribing it is a no-op.
    pub fn closed_handle() -> Self {
        Self {
            inner: Rc::new(ClosedControl),
        }
    }

    /// Cancels the subscription: no further events are delivered and the
    /// producer cleanup runs (once).
    pub fn unsubscribe(&self) {
        self.inner.unsubscribe();
    }

    /// Returns true once the subscription has completed, errored, or been
    /// unsubscribed.
    pub fn closed(&self) -> bool {
        self.inner.closed()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.closed())
            .finish()
    }
}

struct ClosedControl;

impl SubscriptionControl for ClosedControl {
    fn unsubscribe(&self) {}
    fn closed(&self) -> bool {
        true
    }
}

/// Producer-side end of a subscription.
///
/// Events pushed after the subscription closed are ignored.
pub struct Sink<T, E> {
    state: Rc<SubscriptionState<T, E>>,
}

impl<T, E> Clone for Sink<T, E> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

impl<T: 'static, E: 'static> Sink<T, E> {
    pub(crate) fn new(state: Rc<SubscriptionState<T, E>>) -> Self {
        Self { state }
    }

    /// Returns a handle to the subscription this sink feeds.
    pub fn subscription(&self) -> Subscription {
        self.state.subscription()
    }

    /// Delivers a value.
    pub fn next(&self, value: T) {
        self.state.next(value);
    }

    /// Delivers the terminal error event.
    pub fn error(&self, error: E) {
        self.state.error(error);
    }

    /// Delivers the terminal completion event.
    pub fn complete(&self) {
        self.state.complete();
    }

    /// Returns true when the consumer will not receive further events.
    pub fn closed(&self) -> bool {
        self.state.is_closed()
    }
}

impl<T, E> fmt::Debug for Sink<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink")
            .field("closed", &self.state.closed.get())
            .finish()
    }
}
