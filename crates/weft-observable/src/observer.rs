// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Consumer callbacks for a single subscription.

use std::fmt;
use std::rc::Rc;

use crate::subscription::Subscription;

/// The set of callbacks a consumer registers with
/// [`crate::Observable::subscribe`].
///
/// Every callback is optional. `start` runs before the producer, with the
/// subscription handle, so a consumer may cancel synchronously.
pub struct Observer<T, E> {
    pub(crate) start: Option<Box<dyn FnMut(&Subscription)>>,
    pub(crate) next: Option<Box<dyn FnMut(T)>>,
    pub(crate) error: Option<Box<dyn FnMut(E)>>,
    pub(crate) complete: Option<Box<dyn FnMut()>>,
    pub(crate) unsubscribe: Option<Box<dyn FnMut()>>,
}

impl<T, E> Default for Observer<T, E> {
    fn default() -> Self {
        Self {
            start: None,
            next: None,
            error: None,
            complete: None,
            unsubscribe: None,
        }
    }
}

impl<T, E> Observer<T, E> {
    /// Creates an observer with no callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the `start` callback.
    pub fn on_start(mut self, f: impl FnMut(&Subscription) + 'static) -> Self {
        self.start = Some(Box::new(f));
        self
    }

    /// Sets the `next` callback.
    pub fn on_next(mut self, f: impl FnMut(T) + 'static) -> Self {
        self.next = Some(Box::new(f));
        self
    }

    /// Sets the `error` callback.
    pub fn on_error(mut self, f: impl FnMut(E) + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    /// Sets the `complete` callback.
    pub fn on_complete(mut self, f: impl FnMut() + 'static) -> Self {
        self.complete = Some(Box::new(f));
        self
    }

    /// Sets the `unsubscribe` callback, invoked when the consumer cancels
    /// before a terminal event.
    pub fn on_unsubscribe(mut self, f: impl FnMut() + 'static) -> Self {
        self.unsubscribe = Some(Box::new(f));
        self
    }
}

impl<T, E> fmt::Debug for Observer<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("start", &self.start.is_some())
            .field("next", &self.next.is_some())
            .field("error", &self.error.is_some())
            .field("complete", &self.complete.is_some())
            .field("unsubscribe", &self.unsubscribe.is_some())
            .finish()
    }
}

/// Side-effect hooks for [`crate::Observable::tap`].
///
/// Unlike [`Observer`], hooks are shared (`Rc`) because the tapped
/// observable may be subscribed many times.
pub struct Tap<T, E> {
    pub(crate) start: Option<Rc<dyn Fn()>>,
    pub(crate) next: Option<Rc<dyn Fn(&T)>>,
    pub(crate) error: Option<Rc<dyn Fn(&E)>>,
    pub(crate) complete: Option<Rc<dyn Fn()>>,
    pub(crate) unsubscribe: Option<Rc<dyn Fn()>>,
}

impl<T, E> Clone for Tap<T, E> {
    fn clone(&self) -> Self {
        Self {
            start: self.start.clone(),
            next: self.next.clone(),
            error: self.error.clone(),
            complete: self.complete.clone(),
            unsubscribe: self.unsubscribe.clone(),
        }
    }
}

impl<T, E> Default for Tap<T, E> {
    fn default() -> Self {
        Self {
            start: None,
            next: None,
            error: None,
            complete: None,
            unsubscribe: None,
        }
    }
}

impl<T, E> Tap<T, E> {
    /// Creates an empty set of hooks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs when a consumer subscribes, before the upstream producer.
    pub fn on_start(mut self, f: impl Fn() + 'static) -> Self {
        self.start = Some(Rc::new(f));
        self
    }

    /// Runs for every value, before it is forwarded.
    pub fn on_next(mut self, f: impl Fn(&T) + 'static) -> Self {
        self.next = Some(Rc::new(f));
        self
    }

    /// Runs on error, before it is forwarded.
    pub fn on_error(mut self, f: impl Fn(&E) + 'static) -> Self {
        self.error = Some(Rc::new(f));
        self
    }

    /// Runs on completion, before it is forwarded.
    pub fn on_complete(mut self, f: impl Fn() + 'static) -> Self {
        self.complete = Some(Rc::new(f));
        self
    }

    /// Runs when the downstream consumer cancels.
    pub fn on_unsubscribe(mut self, f: impl Fn() + 'static) -> Self {
        self.unsubscribe = Some(Rc::new(f));
        self
    }
}

impl<T, E> fmt::Debug for Tap<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tap")
            .field("start", &self.start.is_some())
            .field("next", &self.next.is_some())
            .field("error", &self.error.is_some())
            .field("complete", &self.complete.is_some())
            .field("unsubscribe", &self.unsubscribe.is_some())
            .finish()
    }
}
