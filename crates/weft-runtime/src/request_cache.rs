// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-flight request deduplication.
//!
//! Concurrent fetches of the same request share one upstream execution.
//! Responses are recorded in a [`ReplaySubject`] so a caller joining late
//! still sees every payload. The upstream is cancelled when its last caller
//! unsubscribes, and forgotten once it terminates.
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

use weft_observable::{Cleanup, Observable, Observer, ReplaySubject, Subscription};

use crate::error::RuntimeError;
use crate::ident::RequestIdentifier;
use crate::network::GraphQlResponse;

struct InFlight {
    subject: ReplaySubject<GraphQlResponse, RuntimeError>,
    upstream: Option<Subscription>,
}

/// Requests currently executing, by identifier.
#[derive(Default)]
pub struct RequestCache {
    entries: RefCell<BTreeMap<RequestIdentifier, InFlight>>,
}

impl fmt::Debug for RequestCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCache")
            .field("in_flight", &self.len())
            .finish()
    }
}

impl RequestCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests in flight.
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// True when nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// True when `identifier` is in flight.
    pub fn contains(&self, identifier: &RequestIdentifier) -> bool {
        self.entries.borrow().contains_key(identifier)
    }

    /// Shares `source` among every subscriber fetching `identifier`.
    ///
    /// The first subscriber starts `source`; later ones join the running
    /// execution.
    pub fn fetch(
        self: &Rc<Self>,
        identifier: RequestIdentifier,
        source: Observable<GraphQlResponse, RuntimeError>,
    ) -> Observable<GraphQlResponse, RuntimeError> {
        let cache = Rc::downgrade(self);
        Observable::create(move |sink| {
            let Some(cache) = cache.upgrade() else {
                sink.error(RuntimeError::Invariant("request cache dropped".into()));
                return Cleanup::None;
            };
            let subject = cache.join_or_start(identifier, &source);
            let next = sink.clone();
            let error = sink.clone();
            let forward = subject.observable().subscribe(
                Observer::new()
                    .on_next(move |response| next.next(response))
                    .on_error(move |e| error.error(e))
                    .on_complete(move || sink.complete()),
            );
            let cache = Rc::downgrade(&cache);
            Cleanup::from_fn(move || {
                forward.unsubscribe();
                if let Some(cache) = cache.upgrade() {
                    cache.release(identifier);
                }
            })
        })
    }

    fn join_or_start(
        self: &Rc<Self>,
        identifier: RequestIdentifier,
        source: &Observable<GraphQlResponse, RuntimeError>,
    ) -> ReplaySubject<GraphQlResponse, RuntimeError> {
        if let Some(entry) = self.entries.borrow().get(&identifier) {
            return entry.subject.clone();
        }
        let subject = ReplaySubject::new();
        self.entries.borrow_mut().insert(
            identifier,
            InFlight {
                subject: subject.clone(),
                upstream: None,
            },
        );
        let on_next = subject.clone();
        let on_error = (Rc::downgrade(self), subject.clone());
        let on_complete = (Rc::downgrade(self), subject.clone());
        let upstream = source.subscribe(
            Observer::new()
                .on_next(move |response| on_next.next(response))
                .on_error(move |error| {
                    forget(&on_error.0, identifier);
                    on_error.1.error(error);
                })
                .on_complete(move || {
                    forget(&on_complete.0, identifier);
                    on_complete.1.complete();
                }),
        );
        if !upstream.closed() {
            if let Some(entry) = self.entries.borrow_mut().get_mut(&identifier) {
                entry.upstream = Some(upstream);
            }
        }
        subject
    }

    /// Cancels the upstream once nobody listens any more.
    fn release(&self, identifier: RequestIdentifier) {
        let upstream = {
            let mut entries = self.entries.borrow_mut();
            match entries.get(&identifier) {
                Some(entry) if entry.subject.observer_count() == 0 => {
                    entries.remove(&identifier).and_then(|entry| entry.upstream)
                }
                _ => None,
            }
        };
        if let Some(upstream) = upstream {
            upstream.unsubscribe();
        }
    }
}

fn forget(cache: &Weak<RequestCache>, identifier: RequestIdentifier) {
    if let Some(cache) = cache.upgrade() {
        let removed = cache.entries.borrow_mut().remove(&identifier);
        drop(removed);
    }
}
