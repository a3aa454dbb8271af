// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! weft-observable: cold, cancellable push streams.
//!
//! An [`Observable`] models a deferred computation that may deliver zero or
//! more values followed by at most one terminal event. It is the transport
//! abstraction of the Weft runtime: a network request that answers with an
//! initial payload and later `@defer`/`@stream` chunks is one observable.
//!
//! The primitives are single-threaded (`Rc`-based) and never spawn work on
//! their own; asynchrony comes from whoever holds a [`Sink`] (a network
//! callback, a [`Timer`] task).
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod observable;
mod observer;
mod operators;
mod subject;
mod subscription;
mod timer;

/// The stream type and its constructors.
pub use observable::Observable;
/// Consumer callbacks and side-effect hooks.
pub use observer::{Observer, Tap};
/// Multicast subject replaying its history.
pub use subject::ReplaySubject;
/// Subscription handles and producer endpoints.
pub use subscription::{Cleanup, Sink, Subscription};
/// Timer port and the deterministic virtual-time implementation.
pub use timer::{ManualTimer, Timer, TimerHandle};
