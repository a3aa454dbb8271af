// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared test doubles and fixtures for Weft crates.
#![forbid(unsafe_code)]
//!
//! # Modules
//!
//! - [`artifacts`] - Builders for compiled artifacts and operation descriptors
//! - [`network`] - Scripted network whose responses are pushed by the test
//! - [`recorder`] - Recorders for snapshot callbacks, stream events and log events
//! - [`scheduler`] - Run-on-demand task scheduler and manual clock

pub mod artifacts;
pub mod network;
pub mod recorder;
pub mod scheduler;

// Re-export commonly used items at crate root for convenience
pub use artifacts::{
    defer, fragment, fragment_spread, linked, literal, local_argument, operation, plural, query,
    reader_linked, reader_plural, reader_scalar, scalar, stream, variable, RequestBuilder,
};
pub use network::{RecordedRequest, ScriptedNetwork};
pub use recorder::{LogRecorder, Recorded, SnapshotRecorder, StreamRecorder};
pub use scheduler::{ManualClock, QueueScheduler};
