// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Structured runtime events for an optional log sink.
//!
//! Every event is also emitted through `tracing` at debug level; the sink
//! exists for callers that want the events as values.
use std::rc::Rc;

use tracing::debug;

use crate::ident::{DataId, RequestIdentifier};

/// Runtime event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// An execution started.
    ExecuteStart {
        /// Execution id.
        execute_id: u64,
        /// Operation name.
        name: String,
    },
    /// An execution processed a network response.
    ExecuteNext {
        /// Execution id.
        execute_id: u64,
    },
    /// An execution completed.
    ExecuteComplete {
        /// Execution id.
        execute_id: u64,
    },
    /// An execution failed.
    ExecuteError {
        /// Execution id.
        execute_id: u64,
        /// Rendered error.
        error: String,
    },
    /// An execution was cancelled.
    ExecuteUnsubscribe {
        /// Execution id.
        execute_id: u64,
    },
    /// A source was published.
    StorePublish {
        /// Number of records in the published source.
        records: usize,
        /// True when writes went to the optimistic overlay.
        optimistic: bool,
    },
    /// `notify` started.
    StoreNotifyStart {
        /// Operation whose write triggered it.
        source_operation: Option<RequestIdentifier>,
    },
    /// `notify` finished.
    StoreNotifyComplete {
        /// Updated record ids.
        updated_ids: Vec<DataId>,
        /// True when the store was invalidated.
        invalidated_store: bool,
    },
    /// A subscription callback ran.
    StoreNotifySubscription {
        /// Owner of the subscribed selector.
        owner: RequestIdentifier,
    },
    /// Garbage collection ran.
    StoreGc {
        /// Ids removed.
        references_removed: usize,
    },
    /// An optimistic checkpoint was restored.
    StoreRestore,
    /// An optimistic checkpoint was taken.
    StoreSnapshot,
}

/// Event sink.
pub type LogFunction = Rc<dyn Fn(&LogEvent)>;

/// Emits `event` to tracing and to `sink` when present.
pub(crate) fn emit(sink: Option<&LogFunction>, event: LogEvent) {
    debug!(?event, "runtime event");
    if let Some(sink) = sink {
        sink(&event);
    }
}
