// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! weft-runtime: normalized GraphQL object-graph cache.
//!
//! Responses are flattened into a [`RecordSource`] of records keyed by
//! [`DataId`], so every view reading the same entity sees the same data.
//! The [`Store`] publishes deltas, notifies subscribed snapshots whose
//! records changed, answers availability checks, and garbage-collects
//! records no retained operation can reach. The [`Environment`] drives
//! operations through an injected [`Network`], merging `@defer`/`@stream`
//! chunks and `@module` imports as they arrive.
//!
//! Everything is single-threaded; all mutation happens inside
//! [`Store::publish`], which is never re-entrant.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod ast;
mod config;
mod data;
mod data_checker;
mod disposable;
mod environment;
mod error;
mod executor;
mod handlers;
mod ident;
mod loader;
mod log;
mod mutator;
mod network;
mod normalizer;
mod operation_tracker;
mod publish_queue;
mod reader;
mod record;
mod record_source;
mod reference_marker;
mod request_cache;
mod scheduler;
mod selector;
mod snapshot;
mod storage_key;
mod store;
mod variables;

/// Compiled artifacts consumed by the runtime.
pub use ast::{
    module_component_key, module_operation_key, response_key, Argument, ArgumentDefinition,
    ConcreteRequest, NormalizationHandle, NormalizationLinkedField, NormalizationOperation,
    NormalizationScalarField, NormalizationSelection, NormalizationSplitOperation, OperationKind,
    ReaderFragment, ReaderFragmentMetadata, ReaderLinkedField, ReaderScalarField, ReaderSelection,
    RequestParameters, RequiredFieldAction,
};
/// Runtime tuning and the key/value config port.
pub use config::RuntimeConfig;
/// Denormalized read results.
pub use data::{recycle_nodes_into, recycle_optional, Data, DataObject, FragmentRef, ModuleRef};
/// Availability check of a normalization selector.
pub use data_checker::{check as check_data, Availability, CheckOutcome, MissingFieldHandler};
/// Release handles.
pub use disposable::Disposable;
/// Environment facade.
pub use environment::{Environment, EnvironmentBuilder, MutationConfig};
/// Runtime error type.
pub use error::RuntimeError;
/// Selection-emptiness test used to skip network requests.
pub use executor::is_empty;
/// Handle field post-processing.
pub use handlers::{
    apply_field_payloads, CopyFieldHandler, HandleFieldPayload, Handler, HandlerProvider,
    HandlerRegistry,
};
/// Identifiers and hashing.
pub use ident::{
    canonical_json, generate_client_id, generate_unique_client_id, make_request_identifier,
    DataId, Hash, RequestIdentifier, CLIENT_ID_PREFIX, ROOT_ID, ROOT_TYPE,
};
/// `@module` operation loading.
pub use loader::{OperationLoader, StaticOperationLoader};
/// Structured runtime events.
pub use log::{LogEvent, LogFunction};
/// Mutation proxies for updaters and handlers.
pub use mutator::{
    MutationOutput, RecordProxy, RecordSourceProxy, SelectorStoreUpdater, StoreUpdater,
};
/// Network port and payload shapes.
pub use network::{
    path_key, CacheConfig, FetchFunction, FetchPolicy, GraphQlResponse, Network, NetworkLayer,
    PathSegment, PayloadError, RawPayload, SubscribeFunction, Uploadables,
};
/// Response normalization.
pub use normalizer::{
    default_get_data_id, normalize_response, normalize_selections, DeferPlaceholder, GetDataId,
    IncrementalPlaceholder, ModuleImportPayload, NormalizationResult, NormalizeOptions,
    StreamPlaceholder,
};
/// Pending operation tracking.
pub use operation_tracker::{OperationTracker, PendingOperations};
/// Ordered publishing of server, client and optimistic writes.
pub use publish_queue::{OptimisticUpdate, PublishQueue, UpdateHandle};
/// Reader.
pub use reader::read;
/// Records and field values.
pub use record::{FieldValue, Record};
/// Record sources.
pub use record_source::{OverlaySource, RecordEntry, RecordSource, RecordSourceView, RecordState};
/// GC mark phase.
pub use reference_marker::mark as mark_references;
/// In-flight request deduplication.
pub use request_cache::RequestCache;
/// Scheduling and time ports.
pub use scheduler::{Clock, ImmediateScheduler, SystemClock, TaskHandle, TaskScheduler};
/// Selectors and operation descriptors.
pub use selector::{
    create_operation_descriptor, create_operation_descriptor_at, get_plural_selector,
    get_selector, get_singular_selector, NormalizationRoot, NormalizationSelector,
    OperationDescriptor, PluralReaderSelector, ReaderSelector, RequestDescriptor,
    SingularReaderSelector,
};
/// Read results.
pub use snapshot::{read_required, MissingRequiredField, MissingRequiredFields, Snapshot};
/// Storage keys.
pub use storage_key::{format_storage_key, get_handle_key, get_handle_storage_key, get_storage_key};
/// The store.
pub use store::{
    InvalidationState, NotifyOutcome, OperationAvailability, SnapshotCallback, Store, StoreBuilder,
};
/// Variables.
pub use variables::{
    condition_value, get_argument_value, get_argument_values, get_fragment_variables,
    get_operation_variables, Variables,
};
