// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The environment: one store, one network, and everything that moves data
//! between them.
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use serde_json::{Map, Value};
use weft_observable::{Cleanup, Observable, Observer};

use crate::disposable::Disposable;
use crate::error::RuntimeError;
use crate::executor::{self, ExecuteKind, ExecutorContext};
use crate::handlers::HandlerProvider;
use crate::ident::ROOT_TYPE;
use crate::loader::OperationLoader;
use crate::log::LogFunction;
use crate::mutator::{SelectorStoreUpdater, StoreUpdater};
use crate::network::{FetchPolicy, GraphQlResponse, Network, RawPayload, Uploadables};
use crate::normalizer::{normalize_response, GetDataId, NormalizeOptions};
use crate::operation_tracker::OperationTracker;
use crate::publish_queue::{OptimisticUpdate, PublishQueue, UpdateHandle};
use crate::record_source::RecordSource;
use crate::request_cache::RequestCache;
use crate::selector::{OperationDescriptor, SingularReaderSelector};
use crate::snapshot::Snapshot;
use crate::store::{NotifyOutcome, OperationAvailability, Store};

/// Options for [`Environment::execute_mutation`].
#[derive(Clone, Default)]
pub struct MutationConfig {
    /// Response applied optimistically until the server answers.
    pub optimistic_response: Option<Map<String, Value>>,
    /// Updater applied together with the optimistic response.
    pub optimistic_updater: Option<SelectorStoreUpdater>,
    /// Updater applied to every server payload.
    pub updater: Option<SelectorStoreUpdater>,
    /// Files sent with the request.
    pub uploadables: Option<Uploadables>,
}

impl fmt::Debug for MutationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationConfig")
            .field("optimistic_response", &self.optimistic_response)
            .field("optimistic_updater", &self.optimistic_updater.is_some())
            .field("updater", &self.updater.is_some())
            .field("uploadables", &self.uploadables)
            .finish()
    }
}

/// Builder for [`Environment`].
pub struct EnvironmentBuilder {
    network: Rc<dyn Network>,
    store: Option<Store>,
    handler_provider: Option<Rc<dyn HandlerProvider>>,
    operation_loader: Option<Rc<dyn OperationLoader>>,
    get_data_id: Option<GetDataId>,
    log: Option<LogFunction>,
}

impl fmt::Debug for EnvironmentBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentBuilder")
            .field("store", &self.store.is_some())
            .field("handler_provider", &self.handler_provider.is_some())
            .field("operation_loader", &self.operation_loader.is_some())
            .finish_non_exhaustive()
    }
}

impl EnvironmentBuilder {
    /// Uses `store` instead of a fresh default store.
    pub fn store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    /// Handlers for `@__clientField`-style handle fields.
    pub fn handler_provider(mut self, provider: Rc<dyn HandlerProvider>) -> Self {
        self.handler_provider = Some(provider);
        self
    }

    /// Loader for `@module` split operations. Defaults to the store's.
    pub fn operation_loader(mut self, loader: Rc<dyn OperationLoader>) -> Self {
        self.operation_loader = Some(loader);
        self
    }

    /// Record id strategy. Defaults to the `id` field.
    pub fn get_data_id(mut self, get_data_id: GetDataId) -> Self {
        self.get_data_id = Some(get_data_id);
        self
    }

    /// Structured event sink. Defaults to the store's.
    pub fn log(mut self, log: LogFunction) -> Self {
        self.log = Some(log);
        self
    }

    /// Builds the environment.
    pub fn build(self) -> Environment {
        let store = self.store.unwrap_or_else(|| Store::new(RecordSource::new()));
        let defaults = NormalizeOptions::default();
        let normalize = NormalizeOptions {
            get_data_id: self.get_data_id.unwrap_or(defaults.get_data_id),
            treat_missing_fields_as_null: store.config().treat_missing_fields_as_null,
            path: Vec::new(),
        };
        let publish_queue = Rc::new(PublishQueue::new(store.clone(), self.handler_provider));
        let ctx = ExecutorContext {
            loader: self.operation_loader.or_else(|| store.operation_loader()),
            log: self.log.or_else(|| store.log_function().cloned()),
            store,
            network: self.network,
            publish_queue,
            tracker: Rc::new(OperationTracker::new()),
            normalize,
            next_execute_id: Cell::new(0),
        };
        Environment {
            ctx: Rc::new(ctx),
            request_cache: Rc::new(RequestCache::new()),
        }
    }
}

/// Entry point for executing operations against a store.
///
/// Cloning is cheap and shares everything.
#[derive(Clone)]
pub struct Environment {
    ctx: Rc<ExecutorContext>,
    request_cache: Rc<RequestCache>,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("store", &self.ctx.store)
            .field("request_cache", &self.request_cache)
            .finish_non_exhaustive()
    }
}

impl Environment {
    /// Starts a builder around `network`.
    pub fn builder(network: Rc<dyn Network>) -> EnvironmentBuilder {
        EnvironmentBuilder {
            network,
            store: None,
            handler_provider: None,
            operation_loader: None,
            get_data_id: None,
            log: None,
        }
    }

    /// The store.
    pub fn get_store(&self) -> &Store {
        &self.ctx.store
    }

    /// The network.
    pub fn get_network(&self) -> &Rc<dyn Network> {
        &self.ctx.network
    }

    /// Tracker of operations affecting other operations' data.
    pub fn get_operation_tracker(&self) -> &Rc<OperationTracker> {
        &self.ctx.tracker
    }

    /// True when the operation needs nothing from the server.
    pub fn is_empty(&self, operation: &OperationDescriptor) -> bool {
        executor::is_empty(operation)
    }

    /// Fetches a query and publishes its payloads.
    ///
    /// Store-first fetch policies complete without touching the network
    /// when the store already holds the data.
    pub fn execute(&self, operation: &OperationDescriptor) -> Observable<GraphQlResponse, RuntimeError> {
        if self.is_empty(operation) {
            return Observable::empty();
        }
        let network = executor::execute(&self.ctx, operation, ExecuteKind::Query);
        let policy = operation.request.cache_config.fetch_policy;
        if !policy.reads_store() {
            return network;
        }
        let store = self.ctx.store.clone();
        let operation = operation.clone();
        Observable::create(move |sink| {
            let fulfilled = match store.check(&operation) {
                Ok(availability) => matches!(availability, OperationAvailability::Available { .. }),
                Err(error) => {
                    sink.error(error);
                    return Cleanup::None;
                }
            };
            let skip_network = match policy {
                FetchPolicy::StoreOnly => true,
                FetchPolicy::StoreOrNetwork => fulfilled,
                FetchPolicy::StoreAndNetwork | FetchPolicy::NetworkOnly => false,
            };
            if skip_network {
                sink.complete();
                return Cleanup::None;
            }
            let next = sink.clone();
            let error = sink.clone();
            network
                .subscribe(
                    Observer::new()
                        .on_next(move |response| next.next(response))
                        .on_error(move |e| error.error(e))
                        .on_complete(move || sink.complete()),
                )
                .into()
        })
    }

    /// Like [`execute`](Self::execute), but concurrent calls for the same
    /// request share one network execution.
    pub fn fetch_query(&self, operation: &OperationDescriptor) -> Observable<GraphQlResponse, RuntimeError> {
        self.request_cache
            .fetch(operation.identifier(), self.execute(operation))
    }

    /// Number of deduplicated requests currently in flight.
    pub fn in_flight_requests(&self) -> usize {
        self.request_cache.len()
    }

    /// Runs a mutation with optional optimistic data.
    ///
    /// The optimistic update is rolled back when the first server payload
    /// is committed, on error, and on cancellation.
    pub fn execute_mutation(
        &self,
        operation: &OperationDescriptor,
        config: MutationConfig,
    ) -> Observable<GraphQlResponse, RuntimeError> {
        executor::execute(
            &self.ctx,
            operation,
            ExecuteKind::Mutation {
                optimistic_response: config.optimistic_response,
                optimistic_updater: config.optimistic_updater,
                updater: config.updater,
                uploadables: config.uploadables,
            },
        )
    }

    /// Starts a subscription; each event is published like a payload.
    pub fn execute_subscription(
        &self,
        operation: &OperationDescriptor,
        updater: Option<SelectorStoreUpdater>,
    ) -> Observable<GraphQlResponse, RuntimeError> {
        executor::execute(&self.ctx, operation, ExecuteKind::Subscription { updater })
    }

    /// Publishes a locally produced payload as if the server sent it.
    pub fn commit_payload(
        &self,
        operation: &OperationDescriptor,
        payload: &RawPayload,
    ) -> Result<NotifyOutcome, RuntimeError> {
        let result = normalize_response(payload, &operation.root, ROOT_TYPE, &self.ctx.normalize)?;
        self.ctx
            .publish_queue
            .commit_payload(operation.clone(), Rc::new(result), None);
        self.ctx.publish_queue.run(Some(operation))
    }

    /// Applies `updater` to the base source.
    pub fn commit_update(&self, updater: StoreUpdater) -> Result<NotifyOutcome, RuntimeError> {
        self.ctx.publish_queue.commit_update(updater);
        self.ctx.publish_queue.run(None)
    }

    /// Applies an optimistic update until reverted.
    pub fn apply_update(&self, updater: StoreUpdater) -> Result<UpdateHandle, RuntimeError> {
        let handle = self
            .ctx
            .publish_queue
            .apply_update(OptimisticUpdate::Updater(updater));
        self.ctx.publish_queue.run(None)?;
        Ok(handle)
    }

    /// Rolls back an optimistic update.
    pub fn revert_update(&self, handle: UpdateHandle) -> Result<NotifyOutcome, RuntimeError> {
        self.ctx.publish_queue.revert_update(handle);
        self.ctx.publish_queue.run(None)
    }

    /// Swaps an optimistic update for another in one notification.
    pub fn replace_update(
        &self,
        handle: UpdateHandle,
        updater: StoreUpdater,
    ) -> Result<UpdateHandle, RuntimeError> {
        self.ctx.publish_queue.revert_update(handle);
        let next = self
            .ctx
            .publish_queue
            .apply_update(OptimisticUpdate::Updater(updater));
        self.ctx.publish_queue.run(None)?;
        Ok(next)
    }

    /// Reads a selector.
    pub fn lookup(&self, selector: &SingularReaderSelector) -> Result<Snapshot, RuntimeError> {
        self.ctx.store.lookup(selector)
    }

    /// Calls `callback` whenever the snapshot's data changes.
    pub fn subscribe(&self, snapshot: &Snapshot, callback: impl Fn(&Snapshot) + 'static) -> Disposable {
        self.ctx.store.subscribe(snapshot, callback)
    }

    /// Keeps the operation's data from being collected.
    pub fn retain(&self, operation: &OperationDescriptor) -> Disposable {
        self.ctx.store.retain(operation)
    }

    /// Whether the store can fulfil the operation.
    pub fn check(&self, operation: &OperationDescriptor) -> Result<OperationAvailability, RuntimeError> {
        self.ctx.store.check(operation)
    }
}
