// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Drives one operation: network payloads in, normalized deltas published.
//!
//! An executor lives for one subscription to the observable returned by
//! `execute`. Full payloads normalize against the operation root.
//! Incremental payloads are matched to the `@defer`/`@stream` placeholders
//! recorded by earlier payloads, keyed by label and response path, and are
//! buffered when they arrive first. `@module` payloads wait on the
//! operation loader. The observable completes once the network is done and
//! no deferred payload or module load is outstanding.
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::{Rc, Weak};

use serde_json::{Map, Value};
use tracing::{trace, warn};
use weft_observable::{Cleanup, Observable, Observer, Sink, Subscription};

use crate::ast::{
    response_key, NormalizationLinkedField, NormalizationSelection, NormalizationSplitOperation,
};
use crate::disposable::Disposable;
use crate::error::RuntimeError;
use crate::ident::{generate_client_id, DataId, ROOT_TYPE};
use crate::loader::OperationLoader;
use crate::log::{emit, LogEvent, LogFunction};
use crate::mutator::SelectorStoreUpdater;
use crate::network::{path_key, GraphQlResponse, Network, PathSegment, RawPayload, Uploadables};
use crate::normalizer::{
    linked_typename, normalize_response, normalize_selections, DeferPlaceholder,
    IncrementalPlaceholder, ModuleImportPayload, NormalizationResult, NormalizeOptions,
    StreamPlaceholder,
};
use crate::operation_tracker::OperationTracker;
use crate::publish_queue::{OptimisticUpdate, PublishQueue, UpdateHandle};
use crate::record::{FieldValue, Record};
use crate::record_source::{RecordSource, RecordSourceView};
use crate::selector::OperationDescriptor;
use crate::storage_key::get_storage_key;
use crate::store::Store;
use crate::variables::{condition_value, Variables};

/// How far past the end of a streamed list an item may land. Items arrive
/// out of order, but never this far ahead of the list they extend.
const MAX_STREAM_GAP: usize = 1024;

/// Collaborators shared by every execution of one environment.
pub(crate) struct ExecutorContext {
    pub(crate) store: Store,
    pub(crate) network: Rc<dyn Network>,
    pub(crate) publish_queue: Rc<PublishQueue>,
    pub(crate) tracker: Rc<OperationTracker>,
    pub(crate) loader: Option<Rc<dyn OperationLoader>>,
    pub(crate) normalize: NormalizeOptions,
    pub(crate) log: Option<LogFunction>,
    pub(crate) next_execute_id: Cell<u64>,
}

/// What kind of request an execution runs.
#[derive(Clone)]
pub(crate) enum ExecuteKind {
    Query,
    Mutation {
        optimistic_response: Option<Map<String, Value>>,
        optimistic_updater: Option<SelectorStoreUpdater>,
        updater: Option<SelectorStoreUpdater>,
        uploadables: Option<Uploadables>,
    },
    Subscription {
        updater: Option<SelectorStoreUpdater>,
    },
}

/// Observable that runs `operation` once per subscription.
pub(crate) fn execute(
    ctx: &Rc<ExecutorContext>,
    operation: &OperationDescriptor,
    kind: ExecuteKind,
) -> Observable<GraphQlResponse, RuntimeError> {
    let ctx = Rc::clone(ctx);
    let operation = operation.clone();
    Observable::create(move |sink| {
        let executor = Executor::start(Rc::clone(&ctx), operation.clone(), kind.clone(), sink);
        Cleanup::from_fn(move || executor.cancel())
    })
}

/// True when `operation` selects nothing the server would have to send.
pub fn is_empty(operation: &OperationDescriptor) -> bool {
    !selects_server_fields(operation.root.node.selections(), &operation.root.variables)
}

fn selects_server_fields(selections: &[NormalizationSelection], variables: &Variables) -> bool {
    selections.iter().any(|selection| match selection {
        NormalizationSelection::ScalarField(_)
        | NormalizationSelection::LinkedField(_)
        | NormalizationSelection::ScalarHandle(_)
        | NormalizationSelection::LinkedHandle(_)
        | NormalizationSelection::ModuleImport { .. } => true,
        NormalizationSelection::Condition {
            condition,
            passing_value,
            selections,
        } => {
            condition_value(variables, condition) == *passing_value
                && selects_server_fields(selections, variables)
        }
        NormalizationSelection::InlineFragment { selections, .. }
        | NormalizationSelection::Defer { selections, .. }
        | NormalizationSelection::Stream { selections, .. } => {
            selects_server_fields(selections, variables)
        }
        NormalizationSelection::ClientExtension { .. } => false,
    })
}

/// Path of the object holding a streamed list, for an item path ending in
/// `[field, index]`.
fn stream_parent_path(path: &[PathSegment]) -> Option<&[PathSegment]> {
    match path {
        [parent @ .., PathSegment::Key(_), PathSegment::Index(_)] => Some(parent),
        _ => None,
    }
}

type PlaceholderKey = (String, String);

/// Current link list of a streamed field as this execution has built it.
#[derive(Debug, Clone)]
struct StreamList {
    type_name: String,
    ids: Vec<Option<DataId>>,
}

#[derive(Default)]
struct ExecutorState {
    terminated: bool,
    network_done: bool,
    optimistic: Option<UpdateHandle>,
    retain: Option<Disposable>,
    placeholders: BTreeMap<PlaceholderKey, IncrementalPlaceholder>,
    resolved_defers: BTreeSet<PlaceholderKey>,
    buffered: BTreeMap<String, Vec<RawPayload>>,
    stream_lists: BTreeMap<(DataId, String), StreamList>,
    pending_modules: usize,
    module_subscriptions: Vec<Subscription>,
    network: Option<Subscription>,
}

struct Executor {
    this: Weak<Executor>,
    ctx: Rc<ExecutorContext>,
    operation: OperationDescriptor,
    sink: Sink<GraphQlResponse, RuntimeError>,
    execute_id: u64,
    updater: Option<SelectorStoreUpdater>,
    state: RefCell<ExecutorState>,
}

impl Executor {
    fn start(
        ctx: Rc<ExecutorContext>,
        operation: OperationDescriptor,
        kind: ExecuteKind,
        sink: Sink<GraphQlResponse, RuntimeError>,
    ) -> Rc<Self> {
        let execute_id = ctx.next_execute_id.get() + 1;
        ctx.next_execute_id.set(execute_id);
        emit(
            ctx.log.as_ref(),
            LogEvent::ExecuteStart {
                execute_id,
                name: operation.request.name().to_owned(),
            },
        );
        let retain = ctx.store.retain(&operation);
        let (updater, optimistic, uploadables, is_subscription) = match kind {
            ExecuteKind::Query => (None, None, None, false),
            ExecuteKind::Mutation {
                optimistic_response,
                optimistic_updater,
                updater,
                uploadables,
            } => (
                updater,
                Some((optimistic_response, optimistic_updater)),
                uploadables,
                false,
            ),
            ExecuteKind::Subscription { updater } => (updater, None, None, true),
        };
        let executor = Rc::new_cyclic(|this| Self {
            this: this.clone(),
            ctx,
            operation,
            sink,
            execute_id,
            updater,
            state: RefCell::new(ExecutorState {
                retain: Some(retain),
                ..ExecutorState::default()
            }),
        });

        if let Some((response, updater)) = optimistic {
            if let Err(error) = executor.apply_optimistic(response, updater) {
                executor.fail(error);
                return executor;
            }
        }

        let request = &executor.operation.request;
        let source = if is_subscription {
            executor
                .ctx
                .network
                .subscribe(&request.node.params, &request.variables, &request.cache_config)
        } else {
            executor.ctx.network.fetch(
                &request.node.params,
                &request.variables,
                &request.cache_config,
                uploadables.as_ref(),
            )
        };
        let on_next = executor.this.clone();
        let on_error = executor.this.clone();
        let on_complete = executor.this.clone();
        let subscription = source.subscribe(
            Observer::new()
                .on_next(move |response| {
                    if let Some(executor) = on_next.upgrade() {
                        executor.handle_next(&response);
                    }
                })
                .on_error(move |error| {
                    if let Some(executor) = on_error.upgrade() {
                        executor.fail(error);
                    }
                })
                .on_complete(move || {
                    if let Some(executor) = on_complete.upgrade() {
                        executor.handle_network_complete();
                    }
                }),
        );
        if !subscription.closed() {
            let mut state = executor.state.borrow_mut();
            if state.terminated {
                drop(state);
                subscription.unsubscribe();
            } else {
                state.network = Some(subscription);
            }
        }
        executor
    }

    fn is_terminated(&self) -> bool {
        self.state.borrow().terminated
    }

    fn apply_optimistic(
        &self,
        response: Option<Map<String, Value>>,
        updater: Option<SelectorStoreUpdater>,
    ) -> Result<(), RuntimeError> {
        if response.is_none() && updater.is_none() {
            return Ok(());
        }
        let payload = match response {
            Some(data) => normalize_response(
                &RawPayload::from_data(data),
                &self.operation.root,
                ROOT_TYPE,
                &self.ctx.normalize,
            )?,
            None => NormalizationResult::default(),
        };
        let handle = self.ctx.publish_queue.apply_update(OptimisticUpdate::Payload {
            operation: self.operation.clone(),
            payload: Rc::new(payload),
            updater,
        });
        self.state.borrow_mut().optimistic = Some(handle);
        self.flush(None)
    }

    /// Runs the publish queue and records which owners this operation
    /// touched.
    fn flush(&self, source: Option<&OperationDescriptor>) -> Result<(), RuntimeError> {
        let outcome = self.ctx.publish_queue.run(source)?;
        if !outcome.updated_owners.is_empty() && !self.is_terminated() {
            self.ctx
                .tracker
                .update(&self.operation.request, &outcome.updated_owners);
        }
        Ok(())
    }

    fn handle_next(&self, response: &GraphQlResponse) {
        if self.is_terminated() {
            return;
        }
        if let Err(error) = self.process_response(response) {
            self.fail(error);
            return;
        }
        emit(
            self.ctx.log.as_ref(),
            LogEvent::ExecuteNext {
                execute_id: self.execute_id,
            },
        );
        self.sink.next(response.clone());
        self.maybe_complete();
    }

    fn process_response(&self, response: &GraphQlResponse) -> Result<(), RuntimeError> {
        let payloads = response.payloads();
        for payload in payloads {
            if payload.data.is_some() {
                continue;
            }
            if let Some(errors) = payload.errors.as_ref().filter(|errors| !errors.is_empty()) {
                return Err(RuntimeError::GraphQl {
                    operation: self.operation.request.name().to_owned(),
                    messages: errors.iter().map(|error| error.message.clone()).collect(),
                });
            }
        }
        if let Some(handle) = self.state.borrow_mut().optimistic.take() {
            self.ctx.publish_queue.revert_update(handle);
        }
        for payload in payloads {
            if let Some(errors) = &payload.errors {
                for error in errors {
                    warn!(operation = %self.operation.request.name(), message = %error.message, "partial response carried an error");
                }
            }
            if payload.is_incremental() {
                self.process_incremental(payload)?;
            } else {
                let result = normalize_response(
                    payload,
                    &self.operation.root,
                    ROOT_TYPE,
                    &self.ctx.normalize,
                )?;
                self.commit(result)?;
            }
        }
        self.flush(Some(&self.operation))
    }

    /// Queues a normalized delta, then follows its placeholders and
    /// module imports.
    fn commit(&self, result: NormalizationResult) -> Result<(), RuntimeError> {
        let result = Rc::new(result);
        self.ctx.publish_queue.commit_payload(
            self.operation.clone(),
            Rc::clone(&result),
            self.updater.clone(),
        );
        for placeholder in &result.incremental_placeholders {
            self.register_placeholder(placeholder.clone(), &result.source)?;
        }
        for module in &result.module_import_payloads {
            self.process_module(module.clone())?;
        }
        Ok(())
    }

    fn register_placeholder(
        &self,
        placeholder: IncrementalPlaceholder,
        source: &RecordSource,
    ) -> Result<(), RuntimeError> {
        if let IncrementalPlaceholder::Stream(stream) = &placeholder {
            self.seed_stream_lists(stream, source)?;
        }
        let key = placeholder.key();
        trace!(label = %key.0, path = %key.1, "incremental placeholder registered");
        let matched = {
            let mut state = self.state.borrow_mut();
            state.placeholders.insert(key.clone(), placeholder);
            match state.buffered.remove(&key.0) {
                Some(buffered) => {
                    let (matched, rest): (Vec<RawPayload>, Vec<RawPayload>) =
                        buffered.into_iter().partition(|payload| {
                            payload.path.as_deref().is_some_and(|path| {
                                path_key(path) == key.1
                                    || stream_parent_path(path)
                                        .is_some_and(|parent| path_key(parent) == key.1)
                            })
                        });
                    if !rest.is_empty() {
                        state.buffered.insert(key.0.clone(), rest);
                    }
                    matched
                }
                None => Vec::new(),
            }
        };
        for payload in matched {
            self.process_incremental(&payload)?;
        }
        Ok(())
    }

    fn seed_stream_lists(&self, stream: &StreamPlaceholder, source: &RecordSource) -> Result<(), RuntimeError> {
        for selection in &stream.selections {
            let NormalizationSelection::LinkedField(field) = selection else {
                continue;
            };
            if !field.plural {
                continue;
            }
            let storage_key = get_storage_key(
                &field.name,
                &field.args,
                field.storage_key.as_deref(),
                &stream.variables,
            )?;
            let list = source.get(&stream.parent_id).map(|record| StreamList {
                type_name: record.typename().to_owned(),
                ids: record
                    .get(&storage_key)
                    .and_then(FieldValue::as_link_list)
                    .map(<[Option<DataId>]>::to_vec)
                    .unwrap_or_default(),
            });
            if let Some(list) = list {
                self.state
                    .borrow_mut()
                    .stream_lists
                    .insert((stream.parent_id.clone(), storage_key), list);
            }
        }
        Ok(())
    }

    fn process_incremental(&self, payload: &RawPayload) -> Result<(), RuntimeError> {
        let (Some(label), Some(path)) = (&payload.label, &payload.path) else {
            return Ok(());
        };
        let defer_key = (label.clone(), path_key(path));
        let stream_key = stream_parent_path(path).map(|parent| (label.clone(), path_key(parent)));
        let placeholder = {
            let state = self.state.borrow();
            state
                .placeholders
                .get(&defer_key)
                .filter(|p| matches!(p, IncrementalPlaceholder::Defer(_)))
                .or_else(|| {
                    stream_key
                        .as_ref()
                        .and_then(|key| state.placeholders.get(key))
                        .filter(|p| matches!(p, IncrementalPlaceholder::Stream(_)))
                })
                .cloned()
        };
        match placeholder {
            Some(IncrementalPlaceholder::Defer(defer)) => self.process_defer(&defer, defer_key, payload),
            Some(IncrementalPlaceholder::Stream(stream)) => self.process_stream(&stream, path, payload),
            None => {
                let mut state = self.state.borrow_mut();
                if state.resolved_defers.contains(&defer_key) {
                    warn!(label = %label, path = %defer_key.1, "duplicate deferred payload ignored");
                } else {
                    trace!(label = %label, path = %defer_key.1, "incremental payload buffered");
                    state
                        .buffered
                        .entry(label.clone())
                        .or_default()
                        .push(payload.clone());
                }
                Ok(())
            }
        }
    }

    fn process_defer(
        &self,
        defer: &DeferPlaceholder,
        key: PlaceholderKey,
        payload: &RawPayload,
    ) -> Result<(), RuntimeError> {
        {
            let mut state = self.state.borrow_mut();
            state.placeholders.remove(&key);
            state.resolved_defers.insert(key);
        }
        let empty = Map::new();
        let data = payload.data.as_ref().unwrap_or(&empty);
        let options = NormalizeOptions {
            path: defer.path.clone(),
            ..self.ctx.normalize.clone()
        };
        let mut result = normalize_selections(
            &defer.data_id,
            &defer.type_name,
            &defer.selections,
            data,
            &defer.variables,
            &options,
        )?;
        result.is_final = payload.is_final();
        self.commit(result)
    }

    fn streamed_field<'s>(
        stream: &'s StreamPlaceholder,
        field_key: &str,
    ) -> Option<&'s NormalizationLinkedField> {
        stream.selections.iter().find_map(|selection| match selection {
            NormalizationSelection::LinkedField(field)
                if field.plural && response_key(&field.name, field.alias.as_deref()) == field_key =>
            {
                Some(field)
            }
            _ => None,
        })
    }

    fn process_stream(
        &self,
        stream: &StreamPlaceholder,
        path: &[PathSegment],
        payload: &RawPayload,
    ) -> Result<(), RuntimeError> {
        let is_final = payload.is_final();
        let stream_key = stream_parent_path(path).map(|parent| (stream.label.clone(), path_key(parent)));
        if is_final {
            if let Some(key) = &stream_key {
                self.state.borrow_mut().placeholders.remove(key);
            }
        }
        let Some(data) = &payload.data else {
            return Ok(());
        };
        let (field_key, index) = match path {
            [.., PathSegment::Key(field_key), PathSegment::Index(index)] => (field_key.as_str(), *index),
            _ => {
                return Err(RuntimeError::InvalidPayload(format!(
                    "stream payload path `{}` does not end in a list index",
                    path_key(path)
                )))
            }
        };
        let field = Self::streamed_field(stream, field_key).ok_or_else(|| {
            RuntimeError::InvalidPayload(format!(
                "no streamed field `{field_key}` under label `{}`",
                stream.label
            ))
        })?;
        let storage_key = get_storage_key(
            &field.name,
            &field.args,
            field.storage_key.as_deref(),
            &stream.variables,
        )?;
        let client_id = generate_client_id(&stream.parent_id, &storage_key, Some(index));
        let type_name = linked_typename(field.concrete_type.as_deref(), data, client_id.as_str(), path)?;
        let item_id = (self.ctx.normalize.get_data_id)(data, &type_name).unwrap_or(client_id);
        let options = NormalizeOptions {
            path: path.to_vec(),
            ..self.ctx.normalize.clone()
        };
        let mut result = normalize_selections(
            &item_id,
            &type_name,
            &field.selections,
            data,
            &stream.variables,
            &options,
        )?;

        let parent = {
            let mut state = self.state.borrow_mut();
            let list = state
                .stream_lists
                .entry((stream.parent_id.clone(), storage_key.clone()))
                .or_insert_with(|| self.stored_list(&stream.parent_id, &storage_key));
            if index.saturating_sub(list.ids.len()) > MAX_STREAM_GAP {
                return Err(RuntimeError::InvalidPayload(format!(
                    "stream index {index} is too far past the {} items of `{storage_key}`",
                    list.ids.len()
                )));
            }
            if list.ids.len() <= index {
                list.ids.resize(index + 1, None);
            }
            list.ids[index] = Some(item_id);
            let mut parent = Record::new(stream.parent_id.clone(), &list.type_name);
            parent.set(storage_key, FieldValue::LinkList(list.ids.clone()));
            parent
        };
        result.source.set(parent);
        result.is_final = is_final;
        self.commit(result)
    }

    /// The streamed list as currently published.
    fn stored_list(&self, parent_id: &DataId, storage_key: &str) -> StreamList {
        self.ctx.store.with_source(|view| match view.get(parent_id) {
            Some(record) => StreamList {
                type_name: record.typename().to_owned(),
                ids: record
                    .get(storage_key)
                    .and_then(FieldValue::as_link_list)
                    .map(<[Option<DataId>]>::to_vec)
                    .unwrap_or_default(),
            },
            None => StreamList {
                type_name: String::new(),
                ids: Vec::new(),
            },
        })
    }

    fn process_module(&self, module: ModuleImportPayload) -> Result<(), RuntimeError> {
        let Some(loader) = self.ctx.loader.clone() else {
            return Err(RuntimeError::ModuleLoad {
                reference: module.operation_reference,
                reason: "no operation loader configured".into(),
            });
        };
        if let Some(operation) = loader.get(&module.operation_reference) {
            return self.normalize_module(&operation, &module);
        }
        self.state.borrow_mut().pending_modules += 1;
        let on_next = self.this.clone();
        let on_error = self.this.clone();
        let on_complete = self.this.clone();
        let subscription = loader.load(&module.operation_reference).subscribe(
            Observer::new()
                .on_next(move |operation: Option<Rc<NormalizationSplitOperation>>| {
                    if let (Some(executor), Some(operation)) = (on_next.upgrade(), operation) {
                        executor.handle_module_loaded(&operation, &module);
                    }
                })
                .on_error(move |error| {
                    if let Some(executor) = on_error.upgrade() {
                        executor.fail(error);
                    }
                })
                .on_complete(move || {
                    if let Some(executor) = on_complete.upgrade() {
                        {
                            let mut state = executor.state.borrow_mut();
                            state.pending_modules = state.pending_modules.saturating_sub(1);
                        }
                        executor.maybe_complete();
                    }
                }),
        );
        if !subscription.closed() {
            self.state.borrow_mut().module_subscriptions.push(subscription);
        }
        Ok(())
    }

    fn normalize_module(
        &self,
        operation: &NormalizationSplitOperation,
        module: &ModuleImportPayload,
    ) -> Result<(), RuntimeError> {
        let options = NormalizeOptions {
            path: module.path.clone(),
            ..self.ctx.normalize.clone()
        };
        let result = normalize_selections(
            &module.data_id,
            &module.type_name,
            &operation.selections,
            &module.data,
            &module.variables,
            &options,
        )?;
        self.commit(result)
    }

    fn handle_module_loaded(&self, operation: &NormalizationSplitOperation, module: &ModuleImportPayload) {
        if self.is_terminated() {
            return;
        }
        let outcome = self
            .normalize_module(operation, module)
            .and_then(|()| self.flush(Some(&self.operation)));
        if let Err(error) = outcome {
            self.fail(error);
        }
    }

    fn handle_network_complete(&self) {
        {
            let mut state = self.state.borrow_mut();
            state.network_done = true;
            state.network = None;
            state
                .placeholders
                .retain(|_, placeholder| matches!(placeholder, IncrementalPlaceholder::Defer(_)));
        }
        self.maybe_complete();
    }

    fn maybe_complete(&self) {
        let unmatched = {
            let state = self.state.borrow();
            let done = !state.terminated
                && state.network_done
                && state.pending_modules == 0
                && state.placeholders.is_empty();
            if !done {
                return;
            }
            state.buffered.values().map(Vec::len).sum::<usize>()
        };
        if unmatched > 0 {
            warn!(
                operation = %self.operation.request.name(),
                unmatched,
                "incremental payloads never matched a placeholder"
            );
        }
        self.finish();
        emit(
            self.ctx.log.as_ref(),
            LogEvent::ExecuteComplete {
                execute_id: self.execute_id,
            },
        );
        self.sink.complete();
    }

    fn fail(&self, error: RuntimeError) {
        if self.is_terminated() {
            return;
        }
        self.finish();
        emit(
            self.ctx.log.as_ref(),
            LogEvent::ExecuteError {
                execute_id: self.execute_id,
                error: error.to_string(),
            },
        );
        self.sink.error(error);
    }

    fn cancel(&self) {
        if self.is_terminated() {
            return;
        }
        self.finish();
        emit(
            self.ctx.log.as_ref(),
            LogEvent::ExecuteUnsubscribe {
                execute_id: self.execute_id,
            },
        );
    }

    /// Releases everything the execution holds. Published data stays.
    fn finish(&self) {
        let (optimistic, retain, modules, network) = {
            let mut state = self.state.borrow_mut();
            state.terminated = true;
            state.placeholders.clear();
            (
                state.optimistic.take(),
                state.retain.take(),
                std::mem::take(&mut state.module_subscriptions),
                state.network.take(),
            )
        };
        if let Some(handle) = optimistic {
            self.ctx.publish_queue.revert_update(handle);
            if let Err(error) = self.ctx.publish_queue.run(None) {
                warn!(%error, "failed to revert optimistic update");
            }
        }
        for subscription in modules {
            subscription.unsubscribe();
        }
        if let Some(subscription) = network {
            subscription.unsubscribe();
        }
        self.ctx.tracker.complete(&self.operation.request);
        if let Some(retain) = retain {
            retain.dispose();
        }
    }
}
