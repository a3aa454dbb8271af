// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The normalized store.
//!
//! `publish` merges record deltas and never notifies; `notify` fans the
//! accumulated changes out to subscriptions. Subscription callbacks run after
//! every internal borrow is released, so a callback may look up, subscribe,
//! dispose or even publish again.
//!
//! Garbage collection is reference counted per root operation with a FIFO
//! release buffer in front of the sweep. Sweeps are scheduled through the
//! injected [`TaskScheduler`] and never run inside `publish` or `notify`.
mod gc;
mod lookup_cache;
mod release_buffer;
mod subscriptions;

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::{Rc, Weak};

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::ast::OperationKind;
use crate::config::RuntimeConfig;
use crate::data_checker::{check as check_data, Availability, MissingFieldHandler};
use crate::disposable::Disposable;
use crate::error::RuntimeError;
use crate::ident::{DataId, RequestIdentifier};
use crate::loader::OperationLoader;
use crate::log::{emit, LogEvent, LogFunction};
use crate::reader::read;
use crate::record::Record;
use crate::record_source::{OverlaySource, RecordEntry, RecordSource, RecordSourceView};
use crate::scheduler::{Clock, ImmediateScheduler, SystemClock, TaskHandle, TaskScheduler};
use crate::selector::{OperationDescriptor, RequestDescriptor, SingularReaderSelector};
use crate::snapshot::Snapshot;

use gc::{is_expired, mark_roots, sweep, RootEntry, Roots};
use lookup_cache::LookupCache;
use release_buffer::ReleaseBuffer;
use subscriptions::SubscriptionRegistry;
pub use subscriptions::SnapshotCallback;

/// Result of [`Store::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationAvailability {
    /// Everything is present and fresh.
    Available {
        /// When the operation's data was last written, if known.
        fetch_time: Option<u64>,
    },
    /// Some selected data is absent.
    Missing,
    /// Data is present but invalidated or expired.
    Stale,
}

/// What a [`Store::notify`] pass changed.
#[derive(Debug, Clone, Default)]
pub struct NotifyOutcome {
    /// Ids written since the previous notify.
    pub updated_ids: BTreeSet<DataId>,
    /// Owners of subscriptions whose data changed, deduplicated.
    pub updated_owners: Vec<Rc<RequestDescriptor>>,
}

/// Invalidation epochs observed for a set of records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationState {
    /// Records being watched.
    pub data_ids: Vec<DataId>,
    /// Invalidation epoch per record.
    pub invalidations: BTreeMap<DataId, Option<u64>>,
    /// Global invalidation epoch.
    pub global: Option<u64>,
}

struct InvalidationSubscription {
    data_ids: Vec<DataId>,
    callback: Rc<dyn Fn()>,
}

#[derive(Debug, Clone, Copy)]
struct GcRun {
    epoch: u64,
    handle: Option<TaskHandle>,
}

struct StoreState {
    source: RecordSource,
    optimistic: Option<RecordSource>,
    updated_ids: BTreeSet<DataId>,
    invalidated_ids: BTreeSet<DataId>,
    current_write_epoch: u64,
    global_invalidation_epoch: Option<u64>,
    roots: Roots,
    release_buffer: ReleaseBuffer,
    subscriptions: SubscriptionRegistry,
    invalidation_subscriptions: FxHashMap<u64, InvalidationSubscription>,
    next_invalidation_id: u64,
    gc_hold_count: usize,
    gc_run: Option<GcRun>,
    should_schedule_gc: bool,
}

impl StoreState {
    fn with_view<R>(&self, f: impl FnOnce(&dyn RecordSourceView) -> R) -> R {
        match &self.optimistic {
            Some(overlay) => f(&OverlaySource::new(&self.source, overlay)),
            None => f(&self.source),
        }
    }

    fn visible_entry(&self, id: &DataId) -> Option<RecordEntry> {
        self.optimistic
            .as_ref()
            .and_then(|overlay| overlay.entry(id))
            .or_else(|| self.source.entry(id))
            .cloned()
    }

    fn target_mut(&mut self) -> &mut RecordSource {
        match &mut self.optimistic {
            Some(overlay) => overlay,
            None => &mut self.source,
        }
    }

    /// Merges `delta` into the visible source. Returns the ids that changed.
    fn merge(
        &mut self,
        delta: &RecordSource,
        invalidated: Option<&BTreeSet<DataId>>,
    ) -> BTreeSet<DataId> {
        let epoch = self.current_write_epoch + 1;
        let marked = |id: &DataId| invalidated.is_some_and(|ids| ids.contains(id));
        let mut written = BTreeSet::new();
        for (id, entry) in delta.iter() {
            let current = self.visible_entry(id);
            let next = match entry {
                RecordEntry::Existent(incoming) => {
                    let mut next = match &current {
                        Some(RecordEntry::Existent(existing)) => {
                            if !marked(id) && existing.is_superset_of(incoming) {
                                continue;
                            }
                            existing.update(incoming)
                        }
                        _ => Record::clone(incoming),
                    };
                    if marked(id) {
                        next.set_invalidated_at(epoch);
                        self.invalidated_ids.insert(id.clone());
                    }
                    RecordEntry::Existent(Rc::new(next))
                }
                RecordEntry::Nonexistent => {
                    if matches!(current, Some(RecordEntry::Nonexistent)) {
                        continue;
                    }
                    RecordEntry::Nonexistent
                }
            };
            self.target_mut().insert_entry(id.clone(), next);
            written.insert(id.clone());
        }
        for id in invalidated.into_iter().flatten() {
            if delta.has(id) {
                continue;
            }
            if let Some(RecordEntry::Existent(existing)) = self.visible_entry(id) {
                let mut next = Record::clone(&existing);
                next.set_invalidated_at(epoch);
                self.target_mut().set(next);
                self.invalidated_ids.insert(id.clone());
                written.insert(id.clone());
            }
        }
        written
    }
}

struct StoreInner {
    state: RefCell<StoreState>,
    lookup_cache: RefCell<LookupCache>,
    config: RuntimeConfig,
    scheduler: Rc<dyn TaskScheduler>,
    clock: Rc<dyn Clock>,
    loader: Option<Rc<dyn OperationLoader>>,
    handlers: Vec<Rc<dyn MissingFieldHandler>>,
    log: Option<LogFunction>,
}

/// Builder for [`Store`].
pub struct StoreBuilder {
    source: RecordSource,
    config: RuntimeConfig,
    scheduler: Rc<dyn TaskScheduler>,
    clock: Rc<dyn Clock>,
    loader: Option<Rc<dyn OperationLoader>>,
    handlers: Vec<Rc<dyn MissingFieldHandler>>,
    log: Option<LogFunction>,
}

impl fmt::Debug for StoreBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreBuilder")
            .field("records", &self.source.size())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StoreBuilder {
    /// Sets the tuning parameters.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the scheduler used for GC sweeps.
    pub fn scheduler(mut self, scheduler: Rc<dyn TaskScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Sets the clock used for query expiration.
    pub fn clock(mut self, clock: Rc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the loader used to walk `@module` data.
    pub fn operation_loader(mut self, loader: Rc<dyn OperationLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Sets the handlers `check` consults for absent fields.
    pub fn missing_field_handlers(mut self, handlers: Vec<Rc<dyn MissingFieldHandler>>) -> Self {
        self.handlers = handlers;
        self
    }

    /// Sets the structured event sink.
    pub fn log(mut self, log: LogFunction) -> Self {
        self.log = Some(log);
        self
    }

    /// Builds the store.
    pub fn build(self) -> Store {
        Store {
            inner: Rc::new(StoreInner {
                state: RefCell::new(StoreState {
                    source: self.source,
                    optimistic: None,
                    updated_ids: BTreeSet::new(),
                    invalidated_ids: BTreeSet::new(),
                    current_write_epoch: 0,
                    global_invalidation_epoch: None,
                    roots: Roots::new(),
                    release_buffer: ReleaseBuffer::new(self.config.gc_release_buffer_size),
                    subscriptions: SubscriptionRegistry::default(),
                    invalidation_subscriptions: FxHashMap::default(),
                    next_invalidation_id: 0,
                    gc_hold_count: 0,
                    gc_run: None,
                    should_schedule_gc: false,
                }),
                lookup_cache: RefCell::new(LookupCache::new(self.config.lookup_cache_capacity)),
                config: self.config,
                scheduler: self.scheduler,
                clock: self.clock,
                loader: self.loader,
                handlers: self.handlers,
                log: self.log,
            }),
        }
    }
}

/// Shared handle to a normalized store.
#[derive(Clone)]
pub struct Store {
    inner: Rc<StoreInner>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.try_borrow();
        let mut out = f.debug_struct("Store");
        if let Ok(state) = state {
            out.field("records", &state.source.size())
                .field("roots", &state.roots.len())
                .field("subscriptions", &state.subscriptions.len())
                .field("epoch", &state.current_write_epoch);
        }
        out.finish_non_exhaustive()
    }
}

impl Store {
    /// Store over `source` with default collaborators.
    pub fn new(source: RecordSource) -> Self {
        Self::builder(source).build()
    }

    /// Builder over `source`.
    pub fn builder(source: RecordSource) -> StoreBuilder {
        StoreBuilder {
            source,
            config: RuntimeConfig::default(),
            scheduler: Rc::new(ImmediateScheduler),
            clock: Rc::new(SystemClock),
            loader: None,
            handlers: Vec::new(),
            log: None,
        }
    }

    fn from_weak(weak: &Weak<StoreInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn state_mut(&self) -> Result<std::cell::RefMut<'_, StoreState>, RuntimeError> {
        self.inner
            .state
            .try_borrow_mut()
            .map_err(|_| RuntimeError::ReentrantPublish)
    }

    /// Tuning in effect.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub(crate) fn operation_loader(&self) -> Option<Rc<dyn OperationLoader>> {
        self.inner.loader.clone()
    }

    pub(crate) fn log_function(&self) -> Option<&LogFunction> {
        self.inner.log.as_ref()
    }

    /// Reads `selector` against the visible source.
    ///
    /// Repeated lookups return pointer-identical data until a publish
    /// touches one of the snapshot's seen records.
    pub fn lookup(&self, selector: &SingularReaderSelector) -> Result<Snapshot, RuntimeError> {
        let key = selector.identity();
        if let Some(hit) = self.inner.lookup_cache.borrow().get(&key) {
            return Ok(hit);
        }
        let snapshot = {
            let state = self.inner.state.borrow();
            state.with_view(|view| read(view, selector))?
        };
        self.inner
            .lookup_cache
            .borrow_mut()
            .insert(key, snapshot.clone());
        Ok(snapshot)
    }

    /// Merges `source` into the visible records, marking
    /// `invalidated_ids` stale. Does not notify.
    pub fn publish(
        &self,
        source: &RecordSource,
        invalidated_ids: Option<&BTreeSet<DataId>>,
    ) -> Result<(), RuntimeError> {
        let (written, optimistic) = {
            let mut state = self.state_mut()?;
            let written = state.merge(source, invalidated_ids);
            state.updated_ids.extend(written.iter().cloned());
            (written, state.optimistic.is_some())
        };
        self.inner.lookup_cache.borrow_mut().evict_touching(&written);
        emit(
            self.log_function(),
            LogEvent::StorePublish {
                records: source.size(),
                optimistic,
            },
        );
        Ok(())
    }

    /// Fans out changes accumulated since the last notify.
    ///
    /// Each affected subscription fires at most once with its merged data.
    /// When `source_operation` is given its root is stamped with the new
    /// epoch, or parked in the release buffer if nobody retains it.
    pub fn notify(
        &self,
        source_operation: Option<&OperationDescriptor>,
        invalidate_store: bool,
    ) -> Result<NotifyOutcome, RuntimeError> {
        emit(
            self.log_function(),
            LogEvent::StoreNotifyStart {
                source_operation: source_operation.map(OperationDescriptor::identifier),
            },
        );
        let now = self.inner.clock.now_ms();
        let (pending, invalidation_callbacks, outcome) = {
            let mut guard = self.state_mut()?;
            let state = &mut *guard;
            state.current_write_epoch += 1;
            let epoch = state.current_write_epoch;
            if invalidate_store {
                state.global_invalidation_epoch = Some(epoch);
            }
            let updated_ids = std::mem::take(&mut state.updated_ids);
            let invalidated_ids = std::mem::take(&mut state.invalidated_ids);
            let pending = {
                let StoreState {
                    source,
                    optimistic,
                    subscriptions,
                    ..
                } = &mut *state;
                match optimistic {
                    Some(overlay) => {
                        subscriptions.update(&OverlaySource::new(source, overlay), &updated_ids)
                    }
                    None => subscriptions.update(source, &updated_ids),
                }
            };
            let mut invalidation_ids: Vec<&u64> = state.invalidation_subscriptions.keys().collect();
            invalidation_ids.sort_unstable();
            let invalidation_callbacks: Vec<(u64, Rc<dyn Fn()>)> = invalidation_ids
                .into_iter()
                .filter_map(|id| {
                    let subscription = state.invalidation_subscriptions.get(id)?;
                    (invalidate_store
                        || subscription
                            .data_ids
                            .iter()
                            .any(|data_id| invalidated_ids.contains(data_id)))
                    .then(|| (*id, Rc::clone(&subscription.callback)))
                })
                .collect();
            if let Some(operation) = source_operation {
                let id = operation.identifier();
                if let Some(root) = state.roots.get_mut(&id) {
                    root.epoch = Some(epoch);
                    root.fetch_time = Some(now);
                } else if operation.request.operation_kind() == OperationKind::Query
                    && state.release_buffer.capacity() > 0
                    && state.release_buffer.has_room()
                {
                    // Keep an unretained query's data around briefly.
                    state.release_buffer.push(id);
                    state.roots.insert(
                        id,
                        RootEntry {
                            operation: operation.clone(),
                            ref_count: 0,
                            epoch: Some(epoch),
                            fetch_time: Some(now),
                        },
                    );
                }
            }
            let mut updated_owners: Vec<Rc<RequestDescriptor>> = Vec::new();
            for callback in &pending {
                let owner = &callback.snapshot.selector.owner;
                if !updated_owners
                    .iter()
                    .any(|seen| seen.identifier == owner.identifier)
                {
                    updated_owners.push(Rc::clone(owner));
                }
            }
            (
                pending,
                invalidation_callbacks,
                NotifyOutcome {
                    updated_ids,
                    updated_owners,
                },
            )
        };
        for pending in pending {
            if !self.inner.state.borrow().subscriptions.contains(pending.id) {
                continue;
            }
            emit(
                self.log_function(),
                LogEvent::StoreNotifySubscription {
                    owner: pending.snapshot.selector.owner.identifier,
                },
            );
            (pending.callback)(&pending.snapshot);
        }
        for (id, callback) in invalidation_callbacks {
            if !self
                .inner
                .state
                .borrow()
                .invalidation_subscriptions
                .contains_key(&id)
            {
                continue;
            }
            callback();
        }
        emit(
            self.log_function(),
            LogEvent::StoreNotifyComplete {
                updated_ids: outcome.updated_ids.iter().cloned().collect(),
                invalidated_store: invalidate_store,
            },
        );
        Ok(outcome)
    }

    /// Registers `callback` for changes to `snapshot`'s data.
    pub fn subscribe(
        &self,
        snapshot: &Snapshot,
        callback: impl Fn(&Snapshot) + 'static,
    ) -> Disposable {
        let id = self
            .inner
            .state
            .borrow_mut()
            .subscriptions
            .insert(snapshot.clone(), Rc::new(callback));
        let weak = Rc::downgrade(&self.inner);
        Disposable::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.state.borrow_mut().subscriptions.remove(id);
            }
        })
    }

    /// Availability of `operation`'s data.
    ///
    /// Values synthesized by missing field handlers are written back to the
    /// store without notifying.
    pub fn check(&self, operation: &OperationDescriptor) -> Result<OperationAvailability, RuntimeError> {
        let (outcome, root_epoch, fetch_time, global) = {
            let state = self.inner.state.borrow();
            let root = state.roots.get(&operation.identifier());
            let loader = self.inner.loader.as_deref();
            let outcome = state.with_view(|view| {
                check_data(view, &operation.root, &self.inner.handlers, loader)
            })?;
            (
                outcome,
                root.and_then(|root| root.epoch),
                root.and_then(|root| root.fetch_time),
                state.global_invalidation_epoch,
            )
        };
        if !outcome.sink.is_empty() {
            let written = self.state_mut()?.merge(&outcome.sink, None);
            self.inner.lookup_cache.borrow_mut().evict_touching(&written);
        }
        if let Some(global) = global {
            if root_epoch.is_none_or(|written| written <= global) {
                return Ok(OperationAvailability::Stale);
            }
        }
        if let Some(invalidated) = outcome.most_recent_invalidation {
            if root_epoch.is_none_or(|written| invalidated > written) {
                return Ok(OperationAvailability::Stale);
            }
        }
        if outcome.status == Availability::Missing {
            return Ok(OperationAvailability::Missing);
        }
        if is_expired(
            fetch_time,
            self.inner.clock.now_ms(),
            self.inner.config.query_cache_expiration_ms,
        ) {
            return Ok(OperationAvailability::Stale);
        }
        Ok(OperationAvailability::Available { fetch_time })
    }

    /// Pins `operation`'s reachable records against collection.
    pub fn retain(&self, operation: &OperationDescriptor) -> Disposable {
        let id = operation.identifier();
        {
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;
            match state.roots.get_mut(&id) {
                Some(root) => {
                    if root.ref_count == 0 {
                        state.release_buffer.remove(&id);
                    }
                    root.ref_count += 1;
                }
                None => {
                    state.roots.insert(
                        id,
                        RootEntry {
                            operation: operation.clone(),
                            ref_count: 1,
                            epoch: None,
                            fetch_time: None,
                        },
                    );
                }
            }
        }
        let weak = Rc::downgrade(&self.inner);
        Disposable::new(move || {
            if let Some(store) = Self::from_weak(&weak) {
                store.release(id);
            }
        })
    }

    fn release(&self, id: RequestIdentifier) {
        let now = self.inner.clock.now_ms();
        let schedule = {
            let mut state = self.inner.state.borrow_mut();
            let (ref_count, fetch_time) = match state.roots.get_mut(&id) {
                Some(root) => {
                    root.ref_count = root.ref_count.saturating_sub(1);
                    (root.ref_count, root.fetch_time)
                }
                None => return,
            };
            if ref_count > 0 {
                return;
            }
            if is_expired(fetch_time, now, self.inner.config.query_cache_expiration_ms) {
                state.roots.remove(&id);
                true
            } else {
                let evicted = state.release_buffer.push(id);
                for evicted in &evicted {
                    state.roots.remove(evicted);
                }
                !evicted.is_empty()
            }
        };
        if schedule {
            self.schedule_gc();
        }
    }

    /// Defers collection while the returned handle is live.
    pub fn hold_gc(&self) -> Disposable {
        let cancelled = {
            let mut state = self.inner.state.borrow_mut();
            state.gc_hold_count += 1;
            let run = state.gc_run.take();
            if run.is_some() {
                state.should_schedule_gc = true;
            }
            run.and_then(|run| run.handle)
        };
        if let Some(handle) = cancelled {
            self.inner.scheduler.cancel(handle);
        }
        let weak = Rc::downgrade(&self.inner);
        Disposable::new(move || {
            let Some(store) = Self::from_weak(&weak) else {
                return;
            };
            let schedule = {
                let mut state = store.inner.state.borrow_mut();
                state.gc_hold_count = state.gc_hold_count.saturating_sub(1);
                state.gc_hold_count == 0 && std::mem::take(&mut state.should_schedule_gc)
            };
            if schedule {
                store.schedule_gc();
            }
        })
    }

    /// Schedules a sweep through the task scheduler.
    ///
    /// Deferred while a hold or an optimistic snapshot is active; a no-op
    /// when a sweep is already pending.
    pub fn schedule_gc(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.gc_hold_count > 0 || state.optimistic.is_some() {
                state.should_schedule_gc = true;
                return;
            }
            if state.gc_run.is_some() {
                return;
            }
            state.gc_run = Some(GcRun {
                epoch: state.current_write_epoch,
                handle: None,
            });
        }
        let weak = Rc::downgrade(&self.inner);
        let handle = self.inner.scheduler.schedule(Box::new(move || {
            if let Some(store) = Self::from_weak(&weak) {
                store.run_scheduled_gc();
            }
        }));
        if let Some(run) = self.inner.state.borrow_mut().gc_run.as_mut() {
            run.handle.get_or_insert(handle);
        }
    }

    fn run_scheduled_gc(&self) {
        let written_since = {
            let mut state = self.inner.state.borrow_mut();
            let Some(run) = state.gc_run.take() else {
                return;
            };
            if state.gc_hold_count > 0 || state.optimistic.is_some() {
                state.should_schedule_gc = true;
                return;
            }
            run.epoch != state.current_write_epoch
        };
        if written_since {
            debug!("store written since the sweep was scheduled; rescheduling");
            self.schedule_gc();
            return;
        }
        self.collect();
    }

    /// Sweeps now: removes every record unreachable from a live root.
    /// Returns the number of records removed. Skipped while an optimistic
    /// snapshot is active.
    pub fn collect(&self) -> usize {
        let removed = {
            let mut state = self.inner.state.borrow_mut();
            if state.optimistic.is_some() {
                state.should_schedule_gc = true;
                return 0;
            }
            let now = self.inner.clock.now_ms();
            let loader = self.inner.loader.as_deref();
            let StoreState {
                source,
                roots,
                release_buffer,
                ..
            } = &mut *state;
            let references = mark_roots(
                source,
                roots,
                now,
                self.inner.config.query_cache_expiration_ms,
                loader,
            );
            release_buffer.retain(|id| roots.contains_key(id));
            sweep(source, &references)
        };
        if removed > 0 {
            self.inner.lookup_cache.borrow_mut().clear();
        }
        emit(
            self.log_function(),
            LogEvent::StoreGc {
                references_removed: removed,
            },
        );
        removed
    }

    /// Starts an optimistic overlay: later publishes land in it until
    /// [`Store::restore`] discards them.
    pub fn snapshot(&self) -> Result<(), RuntimeError> {
        let cancelled = {
            let mut state = self.state_mut()?;
            if state.optimistic.is_some() {
                return Err(RuntimeError::Invariant(
                    "snapshot() called while a snapshot exists".into(),
                ));
            }
            let StoreState {
                source,
                subscriptions,
                ..
            } = &mut *state;
            subscriptions.snapshot_all(source);
            let run = state.gc_run.take();
            if run.is_some() {
                state.should_schedule_gc = true;
            }
            state.optimistic = Some(RecordSource::new());
            run.and_then(|run| run.handle)
        };
        if let Some(handle) = cancelled {
            self.inner.scheduler.cancel(handle);
        }
        self.inner.lookup_cache.borrow_mut().clear();
        emit(self.log_function(), LogEvent::StoreSnapshot);
        Ok(())
    }

    /// Discards the optimistic overlay. Subscriptions whose data differs
    /// from their pre-snapshot state are re-read on the next notify.
    pub fn restore(&self) -> Result<(), RuntimeError> {
        let schedule = {
            let mut state = self.state_mut()?;
            if state.optimistic.take().is_none() {
                return Err(RuntimeError::Invariant(
                    "restore() called without a snapshot".into(),
                ));
            }
            state.subscriptions.restore();
            std::mem::take(&mut state.should_schedule_gc)
        };
        self.inner.lookup_cache.borrow_mut().clear();
        emit(self.log_function(), LogEvent::StoreRestore);
        if schedule {
            self.schedule_gc();
        }
        Ok(())
    }

    /// True while an optimistic overlay is active.
    pub fn is_optimistic(&self) -> bool {
        self.inner.state.borrow().optimistic.is_some()
    }

    /// Invalidation epochs for `data_ids`.
    pub fn lookup_invalidation_state(&self, data_ids: &[DataId]) -> InvalidationState {
        let state = self.inner.state.borrow();
        let invalidations = data_ids
            .iter()
            .map(|id| {
                let epoch = match state.visible_entry(id) {
                    Some(RecordEntry::Existent(record)) => record.invalidated_at(),
                    _ => None,
                };
                (id.clone(), epoch)
            })
            .collect();
        InvalidationState {
            data_ids: data_ids.to_vec(),
            invalidations,
            global: state.global_invalidation_epoch,
        }
    }

    /// True when any record in `previous` was invalidated since it was
    /// taken.
    pub fn check_invalidation_state(&self, previous: &InvalidationState) -> bool {
        self.lookup_invalidation_state(&previous.data_ids) != *previous
    }

    /// Calls `callback` whenever a record in `state` (or the whole store) is
    /// invalidated.
    pub fn subscribe_to_invalidation_state(
        &self,
        state: &InvalidationState,
        callback: impl Fn() + 'static,
    ) -> Disposable {
        let id = {
            let mut store_state = self.inner.state.borrow_mut();
            store_state.next_invalidation_id += 1;
            let id = store_state.next_invalidation_id;
            store_state.invalidation_subscriptions.insert(
                id,
                InvalidationSubscription {
                    data_ids: state.data_ids.clone(),
                    callback: Rc::new(callback),
                },
            );
            id
        };
        let weak = Rc::downgrade(&self.inner);
        Disposable::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .state
                    .borrow_mut()
                    .invalidation_subscriptions
                    .remove(&id);
            }
        })
    }

    /// Owned copy of the visible records.
    pub fn get_source(&self) -> RecordSource {
        let state = self.inner.state.borrow();
        match &state.optimistic {
            Some(overlay) => OverlaySource::new(&state.source, overlay).to_source(),
            None => state.source.clone(),
        }
    }

    /// Runs `f` against the visible records without copying them.
    pub fn with_source<R>(&self, f: impl FnOnce(&dyn RecordSourceView) -> R) -> R {
        self.inner.state.borrow().with_view(f)
    }

    /// JSON dump of the visible records, sorted by id.
    pub fn record_source_json(&self) -> serde_json::Value {
        self.get_source().to_json()
    }

    /// Number of roots (retained or buffered).
    pub fn root_count(&self) -> usize {
        self.inner.state.borrow().roots.len()
    }

    /// Number of released roots waiting in the release buffer.
    pub fn release_buffer_len(&self) -> usize {
        self.inner.state.borrow().release_buffer.len()
    }

    /// Number of live snapshot subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.state.borrow().subscriptions.len()
    }

    /// Number of cached lookups.
    pub fn lookup_cache_len(&self) -> usize {
        self.inner.lookup_cache.borrow().len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::cell::Cell;

    use serde_json::json;

    use super::*;
    use crate::ast::{
        ConcreteRequest, NormalizationLinkedField, NormalizationOperation, NormalizationScalarField,
        NormalizationSelection, ReaderFragment, ReaderFragmentMetadata, ReaderLinkedField,
        ReaderScalarField, ReaderSelection, RequestParameters,
    };
    use crate::ident::ROOT_TYPE;
    use crate::network::CacheConfig;
    use crate::record::FieldValue;
    use crate::selector::create_operation_descriptor;
    use crate::variables::Variables;

    fn request() -> Rc<ConcreteRequest> {
        let name = NormalizationSelection::ScalarField(NormalizationScalarField {
            name: "name".into(),
            alias: None,
            args: vec![],
            storage_key: None,
        });
        let reader_name = ReaderSelection::ScalarField(ReaderScalarField {
            name: "name".into(),
            alias: None,
            args: vec![],
            storage_key: None,
        });
        Rc::new(ConcreteRequest {
            fragment: Rc::new(ReaderFragment {
                name: "MeQuery".into(),
                type_name: "Query".into(),
                argument_definitions: vec![],
                metadata: ReaderFragmentMetadata::default(),
                selections: vec![ReaderSelection::LinkedField(ReaderLinkedField {
                    name: "me".into(),
                    alias: None,
                    args: vec![],
                    storage_key: None,
                    concrete_type: Some("User".into()),
                    plural: false,
                    selections: vec![reader_name],
                })],
            }),
            operation: Rc::new(NormalizationOperation {
                name: "MeQuery".into(),
                argument_definitions: vec![],
                selections: vec![NormalizationSelection::LinkedField(NormalizationLinkedField {
                    name: "me".into(),
                    alias: None,
                    args: vec![],
                    storage_key: None,
                    concrete_type: Some("User".into()),
                    plural: false,
                    selections: vec![name],
                })],
            }),
            params: RequestParameters {
                name: "MeQuery".into(),
                operation_kind: OperationKind::Query,
                id: None,
                text: None,
                metadata: serde_json::Map::new(),
            },
        })
    }

    fn me(name: &str) -> RecordSource {
        let mut root = Record::new(DataId::root(), ROOT_TYPE);
        root.set("me", FieldValue::Link(DataId::from("4")));
        let mut user = Record::new(DataId::from("4"), "User");
        user.set("name", FieldValue::scalar(json!(name)));
        [root, user].into_iter().collect()
    }

    fn store(buffer: usize) -> Store {
        Store::builder(RecordSource::new())
            .config(RuntimeConfig {
                gc_release_buffer_size: buffer,
                ..RuntimeConfig::default()
            })
            .build()
    }

    #[test]
    fn lookup_is_pointer_stable_until_touched() {
        let store = store(10);
        store.publish(&me("Zuck"), None).unwrap();
        let operation = create_operation_descriptor(request(), &Variables::new(), CacheConfig::default());
        let first = store.lookup(&operation.fragment).unwrap();
        let second = store.lookup(&operation.fragment).unwrap();
        assert!(first.same_data(&second));
        store.publish(&me("Mark"), None).unwrap();
        let third = store.lookup(&operation.fragment).unwrap();
        assert!(!first.same_data(&third));
    }

    #[test]
    fn notify_fires_each_subscription_once() {
        let store = store(10);
        store.publish(&me("Zuck"), None).unwrap();
        let operation = create_operation_descriptor(request(), &Variables::new(), CacheConfig::default());
        let snapshot = store.lookup(&operation.fragment).unwrap();
        let calls = Rc::new(Cell::new(0));
        let seen = Rc::clone(&calls);
        let subscription = store.subscribe(&snapshot, move |_| seen.set(seen.get() + 1));
        store.publish(&me("Mark"), None).unwrap();
        store.publish(&me("Priscilla"), None).unwrap();
        let outcome = store.notify(None, false).unwrap();
        assert_eq!(calls.get(), 1);
        assert_eq!(outcome.updated_owners.len(), 1);
        subscription.dispose();
        store.publish(&me("Zuck"), None).unwrap();
        store.notify(None, false).unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn released_roots_are_collected_past_the_buffer() {
        let store = store(0);
        let operation = create_operation_descriptor(request(), &Variables::new(), CacheConfig::default());
        let retained = store.retain(&operation);
        store.publish(&me("Zuck"), None).unwrap();
        store.notify(Some(&operation), false).unwrap();
        assert_eq!(store.collect(), 0);
        retained.dispose();
        assert_eq!(store.get_source().size(), 0);
        assert_eq!(store.root_count(), 0);
    }

    #[test]
    fn optimistic_overlay_is_discarded_on_restore() {
        let store = store(10);
        store.publish(&me("Zuck"), None).unwrap();
        store.notify(None, false).unwrap();
        store.snapshot().unwrap();
        assert!(store.snapshot().is_err());
        store.publish(&me("Optimistic"), None).unwrap();
        store.notify(None, false).unwrap();
        let user = DataId::from("4");
        assert_eq!(
            store.with_source(|view| view.get(&user).and_then(|r| r.get_value("name"))),
            Some(json!("Optimistic"))
        );
        store.restore().unwrap();
        assert_eq!(
            store.with_source(|view| view.get(&user).and_then(|r| r.get_value("name"))),
            Some(json!("Zuck"))
        );
        assert!(store.restore().is_err());
    }

    #[test]
    fn invalidation_marks_operations_stale() {
        let store = store(10);
        let operation = create_operation_descriptor(request(), &Variables::new(), CacheConfig::default());
        let _retained = store.retain(&operation);
        store.publish(&me("Zuck"), None).unwrap();
        store.notify(Some(&operation), false).unwrap();
        assert!(matches!(
            store.check(&operation).unwrap(),
            OperationAvailability::Available { .. }
        ));
        let state = store.lookup_invalidation_state(&[DataId::from("4")]);
        let fired = Rc::new(Cell::new(false));
        let flag = Rc::clone(&fired);
        let _watch = store.subscribe_to_invalidation_state(&state, move || flag.set(true));
        let ids: BTreeSet<DataId> = [DataId::from("4")].into_iter().collect();
        store.publish(&RecordSource::new(), Some(&ids)).unwrap();
        store.notify(None, false).unwrap();
        assert!(fired.get());
        assert!(store.check_invalidation_state(&state));
        assert_eq!(store.check(&operation).unwrap(), OperationAvailability::Stale);
    }
}
