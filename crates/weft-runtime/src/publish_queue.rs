// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Orders server payloads, client updates and optimistic updates into
//! publishes on the store.
//!
//! Optimistic updates live in the store's optimistic overlay. Committing
//! anything to the base source first rolls the overlay back, applies the
//! commit, then replays the optimistic updates that are still active on a
//! fresh overlay, so server data and optimistic data never mix in the base.
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::disposable::Disposable;
use crate::error::RuntimeError;
use crate::handlers::{apply_field_payloads, HandlerProvider};
use crate::mutator::{MutationOutput, RecordSourceProxy, SelectorStoreUpdater, StoreUpdater};
use crate::normalizer::NormalizationResult;
use crate::reader::read;
use crate::record_source::{RecordSource, RecordSourceView};
use crate::selector::OperationDescriptor;
use crate::store::{NotifyOutcome, Store};

/// Handle for an applied optimistic update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UpdateHandle(pub u64);

/// An optimistic change, kept until reverted.
#[derive(Clone)]
pub enum OptimisticUpdate {
    /// Imperative update.
    Updater(StoreUpdater),
    /// Optimistic response for an operation.
    Payload {
        /// Operation the response belongs to.
        operation: OperationDescriptor,
        /// Normalized optimistic response.
        payload: Rc<NormalizationResult>,
        /// Optional updater run after the response is layered in.
        updater: Option<SelectorStoreUpdater>,
    },
}

impl fmt::Debug for OptimisticUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Updater(_) => f.write_str("OptimisticUpdate::Updater"),
            Self::Payload { operation, .. } => f
                .debug_struct("OptimisticUpdate::Payload")
                .field("operation", &operation.request.name())
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Clone)]
enum PendingCommit {
    Payload {
        operation: OperationDescriptor,
        payload: Rc<NormalizationResult>,
        updater: Option<SelectorStoreUpdater>,
    },
    Source(RecordSource),
    Client(StoreUpdater),
}

#[derive(Default)]
struct QueueState {
    has_store_snapshot: bool,
    pending_backup_rebase: bool,
    pending_data: Vec<PendingCommit>,
    pending_optimistic: BTreeMap<UpdateHandle, OptimisticUpdate>,
    applied_optimistic: BTreeMap<UpdateHandle, OptimisticUpdate>,
    gc_hold: Option<Disposable>,
    next_handle: u64,
}

/// Batches writes until [`PublishQueue::run`].
pub struct PublishQueue {
    store: Store,
    handler_provider: Option<Rc<dyn HandlerProvider>>,
    state: RefCell<QueueState>,
}

impl fmt::Debug for PublishQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("PublishQueue")
            .field("pending_data", &state.pending_data.len())
            .field("pending_optimistic", &state.pending_optimistic.len())
            .field("applied_optimistic", &state.applied_optimistic.len())
            .finish_non_exhaustive()
    }
}

/// Applies handlers and the selector updater for one payload on top of
/// `payload.source`, returning the resulting sink.
fn process_payload(
    base: &dyn RecordSourceView,
    operation: &OperationDescriptor,
    payload: &NormalizationResult,
    updater: Option<&SelectorStoreUpdater>,
    handlers: Option<&dyn HandlerProvider>,
) -> Result<MutationOutput, RuntimeError> {
    let proxy = RecordSourceProxy::with_sink(base, payload.source.clone());
    apply_field_payloads(handlers, &proxy, &payload.field_payloads)?;
    if let Some(updater) = updater {
        let data = read(&payload.source, &operation.fragment)?.data;
        updater(&proxy, data.as_ref())?;
    }
    Ok(proxy.into_output())
}

impl PublishQueue {
    /// Queue writing into `store`.
    pub fn new(store: Store, handler_provider: Option<Rc<dyn HandlerProvider>>) -> Self {
        Self {
            store,
            handler_provider,
            state: RefCell::new(QueueState::default()),
        }
    }

    /// Schedules an optimistic update for the next run.
    pub fn apply_update(&self, update: OptimisticUpdate) -> UpdateHandle {
        let mut state = self.state.borrow_mut();
        state.next_handle += 1;
        let handle = UpdateHandle(state.next_handle);
        state.pending_optimistic.insert(handle, update);
        handle
    }

    /// Schedules removal of an optimistic update.
    pub fn revert_update(&self, handle: UpdateHandle) {
        let mut state = self.state.borrow_mut();
        if state.pending_optimistic.remove(&handle).is_none()
            && state.applied_optimistic.remove(&handle).is_some()
        {
            state.pending_backup_rebase = true;
        }
    }

    /// Schedules removal of every optimistic update.
    pub fn revert_all(&self) {
        let mut state = self.state.borrow_mut();
        state.pending_backup_rebase = true;
        state.pending_optimistic.clear();
        state.applied_optimistic.clear();
    }

    /// Schedules a server payload.
    pub fn commit_payload(
        &self,
        operation: OperationDescriptor,
        payload: Rc<NormalizationResult>,
        updater: Option<SelectorStoreUpdater>,
    ) {
        let mut state = self.state.borrow_mut();
        state.pending_backup_rebase = true;
        state.pending_data.push(PendingCommit::Payload {
            operation,
            payload,
            updater,
        });
    }

    /// Schedules a client update against the base source.
    pub fn commit_update(&self, updater: StoreUpdater) {
        let mut state = self.state.borrow_mut();
        state.pending_backup_rebase = true;
        state.pending_data.push(PendingCommit::Client(updater));
    }

    /// Schedules a raw source publish.
    pub fn commit_source(&self, source: RecordSource) {
        let mut state = self.state.borrow_mut();
        state.pending_backup_rebase = true;
        state.pending_data.push(PendingCommit::Source(source));
    }

    /// True while any optimistic update is applied or pending.
    pub fn has_optimistic_updates(&self) -> bool {
        let state = self.state.borrow();
        !state.applied_optimistic.is_empty() || !state.pending_optimistic.is_empty()
    }

    /// Publishes everything queued and notifies once.
    pub fn run(&self, source_operation: Option<&OperationDescriptor>) -> Result<NotifyOutcome, RuntimeError> {
        let (rebase, restore) = {
            let mut state = self.state.borrow_mut();
            let rebase = state.pending_backup_rebase;
            let restore = rebase && state.has_store_snapshot;
            if restore {
                state.has_store_snapshot = false;
            }
            (rebase, restore)
        };
        if restore {
            self.store.restore()?;
        }
        let pending_data = std::mem::take(&mut self.state.borrow_mut().pending_data);
        let invalidated_store = self.commit_data(pending_data)?;

        let (replay, fresh, snapshot) = {
            let mut state = self.state.borrow_mut();
            let replay: Vec<OptimisticUpdate> = if rebase {
                state.applied_optimistic.values().cloned().collect()
            } else {
                Vec::new()
            };
            let fresh = std::mem::take(&mut state.pending_optimistic);
            let needs_overlay = !fresh.is_empty() || !replay.is_empty();
            let snapshot = needs_overlay && !state.has_store_snapshot;
            if snapshot {
                state.has_store_snapshot = true;
            }
            (replay, fresh, needs_overlay.then_some(snapshot))
        };
        if let Some(take_snapshot) = snapshot {
            if take_snapshot {
                self.store.snapshot()?;
            }
            let mut updates = replay;
            updates.extend(fresh.values().cloned());
            self.apply_optimistic(&updates)?;
            self.state.borrow_mut().applied_optimistic.extend(fresh);
        }

        let release = {
            let mut state = self.state.borrow_mut();
            state.pending_backup_rebase = false;
            if state.applied_optimistic.is_empty() {
                state.gc_hold.take()
            } else {
                if state.gc_hold.is_none() {
                    state.gc_hold = Some(self.store.hold_gc());
                }
                None
            }
        };
        if let Some(hold) = release {
            hold.dispose();
        }
        self.store.notify(source_operation, invalidated_store)
    }

    fn commit_data(&self, pending: Vec<PendingCommit>) -> Result<bool, RuntimeError> {
        let handlers = self.handler_provider.as_deref();
        let mut invalidated_store = false;
        for commit in pending {
            let output = match commit {
                PendingCommit::Payload {
                    operation,
                    payload,
                    updater,
                } => self.store.with_source(|base| {
                    process_payload(base, &operation, &payload, updater.as_ref(), handlers)
                })?,
                PendingCommit::Source(source) => MutationOutput {
                    sink: source,
                    ..MutationOutput::default()
                },
                PendingCommit::Client(updater) => self.store.with_source(|base| {
                    let proxy = RecordSourceProxy::new(base);
                    updater(&proxy)?;
                    Ok::<_, RuntimeError>(proxy.into_output())
                })?,
            };
            invalidated_store |= output.invalidated_store;
            self.store
                .publish(&output.sink, Some(&output.invalidated_ids))?;
        }
        Ok(invalidated_store)
    }

    fn apply_optimistic(&self, updates: &[OptimisticUpdate]) -> Result<(), RuntimeError> {
        let handlers = self.handler_provider.as_deref();
        let output = self.store.with_source(|base| {
            let proxy = RecordSourceProxy::new(base);
            for update in updates {
                match update {
                    OptimisticUpdate::Updater(updater) => updater(&proxy)?,
                    OptimisticUpdate::Payload {
                        operation,
                        payload,
                        updater,
                    } => {
                        proxy.publish_source(&payload.source);
                        apply_field_payloads(handlers, &proxy, &payload.field_payloads)?;
                        if let Some(updater) = updater {
                            let data = read(&payload.source, &operation.fragment)?.data;
                            updater(&proxy, data.as_ref())?;
                        }
                    }
                }
            }
            Ok::<_, RuntimeError>(proxy.into_output())
        })?;
        self.store.publish(&output.sink, None)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::ident::{DataId, ROOT_TYPE};
    use crate::record::{FieldValue, Record};

    fn name_of(store: &Store) -> Option<serde_json::Value> {
        store.with_source(|view| {
            view.get(&DataId::from("4"))
                .and_then(|record| record.get_value("name"))
        })
    }

    fn seeded() -> Store {
        let mut user = Record::new(DataId::from("4"), "User");
        user.set("name", FieldValue::scalar(json!("Zuck")));
        let source: RecordSource = [Record::new(DataId::root(), ROOT_TYPE), user]
            .into_iter()
            .collect();
        Store::new(source)
    }

    fn rename(to: &'static str) -> StoreUpdater {
        Rc::new(move |proxy: &RecordSourceProxy<'_>| {
            if let Some(user) = proxy.get(&DataId::from("4")) {
                user.set_value(json!(to), "name", None);
            }
            Ok(())
        })
    }

    #[test]
    fn optimistic_updates_survive_server_commits_until_reverted() {
        let store = seeded();
        let queue = PublishQueue::new(store.clone(), None);
        let handle = queue.apply_update(OptimisticUpdate::Updater(rename("Optimistic")));
        queue.run(None).unwrap();
        assert_eq!(name_of(&store), Some(json!("Optimistic")));
        assert!(store.is_optimistic());

        let mut server = Record::new(DataId::from("4"), "User");
        server.set("username", FieldValue::scalar(json!("zuck")));
        queue.commit_source([server].into_iter().collect());
        queue.run(None).unwrap();
        assert_eq!(name_of(&store), Some(json!("Optimistic")));

        queue.revert_update(handle);
        queue.run(None).unwrap();
        assert_eq!(name_of(&store), Some(json!("Zuck")));
        assert!(!store.is_optimistic());
        assert!(!queue.has_optimistic_updates());
        let username = store.with_source(|view| {
            view.get(&DataId::from("4"))
                .and_then(|record| record.get_value("username"))
        });
        assert_eq!(username, Some(json!("zuck")));
    }

    #[test]
    fn client_updates_write_the_base() {
        let store = seeded();
        let queue = PublishQueue::new(store.clone(), None);
        queue.commit_update(rename("Mark"));
        let outcome = queue.run(None).unwrap();
        assert!(outcome.updated_ids.contains(&DataId::from("4")));
        assert_eq!(name_of(&store), Some(json!("Mark")));
        assert!(!store.is_optimistic());
    }
}
