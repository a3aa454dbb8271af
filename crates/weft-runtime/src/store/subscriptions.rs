// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Snapshot subscription registry.
use std::collections::BTreeSet;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use tracing::warn;

use crate::data::recycle_optional;
use crate::ident::DataId;
use crate::reader::read;
use crate::record_source::RecordSourceView;
use crate::snapshot::Snapshot;

/// Callback fired with the latest snapshot.
pub type SnapshotCallback = Rc<dyn Fn(&Snapshot)>;

pub(crate) struct StoreSubscription {
    snapshot: Snapshot,
    backup: Option<Snapshot>,
    stale: bool,
    callback: SnapshotCallback,
}

/// A callback owed after the registry borrow is released.
pub(crate) struct PendingCallback {
    pub(crate) id: u64,
    pub(crate) callback: SnapshotCallback,
    pub(crate) snapshot: Snapshot,
}

/// Subscriptions keyed by handle; add and remove are O(1).
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: FxHashMap<u64, StoreSubscription>,
    next_id: u64,
}

impl SubscriptionRegistry {
    pub(crate) fn insert(&mut self, snapshot: Snapshot, callback: SnapshotCallback) -> u64 {
        self.next_id += 1;
        self.entries.insert(
            self.next_id,
            StoreSubscription {
                snapshot,
                backup: None,
                stale: false,
                callback,
            },
        );
        self.next_id
    }

    pub(crate) fn remove(&mut self, id: u64) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Handles in registration order, so fan-out is deterministic.
    fn ordered_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.entries.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Re-reads every subscription that saw an updated id (or was marked
    /// stale) and returns the callbacks whose data changed.
    pub(crate) fn update(
        &mut self,
        view: &dyn RecordSourceView,
        updated_ids: &BTreeSet<DataId>,
    ) -> Vec<PendingCallback> {
        let mut pending = Vec::new();
        for id in self.ordered_ids() {
            let Some(subscription) = self.entries.get_mut(&id) else {
                continue;
            };
            if !subscription.stale && !subscription.snapshot.touches(updated_ids) {
                continue;
            }
            let mut next = match read(view, &subscription.snapshot.selector) {
                Ok(next) => next,
                Err(error) => {
                    warn!(%error, "subscription re-read failed");
                    continue;
                }
            };
            next.data = recycle_optional(subscription.snapshot.data.as_ref(), next.data);
            let changed = !next.same_data(&subscription.snapshot);
            subscription.snapshot = next;
            subscription.stale = false;
            if changed {
                pending.push(PendingCallback {
                    id,
                    callback: Rc::clone(&subscription.callback),
                    snapshot: subscription.snapshot.clone(),
                });
            }
        }
        pending
    }

    /// Records a backup of every snapshot before optimistic writes.
    pub(crate) fn snapshot_all(&mut self, view: &dyn RecordSourceView) {
        for subscription in self.entries.values_mut() {
            if !subscription.stale {
                subscription.backup = Some(subscription.snapshot.clone());
                continue;
            }
            match read(view, &subscription.snapshot.selector) {
                Ok(mut backup) => {
                    backup.data =
                        recycle_optional(subscription.snapshot.data.as_ref(), backup.data);
                    subscription.backup = Some(backup);
                }
                Err(error) => warn!(%error, "subscription backup read failed"),
            }
        }
    }

    /// Rolls read metadata back to the backups while keeping the data the
    /// subscriber last saw; anything that differs is marked stale so the
    /// next notify re-reads it and fires.
    pub(crate) fn restore(&mut self) {
        for subscription in self.entries.values_mut() {
            match subscription.backup.take() {
                Some(backup) => {
                    if !backup.same_data(&subscription.snapshot) {
                        subscription.stale = true;
                    }
                    let data = subscription.snapshot.data.take();
                    subscription.snapshot = Snapshot { data, ..backup };
                }
                None => subscription.stale = true,
            }
        }
    }
}
