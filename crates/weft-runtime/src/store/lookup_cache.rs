// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Bounded cache of lookup results keyed by selector identity.
use std::collections::{BTreeSet, VecDeque};

use rustc_hash::FxHashMap;

use crate::ident::{DataId, Hash};
use crate::snapshot::Snapshot;

/// FIFO-bounded snapshot cache.
///
/// An entry stays valid until a write touches one of its seen records, so a
/// hit hands back pointer-identical data.
#[derive(Debug, Default)]
pub(crate) struct LookupCache {
    capacity: usize,
    entries: FxHashMap<Hash, Snapshot>,
    order: VecDeque<Hash>,
}

impl LookupCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: FxHashMap::default(),
            order: VecDeque::new(),
        }
    }

    pub(crate) fn get(&self, key: &Hash) -> Option<Snapshot> {
        self.entries.get(key).cloned()
    }

    pub(crate) fn insert(&mut self, key: Hash, snapshot: Snapshot) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.insert(key, snapshot).is_none() {
            self.order.push_back(key);
        }
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }

    /// Drops every entry that saw one of `ids`.
    pub(crate) fn evict_touching(&mut self, ids: &BTreeSet<DataId>) {
        if ids.is_empty() {
            return;
        }
        self.entries.retain(|_, snapshot| !snapshot.touches(ids));
        let entries = &self.entries;
        self.order.retain(|key| entries.contains_key(key));
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
