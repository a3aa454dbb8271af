// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! FIFO of released roots awaiting collection.
use std::collections::VecDeque;

use crate::ident::RequestIdentifier;

/// Bounded FIFO of zero-ref roots.
///
/// Re-retaining a buffered root removes it; pushing past capacity evicts
/// from the front.
#[derive(Debug, Clone, Default)]
pub(crate) struct ReleaseBuffer {
    capacity: usize,
    entries: VecDeque<RequestIdentifier>,
}

impl ReleaseBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn has_room(&self) -> bool {
        self.entries.len() < self.capacity
    }

    /// Appends `id`; returns the ids evicted to stay within capacity.
    pub(crate) fn push(&mut self, id: RequestIdentifier) -> Vec<RequestIdentifier> {
        self.entries.push_back(id);
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            if let Some(oldest) = self.entries.pop_front() {
                evicted.push(oldest);
            }
        }
        evicted
    }

    pub(crate) fn remove(&mut self, id: &RequestIdentifier) {
        self.entries.retain(|entry| entry != id);
    }

    /// Keeps only entries for which `keep` holds.
    pub(crate) fn retain(&mut self, mut keep: impl FnMut(&RequestIdentifier) -> bool) {
        self.entries.retain(|entry| keep(entry));
    }
}
