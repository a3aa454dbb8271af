// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Which in-flight operations are about to change which owners' data.
//!
//! A view reading data owned by one query can ask whether some other
//! operation (a mutation, a streaming query) is still writing into it, and
//! wait for those writes to settle.
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use weft_observable::{Observable, ReplaySubject};

use crate::error::RuntimeError;
use crate::ident::RequestIdentifier;
use crate::selector::RequestDescriptor;

/// Operations currently affecting one owner.
#[derive(Clone)]
pub struct PendingOperations {
    /// The in-flight operations.
    pub pending: Vec<Rc<RequestDescriptor>>,
    /// Completes once none of them affects the owner any more.
    pub settled: Observable<(), RuntimeError>,
}

impl fmt::Debug for PendingOperations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperations")
            .field(
                "pending",
                &self
                    .pending
                    .iter()
                    .map(|request| request.identifier)
                    .collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct TrackerState {
    owners_to_pending: BTreeMap<RequestIdentifier, BTreeMap<RequestIdentifier, Rc<RequestDescriptor>>>,
    pending_to_owners: BTreeMap<RequestIdentifier, BTreeSet<RequestIdentifier>>,
    settled: BTreeMap<RequestIdentifier, ReplaySubject<(), RuntimeError>>,
}

/// Tracks pending operation -> affected owner edges.
#[derive(Default)]
pub struct OperationTracker {
    state: RefCell<TrackerState>,
}

impl fmt::Debug for OperationTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("OperationTracker")
            .field("owners", &state.owners_to_pending.len())
            .field("pending", &state.pending_to_owners.len())
            .finish()
    }
}

impl OperationTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `pending` has changed data read by `affected_owners`.
    pub fn update(&self, pending: &Rc<RequestDescriptor>, affected_owners: &[Rc<RequestDescriptor>]) {
        if affected_owners.is_empty() {
            return;
        }
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let pending_id = pending.identifier;
        for owner in affected_owners {
            let newly_affected = state
                .owners_to_pending
                .entry(owner.identifier)
                .or_default()
                .insert(pending_id, Rc::clone(pending))
                .is_none();
            if newly_affected {
                state
                    .pending_to_owners
                    .entry(pending_id)
                    .or_default()
                    .insert(owner.identifier);
            }
        }
    }

    /// Removes `pending`; owners left unaffected have their `settled`
    /// observable completed.
    pub fn complete(&self, pending: &RequestDescriptor) {
        let completed: Vec<ReplaySubject<(), RuntimeError>> = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let Some(owners) = state.pending_to_owners.remove(&pending.identifier) else {
                return;
            };
            let mut completed = Vec::new();
            for owner in owners {
                let Some(operations) = state.owners_to_pending.get_mut(&owner) else {
                    continue;
                };
                operations.remove(&pending.identifier);
                if operations.is_empty() {
                    state.owners_to_pending.remove(&owner);
                    if let Some(subject) = state.settled.remove(&owner) {
                        completed.push(subject);
                    }
                }
            }
            completed
        };
        for subject in completed {
            subject.complete();
        }
    }

    /// Operations affecting `owner`, or `None` when nothing is pending.
    pub fn pending_operations_for_owner(&self, owner: &RequestDescriptor) -> Option<PendingOperations> {
        let mut state = self.state.borrow_mut();
        let pending: Vec<Rc<RequestDescriptor>> = state
            .owners_to_pending
            .get(&owner.identifier)?
            .values()
            .cloned()
            .collect();
        if pending.is_empty() {
            return None;
        }
        let settled = state
            .settled
            .entry(owner.identifier)
            .or_insert_with(ReplaySubject::new)
            .observable();
        Some(PendingOperations { pending, settled })
    }

    /// True when any operation affects `owner`.
    pub fn is_affected(&self, owner: &RequestDescriptor) -> bool {
        self.state
            .borrow()
            .owners_to_pending
            .get(&owner.identifier)
            .is_some_and(|operations| !operations.is_empty())
    }
}
