// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Root table and mark/sweep collection.
use std::collections::{BTreeMap, BTreeSet};

use tracing::{trace, warn};

use crate::ident::{DataId, RequestIdentifier};
use crate::loader::OperationLoader;
use crate::record_source::{RecordSource, RecordSourceView};
use crate::reference_marker::mark;
use crate::selector::OperationDescriptor;

/// A retained (or recently released) operation.
#[derive(Debug, Clone)]
pub(crate) struct RootEntry {
    pub(crate) operation: OperationDescriptor,
    pub(crate) ref_count: usize,
    /// Write epoch at which the operation's data was last written.
    pub(crate) epoch: Option<u64>,
    /// Clock time of the last write, in ms.
    pub(crate) fetch_time: Option<u64>,
}

pub(crate) type Roots = BTreeMap<RequestIdentifier, RootEntry>;

/// True when `fetch_time` is older than `expiration_ms` at `now`.
pub(crate) fn is_expired(fetch_time: Option<u64>, now: u64, expiration_ms: Option<u64>) -> bool {
    match (fetch_time, expiration_ms) {
        (Some(fetched), Some(expiration)) => now.saturating_sub(fetched) >= expiration,
        _ => false,
    }
}

/// Marks every id reachable from a live root. Expired zero-ref roots are
/// dropped from `roots` instead of marked.
pub(crate) fn mark_roots(
    source: &RecordSource,
    roots: &mut Roots,
    now: u64,
    expiration_ms: Option<u64>,
    loader: Option<&dyn OperationLoader>,
) -> BTreeSet<DataId> {
    roots.retain(|_, entry| {
        entry.ref_count > 0 || !is_expired(entry.fetch_time, now, expiration_ms)
    });
    let mut references = BTreeSet::new();
    for (id, entry) in roots.iter() {
        if let Err(error) = mark(source, &entry.operation.root, &mut references, loader) {
            warn!(root = %id.short(), %error, "failed to mark root; keeping its records");
            references.extend(source.record_ids());
        }
    }
    references
}

/// Removes every record not in `references`. Returns the number removed.
pub(crate) fn sweep(source: &mut RecordSource, references: &BTreeSet<DataId>) -> usize {
    if references.is_empty() {
        let removed = source.size();
        source.clear();
        return removed;
    }
    let doomed: Vec<DataId> = source
        .record_ids()
        .into_iter()
        .filter(|id| !references.contains(id))
        .collect();
    for id in &doomed {
        source.remove(id);
    }
    trace!(removed = doomed.len(), kept = source.size(), "swept records");
    doomed.len()
}
