// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Read results.
use std::collections::BTreeSet;

use tracing::warn;

use crate::data::Data;
use crate::error::RuntimeError;
use crate::ident::DataId;
use crate::selector::SingularReaderSelector;

/// One `@required` field that read as null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingRequiredField {
    /// Fragment that declared the field.
    pub owner: String,
    /// Path of the field within the fragment.
    pub path: String,
}

/// Required fields that read as null during one read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissingRequiredFields {
    /// Fields declared with `action: LOG`.
    Log(Vec<MissingRequiredField>),
    /// First field declared with `action: THROW`.
    Throw(MissingRequiredField),
}

/// Result of reading a selector against a record source.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Read data: `None` when the root record is unknown, `Some(Data::Null)`
    /// when it is known null or deleted.
    pub data: Option<Data>,
    /// True when any selected field was absent.
    pub is_missing_data: bool,
    /// Every record touched by the read.
    pub seen_records: BTreeSet<DataId>,
    /// The selector that produced this snapshot.
    pub selector: SingularReaderSelector,
    /// Required fields that read as null.
    pub missing_required_fields: Option<MissingRequiredFields>,
}

impl Snapshot {
    /// True when the snapshot saw any of `ids`.
    pub fn touches(&self, ids: &BTreeSet<DataId>) -> bool {
        if self.seen_records.len() <= ids.len() {
            self.seen_records.iter().any(|id| ids.contains(id))
        } else {
            ids.iter().any(|id| self.seen_records.contains(id))
        }
    }

    /// True when both snapshots hold pointer-identical data.
    pub fn same_data(&self, other: &Self) -> bool {
        match (&self.data, &other.data) {
            (Some(a), Some(b)) => a.ptr_eq(b),
            (None, None) => true,
            _ => false,
        }
    }
}

/// Applies the snapshot's `@required` outcome: logs `LOG` fields and
/// returns an error for a `THROW` field.
pub fn read_required(snapshot: &Snapshot) -> Result<(), RuntimeError> {
    match &snapshot.missing_required_fields {
        None => Ok(()),
        Some(MissingRequiredFields::Log(fields)) => {
            for field in fields {
                warn!(owner = %field.owner, path = %field.path, "required field was null");
            }
            Ok(())
        }
        Some(MissingRequiredFields::Throw(field)) => Err(RuntimeError::MissingRequiredField {
            owner: field.owner.clone(),
            path: field.path.clone(),
        }),
    }
}
