// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Record sources: maps from [`DataId`] to records.
//!
//! Iteration is in id order, so any dump of a source is deterministic.
use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::{Map, Value};

use crate::ident::DataId;
use crate::record::Record;

/// Tri-state status of an id in a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// A record is present.
    Existent,
    /// The record is known to be deleted (or null).
    Nonexistent,
    /// Nothing is known about the id.
    Unknown,
}

/// Entry stored for a known id.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordEntry {
    /// Live record, shared copy-on-write.
    Existent(Rc<Record>),
    /// Known-deleted marker.
    Nonexistent,
}

/// Read access shared by plain sources and optimistic overlays.
pub trait RecordSourceView {
    /// Entry for `id`, or `None` when unknown.
    fn entry(&self, id: &DataId) -> Option<&RecordEntry>;

    /// Every known id, in order.
    fn record_ids(&self) -> Vec<DataId>;

    /// Live record for `id`.
    fn get(&self, id: &DataId) -> Option<&Rc<Record>> {
        match self.entry(id)? {
            RecordEntry::Existent(record) => Some(record),
            RecordEntry::Nonexistent => None,
        }
    }

    /// Status of `id`.
    fn get_status(&self, id: &DataId) -> RecordState {
        match self.entry(id) {
            Some(RecordEntry::Existent(_)) => RecordState::Existent,
            Some(RecordEntry::Nonexistent) => RecordState::Nonexistent,
            None => RecordState::Unknown,
        }
    }

    /// True when `id` is known (present or deleted).
    fn has(&self, id: &DataId) -> bool {
        self.entry(id).is_some()
    }
}

/// Owned, mutable record source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSource {
    records: BTreeMap<DataId, RecordEntry>,
}

impl RecordSource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `record`, replacing any previous entry.
    pub fn set(&mut self, record: Record) {
        self.set_rc(Rc::new(record));
    }

    /// Stores an already shared record.
    pub fn set_rc(&mut self, record: Rc<Record>) {
        self.records
            .insert(record.id().clone(), RecordEntry::Existent(record));
    }

    /// Mutable access to a live record, cloning it if it is shared.
    pub fn get_mut(&mut self, id: &DataId) -> Option<&mut Record> {
        match self.records.get_mut(id)? {
            RecordEntry::Existent(record) => Some(Rc::make_mut(record)),
            RecordEntry::Nonexistent => None,
        }
    }

    /// Marks `id` as known-deleted.
    pub fn delete(&mut self, id: &DataId) {
        self.records.insert(id.clone(), RecordEntry::Nonexistent);
    }

    /// Forgets `id` entirely, making it unknown.
    pub fn remove(&mut self, id: &DataId) -> Option<RecordEntry> {
        self.records.remove(id)
    }

    /// Forgets every record.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Number of known ids.
    pub fn size(&self) -> usize {
        self.records.len()
    }

    /// True when no id is known.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterates entries in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&DataId, &RecordEntry)> {
        self.records.iter()
    }

    /// Inserts a raw entry.
    pub fn insert_entry(&mut self, id: DataId, entry: RecordEntry) {
        self.records.insert(id, entry);
    }

    /// Bulk JSON snapshot: `{ id: record | null }` with sorted keys.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        for (id, entry) in &self.records {
            let value = match entry {
                RecordEntry::Existent(record) => record.to_json(),
                RecordEntry::Nonexistent => Value::Null,
            };
            map.insert(id.as_str().to_owned(), value);
        }
        Value::Object(map)
    }
}

impl RecordSourceView for RecordSource {
    fn entry(&self, id: &DataId) -> Option<&RecordEntry> {
        self.records.get(id)
    }

    fn record_ids(&self) -> Vec<DataId> {
        self.records.keys().cloned().collect()
    }
}

impl FromIterator<Record> for RecordSource {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        let mut source = Self::new();
        for record in iter {
            source.set(record);
        }
        source
    }
}

/// Read-through view: entries in `overlay` shadow those in `base`.
#[derive(Debug, Clone, Copy)]
pub struct OverlaySource<'a> {
    base: &'a RecordSource,
    overlay: &'a RecordSource,
}

impl<'a> OverlaySource<'a> {
    /// Layers `overlay` over `base`.
    pub fn new(base: &'a RecordSource, overlay: &'a RecordSource) -> Self {
        Self { base, overlay }
    }

    /// Materializes the view into an owned source.
    pub fn to_source(&self) -> RecordSource {
        let mut out = self.base.clone();
        for (id, entry) in self.overlay.iter() {
            out.insert_entry(id.clone(), entry.clone());
        }
        out
    }
}

impl RecordSourceView for OverlaySource<'_> {
    fn entry(&self, id: &DataId) -> Option<&RecordEntry> {
        self.overlay.entry(id).or_else(|| self.base.entry(id))
    }

    fn record_ids(&self) -> Vec<DataId> {
        let mut ids = self.base.record_ids();
        ids.extend(
            self.overlay
                .iter()
                .map(|(id, _)| id)
                .filter(|id| !self.base.has(id))
                .cloned(),
        );
        ids.sort();
        ids
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::record::FieldValue;

    #[test]
    fn status_is_tri_state() {
        let mut source = RecordSource::new();
        source.set(Record::new(DataId::from("a"), "T"));
        source.delete(&DataId::from("b"));
        assert_eq!(source.get_status(&DataId::from("a")), RecordState::Existent);
        assert_eq!(source.get_status(&DataId::from("b")), RecordState::Nonexistent);
        assert_eq!(source.get_status(&DataId::from("c")), RecordState::Unknown);
        assert!(source.has(&DataId::from("b")));
        assert!(source.get(&DataId::from("b")).is_none());
    }

    #[test]
    fn get_mut_does_not_affect_shared_copies() {
        let mut source = RecordSource::new();
        source.set(Record::new(DataId::from("a"), "T"));
        let held = Rc::clone(source.get(&DataId::from("a")).unwrap());
        source
            .get_mut(&DataId::from("a"))
            .unwrap()
            .set("x", FieldValue::scalar(json!(1)));
        assert!(held.get("x").is_none());
        assert_eq!(
            source.get(&DataId::from("a")).unwrap().get_value("x"),
            Some(json!(1))
        );
    }

    #[test]
    fn overlay_shadows_base() {
        let mut base = RecordSource::new();
        base.set(Record::new(DataId::from("a"), "T"));
        base.set(Record::new(DataId::from("b"), "T"));
        let mut overlay = RecordSource::new();
        overlay.delete(&DataId::from("a"));
        overlay.set(Record::new(DataId::from("c"), "T"));
        let view = OverlaySource::new(&base, &overlay);
        assert_eq!(view.get_status(&DataId::from("a")), RecordState::Nonexistent);
        assert_eq!(view.get_status(&DataId::from("b")), RecordState::Existent);
        assert_eq!(view.record_ids().len(), 3);
        assert_eq!(view.to_source().size(), 3);
    }
}
