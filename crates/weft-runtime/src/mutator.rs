// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Copy-on-write mutation proxies handed to updaters and handlers.
//!
//! Reads fall through to the base view; writes land in a private sink that
//! holds only the touched fields. The sink is what gets published.
use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

use serde_json::Value;

use crate::data::Data;
use crate::error::RuntimeError;
use crate::ident::{DataId, ROOT_TYPE};
use crate::record::{FieldValue, Record};
use crate::record_source::{RecordEntry, RecordSource, RecordSourceView, RecordState};
use crate::storage_key::format_storage_key;
use crate::variables::Variables;

/// Imperative store update.
pub type StoreUpdater = Rc<dyn Fn(&RecordSourceProxy<'_>) -> Result<(), RuntimeError>>;

/// Store update that also sees the response data read with the
/// operation's root fragment.
pub type SelectorStoreUpdater =
    Rc<dyn Fn(&RecordSourceProxy<'_>, Option<&Data>) -> Result<(), RuntimeError>>;

/// Parts left after a mutation pass.
#[derive(Debug, Default)]
pub struct MutationOutput {
    /// Changed fields and deletions.
    pub sink: RecordSource,
    /// Ids marked invalid.
    pub invalidated_ids: BTreeSet<DataId>,
    /// True when the whole store was invalidated.
    pub invalidated_store: bool,
}

/// Mutable view of a record source.
pub struct RecordSourceProxy<'a> {
    base: &'a dyn RecordSourceView,
    sink: RefCell<RecordSource>,
    invalidated_ids: RefCell<BTreeSet<DataId>>,
    invalidated_store: Cell<bool>,
}

impl fmt::Debug for RecordSourceProxy<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordSourceProxy")
            .field("sink", &self.sink.borrow().size())
            .field("invalidated_store", &self.invalidated_store.get())
            .finish_non_exhaustive()
    }
}

impl<'a> RecordSourceProxy<'a> {
    /// Wraps `base`.
    pub fn new(base: &'a dyn RecordSourceView) -> Self {
        Self::with_sink(base, RecordSource::new())
    }

    /// Wraps `base` with writes already staged in `sink`.
    pub fn with_sink(base: &'a dyn RecordSourceView, sink: RecordSource) -> Self {
        Self {
            base,
            sink: RefCell::new(sink),
            invalidated_ids: RefCell::new(BTreeSet::new()),
            invalidated_store: Cell::new(false),
        }
    }

    /// Status of `id`, sink first.
    pub fn status(&self, id: &DataId) -> RecordState {
        match self.sink.borrow().entry(id) {
            Some(RecordEntry::Existent(_)) => RecordState::Existent,
            Some(RecordEntry::Nonexistent) => RecordState::Nonexistent,
            None => self.base.get_status(id),
        }
    }

    /// Proxy for a live record.
    pub fn get(&self, id: &DataId) -> Option<RecordProxy<'_, 'a>> {
        (self.status(id) == RecordState::Existent).then(|| RecordProxy {
            source: self,
            id: id.clone(),
        })
    }

    /// Creates a new record. Fails when `id` is already live.
    pub fn create(&self, id: DataId, typename: &str) -> Result<RecordProxy<'_, 'a>, RuntimeError> {
        if self.status(&id) == RecordState::Existent {
            return Err(RuntimeError::Invariant(format!(
                "cannot create `{id}`: record already exists"
            )));
        }
        self.sink.borrow_mut().set(Record::new(id.clone(), typename));
        Ok(RecordProxy { source: self, id })
    }

    /// Marks `id` deleted. The root record cannot be deleted.
    pub fn delete(&self, id: &DataId) -> Result<(), RuntimeError> {
        if *id == DataId::root() {
            return Err(RuntimeError::Invariant("cannot delete the root record".into()));
        }
        self.sink.borrow_mut().delete(id);
        Ok(())
    }

    /// Root record, created on first access.
    pub fn root(&self) -> RecordProxy<'_, 'a> {
        let root = DataId::root();
        if self.status(&root) != RecordState::Existent {
            self.sink.borrow_mut().set(Record::new(root.clone(), ROOT_TYPE));
        }
        RecordProxy {
            source: self,
            id: root,
        }
    }

    /// Layers a normalized delta into the sink.
    pub fn publish_source(&self, source: &RecordSource) {
        let mut sink = self.sink.borrow_mut();
        for (id, entry) in source.iter() {
            match entry {
                RecordEntry::Existent(record) => {
                    let next = match sink.get(id) {
                        Some(existing) => existing.update(record),
                        None => Record::clone(record),
                    };
                    sink.set(next);
                }
                RecordEntry::Nonexistent => sink.delete(id),
            }
        }
    }

    /// Marks every record stale as of the next publish.
    pub fn invalidate_store(&self) {
        self.invalidated_store.set(true);
    }

    /// Consumes the proxy.
    pub fn into_output(self) -> MutationOutput {
        MutationOutput {
            sink: self.sink.into_inner(),
            invalidated_ids: self.invalidated_ids.into_inner(),
            invalidated_store: self.invalidated_store.get(),
        }
    }

    /// Invalidation epoch recorded on the base record.
    pub(crate) fn invalidated_at(&self, id: &DataId) -> Option<u64> {
        self.base.get(id).and_then(|record| record.invalidated_at())
    }

    fn field(&self, id: &DataId, storage_key: &str) -> Option<FieldValue> {
        let sink = self.sink.borrow();
        match sink.entry(id) {
            Some(RecordEntry::Nonexistent) => return None,
            Some(RecordEntry::Existent(record)) => {
                if let Some(value) = record.get(storage_key) {
                    return Some(value.clone());
                }
            }
            None => {}
        }
        self.base.get(id)?.get(storage_key).cloned()
    }

    fn typename(&self, id: &DataId) -> Option<String> {
        if let Some(record) = self.sink.borrow().get(id) {
            return Some(record.typename().to_owned());
        }
        self.base.get(id).map(|record| record.typename().to_owned())
    }

    fn write(&self, id: &DataId, apply: impl FnOnce(&mut Record)) {
        let mut sink = self.sink.borrow_mut();
        if sink.get(id).is_none() {
            let typename = self
                .base
                .get(id)
                .map_or_else(String::new, |record| record.typename().to_owned());
            sink.set(Record::new(id.clone(), typename));
        }
        if let Some(record) = sink.get_mut(id) {
            apply(record);
        }
    }
}

/// Mutable view of one record.
#[derive(Clone)]
pub struct RecordProxy<'p, 'a> {
    source: &'p RecordSourceProxy<'a>,
    id: DataId,
}

impl fmt::Debug for RecordProxy<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RecordProxy").field(&self.id).finish()
    }
}

fn key(name: &str, args: Option<&Variables>) -> String {
    args.map_or_else(|| name.to_owned(), |args| format_storage_key(name, args))
}

impl<'p, 'a> RecordProxy<'p, 'a> {
    /// Record id.
    pub fn get_data_id(&self) -> &DataId {
        &self.id
    }

    /// Record typename.
    pub fn get_type(&self) -> String {
        self.source.typename(&self.id).unwrap_or_default()
    }

    /// Raw field by storage key.
    pub fn get_field(&self, storage_key: &str) -> Option<FieldValue> {
        self.source.field(&self.id, storage_key)
    }

    /// Raw field write by storage key.
    pub fn set_field(&self, storage_key: &str, value: FieldValue) -> &Self {
        self.source
            .write(&self.id, |record| record.set(storage_key, value));
        self
    }

    /// Copies one storage key to another, skipping absent fields.
    pub fn copy_field(&self, from: &str, to: &str) -> &Self {
        if let Some(value) = self.get_field(from) {
            self.set_field(to, value);
        }
        self
    }

    /// Scalar value; `Some(Value::Null)` for known null.
    pub fn get_value(&self, name: &str, args: Option<&Variables>) -> Option<Value> {
        match self.get_field(&key(name, args))? {
            FieldValue::Null => Some(Value::Null),
            FieldValue::Scalar(value) => Some(value),
            FieldValue::ScalarList(items) => Some(Value::Array(items)),
            FieldValue::Link(_) | FieldValue::LinkList(_) => None,
        }
    }

    /// Writes a scalar value.
    pub fn set_value(&self, value: Value, name: &str, args: Option<&Variables>) -> &Self {
        self.set_field(&key(name, args), FieldValue::scalar(value))
    }

    /// Linked record, if the link points at a live record.
    pub fn get_linked_record(&self, name: &str, args: Option<&Variables>) -> Option<Self> {
        match self.get_field(&key(name, args))? {
            FieldValue::Link(id) => self.source.get(&id),
            _ => None,
        }
    }

    /// Points the field at `record`.
    pub fn set_linked_record(&self, record: &Self, name: &str, args: Option<&Variables>) -> &Self {
        self.set_field(&key(name, args), FieldValue::Link(record.id.clone()))
    }

    /// Linked record, created (with a client id) when absent.
    pub fn get_or_create_linked_record(
        &self,
        name: &str,
        typename: &str,
        args: Option<&Variables>,
    ) -> Result<Self, RuntimeError> {
        if let Some(existing) = self.get_linked_record(name, args) {
            return Ok(existing);
        }
        let storage_key = key(name, args);
        let id = crate::ident::generate_client_id(&self.id, &storage_key, None);
        let linked = match self.source.get(&id) {
            Some(existing) => existing,
            None => self.source.create(id, typename)?,
        };
        self.set_linked_record(&linked, name, args);
        Ok(linked)
    }

    /// Linked records; dangling or null items are `None`.
    pub fn get_linked_records(&self, name: &str, args: Option<&Variables>) -> Option<Vec<Option<Self>>> {
        match self.get_field(&key(name, args))? {
            FieldValue::LinkList(ids) => Some(
                ids.iter()
                    .map(|id| id.as_ref().and_then(|id| self.source.get(id)))
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Points the field at `records`.
    pub fn set_linked_records(
        &self,
        records: &[Option<&Self>],
        name: &str,
        args: Option<&Variables>,
    ) -> &Self {
        let ids = records
            .iter()
            .map(|record| record.map(|r| r.id.clone()))
            .collect();
        self.set_field(&key(name, args), FieldValue::LinkList(ids))
    }

    /// Marks this record stale as of the next publish.
    pub fn invalidate_record(&self) {
        self.source
            .invalidated_ids
            .borrow_mut()
            .insert(self.id.clone());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn base() -> RecordSource {
        let mut user = Record::new(DataId::from("4"), "User");
        user.set("name", FieldValue::scalar(json!("Zuck")));
        let mut root = Record::new(DataId::root(), ROOT_TYPE);
        root.set("me", FieldValue::Link(DataId::from("4")));
        [user, root].into_iter().collect()
    }

    #[test]
    fn writes_land_in_the_sink_only() {
        let base = base();
        let proxy = RecordSourceProxy::new(&base);
        let me = proxy.root().get_linked_record("me", None).unwrap();
        assert_eq!(me.get_value("name", None), Some(json!("Zuck")));
        me.set_value(json!("Mark"), "name", None);
        assert_eq!(me.get_value("name", None), Some(json!("Mark")));
        let output = proxy.into_output();
        let written = output.sink.get(&DataId::from("4")).unwrap();
        assert_eq!(written.typename(), "User");
        assert_eq!(written.field_count(), 1);
        assert_eq!(
            base.get(&DataId::from("4")).unwrap().get_value("name"),
            Some(json!("Zuck"))
        );
    }

    #[test]
    fn create_and_delete_follow_record_state() {
        let base = base();
        let proxy = RecordSourceProxy::new(&base);
        assert!(proxy.create(DataId::from("4"), "User").is_err());
        let friend = proxy.create(DataId::from("5"), "User").unwrap();
        proxy
            .root()
            .set_linked_records(&[Some(&friend), None], "friends", None);
        proxy.delete(&DataId::from("4")).unwrap();
        assert!(proxy.get(&DataId::from("4")).is_none());
        assert!(proxy.delete(&DataId::root()).is_err());
        let friends = proxy.root().get_linked_records("friends", None).unwrap();
        assert_eq!(friends.len(), 2);
        assert!(friends[1].is_none());
    }

    #[test]
    fn invalidation_is_collected() {
        let base = base();
        let proxy = RecordSourceProxy::new(&base);
        proxy.get(&DataId::from("4")).unwrap().invalidate_record();
        proxy.invalidate_store();
        let output = proxy.into_output();
        assert!(output.invalidated_ids.contains(&DataId::from("4")));
        assert!(output.invalidated_store);
    }
}
