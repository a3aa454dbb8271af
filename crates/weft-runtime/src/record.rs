// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Flat, typed records.
use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::{Map, Value};
use tracing::warn;

use crate::ident::DataId;

/// Value stored under one field storage key.
///
/// Absence of a key (never fetched) is modelled by the record map returning
/// `None`; `FieldValue::Null` is a known null.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Known null.
    Null,
    /// Scalar value; never `Value::Null`, see [`FieldValue::scalar`].
    Scalar(Value),
    /// List of scalars.
    ScalarList(Vec<Value>),
    /// Reference to another record.
    Link(DataId),
    /// List of references; `None` entries are null items.
    LinkList(Vec<Option<DataId>>),
}

impl FieldValue {
    /// Builds a scalar field value; JSON `null` becomes [`FieldValue::Null`]
    /// and arrays become [`FieldValue::ScalarList`].
    pub fn scalar(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Array(items) => Self::ScalarList(items),
            other => Self::Scalar(other),
        }
    }

    /// Returns the linked id for `Link` values.
    pub fn as_link(&self) -> Option<&DataId> {
        match self {
            Self::Link(id) => Some(id),
            _ => None,
        }
    }

    /// Returns the linked ids for `LinkList` values.
    pub fn as_link_list(&self) -> Option<&[Option<DataId>]> {
        match self {
            Self::LinkList(ids) => Some(ids),
            _ => None,
        }
    }

    /// JSON rendering used by [`Record::to_json`].
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Scalar(value) => value.clone(),
            Self::ScalarList(items) => Value::Array(items.clone()),
            Self::Link(id) => serde_json::json!({ "__ref": id.as_str() }),
            Self::LinkList(ids) => serde_json::json!({
                "__refs": ids
                    .iter()
                    .map(|id| id.as_ref().map_or(Value::Null, |id| Value::from(id.as_str())))
                    .collect::<Vec<_>>()
            }),
        }
    }
}

/// One normalized graph node.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    id: DataId,
    typename: Rc<str>,
    fields: BTreeMap<String, FieldValue>,
    invalidated_at: Option<u64>,
}

impl Record {
    /// Creates an empty record.
    pub fn new(id: DataId, typename: impl AsRef<str>) -> Self {
        Self {
            id,
            typename: Rc::from(typename.as_ref()),
            fields: BTreeMap::new(),
            invalidated_at: None,
        }
    }

    /// Record id.
    pub fn id(&self) -> &DataId {
        &self.id
    }

    /// Record typename.
    pub fn typename(&self) -> &str {
        &self.typename
    }

    /// Field lookup: `None` means absent.
    pub fn get(&self, storage_key: &str) -> Option<&FieldValue> {
        self.fields.get(storage_key)
    }

    /// Scalar lookup: `Some(Value::Null)` for known null, `None` when absent
    /// or not a scalar.
    pub fn get_value(&self, storage_key: &str) -> Option<Value> {
        match self.fields.get(storage_key)? {
            FieldValue::Null => Some(Value::Null),
            FieldValue::Scalar(v) => Some(v.clone()),
            FieldValue::ScalarList(items) => Some(Value::Array(items.clone())),
            FieldValue::Link(_) | FieldValue::LinkList(_) => None,
        }
    }

    /// True when the field has been fetched (including known null).
    pub fn has(&self, storage_key: &str) -> bool {
        self.fields.contains_key(storage_key)
    }

    /// Sets a field.
    pub fn set(&mut self, storage_key: impl Into<String>, value: FieldValue) {
        self.fields.insert(storage_key.into(), value);
    }

    /// Forgets a field, making it absent again.
    pub fn remove(&mut self, storage_key: &str) -> Option<FieldValue> {
        self.fields.remove(storage_key)
    }

    /// Iterates fields in storage-key order.
    pub fn fields(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.fields.iter()
    }

    /// Number of stored fields.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Write epoch at which the record was invalidated, if ever.
    pub fn invalidated_at(&self) -> Option<u64> {
        self.invalidated_at
    }

    /// Marks the record invalid as of `epoch`.
    pub fn set_invalidated_at(&mut self, epoch: u64) {
        self.invalidated_at = Some(epoch);
    }

    /// Field-level merge: fields present in `incoming` overwrite, absent
    /// fields are left untouched.
    ///
    /// A typename change is logged and the incoming typename wins.
    pub fn update(&self, incoming: &Self) -> Self {
        let mut next = self.clone();
        if incoming.typename != self.typename {
            warn!(
                id = %self.id,
                from = %self.typename,
                to = %incoming.typename,
                "record typename changed"
            );
            next.typename = Rc::clone(&incoming.typename);
        }
        for (key, value) in &incoming.fields {
            next.fields.insert(key.clone(), value.clone());
        }
        if incoming.invalidated_at.is_some() {
            next.invalidated_at = incoming.invalidated_at;
        }
        next
    }

    /// True when merging `incoming` into `self` would not change anything.
    pub fn is_superset_of(&self, incoming: &Self) -> bool {
        self.typename == incoming.typename
            && (incoming.invalidated_at.is_none() || incoming.invalidated_at == self.invalidated_at)
            && incoming
                .fields
                .iter()
                .all(|(k, v)| self.fields.get(k) == Some(v))
    }

    /// JSON rendering with `__id` and `__typename` keys.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("__id".into(), Value::from(self.id.as_str()));
        map.insert("__typename".into(), Value::from(&*self.typename));
        if let Some(epoch) = self.invalidated_at {
            map.insert("__invalidated_at".into(), Value::from(epoch));
        }
        for (key, value) in &self.fields {
            map.insert(key.clone(), value.to_json());
        }
        Value::Object(map)
    }
}
