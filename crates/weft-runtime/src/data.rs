// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Denormalized read results.
//!
//! `Data` trees are immutable and `Rc`-shared. [`Data::ptr_eq`] is the
//! identity test views use to skip re-rendering, and
//! [`recycle_nodes_into`] keeps previously returned sub-trees whenever the
//! new read is deep-equal, so unchanged data stays pointer-identical.
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde_json::{Map, Value};

use crate::ident::DataId;
use crate::selector::RequestDescriptor;
use crate::variables::Variables;

/// One node of a read result.
#[derive(Clone, PartialEq)]
pub enum Data {
    /// Known null.
    Null,
    /// Scalar leaf.
    Scalar(Value),
    /// List of items.
    List(Rc<Vec<Data>>),
    /// Object with fields and optional fragment/module references.
    Object(Rc<DataObject>),
}

/// Object node of a read result.
#[derive(Clone, Default, PartialEq)]
pub struct DataObject {
    /// Fields by response key.
    pub fields: BTreeMap<String, Data>,
    /// Fragments spread on this object, to be read by child views.
    pub fragment_ref: Option<FragmentRef>,
    /// `@module` reference, when the object carries one.
    pub module: Option<ModuleRef>,
}

/// Pointer from a parent's data to the fragments spread on a record.
#[derive(Clone)]
pub struct FragmentRef {
    /// Record the fragments read from.
    pub id: DataId,
    /// Spread fragments and the arguments passed to each.
    pub fragments: BTreeMap<String, Variables>,
    /// Request that produced the parent read.
    pub owner: Rc<RequestDescriptor>,
}

impl PartialEq for FragmentRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.fragments == other.fragments
            && self.owner.identifier == other.owner.identifier
    }
}

impl fmt::Debug for FragmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentRef")
            .field("id", &self.id)
            .field("fragments", &self.fragments.keys().collect::<Vec<_>>())
            .field("owner", &self.owner.identifier)
            .finish()
    }
}

/// Reference to a `@module` component and its fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleRef {
    /// Prop name the fragment is exposed under.
    pub fragment_prop_name: String,
    /// Fragment to read for the component.
    pub fragment_name: String,
    /// Component reference as sent by the server.
    pub component: Value,
}

impl Data {
    /// Wraps a finished object.
    pub fn object(object: DataObject) -> Self {
        Self::Object(Rc::new(object))
    }

    /// Wraps finished list items.
    pub fn list(items: Vec<Self>) -> Self {
        Self::List(Rc::new(items))
    }

    /// Identity comparison: `Rc` pointer equality for lists and objects,
    /// value equality for leaves.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Scalar(a), Self::Scalar(b)) => a == b,
            (Self::List(a), Self::List(b)) => Rc::ptr_eq(a, b),
            (Self::Object(a), Self::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// True for `Data::Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Field of an object node.
    pub fn get(&self, key: &str) -> Option<&Self> {
        match self {
            Self::Object(object) => object.fields.get(key),
            _ => None,
        }
    }

    /// Object payload, if this is an object.
    pub fn as_object(&self) -> Option<&DataObject> {
        match self {
            Self::Object(object) => Some(object),
            _ => None,
        }
    }

    /// List items, if this is a list.
    pub fn as_list(&self) -> Option<&[Self]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Scalar value, if this is a scalar.
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            Self::Scalar(value) => Some(value),
            _ => None,
        }
    }

    /// String scalar, if this is one.
    pub fn as_str(&self) -> Option<&str> {
        self.as_scalar().and_then(Value::as_str)
    }

    /// Plain JSON rendering; fragment references render as `__id` and
    /// `__fragments` (names only).
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Scalar(value) => value.clone(),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Object(object) => {
                let mut map = Map::new();
                for (key, value) in &object.fields {
                    map.insert(key.clone(), value.to_json());
                }
                if let Some(fragment_ref) = &object.fragment_ref {
                    map.insert("__id".into(), Value::from(fragment_ref.id.as_str()));
                    map.insert(
                        "__fragments".into(),
                        Value::Array(
                            fragment_ref
                                .fragments
                                .keys()
                                .map(|name| Value::from(name.as_str()))
                                .collect(),
                        ),
                    );
                }
                Value::Object(map)
            }
        }
    }
}

impl fmt::Debug for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl fmt::Debug for DataObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataObject")
            .field("fields", &self.fields)
            .field("fragment_ref", &self.fragment_ref)
            .field("module", &self.module)
            .finish()
    }
}

/// Reuses sub-trees of `prev` that are deep-equal to the matching parts of
/// `next`.
///
/// Returns `prev` itself (pointer-identical) when the trees are equal.
pub fn recycle_nodes_into(prev: &Data, next: Data) -> Data {
    if prev.ptr_eq(&next) {
        return prev.clone();
    }
    match (prev, next) {
        (Data::Object(prev_obj), Data::Object(next_obj)) => {
            let next_obj = Rc::unwrap_or_clone(next_obj);
            let mut all_reused = prev_obj.fields.len() == next_obj.fields.len()
                && prev_obj.fragment_ref == next_obj.fragment_ref
                && prev_obj.module == next_obj.module;
            let mut fields = BTreeMap::new();
            for (key, value) in next_obj.fields {
                let value = match prev_obj.fields.get(&key) {
                    Some(prev_value) => {
                        let recycled = recycle_nodes_into(prev_value, value);
                        all_reused &= recycled.ptr_eq(prev_value);
                        recycled
                    }
                    None => {
                        all_reused = false;
                        value
                    }
                };
                fields.insert(key, value);
            }
            if all_reused {
                Data::Object(Rc::clone(prev_obj))
            } else {
                Data::object(DataObject {
                    fields,
                    fragment_ref: next_obj.fragment_ref,
                    module: next_obj.module,
                })
            }
        }
        (Data::List(prev_items), Data::List(next_items)) => {
            let next_items = Rc::unwrap_or_clone(next_items);
            let mut all_reused = prev_items.len() == next_items.len();
            let mut items = Vec::with_capacity(next_items.len());
            for (i, item) in next_items.into_iter().enumerate() {
                let item = match prev_items.get(i) {
                    Some(prev_item) => {
                        let recycled = recycle_nodes_into(prev_item, item);
                        all_reused &= recycled.ptr_eq(prev_item);
                        recycled
                    }
                    None => {
                        all_reused = false;
                        item
                    }
                };
                items.push(item);
            }
            if all_reused {
                Data::List(Rc::clone(prev_items))
            } else {
                Data::list(items)
            }
        }
        (_, next) => next,
    }
}

/// [`recycle_nodes_into`] over optional roots.
pub fn recycle_optional(prev: Option<&Data>, next: Option<Data>) -> Option<Data> {
    match (prev, next) {
        (Some(prev), Some(next)) => Some(recycle_nodes_into(prev, next)),
        (_, next) => next,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn obj(fields: Vec<(&str, Data)>) -> Data {
        Data::object(DataObject {
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v))
                .collect(),
            ..DataObject::default()
        })
    }

    fn scalar(value: Value) -> Data {
        Data::Scalar(value)
    }

    #[test]
    fn equal_trees_recycle_to_the_previous_pointer() {
        let prev = obj(vec![
            ("name", scalar(json!("Zuck"))),
            ("friends", Data::list(vec![obj(vec![("id", scalar(json!("1")))])])),
        ]);
        let next = obj(vec![
            ("name", scalar(json!("Zuck"))),
            ("friends", Data::list(vec![obj(vec![("id", scalar(json!("1")))])])),
        ]);
        let out = recycle_nodes_into(&prev, next);
        assert!(out.ptr_eq(&prev));
    }

    #[test]
    fn unchanged_siblings_keep_identity_when_one_field_changes() {
        let friends = Data::list(vec![obj(vec![("id", scalar(json!("1")))])]);
        let prev = obj(vec![("name", scalar(json!("Zuck"))), ("friends", friends)]);
        let next = obj(vec![
            ("name", scalar(json!("Mark"))),
            ("friends", Data::list(vec![obj(vec![("id", scalar(json!("1")))])])),
        ]);
        let out = recycle_nodes_into(&prev, next);
        assert!(!out.ptr_eq(&prev));
        assert!(out
            .get("friends")
            .unwrap()
            .ptr_eq(prev.get("friends").unwrap()));
        assert_eq!(out.get("name").unwrap().as_str(), Some("Mark"));
    }

    #[test]
    fn shorter_lists_are_not_recycled() {
        let prev = Data::list(vec![scalar(json!(1)), scalar(json!(2))]);
        let next = Data::list(vec![scalar(json!(1))]);
        let out = recycle_nodes_into(&prev, next);
        assert!(!out.ptr_eq(&prev));
        assert_eq!(out.as_list().unwrap().len(), 1);
    }
}
