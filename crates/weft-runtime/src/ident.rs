// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Identifier and hashing utilities.
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use blake3::Hasher;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::variables::Variables;

/// Canonical 256-bit hash used for request identity.
pub type Hash = [u8; 32];

/// Well-known id of the root record every query starts from.
pub const ROOT_ID: &str = "client:root";

/// Typename of the root record.
pub const ROOT_TYPE: &str = "__Root";

/// Prefix shared by every id minted on the client.
pub const CLIENT_ID_PREFIX: &str = "client:";

/// Opaque identifier of one normalized graph node.
///
/// Server ids are taken from the payload (`id` by default); client ids are
/// derived from the parent record and field storage key so that the same
/// path always produces the same id.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataId(Rc<str>);

impl DataId {
    /// Wraps a string as a data id.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Rc::from(id.as_ref()))
    }

    /// Returns the root record id.
    pub fn root() -> Self {
        Self::new(ROOT_ID)
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for ids minted on the client rather than by the server.
    pub fn is_client_id(&self) -> bool {
        self.0.starts_with(CLIENT_ID_PREFIX)
    }
}

impl fmt::Debug for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataId({:?})", &*self.0)
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DataId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DataId {
    fn from(id: String) -> Self {
        Self(Rc::from(id))
    }
}

impl AsRef<str> for DataId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derives a stable client id for a linked field without a server id.
///
/// `client:<parent>:<storageKey>` for singular fields and
/// `client:<parent>:<storageKey>:<index>` for list items. When the parent is
/// itself a client id its prefix is not repeated.
pub fn generate_client_id(parent: &DataId, storage_key: &str, index: Option<usize>) -> DataId {
    let mut id = String::with_capacity(parent.as_str().len() + storage_key.len() + 16);
    if !parent.is_client_id() {
        id.push_str(CLIENT_ID_PREFIX);
    }
    id.push_str(parent.as_str());
    id.push(':');
    id.push_str(storage_key);
    if let Some(index) = index {
        id.push(':');
        id.push_str(&index.to_string());
    }
    DataId::from(id)
}

thread_local! {
    static LOCAL_ID_COUNTER: Cell<u64> = const { Cell::new(0) };
}

/// Mints a fresh client id (`client:local:<n>`), unique per thread.
pub fn generate_unique_client_id() -> DataId {
    let n = LOCAL_ID_COUNTER.with(|counter| {
        let n = counter.get() + 1;
        counter.set(n);
        n
    });
    DataId::from(format!("{CLIENT_ID_PREFIX}local:{n}"))
}

/// Identity of a request: request id (or name) plus its variables.
///
/// Two operation descriptors with the same identifier read and write the same
/// data and are deduplicated by the store's root table and the request cache.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestIdentifier(pub Hash);

impl RequestIdentifier {
    /// Returns the canonical byte representation of this id.
    #[must_use]
    pub fn as_bytes(&self) -> &Hash {
        &self.0
    }

    /// Returns the first eight bytes, hex encoded, for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for RequestIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestIdentifier({})", self.short())
    }
}

impl fmt::Display for RequestIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Produces a domain-separated request identifier (prefix `b"request:"`)
/// over the request key and canonical variables, using BLAKE3.
pub fn make_request_identifier(request_key: &str, variables: &Variables) -> RequestIdentifier {
    let mut hasher = Hasher::new();
    hasher.update(b"request:");
    hasher.update(&(request_key.len() as u64).to_le_bytes());
    hasher.update(request_key.as_bytes());
    hasher.update(canonical_json(&Value::Object(variables.clone())).as_bytes());
    RequestIdentifier(hasher.finalize().into())
}

/// Serializes `value` with object keys sorted at every level.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn client_ids_are_path_derived() {
        let parent = DataId::from("4");
        assert_eq!(
            generate_client_id(&parent, "friends(first:10)", Some(2)).as_str(),
            "client:4:friends(first:10):2"
        );
        let root = DataId::root();
        assert_eq!(
            generate_client_id(&root, "viewer", None).as_str(),
            "client:root:viewer"
        );
    }

    #[test]
    fn unique_client_ids_do_not_repeat() {
        let a = generate_unique_client_id();
        let b = generate_unique_client_id();
        assert_ne!(a, b);
        assert!(a.is_client_id());
    }

    #[test]
    fn request_identifier_ignores_variable_key_order() {
        let mut a = Variables::new();
        a.insert("b".into(), json!(1));
        a.insert("a".into(), json!({"y": 1, "x": 2}));
        let mut b = Variables::new();
        b.insert("a".into(), json!({"x": 2, "y": 1}));
        b.insert("b".into(), json!(1));
        assert_eq!(
            make_request_identifier("Q", &a),
            make_request_identifier("Q", &b)
        );
        assert_ne!(
            make_request_identifier("Q", &a),
            make_request_identifier("R", &a)
        );
    }
}
