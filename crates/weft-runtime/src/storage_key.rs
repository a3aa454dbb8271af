// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Field storage keys.
//!
//! A field is stored under `name` when it has no (non-null) arguments and
//! under `name(arg:json,...)` otherwise, arguments sorted by name. Handle
//! fields live under `__<key>_<handle>` plus their filtered arguments.
use serde_json::Value;

use crate::ast::{Argument, NormalizationHandle};
use crate::error::RuntimeError;
use crate::ident::canonical_json;
use crate::variables::{get_argument_values, Variables};

/// Formats a storage key from a field name and resolved argument values.
///
/// `null` arguments are dropped.
pub fn format_storage_key(name: &str, args: &Variables) -> String {
    let mut pairs: Vec<(&String, &Value)> = args.iter().filter(|(_, v)| !v.is_null()).collect();
    if pairs.is_empty() {
        return name.to_owned();
    }
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    let mut key = String::with_capacity(name.len() + 16 * pairs.len());
    key.push_str(name);
    key.push('(');
    for (i, (arg, value)) in pairs.into_iter().enumerate() {
        if i > 0 {
            key.push(',');
        }
        key.push_str(arg);
        key.push(':');
        key.push_str(&canonical_json(value));
    }
    key.push(')');
    key
}

/// Storage key of a field, resolving variable arguments.
///
/// A precomputed key is used as-is when present.
pub fn get_storage_key(
    name: &str,
    args: &[Argument],
    static_key: Option<&str>,
    variables: &Variables,
) -> Result<String, RuntimeError> {
    if let Some(key) = static_key {
        return Ok(key.to_owned());
    }
    if args.is_empty() {
        return Ok(name.to_owned());
    }
    let values = get_argument_values(args, variables)?;
    Ok(format_storage_key(name, &values))
}

/// Field name under which a handler writes its output.
pub fn get_handle_key(handle: &str, key: &str, field_name: &str) -> String {
    if key.is_empty() {
        format!("__{field_name}_{handle}")
    } else {
        format!("__{key}_{handle}")
    }
}

/// Storage key of a handle field, keeping only filtered arguments.
pub fn get_handle_storage_key(
    handle: &NormalizationHandle,
    variables: &Variables,
) -> Result<String, RuntimeError> {
    let name = get_handle_key(&handle.handle, &handle.key, &handle.name);
    let Some(filters) = &handle.filters else {
        return Ok(name);
    };
    let kept: Vec<Argument> = handle
        .args
        .iter()
        .filter(|arg| filters.iter().any(|f| f == arg.name()))
        .cloned()
        .collect();
    let values = get_argument_values(&kept, variables)?;
    Ok(format_storage_key(&name, &values))
}
