// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Field handlers: client-side post-processing of normalized fields.
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::error::RuntimeError;
use crate::ident::DataId;
use crate::mutator::RecordSourceProxy;
use crate::variables::Variables;

/// One handle occurrence found while normalizing a payload.
#[derive(Debug, Clone, PartialEq)]
pub struct HandleFieldPayload {
    /// Field arguments, resolved.
    pub args: Variables,
    /// Record holding the field.
    pub data_id: DataId,
    /// Storage key of the server field.
    pub field_key: String,
    /// Handler name.
    pub handle: String,
    /// Storage key the handler should write to.
    pub handle_key: String,
    /// Handler-only arguments, resolved.
    pub handle_args: Variables,
}

/// Post-processing step run after a payload is normalized.
///
/// Handlers may only write through the proxy and must tolerate missing
/// optional data.
pub trait Handler {
    /// Applies the handler for one field occurrence.
    fn update(
        &self,
        store: &RecordSourceProxy<'_>,
        payload: &HandleFieldPayload,
    ) -> Result<(), RuntimeError>;
}

/// Resolves handler names.
pub trait HandlerProvider {
    /// Handler registered under `handle`.
    fn get(&self, handle: &str) -> Option<Rc<dyn Handler>>;
}

/// Map-backed [`HandlerProvider`].
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Rc<dyn Handler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`.
    pub fn with(mut self, name: impl Into<String>, handler: Rc<dyn Handler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

impl HandlerProvider for HandlerRegistry {
    fn get(&self, handle: &str) -> Option<Rc<dyn Handler>> {
        self.handlers.get(handle).cloned()
    }
}

/// Copies the server field into the handle key unchanged.
///
/// Useful as a default for handles whose client shape matches the server
/// shape until a richer handler is installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyFieldHandler;

impl Handler for CopyFieldHandler {
    fn update(
        &self,
        store: &RecordSourceProxy<'_>,
        payload: &HandleFieldPayload,
    ) -> Result<(), RuntimeError> {
        let Some(record) = store.get(&payload.data_id) else {
            return Ok(());
        };
        record.copy_field(&payload.field_key, &payload.handle_key);
        Ok(())
    }
}

/// Applies every field payload through `provider`.
///
/// A payload naming an unregistered handler is an error.
pub fn apply_field_payloads(
    provider: Option<&dyn HandlerProvider>,
    store: &RecordSourceProxy<'_>,
    payloads: &[HandleFieldPayload],
) -> Result<(), RuntimeError> {
    for payload in payloads {
        let handler = provider.and_then(|p| p.get(&payload.handle)).ok_or_else(|| {
            RuntimeError::Invariant(format!("no handler registered for `{}`", payload.handle))
        })?;
        handler.update(store, payload)?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::record::{FieldValue, Record};
    use crate::record_source::RecordSource;

    fn source() -> RecordSource {
        let mut user = Record::new(DataId::from("4"), "User");
        user.set("name", FieldValue::scalar(json!("Zuck")));
        [user].into_iter().collect()
    }

    fn payload(handle: &str) -> HandleFieldPayload {
        HandleFieldPayload {
            args: Variables::new(),
            data_id: DataId::from("4"),
            field_key: "name".into(),
            handle: handle.into(),
            handle_key: "__name_upper".into(),
            handle_args: Variables::new(),
        }
    }

    #[test]
    fn registered_handlers_write_through_the_proxy() {
        let base = source();
        let proxy = RecordSourceProxy::new(&base);
        let registry = HandlerRegistry::new().with("copy", Rc::new(CopyFieldHandler));
        apply_field_payloads(Some(&registry), &proxy, &[payload("copy")]).unwrap();
        let user = proxy.get(&DataId::from("4")).unwrap();
        assert_eq!(user.get_value("__name_upper", None), Some(json!("Zuck")));
    }

    #[test]
    fn unknown_handles_are_invariant_errors() {
        let base = source();
        let proxy = RecordSourceProxy::new(&base);
        let registry = HandlerRegistry::new();
        let err = apply_field_payloads(Some(&registry), &proxy, &[payload("connection")])
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Invariant(message) if message.contains("connection")));
        assert!(apply_field_payloads(None, &proxy, &[payload("copy")]).is_err());
    }

    #[test]
    fn copy_handler_skips_missing_records() {
        let base = RecordSource::new();
        let proxy = RecordSourceProxy::new(&base);
        CopyFieldHandler.update(&proxy, &payload("copy")).unwrap();
        assert!(proxy.get(&DataId::from("4")).is_none());
    }
}
