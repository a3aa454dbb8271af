// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Normalizer: response payload + normalization tree -> record delta.
//!
//! The delta holds only fields present in the payload, so publishing it
//! merges into existing records without clobbering unrelated fields.
use std::fmt;
use std::rc::Rc;

use serde_json::{Map, Value};
use tracing::warn;

use crate::ast::{
    module_component_key, module_operation_key, response_key, NormalizationHandle,
    NormalizationLinkedField, NormalizationScalarField, NormalizationSelection,
};
use crate::error::RuntimeError;
use crate::handlers::HandleFieldPayload;
use crate::ident::{generate_client_id, DataId};
use crate::network::{path_key, PathSegment, RawPayload};
use crate::record::{FieldValue, Record};
use crate::record_source::{RecordSource, RecordSourceView};
use crate::selector::NormalizationSelector;
use crate::storage_key::{get_handle_storage_key, get_storage_key};
use crate::variables::{condition_value, get_argument_values, Variables};

/// Derives a record id from a response object and its typename.
pub type GetDataId = Rc<dyn Fn(&Map<String, Value>, &str) -> Option<DataId>>;

/// Default id strategy: the object's `id` field (string or number).
pub fn default_get_data_id() -> GetDataId {
    Rc::new(|object, _typename| match object.get("id")? {
        Value::String(id) => Some(DataId::new(id)),
        Value::Number(n) => Some(DataId::from(n.to_string())),
        _ => None,
    })
}

/// Normalization settings.
#[derive(Clone)]
pub struct NormalizeOptions {
    /// Record id strategy.
    pub get_data_id: GetDataId,
    /// Write `null` for selected fields the payload omits.
    pub treat_missing_fields_as_null: bool,
    /// Response path of the normalized object.
    pub path: Vec<PathSegment>,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            get_data_id: default_get_data_id(),
            treat_missing_fields_as_null: false,
            path: Vec::new(),
        }
    }
}

impl fmt::Debug for NormalizeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NormalizeOptions")
            .field("treat_missing_fields_as_null", &self.treat_missing_fields_as_null)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Pending `@defer` boundary found in an initial payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferPlaceholder {
    /// Boundary label.
    pub label: String,
    /// Path of the deferred object.
    pub path: Vec<PathSegment>,
    /// Record the deferred selections write to.
    pub data_id: DataId,
    /// Typename of that record.
    pub type_name: String,
    /// Deferred selections.
    pub selections: Vec<NormalizationSelection>,
    /// Variables in scope at the boundary.
    pub variables: Variables,
}

/// Pending `@stream` boundary found in an initial payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamPlaceholder {
    /// Boundary label.
    pub label: String,
    /// Path of the object holding the streamed list.
    pub path: Vec<PathSegment>,
    /// Record holding the streamed list.
    pub parent_id: DataId,
    /// Selections containing the streamed field.
    pub selections: Vec<NormalizationSelection>,
    /// Variables in scope at the boundary.
    pub variables: Variables,
}

/// Placeholder for data that arrives in a later incremental payload.
#[derive(Debug, Clone, PartialEq)]
pub enum IncrementalPlaceholder {
    /// `@defer`.
    Defer(DeferPlaceholder),
    /// `@stream`.
    Stream(StreamPlaceholder),
}

impl IncrementalPlaceholder {
    /// Boundary label.
    pub fn label(&self) -> &str {
        match self {
            Self::Defer(p) => &p.label,
            Self::Stream(p) => &p.label,
        }
    }

    /// Boundary path.
    pub fn path(&self) -> &[PathSegment] {
        match self {
            Self::Defer(p) => &p.path,
            Self::Stream(p) => &p.path,
        }
    }

    /// `(label, path)` key payloads are matched by.
    pub fn key(&self) -> (String, String) {
        (self.label().to_owned(), path_key(self.path()))
    }
}

/// `@module` payload whose split operation still has to be normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleImportPayload {
    /// Response object the module applies to.
    pub data: Map<String, Value>,
    /// Record the module data belongs to.
    pub data_id: DataId,
    /// Operation reference resolved through the operation loader.
    pub operation_reference: String,
    /// Response path of the object.
    pub path: Vec<PathSegment>,
    /// Typename of the record.
    pub type_name: String,
    /// Variables in scope.
    pub variables: Variables,
}

/// Output of one normalization pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizationResult {
    /// Record delta.
    pub source: RecordSource,
    /// Handle fields to run through the handler provider.
    pub field_payloads: Vec<HandleFieldPayload>,
    /// `@defer`/`@stream` boundaries awaiting incremental payloads.
    pub incremental_placeholders: Vec<IncrementalPlaceholder>,
    /// `@module` payloads awaiting their split operation.
    pub module_import_payloads: Vec<ModuleImportPayload>,
    /// True when the payload was marked final.
    pub is_final: bool,
}

/// Normalizes a full payload against `selector`.
///
/// A payload without `data` yields an empty delta.
pub fn normalize_response(
    payload: &RawPayload,
    selector: &NormalizationSelector,
    type_name: &str,
    options: &NormalizeOptions,
) -> Result<NormalizationResult, RuntimeError> {
    let empty = Map::new();
    let data = payload.data.as_ref().unwrap_or(&empty);
    let mut result = normalize_selections(
        &selector.data_id,
        type_name,
        selector.node.selections(),
        data,
        &selector.variables,
        options,
    )?;
    result.is_final = payload.is_final();
    Ok(result)
}

/// Normalizes `data` into the record `data_id` using `selections`.
pub fn normalize_selections(
    data_id: &DataId,
    type_name: &str,
    selections: &[NormalizationSelection],
    data: &Map<String, Value>,
    variables: &Variables,
    options: &NormalizeOptions,
) -> Result<NormalizationResult, RuntimeError> {
    let mut normalizer = Normalizer {
        sink: RecordSource::new(),
        variables,
        options,
        path: options.path.clone(),
        field_payloads: Vec::new(),
        placeholders: Vec::new(),
        module_payloads: Vec::new(),
        in_client_extension: false,
    };
    normalizer.sink.set(Record::new(data_id.clone(), type_name));
    normalizer.traverse_selections(selections, data_id, data)?;
    Ok(NormalizationResult {
        source: normalizer.sink,
        field_payloads: normalizer.field_payloads,
        incremental_placeholders: normalizer.placeholders,
        module_import_payloads: normalizer.module_payloads,
        is_final: false,
    })
}

/// Record typename for a linked response object.
pub(crate) fn linked_typename(
    concrete_type: Option<&str>,
    object: &Map<String, Value>,
    data_id_hint: &str,
    path: &[PathSegment],
) -> Result<String, RuntimeError> {
    if let Some(concrete) = concrete_type {
        return Ok(concrete.to_owned());
    }
    object
        .get("__typename")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| RuntimeError::MissingTypename {
            data_id: data_id_hint.to_owned(),
            path: path_key(path),
        })
}

struct Normalizer<'a> {
    sink: RecordSource,
    variables: &'a Variables,
    options: &'a NormalizeOptions,
    path: Vec<PathSegment>,
    field_payloads: Vec<HandleFieldPayload>,
    placeholders: Vec<IncrementalPlaceholder>,
    module_payloads: Vec<ModuleImportPayload>,
    in_client_extension: bool,
}

impl Normalizer<'_> {
    fn typename_of(&self, id: &DataId) -> String {
        self.sink
            .get(id)
            .map(|record| record.typename().to_owned())
            .unwrap_or_default()
    }

    fn set_field(&mut self, id: &DataId, key: String, value: FieldValue) {
        if let Some(record) = self.sink.get_mut(id) {
            record.set(key, value);
        }
    }

    /// Handles a selected field the payload omitted.
    fn missing_field(&mut self, id: &DataId, storage_key: String, response_key: &str) {
        if self.options.treat_missing_fields_as_null {
            self.set_field(id, storage_key, FieldValue::Null);
        } else if !self.in_client_extension {
            warn!(
                id = %id,
                field = response_key,
                path = %path_key(&self.path),
                "payload is missing a selected field"
            );
        }
    }

    fn is_enabled(&self, if_: Option<&String>) -> bool {
        // An unset variable keeps the boundary active; only `false` disables it.
        if_.is_none_or(|name| self.variables.get(name) != Some(&Value::Bool(false)))
    }

    fn traverse_selections(
        &mut self,
        selections: &[NormalizationSelection],
        id: &DataId,
        data: &Map<String, Value>,
    ) -> Result<(), RuntimeError> {
        for selection in selections {
            match selection {
                NormalizationSelection::ScalarField(field) => self.normalize_scalar(field, id, data)?,
                NormalizationSelection::LinkedField(field) => self.normalize_linked(field, id, data)?,
                NormalizationSelection::InlineFragment {
                    type_name,
                    selections,
                } => {
                    if self.typename_of(id) == *type_name {
                        self.traverse_selections(selections, id, data)?;
                    }
                }
                NormalizationSelection::Condition {
                    condition,
                    passing_value,
                    selections,
                } => {
                    if condition_value(self.variables, condition) == *passing_value {
                        self.traverse_selections(selections, id, data)?;
                    }
                }
                NormalizationSelection::Defer {
                    label,
                    if_,
                    selections,
                } => {
                    if self.is_enabled(if_.as_ref()) {
                        self.placeholders
                            .push(IncrementalPlaceholder::Defer(DeferPlaceholder {
                                label: label.clone(),
                                path: self.path.clone(),
                                data_id: id.clone(),
                                type_name: self.typename_of(id),
                                selections: selections.clone(),
                                variables: self.variables.clone(),
                            }));
                    } else {
                        self.traverse_selections(selections, id, data)?;
                    }
                }
                NormalizationSelection::Stream {
                    label,
                    if_,
                    selections,
                } => {
                    self.traverse_selections(selections, id, data)?;
                    if self.is_enabled(if_.as_ref()) {
                        self.placeholders
                            .push(IncrementalPlaceholder::Stream(StreamPlaceholder {
                                label: label.clone(),
                                path: self.path.clone(),
                                parent_id: id.clone(),
                                selections: selections.clone(),
                                variables: self.variables.clone(),
                            }));
                    }
                }
                NormalizationSelection::ModuleImport { document_name, .. } => {
                    self.normalize_module_import(document_name, id, data);
                }
                NormalizationSelection::ClientExtension { selections } => {
                    let was = self.in_client_extension;
                    self.in_client_extension = true;
                    let result = self.traverse_selections(selections, id, data);
                    self.in_client_extension = was;
                    result?;
                }
                NormalizationSelection::ScalarHandle(handle)
                | NormalizationSelection::LinkedHandle(handle) => {
                    self.record_handle(handle, id)?;
                }
            }
        }
        Ok(())
    }

    fn normalize_scalar(
        &mut self,
        field: &NormalizationScalarField,
        id: &DataId,
        data: &Map<String, Value>,
    ) -> Result<(), RuntimeError> {
        if field.name == "__typename" {
            return Ok(());
        }
        let key = response_key(&field.name, field.alias.as_deref());
        let storage_key = get_storage_key(
            &field.name,
            &field.args,
            field.storage_key.as_deref(),
            self.variables,
        )?;
        match data.get(key) {
            None => self.missing_field(id, storage_key, key),
            Some(value) => self.set_field(id, storage_key, FieldValue::scalar(value.clone())),
        }
        Ok(())
    }

    fn normalize_linked(
        &mut self,
        field: &NormalizationLinkedField,
        id: &DataId,
        data: &Map<String, Value>,
    ) -> Result<(), RuntimeError> {
        let key = response_key(&field.name, field.alias.as_deref());
        let storage_key = get_storage_key(
            &field.name,
            &field.args,
            field.storage_key.as_deref(),
            self.variables,
        )?;
        let value = match data.get(key) {
            None => {
                self.missing_field(id, storage_key, key);
                return Ok(());
            }
            Some(Value::Null) => {
                self.set_field(id, storage_key, FieldValue::Null);
                return Ok(());
            }
            Some(value) => value,
        };
        self.path.push(PathSegment::Key(key.to_owned()));
        let field_value = if field.plural {
            let Value::Array(items) = value else {
                return Err(RuntimeError::InvalidPayload(format!(
                    "expected a list for `{}` at `{}`",
                    key,
                    path_key(&self.path)
                )));
            };
            let mut ids = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                match item {
                    Value::Null => ids.push(None),
                    Value::Object(object) => {
                        self.path.push(PathSegment::Index(index));
                        let next =
                            self.normalize_linked_item(field, id, &storage_key, Some(index), object)?;
                        self.path.pop();
                        ids.push(Some(next));
                    }
                    _ => {
                        return Err(RuntimeError::InvalidPayload(format!(
                            "expected objects in `{}` at `{}`",
                            key,
                            path_key(&self.path)
                        )))
                    }
                }
            }
            FieldValue::LinkList(ids)
        } else {
            let Value::Object(object) = value else {
                return Err(RuntimeError::InvalidPayload(format!(
                    "expected an object for `{}` at `{}`",
                    key,
                    path_key(&self.path)
                )));
            };
            FieldValue::Link(self.normalize_linked_item(field, id, &storage_key, None, object)?)
        };
        self.path.pop();
        self.set_field(id, storage_key, field_value);
        Ok(())
    }

    fn normalize_linked_item(
        &mut self,
        field: &NormalizationLinkedField,
        parent: &DataId,
        storage_key: &str,
        index: Option<usize>,
        object: &Map<String, Value>,
    ) -> Result<DataId, RuntimeError> {
        let client_id = generate_client_id(parent, storage_key, index);
        let type_name =
            linked_typename(field.concrete_type.as_deref(), object, client_id.as_str(), &self.path)?;
        let next = (self.options.get_data_id)(object, &type_name).unwrap_or(client_id);
        match self.sink.get_mut(&next) {
            Some(existing) if existing.typename() != type_name => {
                warn!(id = %next, from = existing.typename(), to = %type_name, "record typename changed within one payload");
            }
            Some(_) => {}
            None => self.sink.set(Record::new(next.clone(), &type_name)),
        }
        self.traverse_selections(&field.selections, &next, object)?;
        Ok(next)
    }

    fn normalize_module_import(
        &mut self,
        document_name: &str,
        id: &DataId,
        data: &Map<String, Value>,
    ) {
        let component_key = module_component_key(document_name);
        let component = data.get(&component_key).cloned().unwrap_or(Value::Null);
        self.set_field(id, component_key, FieldValue::scalar(component));
        let operation_key = module_operation_key(document_name);
        let operation = data.get(&operation_key).cloned().unwrap_or(Value::Null);
        self.set_field(id, operation_key, FieldValue::scalar(operation.clone()));
        if let Value::String(reference) = operation {
            self.module_payloads.push(ModuleImportPayload {
                data: data.clone(),
                data_id: id.clone(),
                operation_reference: reference,
                path: self.path.clone(),
                type_name: self.typename_of(id),
                variables: self.variables.clone(),
            });
        }
    }

    fn record_handle(&mut self, handle: &NormalizationHandle, id: &DataId) -> Result<(), RuntimeError> {
        self.field_payloads.push(HandleFieldPayload {
            args: get_argument_values(&handle.args, self.variables)?,
            data_id: id.clone(),
            field_key: get_storage_key(&handle.name, &handle.args, None, self.variables)?,
            handle: handle.handle.clone(),
            handle_key: get_handle_storage_key(handle, self.variables)?,
            handle_args: get_argument_values(&handle.handle_args, self.variables)?,
        });
        Ok(())
    }
}
