// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Availability check: can a normalization selector be fulfilled from the
//! store without a network request?
use std::rc::Rc;

use serde_json::Value;

use crate::ast::{
    module_operation_key, NormalizationHandle, NormalizationLinkedField, NormalizationScalarField,
    NormalizationSelection,
};
use crate::error::RuntimeError;
use crate::ident::DataId;
use crate::loader::OperationLoader;
use crate::mutator::{RecordProxy, RecordSourceProxy};
use crate::record::FieldValue;
use crate::record_source::{RecordSource, RecordSourceView, RecordState};
use crate::selector::NormalizationSelector;
use crate::storage_key::{get_handle_storage_key, get_storage_key};
use crate::variables::{condition_value, get_argument_values, Variables};

/// Resolves fields absent from a record out of data already in the store,
/// e.g. `node(id:)` pointing at a record fetched by another query.
///
/// Each method returns `None` when it cannot help.
pub trait MissingFieldHandler {
    /// Value for an absent scalar field.
    fn scalar(
        &self,
        _field: &NormalizationScalarField,
        _record: &RecordProxy<'_, '_>,
        _args: &Variables,
        _store: &RecordSourceProxy<'_>,
    ) -> Option<Value> {
        None
    }

    /// Target for an absent linked field; `Some(None)` means known null.
    fn linked(
        &self,
        _field: &NormalizationLinkedField,
        _record: &RecordProxy<'_, '_>,
        _args: &Variables,
        _store: &RecordSourceProxy<'_>,
    ) -> Option<Option<DataId>> {
        None
    }

    /// Targets for an absent plural linked field.
    fn plural_linked(
        &self,
        _field: &NormalizationLinkedField,
        _record: &RecordProxy<'_, '_>,
        _args: &Variables,
        _store: &RecordSourceProxy<'_>,
    ) -> Option<Vec<Option<DataId>>> {
        None
    }
}

/// Whether the checked tree is fully present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// Every selected field is present.
    Available,
    /// Something is absent.
    Missing,
}

/// Result of [`check`].
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    /// Availability of the tree.
    pub status: Availability,
    /// Highest invalidation epoch seen on a reachable record.
    pub most_recent_invalidation: Option<u64>,
    /// Values synthesized by missing field handlers, to be written back.
    pub sink: RecordSource,
}

/// Checks `selector` against `view`.
pub fn check(
    view: &dyn RecordSourceView,
    selector: &NormalizationSelector,
    handlers: &[Rc<dyn MissingFieldHandler>],
    loader: Option<&dyn OperationLoader>,
) -> Result<CheckOutcome, RuntimeError> {
    let proxy = RecordSourceProxy::new(view);
    let mut checker = DataChecker {
        proxy: &proxy,
        handlers,
        loader,
        variables: &selector.variables,
        missing: false,
        most_recent_invalidation: None,
    };
    checker.traverse(selector.node.selections(), &selector.data_id)?;
    let status = if checker.missing {
        Availability::Missing
    } else {
        Availability::Available
    };
    let most_recent_invalidation = checker.most_recent_invalidation;
    Ok(CheckOutcome {
        status,
        most_recent_invalidation,
        sink: proxy.into_output().sink,
    })
}

struct DataChecker<'c, 'a> {
    proxy: &'c RecordSourceProxy<'a>,
    handlers: &'c [Rc<dyn MissingFieldHandler>],
    loader: Option<&'c dyn OperationLoader>,
    variables: &'c Variables,
    missing: bool,
    most_recent_invalidation: Option<u64>,
}

impl DataChecker<'_, '_> {
    fn traverse(&mut self, selections: &[NormalizationSelection], id: &DataId) -> Result<(), RuntimeError> {
        match self.proxy.status(id) {
            RecordState::Unknown => {
                self.missing = true;
                return Ok(());
            }
            RecordState::Nonexistent => return Ok(()),
            RecordState::Existent => {}
        }
        if let Some(epoch) = self.proxy.invalidated_at(id) {
            self.most_recent_invalidation = self.most_recent_invalidation.max(Some(epoch));
        }
        self.traverse_selections(selections, id)
    }

    fn traverse_selections(
        &mut self,
        selections: &[NormalizationSelection],
        id: &DataId,
    ) -> Result<(), RuntimeError> {
        let Some(record) = self.proxy.get(id) else {
            return Ok(());
        };
        for selection in selections {
            match selection {
                NormalizationSelection::ScalarField(field) => self.check_scalar(field, &record)?,
                NormalizationSelection::LinkedField(field) => self.check_linked(field, &record)?,
                NormalizationSelection::InlineFragment {
                    type_name,
                    selections,
                } => {
                    if record.get_type() == *type_name {
                        self.traverse_selections(selections, id)?;
                    }
                }
                NormalizationSelection::Condition {
                    condition,
                    passing_value,
                    selections,
                } => {
                    if condition_value(self.variables, condition) == *passing_value {
                        self.traverse_selections(selections, id)?;
                    }
                }
                NormalizationSelection::Defer { selections, .. }
                | NormalizationSelection::Stream { selections, .. } => {
                    self.traverse_selections(selections, id)?;
                }
                NormalizationSelection::ModuleImport { document_name, .. } => {
                    self.check_module_import(document_name, &record, id)?;
                }
                NormalizationSelection::ClientExtension { selections } => {
                    let was_missing = self.missing;
                    self.traverse_selections(selections, id)?;
                    self.missing = was_missing;
                }
                NormalizationSelection::ScalarHandle(handle) => {
                    let key = get_handle_storage_key(handle, self.variables)?;
                    if record.get_field(&key).is_none() {
                        self.missing = true;
                    }
                }
                NormalizationSelection::LinkedHandle(handle) => {
                    self.check_linked_handle(handle, selections, &record)?;
                }
            }
        }
        Ok(())
    }

    fn check_scalar(
        &mut self,
        field: &NormalizationScalarField,
        record: &RecordProxy<'_, '_>,
    ) -> Result<(), RuntimeError> {
        if field.name == "__typename" {
            return Ok(());
        }
        let key = get_storage_key(&field.name, &field.args, field.storage_key.as_deref(), self.variables)?;
        if record.get_field(&key).is_some() {
            return Ok(());
        }
        let args = get_argument_values(&field.args, self.variables)?;
        let resolved = self
            .handlers
            .iter()
            .find_map(|handler| handler.scalar(field, record, &args, self.proxy));
        match resolved {
            Some(value) => {
                record.set_field(&key, FieldValue::scalar(value));
            }
            None => self.missing = true,
        }
        Ok(())
    }

    fn check_linked(
        &mut self,
        field: &NormalizationLinkedField,
        record: &RecordProxy<'_, '_>,
    ) -> Result<(), RuntimeError> {
        let key = get_storage_key(&field.name, &field.args, field.storage_key.as_deref(), self.variables)?;
        let value = match record.get_field(&key) {
            Some(value) => Some(value),
            None => self.resolve_missing_link(field, record, &key)?,
        };
        match value {
            None => self.missing = true,
            Some(value) => self.check_link_value(&value, &field.selections)?,
        }
        Ok(())
    }

    fn resolve_missing_link(
        &self,
        field: &NormalizationLinkedField,
        record: &RecordProxy<'_, '_>,
        key: &str,
    ) -> Result<Option<FieldValue>, RuntimeError> {
        let args = get_argument_values(&field.args, self.variables)?;
        let resolved = if field.plural {
            self.handlers
                .iter()
                .find_map(|handler| handler.plural_linked(field, record, &args, self.proxy))
                .map(FieldValue::LinkList)
        } else {
            self.handlers
                .iter()
                .find_map(|handler| handler.linked(field, record, &args, self.proxy))
                .map(|target| target.map_or(FieldValue::Null, FieldValue::Link))
        };
        if let Some(value) = &resolved {
            record.set_field(key, value.clone());
        }
        Ok(resolved)
    }

    fn check_link_value(
        &mut self,
        value: &FieldValue,
        selections: &[NormalizationSelection],
    ) -> Result<(), RuntimeError> {
        match value {
            FieldValue::Link(next) => self.traverse(selections, next),
            FieldValue::LinkList(ids) => {
                for next in ids.iter().flatten() {
                    self.traverse(selections, next)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn check_linked_handle(
        &mut self,
        handle: &NormalizationHandle,
        siblings: &[NormalizationSelection],
        record: &RecordProxy<'_, '_>,
    ) -> Result<(), RuntimeError> {
        let key = get_handle_storage_key(handle, self.variables)?;
        let source_field = siblings.iter().find_map(|selection| match selection {
            NormalizationSelection::LinkedField(field)
                if field.name == handle.name && field.alias == handle.alias =>
            {
                Some(field)
            }
            _ => None,
        });
        match (record.get_field(&key), source_field) {
            (None, _) => self.missing = true,
            (Some(value), Some(field)) => self.check_link_value(&value, &field.selections)?,
            (Some(_), None) => {}
        }
        Ok(())
    }

    fn check_module_import(
        &mut self,
        document_name: &str,
        record: &RecordProxy<'_, '_>,
        id: &DataId,
    ) -> Result<(), RuntimeError> {
        let reference = match record.get_field(&module_operation_key(document_name)) {
            None => {
                self.missing = true;
                return Ok(());
            }
            Some(FieldValue::Scalar(Value::String(reference))) => reference,
            Some(_) => return Ok(()),
        };
        match self.loader.and_then(|loader| loader.get(&reference)) {
            Some(operation) => self.traverse_selections(&operation.selections, id),
            None => {
                self.missing = true;
                Ok(())
            }
        }
    }
}
