// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! GC mark phase: collects every id reachable from a root selector.
use std::collections::BTreeSet;

use serde_json::Value;

use crate::ast::{module_operation_key, NormalizationHandle, NormalizationSelection};
use crate::error::RuntimeError;
use crate::ident::DataId;
use crate::loader::OperationLoader;
use crate::record::{FieldValue, Record};
use crate::record_source::RecordSourceView;
use crate::selector::NormalizationSelector;
use crate::storage_key::{get_handle_storage_key, get_storage_key};
use crate::variables::{condition_value, Variables};

/// Adds every id reachable from `selector` to `references`.
///
/// Unknown ids are still marked so a record arriving later for a retained
/// root is not swept.
pub fn mark(
    view: &dyn RecordSourceView,
    selector: &NormalizationSelector,
    references: &mut BTreeSet<DataId>,
    loader: Option<&dyn OperationLoader>,
) -> Result<(), RuntimeError> {
    let mut marker = ReferenceMarker {
        view,
        variables: &selector.variables,
        references,
        loader,
    };
    marker.traverse(selector.node.selections(), &selector.data_id)
}

struct ReferenceMarker<'m> {
    view: &'m dyn RecordSourceView,
    variables: &'m Variables,
    references: &'m mut BTreeSet<DataId>,
    loader: Option<&'m dyn OperationLoader>,
}

impl ReferenceMarker<'_> {
    fn traverse(&mut self, selections: &[NormalizationSelection], id: &DataId) -> Result<(), RuntimeError> {
        // Walks are bounded by the selection tree, so cycles in the graph
        // terminate without a visited check.
        self.references.insert(id.clone());
        let view = self.view;
        match view.get(id) {
            Some(record) => self.traverse_selections(selections, record),
            None => Ok(()),
        }
    }

    fn traverse_selections(
        &mut self,
        selections: &[NormalizationSelection],
        record: &Record,
    ) -> Result<(), RuntimeError> {
        for selection in selections {
            match selection {
                NormalizationSelection::ScalarField(_) | NormalizationSelection::ScalarHandle(_) => {}
                NormalizationSelection::LinkedField(field) => {
                    let key = get_storage_key(
                        &field.name,
                        &field.args,
                        field.storage_key.as_deref(),
                        self.variables,
                    )?;
                    self.follow(record.get(&key), &field.selections)?;
                }
                NormalizationSelection::LinkedHandle(handle) => {
                    self.mark_linked_handle(handle, selections, record)?;
                }
                NormalizationSelection::InlineFragment {
                    type_name,
                    selections,
                } => {
                    if record.typename() == type_name {
                        self.traverse_selections(selections, record)?;
                    }
                }
                NormalizationSelection::Condition {
                    condition,
                    passing_value,
                    selections,
                } => {
                    if condition_value(self.variables, condition) == *passing_value {
                        self.traverse_selections(selections, record)?;
                    }
                }
                NormalizationSelection::Defer { selections, .. }
                | NormalizationSelection::Stream { selections, .. }
                | NormalizationSelection::ClientExtension { selections } => {
                    self.traverse_selections(selections, record)?;
                }
                NormalizationSelection::ModuleImport { document_name, .. } => {
                    let reference = record.get_value(&module_operation_key(document_name));
                    if let (Some(Value::String(reference)), Some(loader)) = (reference, self.loader) {
                        if let Some(operation) = loader.get(&reference) {
                            self.traverse_selections(&operation.selections, record)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn follow(
        &mut self,
        value: Option<&FieldValue>,
        selections: &[NormalizationSelection],
    ) -> Result<(), RuntimeError> {
        match value {
            Some(FieldValue::Link(next)) => self.traverse(selections, next),
            Some(FieldValue::LinkList(ids)) => {
                for next in ids.iter().flatten() {
                    self.traverse(selections, next)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn mark_linked_handle(
        &mut self,
        handle: &NormalizationHandle,
        siblings: &[NormalizationSelection],
        record: &Record,
    ) -> Result<(), RuntimeError> {
        let key = get_handle_storage_key(handle, self.variables)?;
        let selections = siblings
            .iter()
            .find_map(|selection| match selection {
                NormalizationSelection::LinkedField(field)
                    if field.name == handle.name && field.alias == handle.alias =>
                {
                    Some(field.selections.as_slice())
                }
                _ => None,
            })
            .unwrap_or_default();
        self.follow(record.get(&key), selections)
    }
}
