// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Reader: selector + record source -> [`Snapshot`].
//!
//! Reads are pure. Every record visited is recorded in `seen_records` so the
//! store can tell which subscriptions a write may affect.
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use tracing::warn;

use crate::ast::{
    module_component_key, response_key, ReaderLinkedField, ReaderScalarField, ReaderSelection,
    RequiredFieldAction,
};
use crate::data::{Data, DataObject, FragmentRef, ModuleRef};
use crate::error::RuntimeError;
use crate::ident::DataId;
use crate::record::{FieldValue, Record};
use crate::record_source::{RecordEntry, RecordSourceView};
use crate::selector::{RequestDescriptor, SingularReaderSelector};
use crate::snapshot::{MissingRequiredField, MissingRequiredFields, Snapshot};
use crate::storage_key::get_storage_key;
use crate::variables::{condition_value, get_argument_values, Variables};

/// Reads `selector` from `source`.
pub fn read(
    source: &dyn RecordSourceView,
    selector: &SingularReaderSelector,
) -> Result<Snapshot, RuntimeError> {
    let mut reader = Reader {
        source,
        variables: &selector.variables,
        owner: &selector.owner,
        fragment_name: &selector.node.name,
        seen: BTreeSet::new(),
        is_missing_data: false,
        missing_required: None,
    };
    let data = reader.traverse(&selector.data_id, &selector.node.selections)?;
    Ok(Snapshot {
        data,
        is_missing_data: reader.is_missing_data,
        seen_records: reader.seen,
        selector: selector.clone(),
        missing_required_fields: reader.missing_required,
    })
}

struct Reader<'a> {
    source: &'a dyn RecordSourceView,
    variables: &'a Variables,
    owner: &'a Rc<RequestDescriptor>,
    fragment_name: &'a str,
    seen: BTreeSet<DataId>,
    is_missing_data: bool,
    missing_required: Option<MissingRequiredFields>,
}

impl<'a> Reader<'a> {
    fn traverse(
        &mut self,
        id: &DataId,
        selections: &[ReaderSelection],
    ) -> Result<Option<Data>, RuntimeError> {
        self.seen.insert(id.clone());
        let source = self.source;
        match source.entry(id) {
            None => {
                self.is_missing_data = true;
                Ok(None)
            }
            Some(RecordEntry::Nonexistent) => Ok(Some(Data::Null)),
            Some(RecordEntry::Existent(record)) => {
                let mut object = DataObject::default();
                if self.traverse_selections(selections, record, &mut object)? {
                    Ok(Some(Data::object(object)))
                } else {
                    Ok(Some(Data::Null))
                }
            }
        }
    }

    /// Returns false when a `@required` field nulls the enclosing object.
    fn traverse_selections(
        &mut self,
        selections: &[ReaderSelection],
        record: &Record,
        object: &mut DataObject,
    ) -> Result<bool, RuntimeError> {
        for selection in selections {
            match selection {
                ReaderSelection::ScalarField(field) => {
                    self.read_scalar(field, record, object)?;
                }
                ReaderSelection::LinkedField(field) => {
                    self.read_linked(field, record, object)?;
                }
                ReaderSelection::RequiredField {
                    field,
                    action,
                    path,
                } => {
                    let value = match field.as_ref() {
                        ReaderSelection::ScalarField(f) => self.read_scalar(f, record, object)?,
                        ReaderSelection::LinkedField(f) => self.read_linked(f, record, object)?,
                        other => {
                            return Err(RuntimeError::InvalidSelector(format!(
                                "@required wraps a non-field selection: {other:?}"
                            )))
                        }
                    };
                    if value.as_ref().is_none_or(Data::is_null) {
                        self.add_missing_required(*action, path);
                        return Ok(false);
                    }
                }
                ReaderSelection::InlineFragment {
                    type_name,
                    selections,
                } => {
                    if record.typename() == type_name
                        && !self.traverse_selections(selections, record, object)?
                    {
                        return Ok(false);
                    }
                }
                ReaderSelection::Condition {
                    condition,
                    passing_value,
                    selections,
                } => {
                    if condition_value(self.variables, condition) == *passing_value
                        && !self.traverse_selections(selections, record, object)?
                    {
                        return Ok(false);
                    }
                }
                ReaderSelection::FragmentSpread { name, args } => {
                    let args = get_argument_values(args, self.variables)?;
                    self.fragment_ref(record, object).insert(name.clone(), args);
                }
                ReaderSelection::Defer { selections } | ReaderSelection::Stream { selections } => {
                    if !self.traverse_selections(selections, record, object)? {
                        return Ok(false);
                    }
                }
                ReaderSelection::ModuleImport {
                    document_name,
                    fragment_name,
                    fragment_prop_name,
                } => {
                    match record.get_value(&module_component_key(document_name)) {
                        None => self.is_missing_data = true,
                        Some(serde_json::Value::Null) => {}
                        Some(component) => {
                            self.fragment_ref(record, object)
                                .insert(fragment_name.clone(), Variables::new());
                            object.module = Some(ModuleRef {
                                fragment_prop_name: fragment_prop_name.clone(),
                                fragment_name: fragment_name.clone(),
                                component,
                            });
                        }
                    }
                }
                ReaderSelection::ClientExtension { selections } => {
                    let was_missing = self.is_missing_data;
                    let keep = self.traverse_selections(selections, record, object)?;
                    self.is_missing_data = was_missing;
                    if !keep {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    fn fragment_ref<'o>(
        &self,
        record: &Record,
        object: &'o mut DataObject,
    ) -> &'o mut BTreeMap<String, Variables> {
        &mut object
            .fragment_ref
            .get_or_insert_with(|| FragmentRef {
                id: record.id().clone(),
                fragments: BTreeMap::new(),
                owner: Rc::clone(self.owner),
            })
            .fragments
    }

    fn add_missing_required(&mut self, action: RequiredFieldAction, path: &str) {
        let field = MissingRequiredField {
            owner: self.fragment_name.to_owned(),
            path: path.to_owned(),
        };
        match action {
            RequiredFieldAction::None => {}
            RequiredFieldAction::Throw => {
                if !matches!(self.missing_required, Some(MissingRequiredFields::Throw(_))) {
                    self.missing_required = Some(MissingRequiredFields::Throw(field));
                }
            }
            RequiredFieldAction::Log => match &mut self.missing_required {
                Some(MissingRequiredFields::Throw(_)) => {}
                Some(MissingRequiredFields::Log(fields)) => fields.push(field),
                None => self.missing_required = Some(MissingRequiredFields::Log(vec![field])),
            },
        }
    }

    fn read_scalar(
        &mut self,
        field: &ReaderScalarField,
        record: &Record,
        object: &mut DataObject,
    ) -> Result<Option<Data>, RuntimeError> {
        let key = response_key(&field.name, field.alias.as_deref());
        let value = match field.name.as_str() {
            "__typename" => Some(Data::Scalar(record.typename().into())),
            "__id" => Some(Data::Scalar(record.id().as_str().into())),
            _ => {
                let storage_key = get_storage_key(
                    &field.name,
                    &field.args,
                    field.storage_key.as_deref(),
                    self.variables,
                )?;
                match record.get(&storage_key) {
                    None => None,
                    Some(FieldValue::Null) => Some(Data::Null),
                    Some(FieldValue::Scalar(value)) => Some(Data::Scalar(value.clone())),
                    Some(FieldValue::ScalarList(items)) => Some(Data::list(
                        items
                            .iter()
                            .map(|item| {
                                if item.is_null() {
                                    Data::Null
                                } else {
                                    Data::Scalar(item.clone())
                                }
                            })
                            .collect(),
                    )),
                    Some(FieldValue::Link(_) | FieldValue::LinkList(_)) => {
                        warn!(id = %record.id(), field = %storage_key, "expected a scalar, found a link");
                        None
                    }
                }
            }
        };
        match &value {
            Some(data) => {
                object.fields.insert(key.to_owned(), data.clone());
            }
            None => self.is_missing_data = true,
        }
        Ok(value)
    }

    fn read_linked(
        &mut self,
        field: &ReaderLinkedField,
        record: &Record,
        object: &mut DataObject,
    ) -> Result<Option<Data>, RuntimeError> {
        let key = response_key(&field.name, field.alias.as_deref());
        let storage_key = get_storage_key(
            &field.name,
            &field.args,
            field.storage_key.as_deref(),
            self.variables,
        )?;
        let value = match (record.get(&storage_key), field.plural) {
            (None, _) => None,
            (Some(FieldValue::Null), _) => Some(Data::Null),
            (Some(FieldValue::Link(id)), false) => self.traverse(id, &field.selections)?,
            (Some(FieldValue::LinkList(ids)), true) => {
                let mut items = Vec::with_capacity(ids.len());
                for id in ids {
                    let item = match id {
                        Some(id) => self.traverse(id, &field.selections)?.unwrap_or(Data::Null),
                        None => Data::Null,
                    };
                    items.push(item);
                }
                Some(Data::list(items))
            }
            (Some(other), plural) => {
                warn!(
                    id = %record.id(),
                    field = %storage_key,
                    plural,
                    found = ?other,
                    "linked field shape does not match the selection"
                );
                None
            }
        };
        match &value {
            Some(data) => {
                object.fields.insert(key.to_owned(), data.clone());
            }
            None => self.is_missing_data = true,
        }
        Ok(value)
    }
}
