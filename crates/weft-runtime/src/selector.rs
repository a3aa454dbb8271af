// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Selectors and operation descriptors.
use std::fmt;
use std::rc::Rc;

use blake3::Hasher;
use serde_json::Value;
use tracing::warn;

use crate::ast::{
    ConcreteRequest, NormalizationOperation, NormalizationSelection, NormalizationSplitOperation,
    OperationKind, ReaderFragment,
};
use crate::data::Data;
use crate::error::RuntimeError;
use crate::ident::{canonical_json, make_request_identifier, DataId, Hash, RequestIdentifier};
use crate::network::CacheConfig;
use crate::variables::{get_fragment_variables, get_operation_variables, Variables};

/// A request bound to its variables.
#[derive(Debug)]
pub struct RequestDescriptor {
    /// Identity of the request (id or name plus variables).
    pub identifier: RequestIdentifier,
    /// Compiled request.
    pub node: Rc<ConcreteRequest>,
    /// Operation variables, defaults applied.
    pub variables: Variables,
    /// Cache directives.
    pub cache_config: CacheConfig,
}

impl RequestDescriptor {
    /// Operation name.
    pub fn name(&self) -> &str {
        &self.node.params.name
    }

    /// Operation kind.
    pub fn operation_kind(&self) -> OperationKind {
        self.node.params.operation_kind
    }
}

/// Normalization tree a selector writes or walks.
#[derive(Debug, Clone)]
pub enum NormalizationRoot {
    /// Root of a full operation.
    Operation(Rc<NormalizationOperation>),
    /// A `@module` split operation.
    Split(Rc<NormalizationSplitOperation>),
}

impl NormalizationRoot {
    /// Root selections.
    pub fn selections(&self) -> &[NormalizationSelection] {
        match self {
            Self::Operation(op) => &op.selections,
            Self::Split(op) => &op.selections,
        }
    }

    /// Name of the root node.
    pub fn name(&self) -> &str {
        match self {
            Self::Operation(op) => &op.name,
            Self::Split(op) => &op.name,
        }
    }
}

/// What to write (or check, or mark) under a record.
#[derive(Debug, Clone)]
pub struct NormalizationSelector {
    /// Record the selections apply to.
    pub data_id: DataId,
    /// Normalization tree.
    pub node: NormalizationRoot,
    /// Variables in scope.
    pub variables: Variables,
}

/// What to read from one record.
#[derive(Clone)]
pub struct SingularReaderSelector {
    /// Record the fragment reads from.
    pub data_id: DataId,
    /// Reader tree.
    pub node: Rc<ReaderFragment>,
    /// Variables in scope.
    pub variables: Variables,
    /// Request whose data this read belongs to.
    pub owner: Rc<RequestDescriptor>,
}

impl SingularReaderSelector {
    /// Stable identity used by the lookup cache.
    pub fn identity(&self) -> Hash {
        let mut hasher = Hasher::new();
        hasher.update(b"selector:");
        hasher.update(self.owner.identifier.as_bytes());
        hasher.update(&(self.node.name.len() as u64).to_le_bytes());
        hasher.update(self.node.name.as_bytes());
        hasher.update(&(self.data_id.as_str().len() as u64).to_le_bytes());
        hasher.update(self.data_id.as_str().as_bytes());
        hasher.update(canonical_json(&Value::Object(self.variables.clone())).as_bytes());
        hasher.finalize().into()
    }

    /// True when both selectors read the same fragment from the same
    /// record, with the same variables and owner.
    pub fn same_as(&self, other: &Self) -> bool {
        self.data_id == other.data_id
            && self.node.name == other.node.name
            && self.variables == other.variables
            && self.owner.identifier == other.owner.identifier
    }
}

impl fmt::Debug for SingularReaderSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingularReaderSelector")
            .field("data_id", &self.data_id)
            .field("fragment", &self.node.name)
            .field("variables", &self.variables)
            .field("owner", &self.owner.identifier)
            .finish()
    }
}

/// Ordered list of singular selectors for plural fragments.
#[derive(Debug, Clone)]
pub struct PluralReaderSelector {
    /// One selector per item, in item order.
    pub selectors: Vec<SingularReaderSelector>,
}

/// Either selector flavor.
#[derive(Debug, Clone)]
pub enum ReaderSelector {
    /// One root.
    Singular(SingularReaderSelector),
    /// Many roots.
    Plural(PluralReaderSelector),
}

/// A request plus the selectors used to write and read its root.
#[derive(Debug, Clone)]
pub struct OperationDescriptor {
    /// The bound request.
    pub request: Rc<RequestDescriptor>,
    /// Root normalization selector (writes).
    pub root: NormalizationSelector,
    /// Root reader selector (reads).
    pub fragment: SingularReaderSelector,
}

impl OperationDescriptor {
    /// Shortcut for `request.identifier`.
    pub fn identifier(&self) -> RequestIdentifier {
        self.request.identifier
    }
}

/// Builds a descriptor rooted at [`DataId::root`].
pub fn create_operation_descriptor(
    request: Rc<ConcreteRequest>,
    variables: &Variables,
    cache_config: CacheConfig,
) -> OperationDescriptor {
    create_operation_descriptor_at(request, variables, cache_config, DataId::root())
}

/// Builds a descriptor rooted at `data_id`.
pub fn create_operation_descriptor_at(
    request: Rc<ConcreteRequest>,
    variables: &Variables,
    cache_config: CacheConfig,
    data_id: DataId,
) -> OperationDescriptor {
    let operation_variables = get_operation_variables(&request.operation, variables);
    let identifier = make_request_identifier(request.params.cache_key(), &operation_variables);
    let descriptor = Rc::new(RequestDescriptor {
        identifier,
        node: Rc::clone(&request),
        variables: operation_variables.clone(),
        cache_config,
    });
    OperationDescriptor {
        root: NormalizationSelector {
            data_id: data_id.clone(),
            node: NormalizationRoot::Operation(Rc::clone(&request.operation)),
            variables: operation_variables.clone(),
        },
        fragment: SingularReaderSelector {
            data_id,
            node: Rc::clone(&request.fragment),
            variables: operation_variables,
            owner: Rc::clone(&descriptor),
        },
        request: descriptor,
    }
}

/// Selector for `fragment` from one item of parent data.
///
/// Returns `Ok(None)` (with a warning) when the item does not spread the
/// fragment, and an error when the item is not an object.
pub fn get_singular_selector(
    fragment: &Rc<ReaderFragment>,
    item: &Data,
) -> Result<Option<SingularReaderSelector>, RuntimeError> {
    let Data::Object(object) = item else {
        return Err(RuntimeError::InvalidSelector(format!(
            "expected an object to read fragment `{}`",
            fragment.name
        )));
    };
    let Some(fragment_ref) = &object.fragment_ref else {
        warn!(fragment = %fragment.name, "item does not reference any fragment");
        return Ok(None);
    };
    let Some(arguments) = fragment_ref.fragments.get(&fragment.name) else {
        warn!(fragment = %fragment.name, id = %fragment_ref.id, "fragment was not spread on item");
        return Ok(None);
    };
    let variables = get_fragment_variables(fragment, &fragment_ref.owner.variables, arguments);
    Ok(Some(SingularReaderSelector {
        data_id: fragment_ref.id.clone(),
        node: Rc::clone(fragment),
        variables,
        owner: Rc::clone(&fragment_ref.owner),
    }))
}

/// Selectors for a plural fragment from a list of items; null items are
/// skipped.
pub fn get_plural_selector(
    fragment: &Rc<ReaderFragment>,
    items: &Data,
) -> Result<PluralReaderSelector, RuntimeError> {
    let Data::List(items) = items else {
        return Err(RuntimeError::InvalidSelector(format!(
            "expected a list to read plural fragment `{}`",
            fragment.name
        )));
    };
    let mut selectors = Vec::with_capacity(items.len());
    for item in items.iter().filter(|item| !item.is_null()) {
        if let Some(selector) = get_singular_selector(fragment, item)? {
            selectors.push(selector);
        }
    }
    Ok(PluralReaderSelector { selectors })
}

/// Selector for `fragment` from parent data, checking that plurality
/// matches the fragment's declaration.
pub fn get_selector(
    fragment: &Rc<ReaderFragment>,
    item: &Data,
) -> Result<Option<ReaderSelector>, RuntimeError> {
    if item.is_null() {
        return Ok(None);
    }
    match (fragment.metadata.plural, item) {
        (true, Data::List(_)) => Ok(Some(ReaderSelector::Plural(get_plural_selector(
            fragment, item,
        )?))),
        (false, Data::Object(_)) => {
            Ok(get_singular_selector(fragment, item)?.map(ReaderSelector::Singular))
        }
        (true, _) => Err(RuntimeError::InvalidSelector(format!(
            "plural fragment `{}` given a non-list item",
            fragment.name
        ))),
        (false, _) => Err(RuntimeError::InvalidSelector(format!(
            "singular fragment `{}` given a non-object item",
            fragment.name
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::ast::{ArgumentDefinition, ReaderFragmentMetadata, RequestParameters};
    use crate::data::{DataObject, FragmentRef};

    fn request() -> Rc<ConcreteRequest> {
        Rc::new(ConcreteRequest {
            fragment: Rc::new(ReaderFragment {
                name: "Q".into(),
                type_name: "Query".into(),
                argument_definitions: vec![],
                metadata: ReaderFragmentMetadata::default(),
                selections: vec![],
            }),
            operation: Rc::new(NormalizationOperation {
                name: "Q".into(),
                argument_definitions: vec![ArgumentDefinition::LocalArgument {
                    name: "id".into(),
                    default_value: json!("4"),
                }],
                selections: vec![],
            }),
            params: RequestParameters {
                name: "Q".into(),
                operation_kind: OperationKind::Query,
                id: None,
                text: None,
                metadata: serde_json::Map::new(),
            },
        })
    }

    fn fragment(plural: bool) -> Rc<ReaderFragment> {
        Rc::new(ReaderFragment {
            name: "F".into(),
            type_name: "User".into(),
            argument_definitions: vec![],
            metadata: ReaderFragmentMetadata { plural },
            selections: vec![],
        })
    }

    #[test]
    fn descriptors_with_same_inputs_share_identity() {
        let a = create_operation_descriptor(request(), &Variables::new(), CacheConfig::default());
        let mut vars = Variables::new();
        vars.insert("id".into(), json!("4"));
        vars.insert("unused".into(), json!(true));
        let b = create_operation_descriptor(request(), &vars, CacheConfig::default());
        assert_eq!(a.identifier(), b.identifier());
        assert_eq!(a.root.data_id, DataId::root());
    }

    #[test]
    fn selectors_come_from_fragment_refs() {
        let op = create_operation_descriptor(request(), &Variables::new(), CacheConfig::default());
        let item = Data::object(DataObject {
            fields: BTreeMap::new(),
            fragment_ref: Some(FragmentRef {
                id: DataId::from("4"),
                fragments: [("F".to_owned(), Variables::new())].into_iter().collect(),
                owner: Rc::clone(&op.request),
            }),
            module: None,
        });
        let selector = get_singular_selector(&fragment(false), &item)
            .unwrap()
            .unwrap();
        assert_eq!(selector.data_id, DataId::from("4"));
        assert_eq!(selector.variables.get("id"), Some(&json!("4")));
    }

    #[test]
    fn plurality_mismatch_is_an_error() {
        let item = Data::object(DataObject::default());
        assert!(matches!(
            get_selector(&fragment(true), &item),
            Err(RuntimeError::InvalidSelector(_))
        ));
        assert!(matches!(
            get_selector(&fragment(false), &Data::list(vec![])),
            Err(RuntimeError::InvalidSelector(_))
        ));
        assert!(get_selector(&fragment(false), &Data::Null).unwrap().is_none());
    }
}
