// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Compiled artifact model.
//!
//! Artifacts are produced by an external compiler and loaded with `serde`.
//! Two shapes exist for every document: the *normalization* tree (write
//! shape, used by the normalizer, data checker, and reference marker) and
//! the *reader* tree (read shape, used to build snapshots).
//!
//! Selection nodes are internally tagged by `kind`:
//!
//! ```json
//! { "kind": "LinkedField", "name": "me", "plural": false, "selections": [] }
//! ```
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Field argument as written in the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Argument {
    /// Inline constant.
    Literal {
        /// Argument name.
        name: String,
        /// Constant value.
        value: Value,
    },
    /// Reference to an operation or fragment variable.
    Variable {
        /// Argument name.
        name: String,
        /// Name of the referenced variable.
        variable_name: String,
    },
}

impl Argument {
    /// Name of the argument.
    pub fn name(&self) -> &str {
        match self {
            Self::Literal { name, .. } | Self::Variable { name, .. } => name,
        }
    }
}

/// Declared fragment or operation argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ArgumentDefinition {
    /// Argument local to the fragment, with an optional default.
    LocalArgument {
        /// Variable name.
        name: String,
        /// Value used when the spread does not pass one.
        #[serde(default)]
        default_value: Value,
    },
    /// Argument inherited from the owning operation's variables.
    RootArgument {
        /// Variable name.
        name: String,
    },
}

impl ArgumentDefinition {
    /// Name of the declared variable.
    pub fn name(&self) -> &str {
        match self {
            Self::LocalArgument { name, .. } | Self::RootArgument { name } => name,
        }
    }
}

/// Operation kind of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// A read.
    #[default]
    Query,
    /// A write with a server response.
    Mutation,
    /// A long-lived stream of responses.
    Subscription,
}

/// Scalar field in the normalization tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationScalarField {
    /// Schema field name.
    pub name: String,
    /// Response key override.
    #[serde(default)]
    pub alias: Option<String>,
    /// Field arguments.
    #[serde(default)]
    pub args: Vec<Argument>,
    /// Precomputed storage key when every argument is a literal.
    #[serde(default)]
    pub storage_key: Option<String>,
}

/// Linked (object-valued) field in the normalization tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationLinkedField {
    /// Schema field name.
    pub name: String,
    /// Response key override.
    #[serde(default)]
    pub alias: Option<String>,
    /// Field arguments.
    #[serde(default)]
    pub args: Vec<Argument>,
    /// Precomputed storage key when every argument is a literal.
    #[serde(default)]
    pub storage_key: Option<String>,
    /// Concrete type when the field's type is not abstract.
    #[serde(default)]
    pub concrete_type: Option<String>,
    /// True for list-valued fields.
    #[serde(default)]
    pub plural: bool,
    /// Child selections.
    pub selections: Vec<NormalizationSelection>,
}

/// Client-side handle attached to a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationHandle {
    /// Schema field name the handle decorates.
    pub name: String,
    /// Response key override.
    #[serde(default)]
    pub alias: Option<String>,
    /// Field arguments.
    #[serde(default)]
    pub args: Vec<Argument>,
    /// Handler name passed to the handler provider.
    pub handle: String,
    /// Handle key; empty means "use the field name".
    #[serde(default)]
    pub key: String,
    /// Arguments kept in the handle storage key; `None` keeps none.
    #[serde(default)]
    pub filters: Option<Vec<String>>,
    /// Arguments passed only to the handler.
    #[serde(default)]
    pub handle_args: Vec<Argument>,
}

/// Node of the normalization (write-shape) tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum NormalizationSelection {
    /// Scalar or list-of-scalar field.
    ScalarField(NormalizationScalarField),
    /// Object or list-of-object field.
    LinkedField(NormalizationLinkedField),
    /// Type-conditioned selections.
    InlineFragment {
        /// Type the selections apply to.
        type_name: String,
        /// Selections applied when the record's typename matches.
        selections: Vec<NormalizationSelection>,
    },
    /// `@include` / `@skip`.
    Condition {
        /// Boolean variable controlling the selections.
        condition: String,
        /// Value of the variable for which the selections apply.
        passing_value: bool,
        /// Guarded selections.
        selections: Vec<NormalizationSelection>,
    },
    /// `@defer` boundary.
    Defer {
        /// Label matching incremental payloads to this boundary.
        label: String,
        /// Variable that can turn deferral off.
        #[serde(rename = "if", default)]
        if_: Option<String>,
        /// Deferred selections.
        selections: Vec<NormalizationSelection>,
    },
    /// `@stream` boundary around a plural linked field.
    Stream {
        /// Label matching incremental payloads to this boundary.
        label: String,
        /// Variable that can turn streaming off.
        #[serde(rename = "if", default)]
        if_: Option<String>,
        /// Selections containing the streamed field.
        selections: Vec<NormalizationSelection>,
    },
    /// `@module` code-split fragment.
    ModuleImport {
        /// Document that declares the `@module` selection.
        document_name: String,
        /// Fragment resolved through the operation loader.
        fragment_name: String,
        /// Prop name under which the fragment is exposed.
        fragment_prop_name: String,
    },
    /// Selections on client-only schema extensions.
    ClientExtension {
        /// Client-only selections.
        selections: Vec<NormalizationSelection>,
    },
    /// Handle on a scalar field.
    ScalarHandle(NormalizationHandle),
    /// Handle on a linked field.
    LinkedHandle(NormalizationHandle),
}

/// Root normalization node of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationOperation {
    /// Operation name.
    pub name: String,
    /// Declared operation variables.
    #[serde(default)]
    pub argument_definitions: Vec<ArgumentDefinition>,
    /// Root selections.
    pub selections: Vec<NormalizationSelection>,
}

/// Normalization tree of a `@module` fragment, loaded on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationSplitOperation {
    /// Split operation name.
    pub name: String,
    /// Selections normalized against the module's record.
    pub selections: Vec<NormalizationSelection>,
}

/// Scalar field in the reader tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderScalarField {
    /// Schema field name.
    pub name: String,
    /// Response key override.
    #[serde(default)]
    pub alias: Option<String>,
    /// Field arguments.
    #[serde(default)]
    pub args: Vec<Argument>,
    /// Precomputed storage key when every argument is a literal.
    #[serde(default)]
    pub storage_key: Option<String>,
}

/// Linked field in the reader tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderLinkedField {
    /// Schema field name.
    pub name: String,
    /// Response key override.
    #[serde(default)]
    pub alias: Option<String>,
    /// Field arguments.
    #[serde(default)]
    pub args: Vec<Argument>,
    /// Precomputed storage key when every argument is a literal.
    #[serde(default)]
    pub storage_key: Option<String>,
    /// Concrete type when the field's type is not abstract.
    #[serde(default)]
    pub concrete_type: Option<String>,
    /// True for list-valued fields.
    #[serde(default)]
    pub plural: bool,
    /// Child selections.
    pub selections: Vec<ReaderSelection>,
}

/// What happens when a `@required` field is null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequiredFieldAction {
    /// Null the parent silently.
    None,
    /// Null the parent and log.
    Log,
    /// Null the parent and report an error on read.
    Throw,
}

/// Node of the reader (read-shape) tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ReaderSelection {
    /// Scalar or list-of-scalar field.
    ScalarField(ReaderScalarField),
    /// Object or list-of-object field.
    LinkedField(ReaderLinkedField),
    /// Type-conditioned selections.
    InlineFragment {
        /// Type the selections apply to.
        type_name: String,
        /// Selections read when the record's typename matches.
        selections: Vec<ReaderSelection>,
    },
    /// `@include` / `@skip`.
    Condition {
        /// Boolean variable controlling the selections.
        condition: String,
        /// Value of the variable for which the selections apply.
        passing_value: bool,
        /// Guarded selections.
        selections: Vec<ReaderSelection>,
    },
    /// Spread of a named fragment; read as a fragment reference.
    FragmentSpread {
        /// Fragment name.
        name: String,
        /// Arguments passed to the fragment.
        #[serde(default)]
        args: Vec<Argument>,
    },
    /// `@defer` boundary, read inline.
    Defer {
        /// Deferred selections.
        selections: Vec<ReaderSelection>,
    },
    /// `@stream` boundary, read inline.
    Stream {
        /// Streamed selections.
        selections: Vec<ReaderSelection>,
    },
    /// `@module` code-split fragment.
    ModuleImport {
        /// Document that declares the `@module` selection.
        document_name: String,
        /// Fragment exposed through the module reference.
        fragment_name: String,
        /// Prop name under which the fragment is exposed.
        fragment_prop_name: String,
    },
    /// `@required` wrapper around one field.
    RequiredField {
        /// Wrapped field.
        field: Box<ReaderSelection>,
        /// Behaviour when the field is null.
        action: RequiredFieldAction,
        /// Dotted path of the field inside the fragment.
        path: String,
    },
    /// Selections on client-only schema extensions.
    ClientExtension {
        /// Client-only selections.
        selections: Vec<ReaderSelection>,
    },
}

/// Optional flags on a reader fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderFragmentMetadata {
    /// True when the fragment reads a list of records.
    #[serde(default)]
    pub plural: bool,
}

/// Root reader node of a fragment or an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderFragment {
    /// Fragment name (the operation name for operation roots).
    pub name: String,
    /// Type the fragment is declared on.
    pub type_name: String,
    /// Declared fragment arguments.
    #[serde(default)]
    pub argument_definitions: Vec<ArgumentDefinition>,
    /// Fragment metadata.
    #[serde(default)]
    pub metadata: ReaderFragmentMetadata,
    /// Root selections.
    pub selections: Vec<ReaderSelection>,
}

/// Request metadata handed to the network layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestParameters {
    /// Operation name.
    pub name: String,
    /// Operation kind.
    #[serde(default)]
    pub operation_kind: OperationKind,
    /// Persisted query id, when available.
    #[serde(default)]
    pub id: Option<String>,
    /// Document text, when available.
    #[serde(default)]
    pub text: Option<String>,
    /// Free-form compiler metadata.
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl RequestParameters {
    /// Key used for request identity: the persisted id, else the name.
    pub fn cache_key(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }
}

/// A compiled operation: reader root, normalization root, and parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcreteRequest {
    /// Reader tree of the operation root.
    pub fragment: Rc<ReaderFragment>,
    /// Normalization tree of the operation.
    pub operation: Rc<NormalizationOperation>,
    /// Network parameters.
    pub params: RequestParameters,
}

impl ConcreteRequest {
    /// Parses a request artifact from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl ReaderFragment {
    /// Parses a fragment artifact from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl NormalizationSplitOperation {
    /// Parses a split operation artifact from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Response key of a field: the alias when present, else the name.
pub fn response_key<'a>(name: &'a str, alias: Option<&'a str>) -> &'a str {
    alias.unwrap_or(name)
}

/// Record field holding the component reference of a `@module` selection.
pub fn module_component_key(document_name: &str) -> String {
    format!("__module_component_{document_name}")
}

/// Record field holding the operation reference of a `@module` selection.
pub fn module_operation_key(document_name: &str) -> String {
    format!("__module_operation_{document_name}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn request_artifact_deserializes_from_tagged_json() {
        let json = r#"{
            "params": { "name": "UserQuery", "operation_kind": "query" },
            "fragment": {
                "name": "UserQuery",
                "type_name": "Query",
                "selections": [
                    { "kind": "LinkedField", "name": "node",
                      "args": [{ "kind": "Variable", "name": "id", "variable_name": "id" }],
                      "selections": [{ "kind": "ScalarField", "name": "name" }] }
                ]
            },
            "operation": {
                "name": "UserQuery",
                "argument_definitions": [{ "kind": "LocalArgument", "name": "id" }],
                "selections": [
                    { "kind": "Defer", "label": "UserQuery$defer$name", "if": "shouldDefer",
                      "selections": [{ "kind": "ScalarField", "name": "name" }] }
                ]
            }
        }"#;
        let request = ConcreteRequest::from_json(json).expect("artifact parses");
        assert_eq!(request.params.cache_key(), "UserQuery");
        match &request.operation.selections[0] {
            NormalizationSelection::Defer { label, if_, .. } => {
                assert_eq!(label, "UserQuery$defer$name");
                assert_eq!(if_.as_deref(), Some("shouldDefer"));
            }
            other => panic!("unexpected node {other:?}"),
        }
        assert_eq!(request.fragment.argument_definitions.len(), 0);
    }

    #[test]
    fn persisted_id_wins_over_name_for_identity() {
        let params = RequestParameters {
            name: "Q".into(),
            operation_kind: OperationKind::Query,
            id: Some("abc123".into()),
            text: None,
            metadata: serde_json::Map::new(),
        };
        assert_eq!(params.cache_key(), "abc123");
    }
}
