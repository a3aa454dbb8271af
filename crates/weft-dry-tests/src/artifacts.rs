// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Builders for compiled artifacts.
//!
//! Tests describe queries with these helpers instead of hand-writing JSON
//! artifacts. Normalization and reader trees are built separately, the way
//! a compiler would emit them.

use std::rc::Rc;

use serde_json::Value;
use weft_runtime::{
    create_operation_descriptor, Argument, ArgumentDefinition, CacheConfig, ConcreteRequest,
    NormalizationLinkedField, NormalizationOperation, NormalizationScalarField,
    NormalizationSelection, OperationDescriptor, OperationKind, ReaderFragment,
    ReaderFragmentMetadata, ReaderLinkedField, ReaderScalarField, ReaderSelection,
    RequestParameters, Variables,
};

/// Scalar field without arguments.
pub fn scalar(name: &str) -> NormalizationSelection {
    NormalizationSelection::ScalarField(NormalizationScalarField {
        name: name.to_string(),
        alias: None,
        args: Vec::new(),
        storage_key: None,
    })
}

fn linked_field(
    name: &str,
    args: Vec<Argument>,
    concrete_type: Option<&str>,
    is_plural: bool,
    selections: Vec<NormalizationSelection>,
) -> NormalizationSelection {
    NormalizationSelection::LinkedField(NormalizationLinkedField {
        name: name.to_string(),
        alias: None,
        args,
        storage_key: None,
        concrete_type: concrete_type.map(str::to_string),
        plural: is_plural,
        selections,
    })
}

/// Singular linked field.
pub fn linked(
    name: &str,
    args: Vec<Argument>,
    concrete_type: Option<&str>,
    selections: Vec<NormalizationSelection>,
) -> NormalizationSelection {
    linked_field(name, args, concrete_type, false, selections)
}

/// Plural linked field.
pub fn plural(
    name: &str,
    concrete_type: Option<&str>,
    selections: Vec<NormalizationSelection>,
) -> NormalizationSelection {
    linked_field(name, Vec::new(), concrete_type, true, selections)
}

/// `@defer` boundary that is always active.
pub fn defer(label: &str, selections: Vec<NormalizationSelection>) -> NormalizationSelection {
    NormalizationSelection::Defer {
        label: label.to_string(),
        if_: None,
        selections,
    }
}

/// `@stream` boundary around `field`.
pub fn stream(label: &str, field: NormalizationSelection) -> NormalizationSelection {
    NormalizationSelection::Stream {
        label: label.to_string(),
        if_: None,
        selections: vec![field],
    }
}

/// Literal argument.
pub fn literal(name: &str, value: Value) -> Argument {
    Argument::Literal {
        name: name.to_string(),
        value,
    }
}

/// Variable argument.
pub fn variable(name: &str, variable_name: &str) -> Argument {
    Argument::Variable {
        name: name.to_string(),
        variable_name: variable_name.to_string(),
    }
}

/// Operation variable with a default.
pub fn local_argument(name: &str, default_value: Value) -> ArgumentDefinition {
    ArgumentDefinition::LocalArgument {
        name: name.to_string(),
        default_value,
    }
}

/// Reader scalar field.
pub fn reader_scalar(name: &str) -> ReaderSelection {
    ReaderSelection::ScalarField(ReaderScalarField {
        name: name.to_string(),
        alias: None,
        args: Vec::new(),
        storage_key: None,
    })
}

fn reader_linked_field(
    name: &str,
    args: Vec<Argument>,
    is_plural: bool,
    selections: Vec<ReaderSelection>,
) -> ReaderSelection {
    ReaderSelection::LinkedField(ReaderLinkedField {
        name: name.to_string(),
        alias: None,
        args,
        storage_key: None,
        concrete_type: None,
        plural: is_plural,
        selections,
    })
}

/// Reader singular linked field.
pub fn reader_linked(name: &str, args: Vec<Argument>, selections: Vec<ReaderSelection>) -> ReaderSelection {
    reader_linked_field(name, args, false, selections)
}

/// Reader plural linked field.
pub fn reader_plural(name: &str, selections: Vec<ReaderSelection>) -> ReaderSelection {
    reader_linked_field(name, Vec::new(), true, selections)
}

/// Spread of a named fragment.
pub fn fragment_spread(name: &str) -> ReaderSelection {
    ReaderSelection::FragmentSpread {
        name: name.to_string(),
        args: Vec::new(),
    }
}

/// Reader fragment on `type_name`.
pub fn fragment(name: &str, type_name: &str, selections: Vec<ReaderSelection>) -> Rc<ReaderFragment> {
    Rc::new(ReaderFragment {
        name: name.to_string(),
        type_name: type_name.to_string(),
        argument_definitions: Vec::new(),
        metadata: ReaderFragmentMetadata::default(),
        selections,
    })
}

/// Builder for a [`ConcreteRequest`].
///
/// # Example
///
/// ```
/// use weft_dry_tests::{reader_scalar, scalar, RequestBuilder};
///
/// let request = RequestBuilder::new("ViewerQuery")
///     .normalization(vec![scalar("greeting")])
///     .reader(vec![reader_scalar("greeting")])
///     .build();
/// assert_eq!(request.params.name, "ViewerQuery");
/// ```
pub struct RequestBuilder {
    name: String,
    kind: OperationKind,
    arguments: Vec<ArgumentDefinition>,
    normalization: Vec<NormalizationSelection>,
    reader: Vec<ReaderSelection>,
}

impl RequestBuilder {
    /// Starts a query named `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: OperationKind::Query,
            arguments: Vec::new(),
            normalization: Vec::new(),
            reader: Vec::new(),
        }
    }

    /// Sets the operation kind.
    pub fn kind(mut self, kind: OperationKind) -> Self {
        self.kind = kind;
        self
    }

    /// Declares an operation variable.
    pub fn argument(mut self, argument: ArgumentDefinition) -> Self {
        self.arguments.push(argument);
        self
    }

    /// Sets the normalization selections.
    pub fn normalization(mut self, selections: Vec<NormalizationSelection>) -> Self {
        self.normalization = selections;
        self
    }

    /// Sets the reader selections.
    pub fn reader(mut self, selections: Vec<ReaderSelection>) -> Self {
        self.reader = selections;
        self
    }

    /// Builds the request.
    pub fn build(self) -> Rc<ConcreteRequest> {
        let type_name = match self.kind {
            OperationKind::Query => "Query",
            OperationKind::Mutation => "Mutation",
            OperationKind::Subscription => "Subscription",
        };
        Rc::new(ConcreteRequest {
            fragment: Rc::new(ReaderFragment {
                name: self.name.clone(),
                type_name: type_name.to_string(),
                argument_definitions: self.arguments.clone(),
                metadata: ReaderFragmentMetadata::default(),
                selections: self.reader,
            }),
            operation: Rc::new(NormalizationOperation {
                name: self.name.clone(),
                argument_definitions: self.arguments,
                selections: self.normalization,
            }),
            params: RequestParameters {
                name: self.name,
                operation_kind: self.kind,
                id: None,
                text: None,
                metadata: serde_json::Map::new(),
            },
        })
    }
}

/// Query with the given trees.
pub fn query(
    name: &str,
    normalization: Vec<NormalizationSelection>,
    reader: Vec<ReaderSelection>,
) -> Rc<ConcreteRequest> {
    RequestBuilder::new(name)
        .normalization(normalization)
        .reader(reader)
        .build()
}

/// Descriptor for `request` with JSON-object `variables`.
///
/// Non-object values are treated as "no variables".
pub fn operation(request: &Rc<ConcreteRequest>, variables: Value) -> OperationDescriptor {
    operation_with(request, variables, CacheConfig::default())
}

/// Descriptor with explicit cache directives.
pub fn operation_with(
    request: &Rc<ConcreteRequest>,
    variables: Value,
    cache_config: CacheConfig,
) -> OperationDescriptor {
    let variables: Variables = match variables {
        Value::Object(map) => map,
        _ => Variables::new(),
    };
    create_operation_descriptor(Rc::clone(request), &variables, cache_config)
}
