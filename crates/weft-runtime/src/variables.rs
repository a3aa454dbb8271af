// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Variable maps and argument resolution.
use serde_json::{Map, Value};

use crate::ast::{Argument, ArgumentDefinition, NormalizationOperation, ReaderFragment};
use crate::error::RuntimeError;

/// Variable bindings by name.
pub type Variables = Map<String, Value>;

/// Operation variables with declared defaults filled in.
///
/// Only declared variables are kept, so two descriptors built from the same
/// request and inputs share an identifier regardless of extra keys.
pub fn get_operation_variables(
    operation: &NormalizationOperation,
    variables: &Variables,
) -> Variables {
    let mut out = Variables::new();
    for definition in &operation.argument_definitions {
        let value = match definition {
            ArgumentDefinition::LocalArgument {
                name,
                default_value,
            } => variables
                .get(name)
                .cloned()
                .unwrap_or_else(|| default_value.clone()),
            ArgumentDefinition::RootArgument { name } => {
                variables.get(name).cloned().unwrap_or(Value::Null)
            }
        };
        out.insert(definition.name().to_owned(), value);
    }
    out
}

/// Variables visible inside a fragment.
///
/// Local arguments take the value passed at the spread site or their
/// default; root arguments are looked up in the owner's variables.
pub fn get_fragment_variables(
    fragment: &ReaderFragment,
    root_variables: &Variables,
    argument_variables: &Variables,
) -> Variables {
    let mut out = Variables::new();
    for definition in &fragment.argument_definitions {
        let value = match definition {
            ArgumentDefinition::LocalArgument {
                name,
                default_value,
            } => argument_variables
                .get(name)
                .cloned()
                .unwrap_or_else(|| default_value.clone()),
            ArgumentDefinition::RootArgument { name } => {
                root_variables.get(name).cloned().unwrap_or(Value::Null)
            }
        };
        out.insert(definition.name().to_owned(), value);
    }
    // Fragments without declared arguments still see the owner's variables.
    for (name, value) in root_variables {
        out.entry(name.clone()).or_insert_with(|| value.clone());
    }
    out
}

/// Resolves one argument against `variables`.
pub fn get_argument_value(argument: &Argument, variables: &Variables) -> Result<Value, RuntimeError> {
    match argument {
        Argument::Literal { value, .. } => Ok(value.clone()),
        Argument::Variable { variable_name, .. } => variables
            .get(variable_name)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownVariable(variable_name.clone())),
    }
}

/// Resolves every argument against `variables`.
pub fn get_argument_values(
    arguments: &[Argument],
    variables: &Variables,
) -> Result<Variables, RuntimeError> {
    let mut out = Variables::new();
    for argument in arguments {
        out.insert(
            argument.name().to_owned(),
            get_argument_value(argument, variables)?,
        );
    }
    Ok(out)
}

/// Reads a boolean condition variable; absent or non-boolean reads as false.
pub fn condition_value(variables: &Variables, name: &str) -> bool {
    variables.get(name).and_then(Value::as_bool).unwrap_or(false)
}
