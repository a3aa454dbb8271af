// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Resolution of `@module` split operations.
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use weft_observable::Observable;

use crate::ast::NormalizationSplitOperation;
use crate::error::RuntimeError;

/// Resolves operation references produced by `@module` selections.
pub trait OperationLoader {
    /// Synchronously available operation, if already loaded.
    fn get(&self, reference: &str) -> Option<Rc<NormalizationSplitOperation>>;

    /// Loads an operation; emits `None` when the reference is unknown.
    fn load(
        &self,
        reference: &str,
    ) -> Observable<Option<Rc<NormalizationSplitOperation>>, RuntimeError>;
}

/// Loader backed by an in-memory table.
#[derive(Debug, Default)]
pub struct StaticOperationLoader {
    operations: RefCell<BTreeMap<String, Rc<NormalizationSplitOperation>>>,
}

impl StaticOperationLoader {
    /// Creates an empty loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `operation` under `reference`.
    pub fn insert(&self, reference: impl Into<String>, operation: NormalizationSplitOperation) {
        self.operations
            .borrow_mut()
            .insert(reference.into(), Rc::new(operation));
    }
}

impl OperationLoader for StaticOperationLoader {
    fn get(&self, reference: &str) -> Option<Rc<NormalizationSplitOperation>> {
        self.operations.borrow().get(reference).cloned()
    }

    fn load(
        &self,
        reference: &str,
    ) -> Observable<Option<Rc<NormalizationSplitOperation>>, RuntimeError> {
        Observable::from_value(self.get(reference))
    }
}
