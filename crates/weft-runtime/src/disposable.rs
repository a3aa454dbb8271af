// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! One-shot release handles.
use std::fmt;

/// Releases a retention, subscription or update exactly once.
///
/// Dropping a `Disposable` without calling [`Disposable::dispose`] keeps
/// the resource alive.
#[must_use = "dropping a Disposable leaks the resource it guards"]
pub struct Disposable {
    action: Option<Box<dyn FnOnce()>>,
}

impl Disposable {
    /// Wraps `action`.
    pub fn new(action: impl FnOnce() + 'static) -> Self {
        Self {
            action: Some(Box::new(action)),
        }
    }

    /// A handle that does nothing.
    pub fn noop() -> Self {
        Self { action: None }
    }

    /// Runs the release action.
    pub fn dispose(mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}

impl fmt::Debug for Disposable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposable")
            .field("armed", &self.action.is_some())
            .finish()
    }
}
