// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Runtime error taxonomy.
use thiserror::Error;

/// Errors surfaced by the store, environment, and their collaborators.
///
/// Transport and loader errors travel on the `error` channel of the
/// observable returned by `execute`. Programmer errors (bad selectors,
/// unknown variables, re-entrant publish) are returned synchronously.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// The network layer failed to deliver a response.
    #[error("network error: {0}")]
    Network(String),
    /// The server answered with GraphQL errors and no data.
    #[error("graphql error in `{operation}`: {}", messages.join("\n"))]
    GraphQl {
        /// Name of the operation that failed.
        operation: String,
        /// Error messages as reported by the server.
        messages: Vec<String>,
    },
    /// A split operation referenced by `@module` could not be loaded.
    #[error("module load failed for `{reference}`: {reason}")]
    ModuleLoad {
        /// Operation reference as sent by the server.
        reference: String,
        /// Loader-provided reason.
        reason: String,
    },
    /// A linked record without a concrete type was missing `__typename`.
    #[error("expected `__typename` for record `{data_id}` at `{path}`")]
    MissingTypename {
        /// Id of the record being normalized.
        data_id: String,
        /// Response path of the record.
        path: String,
    },
    /// A payload did not match the shape the artifact describes.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    /// A selector was malformed or did not match the data it was built from.
    #[error("invalid selector: {0}")]
    InvalidSelector(String),
    /// An argument referenced a variable that was not provided.
    #[error("undefined variable `{0}`")]
    UnknownVariable(String),
    /// `publish` was called while another publish was in progress.
    #[error("publish called re-entrantly")]
    ReentrantPublish,
    /// `execute_subscription` was called on a network without `subscribe`.
    #[error("network layer does not support subscriptions")]
    MissingSubscribeFunction,
    /// An internal invariant was violated.
    #[error("invariant violated: {0}")]
    Invariant(String),
    /// A `@required(action: THROW)` field was null.
    #[error("missing required field `{path}` in `{owner}`")]
    MissingRequiredField {
        /// Fragment or operation that declared the field.
        owner: String,
        /// Path of the field within the fragment.
        path: String,
    },
    /// Configuration could not be loaded or decoded.
    #[error("config error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for RuntimeError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidPayload(err.to_string())
    }
}
