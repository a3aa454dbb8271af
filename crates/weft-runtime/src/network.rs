// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Network boundary: payload shapes and the [`Network`] port.
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use weft_observable::{Observable, Timer};

use crate::ast::RequestParameters;
use crate::error::RuntimeError;
use crate::variables::Variables;

/// One segment of a response path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// List index.
    Index(usize),
    /// Response key.
    Key(String),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "{i}"),
            Self::Key(k) => f.write_str(k),
        }
    }
}

/// Joins a path with `.` for use as a map key.
pub fn path_key(path: &[PathSegment]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

/// One GraphQL error entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadError {
    /// Human readable message.
    pub message: String,
    /// Remaining server-provided keys (`locations`, `path`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One response (or response chunk) from the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPayload {
    /// Response data.
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
    /// GraphQL errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<PayloadError>>,
    /// Extensions; `is_final: true` marks the last chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
    /// Label of the `@defer`/`@stream` boundary this chunk answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Path of the chunk within the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PathSegment>>,
}

impl RawPayload {
    /// A plain data payload.
    pub fn from_data(data: Map<String, Value>) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    /// True when `extensions.is_final` is `true`.
    pub fn is_final(&self) -> bool {
        self.extensions
            .as_ref()
            .and_then(|ext| ext.get("is_final"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// True for `@defer`/`@stream` chunks.
    pub fn is_incremental(&self) -> bool {
        self.path.is_some() && self.label.is_some()
    }
}

/// A network response: one payload or an ordered batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GraphQlResponse {
    /// Batched payloads, processed in order.
    Batch(Vec<RawPayload>),
    /// Single payload.
    Single(RawPayload),
}

impl GraphQlResponse {
    /// Payloads in processing order.
    pub fn payloads(&self) -> &[RawPayload] {
        match self {
            Self::Batch(items) => items,
            Self::Single(item) => std::slice::from_ref(item),
        }
    }

    /// Parses a response body.
    pub fn from_json(json: &str) -> Result<Self, RuntimeError> {
        Ok(serde_json::from_str(json)?)
    }
}

impl From<RawPayload> for GraphQlResponse {
    fn from(payload: RawPayload) -> Self {
        Self::Single(payload)
    }
}

/// Where `execute` may read data from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchPolicy {
    /// Always fetch.
    #[default]
    NetworkOnly,
    /// Skip the network when the store can fulfil the operation.
    StoreOrNetwork,
    /// Fetch even when the store can fulfil the operation.
    StoreAndNetwork,
    /// Never fetch.
    StoreOnly,
}

impl FetchPolicy {
    /// True for policies that consult the store first.
    pub fn reads_store(self) -> bool {
        !matches!(self, Self::NetworkOnly)
    }
}

/// Per-request cache directives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Bypass any network-level cache.
    #[serde(default)]
    pub force: bool,
    /// Re-run the request on this interval.
    #[serde(default, with = "poll_millis")]
    pub poll: Option<Duration>,
    /// Store/network preference.
    #[serde(default)]
    pub fetch_policy: FetchPolicy,
    /// Free-form metadata passed to the network.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

mod poll_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// Files attached to a mutation.
pub type Uploadables = BTreeMap<String, Value>;

/// Injected transport.
pub trait Network {
    /// Executes a query or mutation.
    fn fetch(
        &self,
        params: &RequestParameters,
        variables: &Variables,
        cache_config: &CacheConfig,
        uploadables: Option<&Uploadables>,
    ) -> Observable<GraphQlResponse, RuntimeError>;

    /// Starts a subscription. The default reports that subscriptions are
    /// unsupported.
    fn subscribe(
        &self,
        params: &RequestParameters,
        variables: &Variables,
        cache_config: &CacheConfig,
    ) -> Observable<GraphQlResponse, RuntimeError> {
        let _ = (params, variables, cache_config);
        Observable::from_error(RuntimeError::MissingSubscribeFunction)
    }
}

/// Fetch closure accepted by [`NetworkLayer`].
pub type FetchFunction = Rc<
    dyn Fn(
        &RequestParameters,
        &Variables,
        &CacheConfig,
        Option<&Uploadables>,
    ) -> Observable<GraphQlResponse, RuntimeError>,
>;

/// Subscribe closure accepted by [`NetworkLayer`].
pub type SubscribeFunction = Rc<
    dyn Fn(&RequestParameters, &Variables, &CacheConfig) -> Observable<GraphQlResponse, RuntimeError>,
>;

/// Closure-backed [`Network`].
///
/// When a timer is attached, requests whose cache config sets `poll` are
/// re-run on that interval.
#[derive(Clone)]
pub struct NetworkLayer {
    fetch: FetchFunction,
    subscribe: Option<SubscribeFunction>,
    timer: Option<Rc<dyn Timer>>,
}

impl NetworkLayer {
    /// Creates a layer from a fetch closure.
    pub fn new(
        fetch: impl Fn(
                &RequestParameters,
                &Variables,
                &CacheConfig,
                Option<&Uploadables>,
            ) -> Observable<GraphQlResponse, RuntimeError>
            + 'static,
    ) -> Self {
        Self {
            fetch: Rc::new(fetch),
            subscribe: None,
            timer: None,
        }
    }

    /// Adds subscription support.
    pub fn with_subscribe(
        mut self,
        subscribe: impl Fn(&RequestParameters, &Variables, &CacheConfig) -> Observable<GraphQlResponse, RuntimeError>
            + 'static,
    ) -> Self {
        self.subscribe = Some(Rc::new(subscribe));
        self
    }

    /// Enables `poll` support using `timer`.
    pub fn with_timer(mut self, timer: Rc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }
}

impl fmt::Debug for NetworkLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkLayer")
            .field("subscribe", &self.subscribe.is_some())
            .field("timer", &self.timer.is_some())
            .finish()
    }
}

impl Network for NetworkLayer {
    fn fetch(
        &self,
        params: &RequestParameters,
        variables: &Variables,
        cache_config: &CacheConfig,
        uploadables: Option<&Uploadables>,
    ) -> Observable<GraphQlResponse, RuntimeError> {
        let observable = (self.fetch)(params, variables, cache_config, uploadables);
        match (cache_config.poll, &self.timer) {
            (Some(interval), Some(timer)) => observable.poll(interval, Rc::clone(timer)),
            _ => observable,
        }
    }

    fn subscribe(
        &self,
        params: &RequestParameters,
        variables: &Variables,
        cache_config: &CacheConfig,
    ) -> Observable<GraphQlResponse, RuntimeError> {
        match &self.subscribe {
            Some(subscribe) => subscribe(params, variables, cache_config),
            None => Observable::from_error(RuntimeError::MissingSubscribeFunction),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn batched_and_single_responses_parse() {
        let single = GraphQlResponse::from_json(r#"{"data":{"me":null}}"#).unwrap();
        assert_eq!(single.payloads().len(), 1);
        let batch = GraphQlResponse::from_json(
            r#"[{"data":{"name":"A"},"label":"Q$defer$F","path":["me"]},
                {"data":{"id":"9"},"label":"Q$stream$items","path":["me","items",3],
                 "extensions":{"is_final":true}}]"#,
        )
        .unwrap();
        let payloads = batch.payloads();
        assert_eq!(payloads.len(), 2);
        assert!(payloads[0].is_incremental());
        assert_eq!(
            payloads[1].path.as_deref().unwrap()[2],
            PathSegment::Index(3)
        );
        assert!(payloads[1].is_final());
        assert_eq!(path_key(payloads[1].path.as_deref().unwrap()), "me.items.3");
    }

    #[test]
    fn graphql_errors_keep_extra_keys() {
        let response =
            GraphQlResponse::from_json(r#"{"errors":[{"message":"boom","path":["me"]}]}"#).unwrap();
        let errors = response.payloads()[0].errors.as_ref().unwrap();
        assert_eq!(errors[0].message, "boom");
        assert!(errors[0].extra.contains_key("path"));
    }
}
