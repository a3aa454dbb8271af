// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Scripted network for driving executions from tests.
//!
//! Every `fetch`/`subscribe` is recorded together with its sink. Tests then
//! push payloads, completion or errors into a chosen request, which makes
//! the arrival order of incremental chunks fully controllable.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::Value;
use weft_observable::{Cleanup, Observable, Sink};
use weft_runtime::{
    CacheConfig, GraphQlResponse, Network, OperationKind, RawPayload, RequestParameters,
    RuntimeError, Uploadables, Variables,
};

/// One call into the network.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Operation name.
    pub name: String,
    /// Operation kind.
    pub kind: OperationKind,
    /// Variables passed to the network.
    pub variables: Variables,
    /// Cache directives passed to the network.
    pub cache_config: CacheConfig,
    /// True when sent through `subscribe`.
    pub subscription: bool,
    sink: Sink<GraphQlResponse, RuntimeError>,
    terminated: Rc<Cell<bool>>,
    cancelled: Rc<Cell<bool>>,
}

impl RecordedRequest {
    /// True once the caller unsubscribed before the request terminated.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    /// True once the request terminated or was cancelled.
    pub fn is_closed(&self) -> bool {
        self.sink.closed()
    }
}

#[derive(Default)]
struct Inner {
    requests: Vec<RecordedRequest>,
    replies: BTreeMap<String, Vec<GraphQlResponse>>,
}

/// [`Network`] whose responses are pushed by the test.
///
/// Clones share state, so a test keeps one handle while the environment
/// owns another.
#[derive(Clone, Default)]
pub struct ScriptedNetwork {
    inner: Rc<RefCell<Inner>>,
}

impl std::fmt::Debug for ScriptedNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedNetwork")
            .field("requests", &self.request_count())
            .finish_non_exhaustive()
    }
}

impl ScriptedNetwork {
    /// Creates a network with no scripted replies.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers every future request named `name` synchronously with
    /// `responses`, then completes.
    pub fn reply_with(&self, name: &str, responses: Vec<GraphQlResponse>) {
        self.inner
            .borrow_mut()
            .replies
            .insert(name.to_string(), responses);
    }

    /// Number of requests sent so far.
    pub fn request_count(&self) -> usize {
        self.inner.borrow().requests.len()
    }

    /// The `index`th request.
    ///
    /// # Panics
    /// Panics when no such request was made.
    #[allow(clippy::panic)]
    pub fn request(&self, index: usize) -> RecordedRequest {
        self.inner
            .borrow()
            .requests
            .get(index)
            .cloned()
            .unwrap_or_else(|| panic!("no request at index {index}"))
    }

    /// Index of the most recent request.
    ///
    /// # Panics
    /// Panics when no request was made.
    #[allow(clippy::panic)]
    pub fn last_index(&self) -> usize {
        let count = self.request_count();
        if count == 0 {
            panic!("no requests recorded");
        }
        count - 1
    }

    /// Pushes `response` into request `index`.
    pub fn next(&self, index: usize, response: GraphQlResponse) {
        // Clone the sink out so observers may call back into the network.
        let sink = self.request(index).sink;
        sink.next(response);
    }

    /// Pushes a JSON payload into request `index`.
    ///
    /// # Panics
    /// Panics when `payload` is not a valid response.
    #[allow(clippy::panic)]
    pub fn next_json(&self, index: usize, payload: Value) {
        let response: GraphQlResponse = serde_json::from_value(payload)
            .unwrap_or_else(|error| panic!("invalid response payload: {error}"));
        self.next(index, response);
    }

    /// Pushes a payload carrying only `data` into request `index`.
    ///
    /// # Panics
    /// Panics when `data` is not a JSON object.
    #[allow(clippy::panic)]
    pub fn next_data(&self, index: usize, data: Value) {
        let Value::Object(data) = data else {
            panic!("payload data must be an object");
        };
        self.next(index, RawPayload::from_data(data).into());
    }

    /// Completes request `index`.
    pub fn complete(&self, index: usize) {
        let request = self.request(index);
        request.terminated.set(true);
        request.sink.complete();
    }

    /// Fails request `index`.
    pub fn error(&self, index: usize, error: RuntimeError) {
        let request = self.request(index);
        request.terminated.set(true);
        request.sink.error(error);
    }

    fn start(
        &self,
        params: &RequestParameters,
        variables: &Variables,
        cache_config: &CacheConfig,
        subscription: bool,
    ) -> Observable<GraphQlResponse, RuntimeError> {
        let inner = Rc::clone(&self.inner);
        let name = params.name.clone();
        let kind = params.operation_kind;
        let variables = variables.clone();
        let cache_config = cache_config.clone();
        Observable::create(move |sink| {
            let terminated = Rc::new(Cell::new(false));
            let cancelled = Rc::new(Cell::new(false));
            let replies = {
                let mut inner = inner.borrow_mut();
                inner.requests.push(RecordedRequest {
                    name: name.clone(),
                    kind,
                    variables: variables.clone(),
                    cache_config: cache_config.clone(),
                    subscription,
                    sink: sink.clone(),
                    terminated: Rc::clone(&terminated),
                    cancelled: Rc::clone(&cancelled),
                });
                inner.replies.get(&name).cloned()
            };
            if let Some(replies) = replies {
                for response in replies {
                    sink.next(response);
                }
                terminated.set(true);
                sink.complete();
            }
            Cleanup::from_fn(move || {
                if !terminated.get() {
                    cancelled.set(true);
                }
            })
        })
    }
}

impl Network for ScriptedNetwork {
    fn fetch(
        &self,
        params: &RequestParameters,
        variables: &Variables,
        cache_config: &CacheConfig,
        _uploadables: Option<&Uploadables>,
    ) -> Observable<GraphQlResponse, RuntimeError> {
        self.start(params, variables, cache_config, false)
    }

    fn subscribe(
        &self,
        params: &RequestParameters,
        variables: &Variables,
        cache_config: &CacheConfig,
    ) -> Observable<GraphQlResponse, RuntimeError> {
        self.start(params, variables, cache_config, true)
    }
}
