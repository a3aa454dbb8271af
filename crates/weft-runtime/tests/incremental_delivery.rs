// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs)]
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::rc::Rc;

use proptest::prelude::*;
use proptest::test_runner::{Config as PropConfig, RngAlgorithm, TestRng, TestRunner};
use serde_json::{json, Value};
use weft_dry_tests::{
    defer, linked, operation, plural, reader_linked, reader_plural, reader_scalar, scalar, stream,
    RequestBuilder, ScriptedNetwork, StreamRecorder,
};
use weft_observable::Subscription;
use weft_runtime::{
    ConcreteRequest, DataId, Environment, GraphQlResponse, NormalizationSelection,
    NormalizationSplitOperation, OperationDescriptor, ReaderSelection, RecordSourceView,
    RuntimeError, StaticOperationLoader,
};

const DEFER_LABEL: &str = "FeedQuery$defer$bio";
const STREAM_LABEL: &str = "FeedQuery$stream$friends";

fn feed_query() -> Rc<ConcreteRequest> {
    RequestBuilder::new("FeedQuery")
        .normalization(vec![linked(
            "me",
            Vec::new(),
            Some("User"),
            vec![
                scalar("id"),
                defer(DEFER_LABEL, vec![scalar("bio")]),
                stream(
                    STREAM_LABEL,
                    plural("friends", Some("User"), vec![scalar("id"), scalar("name")]),
                ),
            ],
        )])
        .reader(vec![reader_linked(
            "me",
            Vec::new(),
            vec![
                reader_scalar("id"),
                ReaderSelection::Defer {
                    selections: vec![reader_scalar("bio")],
                },
                ReaderSelection::Stream {
                    selections: vec![reader_plural(
                        "friends",
                        vec![reader_scalar("id"), reader_scalar("name")],
                    )],
                },
            ],
        )])
        .build()
}

fn initial() -> Value {
    json!({"data": {"me": {"id": "4", "friends": [{"id": "2", "name": "Ada"}]}}})
}

fn deferred_bio() -> Value {
    json!({"label": DEFER_LABEL, "path": ["me"], "data": {"bio": "hello"}})
}

fn streamed_friend(index: usize, id: &str, name: &str) -> Value {
    json!({
        "label": STREAM_LABEL,
        "path": ["me", "friends", index],
        "data": {"id": id, "name": name},
    })
}

fn payloads() -> Vec<Value> {
    vec![
        initial(),
        deferred_bio(),
        streamed_friend(1, "3", "Grace"),
        streamed_friend(2, "5", "Barbara"),
    ]
}

fn full_feed() -> Value {
    json!({"me": {
        "id": "4",
        "bio": "hello",
        "friends": [
            {"id": "2", "name": "Ada"},
            {"id": "3", "name": "Grace"},
            {"id": "5", "name": "Barbara"},
        ],
    }})
}

struct Feed {
    env: Environment,
    network: ScriptedNetwork,
    op: OperationDescriptor,
    recorder: StreamRecorder<GraphQlResponse, RuntimeError>,
    subscription: Subscription,
}

fn start() -> Feed {
    let network = ScriptedNetwork::new();
    let env = Environment::builder(Rc::new(network.clone())).build();
    let op = operation(&feed_query(), json!({}));
    let recorder = StreamRecorder::new();
    let subscription = env.execute(&op).subscribe(recorder.observer());
    Feed {
        env,
        network,
        op,
        recorder,
        subscription,
    }
}

fn feed(env: &Environment, op: &OperationDescriptor) -> Option<Value> {
    env.lookup(&op.fragment).unwrap().data.map(|data| data.to_json())
}

#[test]
fn deferred_and_streamed_chunks_merge_into_the_initial_payload() {
    let Feed {
        env,
        network,
        op,
        recorder,
        ..
    } = start();

    network.next_json(0, initial());
    let snapshot = env.lookup(&op.fragment).unwrap();
    assert!(snapshot.is_missing_data, "bio has not arrived yet");

    network.next_json(0, deferred_bio());
    network.next_json(0, streamed_friend(1, "3", "Grace"));
    network.next_json(0, streamed_friend(2, "5", "Barbara"));
    let snapshot = env.lookup(&op.fragment).unwrap();
    assert!(!snapshot.is_missing_data);
    assert_eq!(snapshot.data.unwrap().to_json(), full_feed());
    assert_eq!(recorder.values().len(), 4);
    assert!(!recorder.completed());

    network.complete(0);
    assert!(recorder.completed());
}

#[test]
fn batched_incremental_payloads_apply_in_one_response() {
    let Feed {
        env,
        network,
        op,
        recorder,
        ..
    } = start();
    network.next_json(0, Value::Array(payloads()));
    assert_eq!(feed(&env, &op), Some(full_feed()));
    assert_eq!(recorder.values().len(), 1);
}

#[test]
fn final_stream_chunk_settles_the_stream_before_network_complete() {
    let Feed {
        env,
        network,
        op,
        recorder,
        ..
    } = start();
    network.next_json(0, initial());
    network.next_json(0, deferred_bio());
    let mut last = streamed_friend(1, "3", "Grace");
    last["extensions"] = json!({"is_final": true});
    network.next_json(0, last);

    assert!(!recorder.completed());
    network.complete(0);
    assert!(recorder.completed());
    let friends = feed(&env, &op).unwrap()["me"]["friends"].clone();
    assert_eq!(
        friends,
        json!([{"id": "2", "name": "Ada"}, {"id": "3", "name": "Grace"}])
    );
}

#[test]
fn duplicate_deferred_payloads_are_ignored() {
    let Feed {
        env,
        network,
        op,
        recorder,
        ..
    } = start();
    network.next_json(0, initial());
    network.next_json(0, deferred_bio());
    network.next_json(
        0,
        json!({"label": DEFER_LABEL, "path": ["me"], "data": {"bio": "changed"}}),
    );
    assert_eq!(feed(&env, &op).unwrap()["me"]["bio"], json!("hello"));
    assert_eq!(recorder.error(), None);
}

#[test]
fn pending_defer_holds_completion_until_cancelled() {
    let fixture = start();
    fixture.network.next_json(0, initial());
    fixture.network.complete(0);
    assert!(!fixture.recorder.completed(), "deferred payload still outstanding");
    let store = fixture.env.get_store();
    assert_eq!(store.release_buffer_len(), 0, "operation stays retained");

    fixture.subscription.unsubscribe();
    assert!(!fixture.recorder.completed());
    assert_eq!(store.release_buffer_len(), 1, "cancel releases the operation");
}

#[test]
fn incremental_payload_order_does_not_change_the_result() {
    const SEED_BYTES: [u8; 32] = [
        0x17, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        0, 0, 0,
    ];
    let rng = TestRng::from_seed(RngAlgorithm::ChaCha, &SEED_BYTES);
    let mut runner = TestRunner::new_with_rng(
        PropConfig {
            cases: 48,
            ..PropConfig::default()
        },
        rng,
    );

    let order = Just((0..4).collect::<Vec<usize>>()).prop_shuffle();
    runner
        .run(&order, |order| {
            let Feed {
                env,
                network,
                op,
                recorder,
                ..
            } = start();
            let payloads = payloads();
            for index in &order {
                network.next_json(0, payloads[*index].clone());
            }
            prop_assert_eq!(feed(&env, &op), Some(full_feed()));
            prop_assert!(!recorder.completed());
            network.complete(0);
            prop_assert!(recorder.completed());
            prop_assert_eq!(recorder.error(), None);
            Ok(())
        })
        .expect("payload order must not matter");
}

fn module_query() -> Rc<ConcreteRequest> {
    RequestBuilder::new("ProfileQuery")
        .normalization(vec![linked(
            "me",
            Vec::new(),
            Some("User"),
            vec![
                scalar("id"),
                NormalizationSelection::ModuleImport {
                    document_name: "ProfileQuery".into(),
                    fragment_name: "Bio_user".into(),
                    fragment_prop_name: "user".into(),
                },
            ],
        )])
        .reader(vec![reader_linked("me", Vec::new(), vec![reader_scalar("id")])])
        .build()
}

fn module_payload() -> Value {
    json!({"data": {"me": {
        "id": "4",
        "bio": "hello",
        "__module_component_ProfileQuery": "Bio.react",
        "__module_operation_ProfileQuery": "Bio_user$normalization.graphql",
    }}})
}

#[test]
fn module_imports_normalize_with_the_loaded_operation() {
    let loader = StaticOperationLoader::new();
    loader.insert(
        "Bio_user$normalization.graphql",
        NormalizationSplitOperation {
            name: "Bio_user$normalization".into(),
            selections: vec![scalar("bio")],
        },
    );
    let network = ScriptedNetwork::new();
    let env = Environment::builder(Rc::new(network.clone()))
        .operation_loader(Rc::new(loader))
        .build();
    let op = operation(&module_query(), json!({}));
    let recorder = StreamRecorder::<GraphQlResponse, RuntimeError>::new();
    let _sub = env.execute(&op).subscribe(recorder.observer());
    network.next_json(0, module_payload());
    network.complete(0);

    let source = env.get_store().get_source();
    let me = source.get(&DataId::from("4")).unwrap();
    assert_eq!(me.get_value("bio"), Some(json!("hello")));
    assert_eq!(
        me.get_value("__module_component_ProfileQuery"),
        Some(json!("Bio.react"))
    );
    assert!(recorder.completed());
}

#[test]
fn module_imports_without_a_loader_fail() {
    let network = ScriptedNetwork::new();
    let env = Environment::builder(Rc::new(network.clone())).build();
    let op = operation(&module_query(), json!({}));
    let recorder = StreamRecorder::<GraphQlResponse, RuntimeError>::new();
    let _sub = env.execute(&op).subscribe(recorder.observer());
    network.next_json(0, module_payload());

    assert!(matches!(
        recorder.error(),
        Some(RuntimeError::ModuleLoad { reference, .. }) if reference == "Bio_user$normalization.graphql"
    ));
    assert!(network.request(0).is_cancelled());
}

#[test]
fn stream_items_far_past_the_list_fail_the_execution() {
    let Feed {
        network,
        recorder,
        ..
    } = start();
    network.next_json(0, initial());
    network.next_json(0, streamed_friend(1_000_000_000_000_000, "3", "Grace"));

    assert_eq!(recorder.values().len(), 1);
    assert!(matches!(recorder.error(), Some(RuntimeError::InvalidPayload(_))));
    assert!(network.request(0).is_cancelled());
}

#[test]
fn stream_items_may_land_a_little_ahead_of_the_list() {
    let Feed {
        env,
        network,
        op,
        recorder,
        ..
    } = start();
    network.next_json(0, initial());
    network.next_json(0, deferred_bio());
    network.next_json(0, streamed_friend(3, "5", "Barbara"));
    assert_eq!(recorder.error(), None);
    let friends = feed(&env, &op).unwrap()["me"]["friends"].clone();
    assert_eq!(
        friends,
        json!([{"id": "2", "name": "Ada"}, null, null, {"id": "5", "name": "Barbara"}])
    );
}
