// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

#![allow(missing_docs)]
#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::BTreeSet;
use std::rc::Rc;

use serde_json::{json, Value};
use weft_dry_tests::{
    linked, local_argument, operation, reader_linked, reader_scalar, scalar, variable,
    QueueScheduler, RequestBuilder, SnapshotRecorder,
};
use weft_runtime::{
    normalize_response, ConcreteRequest, DataId, FieldValue, NormalizeOptions,
    OperationAvailability, OperationDescriptor, RawPayload, Record, RecordSource,
    RecordSourceView, RuntimeConfig, Store, ROOT_TYPE,
};

fn node_query(name: &str, fields: &[&str]) -> Rc<ConcreteRequest> {
    RequestBuilder::new(name)
        .argument(local_argument("id", Value::Null))
        .normalization(vec![linked(
            "node",
            vec![variable("id", "id")],
            Some("User"),
            fields.iter().map(|f| scalar(f)).collect(),
        )])
        .reader(vec![reader_linked(
            "node",
            vec![variable("id", "id")],
            fields.iter().map(|f| reader_scalar(f)).collect(),
        )])
        .build()
}

fn viewer_query() -> Rc<ConcreteRequest> {
    RequestBuilder::new("ViewerQuery")
        .normalization(vec![linked(
            "viewer",
            Vec::new(),
            Some("Viewer"),
            vec![linked("actor", Vec::new(), Some("User"), vec![scalar("id"), scalar("name")])],
        )])
        .reader(vec![reader_linked(
            "viewer",
            Vec::new(),
            vec![reader_linked(
                "actor",
                Vec::new(),
                vec![reader_scalar("id"), reader_scalar("name")],
            )],
        )])
        .build()
}

fn user(id: &str) -> OperationDescriptor {
    operation(&node_query("UserQuery", &["id", "name"]), json!({ "id": id }))
}

fn normalize(op: &OperationDescriptor, data: Value) -> RecordSource {
    let payload = RawPayload::from_data(data.as_object().cloned().expect("object payload"));
    normalize_response(&payload, &op.root, ROOT_TYPE, &NormalizeOptions::default())
        .unwrap()
        .source
}

fn publish(store: &Store, op: &OperationDescriptor, data: Value) {
    store.publish(&normalize(op, data), None).unwrap();
    store.notify(Some(op), false).unwrap();
}

fn gc_store(release_buffer: usize) -> (Store, Rc<QueueScheduler>) {
    let scheduler = Rc::new(QueueScheduler::new());
    let store = Store::builder(RecordSource::new())
        .config(
            RuntimeConfig::from_json(&format!(r#"{{"gc_release_buffer_size": {release_buffer}}}"#))
                .unwrap(),
        )
        .scheduler(Rc::clone(&scheduler) as Rc<dyn weft_runtime::TaskScheduler>)
        .build();
    (store, scheduler)
}

fn has_record(store: &Store, id: &str) -> bool {
    store.with_source(|view| view.get(&DataId::from(id)).is_some())
}

#[test]
fn one_record_backs_every_query_that_reaches_it() {
    let store = Store::new(RecordSource::new());
    let zuck = user("4");
    let viewer = operation(&viewer_query(), json!({}));
    publish(&store, &zuck, json!({"node": {"id": "4", "name": "Zuck"}}));

    let snapshot = store.lookup(&zuck.fragment).unwrap();
    let recorder = SnapshotRecorder::new();
    let _sub = store.subscribe(&snapshot, recorder.callback());

    publish(
        &store,
        &viewer,
        json!({"viewer": {"actor": {"id": "4", "name": "Mark"}}}),
    );

    assert_eq!(recorder.count(), 1);
    let seen = recorder.last().unwrap();
    assert_eq!(
        seen.data.unwrap().to_json(),
        json!({"node": {"id": "4", "name": "Mark"}})
    );
    let viewer_data = store.lookup(&viewer.fragment).unwrap().data.unwrap();
    assert_eq!(
        viewer_data.to_json(),
        json!({"viewer": {"actor": {"id": "4", "name": "Mark"}}})
    );
}

#[test]
fn writes_between_notifies_coalesce_into_one_callback() {
    let store = Store::new(RecordSource::new());
    let zuck = user("4");
    publish(&store, &zuck, json!({"node": {"id": "4", "name": "Zuck"}}));
    let recorder = SnapshotRecorder::new();
    let _sub = store.subscribe(&store.lookup(&zuck.fragment).unwrap(), recorder.callback());

    store
        .publish(&normalize(&zuck, json!({"node": {"id": "4", "name": "A"}})), None)
        .unwrap();
    store
        .publish(&normalize(&zuck, json!({"node": {"id": "4", "name": "B"}})), None)
        .unwrap();
    assert_eq!(recorder.count(), 0, "publish alone never notifies");

    let outcome = store.notify(Some(&zuck), false).unwrap();
    assert_eq!(recorder.count(), 1);
    assert_eq!(
        recorder.last().unwrap().data.unwrap().to_json(),
        json!({"node": {"id": "4", "name": "B"}})
    );
    assert!(outcome.updated_ids.contains(&DataId::from("4")));
    assert_eq!(outcome.updated_owners.len(), 1);
}

#[test]
fn identical_payloads_do_not_notify() {
    let store = Store::new(RecordSource::new());
    let zuck = user("4");
    publish(&store, &zuck, json!({"node": {"id": "4", "name": "Zuck"}}));
    let recorder = SnapshotRecorder::new();
    let _sub = store.subscribe(&store.lookup(&zuck.fragment).unwrap(), recorder.callback());

    publish(&store, &zuck, json!({"node": {"id": "4", "name": "Zuck"}}));
    assert_eq!(recorder.count(), 0);
}

#[test]
fn disposed_subscriptions_stop_firing() {
    let store = Store::new(RecordSource::new());
    let zuck = user("4");
    publish(&store, &zuck, json!({"node": {"id": "4", "name": "Zuck"}}));
    let recorder = SnapshotRecorder::new();
    let sub = store.subscribe(&store.lookup(&zuck.fragment).unwrap(), recorder.callback());
    assert_eq!(store.subscription_count(), 1);
    sub.dispose();
    assert_eq!(store.subscription_count(), 0);

    publish(&store, &zuck, json!({"node": {"id": "4", "name": "Mark"}}));
    assert_eq!(recorder.count(), 0);
}

#[test]
fn repeated_lookups_share_data_until_a_seen_record_changes() {
    let store = Store::new(RecordSource::new());
    let zuck = user("4");
    publish(&store, &zuck, json!({"node": {"id": "4", "name": "Zuck"}}));

    let first = store.lookup(&zuck.fragment).unwrap().data.unwrap();
    let second = store.lookup(&zuck.fragment).unwrap().data.unwrap();
    assert!(first.ptr_eq(&second));

    let mut unrelated = RecordSource::new();
    let mut record = Record::new(DataId::from("99"), "User");
    record.set("name", FieldValue::scalar(json!("Someone")));
    unrelated.set(record);
    store.publish(&unrelated, None).unwrap();
    store.notify(None, false).unwrap();
    let third = store.lookup(&zuck.fragment).unwrap().data.unwrap();
    assert!(first.ptr_eq(&third), "unrelated writes keep the cached read");

    publish(&store, &zuck, json!({"node": {"id": "4", "name": "Mark"}}));
    let fourth = store.lookup(&zuck.fragment).unwrap().data.unwrap();
    assert!(!first.ptr_eq(&fourth));
    assert_eq!(fourth.get("node").and_then(|n| n.get("name")).and_then(|n| n.as_str()), Some("Mark"));
}

#[test]
fn check_tracks_missing_present_and_invalidated_data() {
    let store = Store::new(RecordSource::new());
    let zuck = user("4");
    assert_eq!(store.check(&zuck).unwrap(), OperationAvailability::Missing);

    publish(&store, &zuck, json!({"node": {"id": "4", "name": "Zuck"}}));
    assert!(matches!(
        store.check(&zuck).unwrap(),
        OperationAvailability::Available { .. }
    ));

    let wider = operation(
        &node_query("UserWithUsernameQuery", &["id", "name", "username"]),
        json!({"id": "4"}),
    );
    assert_eq!(store.check(&wider).unwrap(), OperationAvailability::Missing);

    let invalidated: BTreeSet<DataId> = [DataId::from("4")].into_iter().collect();
    store.publish(&RecordSource::new(), Some(&invalidated)).unwrap();
    store.notify(None, false).unwrap();
    assert_eq!(store.check(&zuck).unwrap(), OperationAvailability::Stale);

    publish(&store, &zuck, json!({"node": {"id": "4", "name": "Zuck"}}));
    assert!(matches!(
        store.check(&zuck).unwrap(),
        OperationAvailability::Available { .. }
    ));
}

#[test]
fn invalidated_records_are_stale_for_operations_that_never_wrote_them() {
    let store = Store::new(RecordSource::new());
    let fetched = user("4");
    publish(&store, &fetched, json!({"node": {"id": "4", "name": "Zuck"}}));
    let reader = operation(&node_query("OtherUserQuery", &["id", "name"]), json!({"id": "4"}));
    assert_eq!(
        store.check(&reader).unwrap(),
        OperationAvailability::Available { fetch_time: None }
    );

    let invalidated: BTreeSet<DataId> = [DataId::from("4")].into_iter().collect();
    store.publish(&RecordSource::new(), Some(&invalidated)).unwrap();
    store.notify(None, false).unwrap();
    assert_eq!(store.check(&fetched).unwrap(), OperationAvailability::Stale);
    assert_eq!(store.check(&reader).unwrap(), OperationAvailability::Stale);
}

#[test]
fn global_invalidation_makes_every_operation_stale() {
    let store = Store::new(RecordSource::new());
    let zuck = user("4");
    publish(&store, &zuck, json!({"node": {"id": "4", "name": "Zuck"}}));
    store.notify(None, true).unwrap();
    assert_eq!(store.check(&zuck).unwrap(), OperationAvailability::Stale);
}

#[test]
fn invalidation_subscribers_hear_about_their_records_only() {
    let store = Store::new(RecordSource::new());
    publish(&store, &user("4"), json!({"node": {"id": "4", "name": "Zuck"}}));
    publish(&store, &user("5"), json!({"node": {"id": "5", "name": "Ada"}}));

    let watched = store.lookup_invalidation_state(&[DataId::from("4")]);
    let hits = Rc::new(std::cell::Cell::new(0));
    let counter = Rc::clone(&hits);
    let subscription =
        store.subscribe_to_invalidation_state(&watched, move || counter.set(counter.get() + 1));

    let other: BTreeSet<DataId> = [DataId::from("5")].into_iter().collect();
    store.publish(&RecordSource::new(), Some(&other)).unwrap();
    store.notify(None, false).unwrap();
    assert_eq!(hits.get(), 0);
    assert!(!store.check_invalidation_state(&watched));

    let mine: BTreeSet<DataId> = [DataId::from("4")].into_iter().collect();
    store.publish(&RecordSource::new(), Some(&mine)).unwrap();
    store.notify(None, false).unwrap();
    assert_eq!(hits.get(), 1);
    assert!(store.check_invalidation_state(&watched));

    subscription.dispose();
    store.notify(None, true).unwrap();
    assert_eq!(hits.get(), 1, "disposed subscribers are not called");
}

#[test]
fn released_data_is_collected_when_the_buffer_is_empty() {
    let (store, scheduler) = gc_store(0);
    let zuck = user("4");
    let viewer = operation(&viewer_query(), json!({}));
    let zuck_retain = store.retain(&zuck);
    let _viewer_retain = store.retain(&viewer);
    publish(&store, &zuck, json!({"node": {"id": "4", "name": "Zuck"}}));
    publish(
        &store,
        &viewer,
        json!({"viewer": {"actor": {"id": "5", "name": "Priscilla"}}}),
    );
    assert_eq!(scheduler.pending(), 0);

    zuck_retain.dispose();
    assert_eq!(scheduler.pending(), 1, "collection is deferred to the scheduler");
    assert!(has_record(&store, "4"));

    assert_eq!(scheduler.run_all(), 1);
    assert!(!has_record(&store, "4"));
    assert!(has_record(&store, "5"));
    assert!(has_record(&store, weft_runtime::ROOT_ID));
    assert_eq!(store.root_count(), 1);
}

#[test]
fn writes_before_a_scheduled_sweep_reschedule_it() {
    let (store, scheduler) = gc_store(0);
    let zuck = user("4");
    let viewer = operation(&viewer_query(), json!({}));
    let zuck_retain = store.retain(&zuck);
    let _viewer_retain = store.retain(&viewer);
    publish(&store, &zuck, json!({"node": {"id": "4", "name": "Zuck"}}));
    publish(
        &store,
        &viewer,
        json!({"viewer": {"actor": {"id": "5", "name": "Priscilla"}}}),
    );

    zuck_retain.dispose();
    publish(
        &store,
        &viewer,
        json!({"viewer": {"actor": {"id": "5", "name": "Cilla"}}}),
    );
    assert_eq!(scheduler.run_all(), 2, "first run aborts and reschedules");
    assert!(!has_record(&store, "4"));
    assert!(has_record(&store, "5"));
}

#[test]
fn re_retaining_before_the_sweep_keeps_the_data() {
    let (store, scheduler) = gc_store(0);
    let zuck = user("4");
    let retain = store.retain(&zuck);
    publish(&store, &zuck, json!({"node": {"id": "4", "name": "Zuck"}}));
    retain.dispose();
    let _again = store.retain(&zuck);

    scheduler.run_all();
    assert!(has_record(&store, "4"));
    assert!(matches!(
        store.lookup(&zuck.fragment).unwrap().data.unwrap().get("node"),
        Some(node) if node.get("name").and_then(|n| n.as_str()) == Some("Zuck")
    ));
}

#[test]
fn release_buffer_keeps_recent_roots_alive() {
    let (store, scheduler) = gc_store(1);
    let zuck = user("4");
    let priscilla = user("5");
    let first = store.retain(&zuck);
    let second = store.retain(&priscilla);
    publish(&store, &zuck, json!({"node": {"id": "4", "name": "Zuck"}}));
    publish(&store, &priscilla, json!({"node": {"id": "5", "name": "Priscilla"}}));

    first.dispose();
    assert_eq!(store.release_buffer_len(), 1);
    assert_eq!(scheduler.pending(), 0, "buffered roots do not trigger a sweep");

    second.dispose();
    assert_eq!(scheduler.pending(), 1);
    scheduler.run_all();
    assert!(!has_record(&store, "4"), "evicted root is collected");
    assert!(has_record(&store, "5"), "buffered root is still marked");
}

#[test]
fn holding_gc_defers_the_sweep_until_released() {
    let (store, scheduler) = gc_store(0);
    let zuck = user("4");
    let retain = store.retain(&zuck);
    publish(&store, &zuck, json!({"node": {"id": "4", "name": "Zuck"}}));

    let hold = store.hold_gc();
    retain.dispose();
    assert_eq!(scheduler.pending(), 0);
    assert!(has_record(&store, "4"));

    hold.dispose();
    assert_eq!(scheduler.pending(), 1);
    scheduler.run_all();
    assert!(!has_record(&store, "4"));
}
