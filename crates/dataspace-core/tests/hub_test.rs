#![allow(clippy::unwrap_used)]
// Integration tests for DataHub over the in-process broker.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use dataspace_core::{
    CoreError, DataHub, EntryKind, Handler, HubConfig, MemoryBroker, MessageKind, PatchOutcome,
    Payload, QoS,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

const SERVER: &str = "mqtt://broker.test";
const WAIT: Duration = Duration::from_secs(2);

fn url(topic: &str) -> String {
    format!("{SERVER}/{topic}")
}

/// Payload as delivered by the broker.
fn wire(raw: &'static str) -> Payload {
    Payload::Bytes(bytes::Bytes::from_static(raw.as_bytes()))
}

fn config() -> HubConfig {
    HubConfig {
        get_timeout: WAIT,
        patch_timeout: Duration::from_millis(200),
        patch_sweep_interval: Duration::from_millis(20),
        connect_timeout: WAIT,
        time_zone: chrono_tz::UTC,
        ..HubConfig::default()
    }
}

fn hub(broker: &MemoryBroker) -> DataHub<MemoryBroker> {
    DataHub::with_connector(broker.clone(), config())
}

/// Round-trip through the session so queued broker events are handled.
async fn settle(hub: &DataHub<MemoryBroker>) -> dataspace_core::SessionStats {
    hub.connection(SERVER).await.unwrap().stats().await.unwrap()
}

fn counting_handler() -> (Handler, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    let handler = Handler::new(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    (handler, count)
}

// ── Reads ────────────────────────────────────────────────────────────

#[tokio::test]
async fn get_returns_retained_value() {
    let broker = MemoryBroker::new();
    broker.publish("sensors/temp", "21.5", true);
    let hub = hub(&broker);

    let delivery = hub.get(&url("sensors/temp")).await.unwrap().unwrap();
    assert_eq!(delivery.payload, wire("21.5"));
    assert_eq!(delivery.kind, MessageKind::Retained);
    assert_eq!(delivery.topic, "sensors/temp");
    assert_eq!(delivery.url, "mqtt://broker.test/sensors/temp");
}

#[tokio::test]
async fn get_timeout_returns_none_and_cleans_up() {
    let broker = MemoryBroker::new();
    let hub = hub(&broker);

    let result = hub
        .get_timeout(&url("nobody/home"), Duration::from_millis(50))
        .await
        .unwrap();
    assert!(result.is_none());

    let stats = settle(&hub).await;
    assert_eq!(stats.pending_gets, 0);
    assert_eq!(stats.subscribed_topics, 0);
    let client_id = hub.connection(SERVER).await.unwrap().client_id().to_owned();
    assert!(broker.subscriptions(&client_id).is_empty());
}

#[tokio::test]
async fn abandoned_get_withdraws_its_waiter() {
    let broker = MemoryBroker::new();
    let hub = hub(&broker);
    let connection = hub.connection(SERVER).await.unwrap();

    // Dropped after the request is queued but before it is answered.
    let abandoned = tokio::time::timeout(Duration::ZERO, connection.get("nobody/home", WAIT)).await;
    assert!(abandoned.is_err());

    let stats = settle(&hub).await;
    assert_eq!(stats.pending_gets, 0);
    assert_eq!(stats.subscribed_topics, 0);
}

#[tokio::test]
async fn get_applies_json_path_filter() {
    let broker = MemoryBroker::new();
    broker.publish("cfg", r#"{"a":{"b":7},"c":1}"#, true);
    let hub = hub(&broker);

    let delivery = hub.get(&url("cfg$.a.b")).await.unwrap().unwrap();
    assert_eq!(delivery.payload, Payload::Json(json!(7)));
    assert_eq!(delivery.topic, "cfg");
}

#[tokio::test]
async fn get_with_maps_delivery() {
    let broker = MemoryBroker::new();
    broker.publish("n", "41", true);
    let hub = hub(&broker);

    let value = hub
        .get_with(&url("n"), WAIT, |d| d.payload.to_json().unwrap().as_i64().unwrap() + 1)
        .await
        .unwrap();
    assert_eq!(value, Some(42));
}

#[tokio::test]
async fn get_detached_runs_handler_once() {
    let broker = MemoryBroker::new();
    broker.publish("once", "1", true);
    let hub = hub(&broker);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = Handler::new(move |d| {
        let _ = tx.send(d.payload.clone());
    });
    hub.get_detached(&url("once"), handler).await.unwrap();

    let first = tokio::time::timeout(WAIT, rx.recv()).await.unwrap();
    assert_eq!(first, Some(wire("1")));

    broker.publish("once", "2", true);
    let stats = settle(&hub).await;
    assert_eq!(stats.subscribed_topics, 0);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn own_write_is_visible_before_echo() {
    let broker = MemoryBroker::new();
    let hub = hub(&broker);

    hub.publish(&url("doc"), json!({"v": 1}), QoS::AtMostOnce, false)
        .await
        .unwrap();
    let delivery = hub.get(&url("doc")).await.unwrap().unwrap();

    assert_eq!(delivery.kind, MessageKind::Cached);
    assert_eq!(delivery.payload.to_json().unwrap(), json!({"v": 1}));

    let cached = hub.get_cached(&url("doc")).await.unwrap().unwrap();
    assert_eq!(cached.kind, MessageKind::PendingUpdate);
}

#[tokio::test]
async fn late_subscriber_receives_cached_value_first() {
    let broker = MemoryBroker::new();
    let hub = hub(&broker);

    let mut first = hub.subscribe_stream(&url("live")).await.unwrap();
    broker.publish("live", "1", false);
    let live = tokio::time::timeout(WAIT, first.next()).await.unwrap().unwrap();
    assert_eq!(live.kind, MessageKind::Public);

    let mut second = hub.subscribe_stream(&url("live")).await.unwrap();
    let replay = tokio::time::timeout(WAIT, second.next()).await.unwrap().unwrap();
    assert_eq!(replay.kind, MessageKind::Cached);
    assert_eq!(replay.payload, wire("1"));

    broker.publish("live", "2", false);
    let next = tokio::time::timeout(WAIT, second.next()).await.unwrap().unwrap();
    assert_eq!(next.payload, wire("2"));
}

#[tokio::test]
async fn private_replies_are_classified() {
    let broker = MemoryBroker::new();
    let hub = hub(&broker);
    let connection = hub.connection(SERVER).await.unwrap();

    let mut stream = connection.subscribe_stream("query").await.unwrap();
    broker.publish(&format!("$private/{}/query", connection.client_id()), "only you", false);

    let delivery = tokio::time::timeout(WAIT, stream.next()).await.unwrap().unwrap();
    assert_eq!(delivery.kind, MessageKind::Private);
    assert_eq!(delivery.topic, "query");
}

// ── Subscriptions ────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_subscriptions_are_rejected() {
    let broker = MemoryBroker::new();
    let hub = hub(&broker);
    let (handler, _) = counting_handler();

    assert!(hub.subscribe(&url("t"), handler.clone()).await.unwrap());
    assert!(!hub.subscribe(&url("t"), handler.clone()).await.unwrap());
    assert!(hub.subscribe(&url("t$.x"), handler.clone()).await.unwrap());

    assert!(hub.unsubscribe(&url("t"), &handler).await.unwrap());
    assert!(!hub.unsubscribe(&url("t"), &handler).await.unwrap());
    assert!(hub.unsubscribe(&url("t$.x"), &handler).await.unwrap());
    assert_eq!(settle(&hub).await.subscribed_topics, 0);
}

#[tokio::test]
async fn unsubscribe_stops_deliveries() {
    let broker = MemoryBroker::new();
    let hub = hub(&broker);
    let (handler, count) = counting_handler();

    hub.subscribe(&url("ticks"), handler.clone()).await.unwrap();
    broker.publish("ticks", "1", false);
    settle(&hub).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    hub.unsubscribe(&url("ticks"), &handler).await.unwrap();
    broker.publish("ticks", "2", false);
    let stats = settle(&hub).await;

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(stats.subscribed_topics, 0);
    let client_id = hub.connection(SERVER).await.unwrap().client_id().to_owned();
    assert!(broker.subscriptions(&client_id).is_empty());

    // Nothing is retained, so a fresh subscription waits for the next publish.
    let (again, replays) = counting_handler();
    hub.subscribe(&url("ticks"), again).await.unwrap();
    settle(&hub).await;
    assert_eq!(replays.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn resubscribing_retained_topic_delivers_once() {
    let broker = MemoryBroker::new();
    broker.publish("r", "1", true);
    let hub = hub(&broker);

    let (first, count) = counting_handler();
    hub.subscribe(&url("r"), first.clone()).await.unwrap();
    settle(&hub).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    hub.unsubscribe(&url("r"), &first).await.unwrap();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let second = Handler::new(move |d| {
        sink.lock().unwrap().push((d.kind, d.payload.clone()));
    });
    hub.subscribe(&url("r"), second).await.unwrap();
    settle(&hub).await;

    assert_eq!(*seen.lock().unwrap(), vec![(MessageKind::Retained, wire("1"))]);
}

#[tokio::test]
async fn own_write_is_replayed_to_fresh_subscription() {
    let broker = MemoryBroker::new();
    let hub = hub(&broker);

    hub.publish(&url("w"), "mine", QoS::AtMostOnce, false)
        .await
        .unwrap();
    let mut stream = hub.subscribe_stream(&url("w")).await.unwrap();

    let delivery = tokio::time::timeout(WAIT, stream.next()).await.unwrap().unwrap();
    assert_eq!(delivery.kind, MessageKind::Cached);
    assert_eq!(delivery.payload, wire("mine"));
}

#[tokio::test]
async fn dropping_stream_unsubscribes() {
    let broker = MemoryBroker::new();
    let hub = hub(&broker);

    let stream = hub.subscribe_stream(&url("s")).await.unwrap();
    assert_eq!(settle(&hub).await.subscribed_topics, 1);
    drop(stream);
    assert_eq!(settle(&hub).await.subscribed_topics, 0);
}

#[tokio::test]
async fn panicking_handler_does_not_stop_deliveries() {
    let broker = MemoryBroker::new();
    let hub = hub(&broker);

    hub.subscribe(&url("p"), Handler::new(|_| panic!("boom")))
        .await
        .unwrap();
    let mut stream = hub.subscribe_stream(&url("p")).await.unwrap();

    broker.publish("p", "1", false);
    broker.publish("p", "2", false);
    let first = tokio::time::timeout(WAIT, stream.next()).await.unwrap().unwrap();
    let second = tokio::time::timeout(WAIT, stream.next()).await.unwrap().unwrap();
    assert_eq!(first.payload, wire("1"));
    assert_eq!(second.payload, wire("2"));
}

// ── Patches ──────────────────────────────────────────────────────────

#[tokio::test]
async fn patch_sets_path_in_empty_document() {
    let broker = MemoryBroker::new();
    broker.publish("doc", "{}", true);
    let hub = hub(&broker);

    let patch = hub.patch(&url("doc"), "$.a", json!(5)).await.unwrap();
    assert_eq!(patch.outcome().await, PatchOutcome::Applied);

    let cached = hub.get_cached(&url("doc")).await.unwrap().unwrap();
    assert_eq!(
        serde_json::from_slice::<serde_json::Value>(&cached.payload).unwrap(),
        json!({"a": 5})
    );
    // Patched documents are published without retain.
    assert_eq!(broker.retained("doc").unwrap().as_ref(), b"{}");
    assert_eq!(settle(&hub).await.pending_patches, 0);
}

#[tokio::test]
async fn publish_with_path_patches_next_delivery() {
    let broker = MemoryBroker::new();
    let writer = hub(&broker);
    let reader = hub(&broker);

    let mut watch = reader.subscribe_stream(&url("shared")).await.unwrap();
    writer
        .publish(&url("shared$.b.c"), json!(true), QoS::AtMostOnce, false)
        .await
        .unwrap();
    assert_eq!(settle(&writer).await.pending_patches, 1);

    broker.publish("shared", r#"{"x":1}"#, false);

    let original = tokio::time::timeout(WAIT, watch.next()).await.unwrap().unwrap();
    assert_eq!(original.payload.to_json().unwrap(), json!({"x": 1}));
    let patched = tokio::time::timeout(WAIT, watch.next()).await.unwrap().unwrap();
    assert_eq!(
        patched.payload.to_json().unwrap(),
        json!({"x": 1, "b": {"c": true}})
    );

    let stats = settle(&writer).await;
    assert_eq!(stats.pending_patches, 0);
}

#[tokio::test]
async fn text_patch_values_stay_strings() {
    let broker = MemoryBroker::new();
    broker.publish("text", "{}", true);
    broker.publish("raw", "{}", true);
    let hub = hub(&broker);

    hub.publish(&url("text$.a"), "5", QoS::AtMostOnce, false)
        .await
        .unwrap();
    hub.publish(&url("raw$.a"), bytes::Bytes::from_static(b"5"), QoS::AtMostOnce, false)
        .await
        .unwrap();
    settle(&hub).await;

    let text = hub.get_cached(&url("text")).await.unwrap().unwrap();
    let raw = hub.get_cached(&url("raw")).await.unwrap().unwrap();
    assert_eq!(
        serde_json::from_slice::<serde_json::Value>(&text.payload).unwrap(),
        json!({"a": "5"})
    );
    assert_eq!(
        serde_json::from_slice::<serde_json::Value>(&raw.payload).unwrap(),
        json!({"a": 5})
    );
}

#[tokio::test]
async fn patches_on_one_topic_share_a_write() {
    let broker = MemoryBroker::new();
    let hub = hub(&broker);

    let a = hub.patch(&url("multi"), "$.a", json!(1)).await.unwrap();
    let b = hub.patch(&url("multi"), "$.b", json!(2)).await.unwrap();
    settle(&hub).await;
    broker.publish("multi", "{}", false);

    assert_eq!(a.outcome().await, PatchOutcome::Applied);
    assert_eq!(b.outcome().await, PatchOutcome::Applied);
    let cached = hub.get_cached(&url("multi")).await.unwrap().unwrap();
    assert_eq!(
        serde_json::from_slice::<serde_json::Value>(&cached.payload).unwrap(),
        json!({"a": 1, "b": 2})
    );
}

#[tokio::test]
async fn patch_expires_without_delivery() {
    let broker = MemoryBroker::new();
    let hub = hub(&broker);

    let patch = hub.patch(&url("silent"), "$.a", json!(1)).await.unwrap();
    assert_eq!(patch.outcome().await, PatchOutcome::Expired);

    let stats = settle(&hub).await;
    assert_eq!(stats.pending_patches, 0);
    assert_eq!(stats.subscribed_topics, 0);
}

#[tokio::test]
async fn patch_on_undecodable_document_fails() {
    let broker = MemoryBroker::new();
    broker.publish("raw", "not json", true);
    let hub = hub(&broker);

    let patch = hub.patch(&url("raw"), "$.a", json!(1)).await.unwrap();
    assert!(matches!(patch.outcome().await, PatchOutcome::Failed { .. }));
    assert_eq!(broker.retained("raw").unwrap().as_ref(), b"not json");
}

#[tokio::test]
async fn invalid_json_path_is_rejected() {
    let broker = MemoryBroker::new();
    let hub = hub(&broker);

    let err = hub.patch(&url("doc"), "$[", json!(1)).await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidJsonPath { .. }));
}

// ── Directories and history ──────────────────────────────────────────

#[tokio::test]
async fn directory_listing_distinguishes_entries() {
    let broker = MemoryBroker::new();
    broker.publish("models/", r#"["a.glb","sub/"]"#, true);
    let hub = hub(&broker);

    let entries = hub.list(&url("models")).await.unwrap().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name, "a.glb");
    assert_eq!(entries[0].kind, EntryKind::File);
    assert_eq!(entries[1].name, "sub/");
    assert_eq!(entries[1].kind, EntryKind::Directory);
}

#[tokio::test]
async fn listing_a_file_is_an_error() {
    let broker = MemoryBroker::new();
    broker.publish("file/", "plain text", true);
    let hub = hub(&broker);

    let err = hub.list(&url("file/")).await.unwrap_err();
    assert!(matches!(err, CoreError::NotADirectory { .. }));
}

#[tokio::test]
async fn find_queries_base_directory() {
    let broker = MemoryBroker::new();
    broker.publish(r#"datadirectory/?find="cube""#, r#"["Models/cube.glb"]"#, true);
    let hub = hub(&broker);

    let result = hub.find(SERVER, "cube").await.unwrap().unwrap();
    assert_eq!(result.payload.to_json().unwrap(), json!(["Models/cube.glb"]));
}

#[tokio::test]
async fn link_publishes_empty_request() {
    let broker = MemoryBroker::new();
    let observer = hub(&broker);
    let hub = hub(&broker);

    let mut requests = observer.subscribe_stream(&url("a/b?link=c/d")).await.unwrap();
    hub.link(&url("a/b"), "c/d").await.unwrap();

    let request = tokio::time::timeout(WAIT, requests.next()).await.unwrap().unwrap();
    assert!(request.payload.is_empty());
}

#[tokio::test]
async fn time_indexed_records() {
    let broker = MemoryBroker::new();
    broker.publish(
        "logs/TimeIndex/2024/03/05/07",
        "{\"time\":1709623800,\"v\":1}\n{\"time\":1709623860,\"v\":2}\n",
        true,
    );
    broker.publish("logs/TimeIndex/2024/03/05/07/", r#"["part-0.jsonl"]"#, true);
    let hub = hub(&broker);

    assert_eq!(
        hub.time_index_url(&url("logs"), 1_709_623_800).unwrap(),
        "mqtt://broker.test/logs/TimeIndex/2024/03/05/07"
    );

    let records = hub
        .get_records_at(&url("logs"), 1_709_623_800)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].get("v"), Some(&json!(2)));

    let files = hub.list_files_at(&url("logs"), 1_709_624_000).await.unwrap().unwrap();
    assert_eq!(files[0].name, "part-0.jsonl");
}

// ── Connections and credentials ──────────────────────────────────────

#[tokio::test]
async fn concurrent_callers_share_one_connection() {
    let broker = MemoryBroker::new();
    let hub = hub(&broker);

    let (a, b) = tokio::join!(hub.connection(SERVER), hub.connection("mqtt://BROKER.test:1883"));
    assert!(a.unwrap().same_session(&b.unwrap()));
    assert_eq!(broker.client_ids().len(), 1);
}

#[tokio::test]
async fn refused_credentials_fail_the_connection() {
    let broker = MemoryBroker::new().with_user("alice", "secret");
    let hub = hub(&broker);

    hub.add_credentials("broker.test", "alice", "wrong").unwrap();
    let err = hub.get(&url("x")).await.unwrap_err();
    assert!(matches!(err, CoreError::AuthenticationFailed { .. }));
}

#[tokio::test]
async fn deleting_credentials_closes_connection() {
    let broker = MemoryBroker::new().with_user("alice", "secret");
    broker.publish("x", "1", true);
    let hub = hub(&broker);

    hub.add_credentials("broker.test", "alice", "secret").unwrap();
    assert!(hub.has_credentials(SERVER).unwrap());
    assert!(hub.get(&url("x")).await.unwrap().is_some());
    assert_eq!(broker.client_ids().len(), 1);

    assert!(hub.delete_credentials("broker.test").await.unwrap());
    assert!(!hub.has_credentials(SERVER).unwrap());
    assert!(broker.client_ids().is_empty());

    let err = hub.get(&url("x")).await.unwrap_err();
    assert!(matches!(err, CoreError::AuthenticationFailed { .. }));
}

#[tokio::test]
async fn deleting_credentials_closes_every_scheme() {
    let broker = MemoryBroker::new().with_user("alice", "secret");
    broker.publish("x", "1", true);
    let hub = hub(&broker);

    hub.add_credentials("broker.test", "alice", "secret").unwrap();
    assert!(hub.get(&url("x")).await.unwrap().is_some());
    assert!(hub.get("mqtts://broker.test/x").await.unwrap().is_some());
    assert_eq!(broker.client_ids().len(), 2);

    assert!(hub.delete_credentials("mqtt://broker.test").await.unwrap());
    assert!(broker.client_ids().is_empty());
}

#[tokio::test]
async fn reconnect_restores_subscriptions() {
    let broker = MemoryBroker::new();
    let hub = hub(&broker);
    let connection = hub.connection(SERVER).await.unwrap();
    let client_id = connection.client_id().to_owned();

    let mut stream = connection.subscribe_stream("r").await.unwrap();
    broker.bounce(&client_id);
    settle(&hub).await;

    assert_eq!(
        broker.subscriptions(&client_id),
        vec![format!("$private/{client_id}/r"), "r".to_owned()]
    );
    broker.publish("r", "after", false);
    let delivery = tokio::time::timeout(WAIT, stream.next()).await.unwrap().unwrap();
    assert_eq!(delivery.payload, wire("after"));
}

#[tokio::test]
async fn urls_without_scheme_are_rejected() {
    let broker = MemoryBroker::new();
    let hub = hub(&broker);

    let err = hub.get("broker.test/topic").await.unwrap_err();
    assert!(matches!(err, CoreError::InvalidUrl { .. }));
}

#[tokio::test]
async fn shutdown_closes_every_connection() {
    let broker = MemoryBroker::new();
    let hub = hub(&broker);
    hub.connection(SERVER).await.unwrap();
    hub.connection("mqtt://other.test").await.unwrap();
    assert_eq!(broker.client_ids().len(), 2);

    hub.shutdown().await;
    assert!(broker.client_ids().is_empty());
}
