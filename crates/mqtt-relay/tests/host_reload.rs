// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Multi-instance host: start, reload and shutdown of relay tasks.

use mqtt_relay::{MemorySink, MockConnector, RelayHost, Side};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn relay(name: &str, rule: &str) -> Value {
    json!({
        "name": name,
        "brokerInUrl": "mqtt://in.local:1883",
        "brokerOutUrl": "mqtt://out.local:1883",
        "topicMap": [{"in": rule}],
        "operationTimeoutMs": 500
    })
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn host() -> (RelayHost, MockConnector) {
    let mock = MockConnector::new();
    let host = RelayHost::new(Arc::new(mock.clone()), Arc::new(MemorySink::new()));
    (host, mock)
}

fn status_published(mock: &MockConnector, name: &str) -> bool {
    let topic = format!("mqtt-relay/status/{}/info", name);
    mock.published_on(Side::Inbound).iter().any(|m| m.topic == topic)
}

#[tokio::test]
async fn test_reload_starts_instances() {
    let (mut host, mock) = host();
    let mut unnamed = relay("ignored", "b/#");
    unnamed.as_object_mut().unwrap().remove("name");

    let report = host.reload(&json!([relay("a", "a/#"), unnamed])).await.unwrap();
    assert_eq!(report.started, vec!["a".to_string(), "relay1".to_string()]);
    assert!(report.rejected.is_empty());
    assert_eq!(host.names(), vec!["a".to_string(), "relay1".to_string()]);

    wait_until("both relays to start", || {
        status_published(&mock, "a") && status_published(&mock, "relay1")
    })
    .await;
    assert_eq!(mock.connect_count(Side::Inbound), 2);
    assert_eq!(mock.connect_count(Side::Outbound), 2);
    assert!(mock
        .connects()
        .iter()
        .any(|c| c.side == Side::Inbound && c.client_id.starts_with("relay_in_relay1_")));

    host.shutdown().await;
}

#[tokio::test]
async fn test_reload_single_mapping_document() {
    let (mut host, mock) = host();
    let report = host.reload(&relay("solo", "#")).await.unwrap();
    assert_eq!(report.started, vec!["solo".to_string()]);
    wait_until("relay to start", || status_published(&mock, "solo")).await;
    host.shutdown().await;
}

#[tokio::test]
async fn test_reload_updates_and_stops() {
    let (mut host, mock) = host();
    host.reload(&json!({"relays": [relay("a", "a/#"), relay("b", "b/#")]}))
        .await
        .unwrap();
    wait_until("both relays to start", || {
        status_published(&mock, "a") && status_published(&mock, "b")
    })
    .await;

    let report = host.reload(&json!([relay("a", "x/#")])).await.unwrap();
    assert_eq!(report.updated, vec!["a".to_string()]);
    assert_eq!(report.stopped, vec!["b".to_string()]);
    assert!(report.started.is_empty());
    assert_eq!(host.names(), vec!["a".to_string()]);

    let unsubscribed = mock.unsubscribe_calls().concat();
    assert!(unsubscribed.contains(&"mqtt-relay/b/#".to_string()));

    wait_until("relay a to resubscribe", || {
        mock.subscribe_calls()
            .iter()
            .any(|call| call.iter().any(|(topic, _)| topic == "x/#"))
    })
    .await;
    assert_eq!(mock.connect_count(Side::Inbound), 3);

    host.shutdown().await;
}

#[tokio::test]
async fn test_reload_unchanged_keeps_connections() {
    let (mut host, mock) = host();
    host.reload(&json!([relay("a", "a/#")])).await.unwrap();
    wait_until("relay to start", || status_published(&mock, "a")).await;

    let report = host.reload(&json!([relay("a", "a/#")])).await.unwrap();
    assert_eq!(report.updated, vec!["a".to_string()]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(mock.connect_count(Side::Inbound), 1);

    host.shutdown().await;
}

#[tokio::test]
async fn test_invalid_entry_rejected() {
    let (mut host, _) = host();
    let report = host
        .reload(&json!([relay("a/b", "#"), relay("ok", "#")]))
        .await
        .unwrap();

    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].0, "a/b");
    assert_eq!(report.started, vec!["ok".to_string()]);
    assert!(host.handle("a/b").is_none());

    host.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_names_fail_reload() {
    let (mut host, _) = host();
    let result = host.reload(&json!([relay("a", "#"), relay("a", "b/#")])).await;
    assert!(result.is_err());
    assert!(host.names().is_empty());
}

#[tokio::test]
async fn test_shutdown_stops_all() {
    let (mut host, mock) = host();
    host.reload(&json!([relay("a", "a/#"), relay("b", "b/#")]))
        .await
        .unwrap();
    wait_until("both relays to start", || {
        status_published(&mock, "a") && status_published(&mock, "b")
    })
    .await;

    let handle = host.handle("a").unwrap();
    host.shutdown().await;

    assert!(host.names().is_empty());
    assert!(handle.is_closed());
    let unsubscribed = mock.unsubscribe_calls().concat();
    assert!(unsubscribed.contains(&"a/#".to_string()));
    assert!(unsubscribed.contains(&"b/#".to_string()));
}
