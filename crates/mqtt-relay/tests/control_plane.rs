// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Control plane: commands received under <apiBaseTopic>/<name>/.

use mqtt_relay::mock::PublishedMessage;
use mqtt_relay::{
    InboundMessage, LogLevel, MemorySink, MockConnector, Relay, Side, StatusSnapshot,
};
use serde_json::{json, Value};
use std::sync::Arc;

const STATUS_TOPIC: &str = "mqtt-relay/status/r/info";

fn base_tree() -> Value {
    json!({
        "name": "r",
        "brokerInUrl": "mqtt://in.local:1883",
        "brokerOutUrl": "mqtt://out.local:1883",
        "brokerOutOptions": {"keepalive": 30},
        "topicMap": [{"in": "a/#", "out": "b"}],
        "operationTimeoutMs": 500
    })
}

async fn started() -> (Relay, MockConnector, Arc<MemorySink>) {
    let mock = MockConnector::new();
    let sink = Arc::new(MemorySink::new());
    let mut relay = Relay::with_sink(base_tree(), Arc::new(mock.clone()), sink.clone()).unwrap();
    relay.start().await.unwrap();
    relay.process_pending().await;
    mock.clear_published();
    (relay, mock, sink)
}

async fn command(relay: &mut Relay, mock: &MockConnector, action: &str, payload: &str) {
    let topic = format!("mqtt-relay/r/{}", action);
    assert!(mock.inject(Side::Inbound, InboundMessage::new(topic, payload)));
    relay.process_pending().await;
}

fn statuses(mock: &MockConnector) -> Vec<StatusSnapshot> {
    mock.published_on(Side::Inbound)
        .iter()
        .filter(|m| m.topic == STATUS_TOPIC)
        .map(|m| serde_json::from_slice(&m.payload).unwrap())
        .collect()
}

fn last_event(mock: &MockConnector) -> String {
    statuses(mock).last().map(|s| s.event.clone()).unwrap_or_default()
}

fn on_topic(mock: &MockConnector, topic: &str) -> Vec<PublishedMessage> {
    mock.published()
        .into_iter()
        .filter(|m| m.topic == topic)
        .collect()
}

#[tokio::test]
async fn test_start_publishes_initial_status() {
    let mock = MockConnector::new();
    let mut relay = Relay::with_sink(base_tree(), Arc::new(mock.clone()), Arc::new(MemorySink::new())).unwrap();
    relay.start().await.unwrap();

    let status = statuses(&mock).pop().unwrap();
    assert_eq!(status.event, "Relay connected/initialized.");
    assert!(status.is_running);
    assert!(status.broker_in.connected);
    assert!(status.broker_out.connected);
    assert_eq!(status.active_data_subscriptions, vec!["a/#".to_string()]);
}

#[tokio::test]
async fn test_getstatus() {
    let (mut relay, mock, _) = started().await;
    command(&mut relay, &mock, "getstatus", "").await;

    let all = statuses(&mock);
    assert_eq!(all.len(), 1);
    let status = &all[0];
    assert_eq!(status.name, "r");
    assert_eq!(status.event, "Status requested.");
    assert_eq!(status.log_level, "warn");
    assert_eq!(status.broker_in.url, "mqtt://in.local:1883");
    assert_eq!(status.broker_out.url, "mqtt://out.local:1883");
    assert_eq!(status.topic_map_count, 1);

    // Status goes to the inbound broker only
    assert!(mock.published_on(Side::Outbound).is_empty());
}

#[tokio::test]
async fn test_command_action_case_insensitive() {
    let (mut relay, mock, _) = started().await;
    command(&mut relay, &mock, "GetStatus", "").await;
    assert_eq!(last_event(&mock), "Status requested.");
}

#[tokio::test]
async fn test_config_get_value() {
    let (mut relay, mock, _) = started().await;
    command(&mut relay, &mock, "config:get/brokerInUrl", "").await;

    let replies = on_topic(&mock, "mqtt-relay/status/r/configValue/brokerInUrl");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].payload_json(), Some(json!("mqtt://in.local:1883")));
}

#[tokio::test]
async fn test_config_get_nested_and_root() {
    let (mut relay, mock, _) = started().await;
    command(&mut relay, &mock, "config:get/topicMap/0/in", "").await;
    command(&mut relay, &mock, "config:get", "").await;

    let nested = on_topic(&mock, "mqtt-relay/status/r/configValue/topicMap_0_in");
    assert_eq!(nested[0].payload_json(), Some(json!("a/#")));

    let root = on_topic(&mock, "mqtt-relay/status/r/configValue/root");
    assert_eq!(root[0].payload_json(), Some(base_tree()));
}

#[tokio::test]
async fn test_config_get_missing_path() {
    let (mut relay, mock, _) = started().await;
    command(&mut relay, &mock, "config:get/nope/deeper", "").await;

    let replies = on_topic(&mock, "mqtt-relay/status/r/configValue/nope_deeper");
    assert_eq!(
        replies[0].payload_json(),
        Some(json!({"error": "Path not found", "requestedPath": "nope/deeper"}))
    );
}

#[tokio::test]
async fn test_config_set_topic_map_reconfigures() {
    let (mut relay, mock, _) = started().await;
    command(
        &mut relay,
        &mock,
        "config:set/topicMap",
        r#"[{"in": "x/#", "out": "y"}]"#,
    )
    .await;

    assert_eq!(mock.connect_count(Side::Inbound), 2);
    assert_eq!(mock.connect_count(Side::Outbound), 2);
    assert!(relay.is_running());
    assert!(relay.active_subscriptions().contains("x/#"));
    assert!(!relay.active_subscriptions().contains("a/#"));
    assert_eq!(relay.config()["topicMap"], json!([{"in": "x/#", "out": "y"}]));

    let status = statuses(&mock).pop().unwrap();
    assert_eq!(status.event, "Configuration set for path: topicMap");
    assert_eq!(status.active_data_subscriptions, vec!["x/#".to_string()]);

    mock.inject(Side::Inbound, InboundMessage::new("x/1", "v"));
    relay.process_pending().await;
    let out = mock.published_on(Side::Outbound);
    assert_eq!(out.last().unwrap().topic, "y/1");
}

#[tokio::test]
async fn test_config_set_invalid_rejected() {
    let (mut relay, mock, sink) = started().await;
    command(&mut relay, &mock, "config:set/name", r#""bad/name""#).await;

    assert_eq!(last_event(&mock), "Error: Failed to set config for path: name");
    assert_eq!(relay.name(), "r");
    assert_eq!(mock.connect_count(Side::Inbound), 1);
    assert!(sink.contains(LogLevel::Error, "Rejected config:set"));
}

#[tokio::test]
async fn test_config_set_out_of_bounds() {
    let (mut relay, mock, _) = started().await;
    command(&mut relay, &mock, "config:set/topicMap/5", r#"{"in": "z/#"}"#).await;

    assert_eq!(last_event(&mock), "Error: Failed to set config for path: topicMap/5");
    assert_eq!(relay.mapper().len(), 1);
}

#[tokio::test]
async fn test_config_set_appends_rule() {
    let (mut relay, mock, _) = started().await;
    command(&mut relay, &mock, "config:set/topicMap/1", r#"{"in": "z/#"}"#).await;

    assert_eq!(last_event(&mock), "Configuration set for path: topicMap/1");
    assert_eq!(relay.mapper().len(), 2);
    assert!(relay.active_subscriptions().contains("z/#"));
}

#[tokio::test]
async fn test_config_mod_merges_mapping() {
    let (mut relay, mock, _) = started().await;
    command(&mut relay, &mock, "config:mod/brokerOutOptions", r#"{"username": "u"}"#).await;

    assert_eq!(last_event(&mock), "Configuration modified for path: brokerOutOptions");
    assert_eq!(
        relay.config()["brokerOutOptions"],
        json!({"keepalive": 30, "username": "u"})
    );
    assert_eq!(relay.settings().broker_out_options.username.as_deref(), Some("u"));
}

#[tokio::test]
async fn test_config_mod_overwrites_scalar() {
    let (mut relay, mock, _) = started().await;
    command(&mut relay, &mock, "config:mod/brokerOutUrl", r#""mqtt://other:1883""#).await;

    assert_eq!(
        last_event(&mock),
        "Configuration modified (overwritten) for path: brokerOutUrl"
    );
    assert_eq!(relay.settings().broker_out_url, "mqtt://other:1883");
}

#[tokio::test]
async fn test_config_mod_missing_path() {
    let (mut relay, mock, _) = started().await;
    command(&mut relay, &mock, "config:mod/nothing/here", r#"{"a": 1}"#).await;

    assert_eq!(
        last_event(&mock),
        "Error: Path not found for config:mod - \"nothing/here\"."
    );
    assert_eq!(mock.connect_count(Side::Inbound), 1);
}

#[tokio::test]
async fn test_unknown_command() {
    let (mut relay, mock, sink) = started().await;
    command(&mut relay, &mock, "reboot", "").await;

    assert_eq!(last_event(&mock), "Error: Unknown command - \"reboot\".");
    assert!(sink.contains(LogLevel::Warn, "Control command rejected"));
}

#[tokio::test]
async fn test_setloglevel_plain_text() {
    let (mut relay, mock, _) = started().await;
    command(&mut relay, &mock, "setloglevel", "DEBUG").await;

    assert_eq!(relay.log_level(), LogLevel::Debug);
    assert_eq!(last_event(&mock), "Log level updated to debug.");
    assert_eq!(relay.config()["logOptions"]["logLevel"], json!("debug"));
    // No reconnect for a level change
    assert_eq!(mock.connect_count(Side::Inbound), 1);
}

#[tokio::test]
async fn test_setloglevel_object_payload() {
    let (mut relay, mock, _) = started().await;
    command(&mut relay, &mock, "setloglevel", r#"{"level": "error"}"#).await;

    assert_eq!(relay.log_level(), LogLevel::Error);
    assert_eq!(statuses(&mock).pop().unwrap().log_level, "error");
}

#[tokio::test]
async fn test_setloglevel_invalid() {
    let (mut relay, mock, _) = started().await;
    command(&mut relay, &mock, "setloglevel", "verbose").await;

    assert_eq!(relay.log_level(), LogLevel::Warn);
    assert_eq!(last_event(&mock), "Error: Invalid level for setLogLevel - \"verbose\".");
}

#[tokio::test]
async fn test_stopinstance() {
    let (mut relay, mock, _) = started().await;
    command(&mut relay, &mock, "stopinstance", "").await;

    let status = statuses(&mock).pop().unwrap();
    assert_eq!(status.event, "Relay instance stopped via API.");
    assert!(!status.is_running);
    assert!(!relay.is_running());
    assert!(relay.active_subscriptions().is_empty());
    let unsubscribed: Vec<String> = mock.unsubscribe_calls().concat();
    assert!(unsubscribed.contains(&"a/#".to_string()));
    assert!(unsubscribed.contains(&"mqtt-relay/r/#".to_string()));

    // Events from the closed connection are ignored
    mock.inject(Side::Inbound, InboundMessage::new("a/1", "v"));
    relay.process_pending().await;
    assert!(mock.published_on(Side::Outbound).is_empty());
}

#[tokio::test]
async fn test_startinstance_when_running() {
    let (mut relay, mock, sink) = started().await;
    command(&mut relay, &mock, "startinstance", "").await;

    assert_eq!(last_event(&mock), "Instance already running.");
    assert_eq!(mock.connect_count(Side::Inbound), 1);
    assert!(sink.contains(LogLevel::Warn, "already running"));
}

#[tokio::test]
async fn test_commands_during_reconfiguration_are_deferred() {
    let (mut relay, mock, _) = started().await;
    mock.inject(
        Side::Inbound,
        InboundMessage::new("mqtt-relay/r/config:set/topicMap", r#"[{"in": "x/#"}]"#),
    );
    mock.inject(Side::Inbound, InboundMessage::new("mqtt-relay/r/getstatus", ""));
    relay.process_pending().await;

    let events: Vec<String> = statuses(&mock).into_iter().map(|s| s.event).collect();
    let n = events.len();
    assert!(n >= 2);
    assert_eq!(events[n - 2], "Configuration set for path: topicMap");
    assert_eq!(events[n - 1], "Status requested.");
}

#[tokio::test]
async fn test_replace_config_unchanged_is_noop() {
    let (mut relay, mock, _) = started().await;
    relay.replace_config(base_tree()).await;
    assert_eq!(mock.connect_count(Side::Inbound), 1);

    let mut tree = base_tree();
    tree["topicMap"] = json!([{"in": "c/#"}]);
    relay.replace_config(tree).await;
    assert_eq!(mock.connect_count(Side::Inbound), 2);
    assert!(relay.active_subscriptions().contains("c/#"));
}

#[tokio::test]
async fn test_commands_during_replace_are_answered() {
    let (mut relay, mock, _) = started().await;
    mock.inject(Side::Inbound, InboundMessage::new("mqtt-relay/r/getstatus", ""));

    let mut tree = base_tree();
    tree["topicMap"] = json!([{"in": "c/#"}]);
    relay.replace_config(tree).await;

    // Answered once the restart completes, without further broker traffic
    let events: Vec<String> = statuses(&mock).into_iter().map(|s| s.event).collect();
    assert_eq!(events, vec!["Relay connected/initialized.", "Status requested."]);
}
