// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Status snapshots published on the status topic.

use serde::{Deserialize, Serialize};

/// Connection summary for one broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerStatus {
    pub url: String,
    pub connected: bool,
}

/// Message counters of a relay instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStats {
    /// Messages published to the outbound broker.
    pub messages_relayed: u64,

    /// Bytes of relayed payloads.
    pub bytes_relayed: u64,

    /// Messages matching no rule.
    pub messages_unmatched: u64,

    /// Messages dropped by the loop guard.
    pub messages_looped: u64,

    /// Failed outbound publishes.
    pub errors: u64,
}

impl RelayStats {
    pub fn record_relayed(&mut self, bytes: usize) {
        self.messages_relayed += 1;
        self.bytes_relayed += bytes as u64;
    }

    pub fn record_unmatched(&mut self) {
        self.messages_unmatched += 1;
    }

    pub fn record_looped(&mut self) {
        self.messages_looped += 1;
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }
}

/// JSON document published on `<apiBase>/status/<name>/info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub name: String,
    pub timestamp: String,
    pub event: String,
    pub is_running: bool,
    pub log_level: String,
    pub broker_in: BrokerStatus,
    pub broker_out: BrokerStatus,
    /// Active subscriptions, the control subscription excluded.
    pub active_data_subscriptions: Vec<String>,
    pub topic_map_count: usize,
    #[serde(default)]
    pub stats: RelayStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_field_names() {
        let snapshot = StatusSnapshot {
            name: "edge".into(),
            timestamp: "2026-01-01 00:00:00".into(),
            event: "Status requested.".into(),
            is_running: true,
            log_level: "info".into(),
            broker_in: BrokerStatus {
                url: "mqtt://a:1883".into(),
                connected: true,
            },
            broker_out: BrokerStatus {
                url: "mqtt://b:1883".into(),
                connected: false,
            },
            active_data_subscriptions: vec!["x/#".into()],
            topic_map_count: 1,
            stats: RelayStats::default(),
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["isRunning"], true);
        assert_eq!(value["brokerOut"]["connected"], false);
        assert_eq!(value["activeDataSubscriptions"][0], "x/#");
        assert_eq!(value["topicMapCount"], 1);
        assert_eq!(value["stats"]["messagesRelayed"], 0);
    }

    #[test]
    fn test_stats_counters() {
        let mut stats = RelayStats::default();
        stats.record_relayed(10);
        stats.record_relayed(5);
        stats.record_unmatched();
        stats.record_looped();
        stats.record_error();
        assert_eq!(stats.messages_relayed, 2);
        assert_eq!(stats.bytes_relayed, 15);
        assert_eq!(stats.messages_unmatched, 1);
        assert_eq!(stats.messages_looped, 1);
        assert_eq!(stats.errors, 1);
    }
}
