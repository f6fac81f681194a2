// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT Relay
//!
//! Subscribes to topics on an inbound broker, rewrites their names and
//! republishes them on an outbound broker. Every instance can be inspected
//! and reconfigured at runtime over MQTT.
//!
//! # Features
//!
//! - **Topic Remapping**: MQTT wildcard rules with prefix rewriting
//! - **Publish Options**: Fixed or pass-through (`auto`) QoS and retain
//! - **Control Plane**: `getstatus`, `config:get`, `config:set`, `config:mod`,
//!   `setloglevel`, `stopinstance` and `startinstance` commands
//! - **Loop Guard**: Drops messages republished unchanged to the same broker
//! - **Multiple Instances**: One process, many relays, reload on SIGHUP
//!
//! # Quick Start
//!
//! ```bash
//! # Write a starter configuration and run it
//! mqtt-relay init
//! mqtt-relay --config relay-config.yaml
//!
//! # Ask a relay for its status
//! mosquitto_pub -t mqtt-relay/edge/getstatus -n
//! mosquitto_sub -t mqtt-relay/status/edge/info
//! ```
//!
//! # Configuration File
//!
//! ```yaml
//! - name: edge
//!   brokerInUrl: mqtt://localhost:1883
//!   brokerOutUrl: mqtt://cloud.example.com:1883
//!   topicMap:
//!     - in: device123/sensor/#
//!       out: home/sensors
//! ```

pub mod config;
pub mod connection;
pub mod control;
pub mod host;
pub mod logging;
pub mod mapping;
pub mod mock;
pub mod mqtt;
pub mod relay;
pub mod status;
pub mod subscriptions;
pub mod tree;

pub use config::{BrokerOptions, ConfigError, LogOptions, RelaySettings};
pub use connection::{
    BrokerClient, BrokerEvent, ConnectionError, ConnectionState, Connector, InboundMessage, Side,
};
pub use control::{ControlCommand, ControlError, Namespace};
pub use host::{RelayHost, ReloadReport};
pub use logging::{LogLevel, LogSink, MemorySink, RelayLog, TracingSink};
pub use mapping::{PublishOptions, Qos, TopicMapper, TopicRule};
pub use mock::{MockConnector, Withheld};
pub use mqtt::{BrokerAddress, MqttConnector};
pub use relay::{Relay, RelayCommand, RelayError, RelayHandle};
pub use status::{RelayStats, StatusSnapshot};
pub use subscriptions::{reconcile, SubscriptionPlan, SubscriptionSet};
pub use tree::{ConfigPath, PathError};
