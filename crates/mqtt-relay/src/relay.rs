// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relay instance.
//!
//! A [`Relay`] owns its configuration tree, both broker connections and the
//! subscription state. Everything is driven from one task: connection
//! events and [`RelayCommand`]s are handled one at a time.
//!
//! Reconfiguration (a `config:set`, `config:mod` or a replaced tree) runs a
//! full stop/rebuild/start cycle. Control messages received while a cycle
//! waits on the brokers are queued and handled once it completes.

use crate::config::{ConfigError, RelaySettings};
use crate::connection::{
    BrokerEvent, ConnectionError, ConnectionEvent, ConnectionManager, ConnectionState, Connector,
    InboundMessage, Side,
};
use crate::control::{ControlCommand, Namespace};
use crate::logging::{LogLevel, LogSink, RelayLog, TracingSink};
use crate::mapping::{PublishOptions, Qos, Setting, TopicMapper};
use crate::status::{BrokerStatus, RelayStats, StatusSnapshot};
use crate::subscriptions::{BatchKind, SubscriptionSet};
use crate::tree::{self, ConfigPath, MergeOutcome, PathError};
use serde_json::{json, Value};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

/// Control messages kept while a reconfiguration cycle is in progress.
pub const MAX_DEFERRED_COMMANDS: usize = 64;

/// QoS requested for data subscriptions, so that `auto` rules see the
/// publisher's QoS.
pub const DATA_SUBSCRIPTION_QOS: Qos = Qos::ExactlyOnce;

pub const CONTROL_SUBSCRIPTION_QOS: Qos = Qos::AtMostOnce;

const PAYLOAD_PREVIEW_CHARS: usize = 100;

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("IN broker connection failed: {0}")]
    InboundConnect(String),

    #[error("Timed out after {0:?} waiting for the IN broker")]
    ConnectTimeout(Duration),

    #[error("Relay event channel closed")]
    ChannelClosed,

    #[error("Relay not running")]
    NotRunning,
}

/// Commands accepted by [`Relay::run`].
#[derive(Debug, Clone)]
pub enum RelayCommand {
    /// Replace the whole configuration tree.
    Replace(Value),
    /// Stop and leave the run loop.
    Shutdown,
}

/// Handle to a relay task.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<RelayCommand>,
}

impl RelayHandle {
    /// Create a handle and the receiver to pass to [`Relay::run`].
    pub fn channel() -> (Self, mpsc::Receiver<RelayCommand>) {
        let (tx, rx) = mpsc::channel(16);
        (Self { tx }, rx)
    }

    pub async fn replace_config(&self, tree: Value) -> Result<(), RelayError> {
        self.tx
            .send(RelayCommand::Replace(tree))
            .await
            .map_err(|_| RelayError::NotRunning)
    }

    pub async fn shutdown(&self) -> Result<(), RelayError> {
        self.tx
            .send(RelayCommand::Shutdown)
            .await
            .map_err(|_| RelayError::NotRunning)
    }

    /// Whether the relay task has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug)]
struct DeferredCommand {
    remainder: String,
    payload: Vec<u8>,
}

enum Mutation {
    Set(Value),
    Merge(Value),
}

impl Mutation {
    fn action(&self) -> &'static str {
        match self {
            Mutation::Set(_) => "set",
            Mutation::Merge(_) => "mod",
        }
    }
}

/// One relay instance.
#[derive(Debug)]
pub struct Relay {
    tree: Arc<Value>,
    settings: RelaySettings,
    mapper: TopicMapper,
    namespace: Namespace,
    log: RelayLog,
    connections: ConnectionManager,
    subscriptions: SubscriptionSet,
    deferred: VecDeque<DeferredCommand>,
    running: bool,
    stats: RelayStats,
}

impl Relay {
    /// Create a relay logging through `tracing`.
    pub fn new(tree: Value, connector: Arc<dyn Connector>) -> Result<Self, RelayError> {
        Self::with_sink(tree, connector, Arc::new(TracingSink))
    }

    /// Create a relay writing its log lines to `sink`.
    pub fn with_sink(
        tree: Value,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn LogSink>,
    ) -> Result<Self, RelayError> {
        let settings = RelaySettings::from_tree(&tree)?;
        let (mapper, _) = TopicMapper::compile(settings.topic_map.as_ref(), settings.publish_options);
        let mut relay = Self {
            tree: Arc::new(tree),
            namespace: Namespace::new(&settings.api_base_topic, &settings.name),
            log: RelayLog::new(settings.name.clone(), sink),
            mapper,
            settings,
            connections: ConnectionManager::new(connector),
            subscriptions: SubscriptionSet::new(),
            deferred: VecDeque::new(),
            running: false,
            stats: RelayStats::default(),
        };
        relay.rebuild()?;
        Ok(relay)
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Current configuration tree.
    pub fn config(&self) -> &Value {
        &self.tree
    }

    /// Shared snapshot of the configuration tree.
    pub fn config_snapshot(&self) -> Arc<Value> {
        Arc::clone(&self.tree)
    }

    pub fn mapper(&self) -> &TopicMapper {
        &self.mapper
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn log_level(&self) -> LogLevel {
        self.log.level()
    }

    pub fn active_subscriptions(&self) -> &BTreeSet<String> {
        self.subscriptions.active()
    }

    pub fn connection_state(&self, side: Side) -> ConnectionState {
        self.connections.connection(side).state()
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.settings.operation_timeout_ms)
    }

    /// Re-derive settings, logger, rules and namespace from the tree.
    fn rebuild(&mut self) -> Result<(), RelayError> {
        let settings = RelaySettings::from_tree(&self.tree)?;

        let (level, rejected) = settings.log_threshold();
        self.log.configure(&settings.name, level, &settings.log_options);
        if let Some(name) = rejected {
            self.log.warn(format_args!(
                "Invalid logLevel \"{}\" in config, using \"{}\". Valid levels: {}",
                name,
                level,
                LogLevel::valid_names()
            ));
        }

        let (mapper, skipped) = TopicMapper::compile(settings.topic_map.as_ref(), settings.publish_options);
        for err in &skipped {
            self.log.warn(err);
        }
        if mapper.is_forward_all() {
            self.log
                .info("No topicMap entries configured, forwarding all topics (#) as received.");
        } else if mapper.is_empty() {
            self.log
                .error("No valid topicMap entries, no data topics will be relayed.");
        }

        self.mapper = mapper;
        self.namespace = Namespace::new(&settings.api_base_topic, &settings.name);
        self.settings = settings;
        self.log.debug(format_args!(
            "Internal state re-initialized: {} rule(s), control topic {}",
            self.mapper.len(),
            self.namespace.subscription()
        ));
        Ok(())
    }

    /// Connect both brokers and wait until the inbound side is up.
    ///
    /// Fails when the inbound broker reports an error before connecting or
    /// does not connect within the operation timeout. The clients keep
    /// retrying in the background either way.
    pub async fn start(&mut self) -> Result<(), RelayError> {
        if self.connections.has_clients() {
            self.log
                .warn("Clients already exist, stopping them before reconnecting.");
            self.stop().await;
        }
        self.running = false;
        self.log.info(format_args!(
            "Connecting MQTT clients for \"{}\"...",
            self.settings.name
        ));

        self.connections.begin();
        if let Err(err) = self.connections.open(
            Side::Inbound,
            &self.settings.name,
            &self.settings.broker_in_url,
            &self.settings.broker_in_options,
        ) {
            self.log.error(format_args!("IN broker error: {}", err));
            return Err(err.into());
        }
        if let Err(err) = self.connections.open(
            Side::Outbound,
            &self.settings.name,
            &self.settings.broker_out_url,
            &self.settings.broker_out_options,
        ) {
            self.log.error(format_args!("OUT broker error: {}", err));
        }

        self.await_inbound().await?;
        self.publish_status("Relay connected/initialized.");
        self.log.info("Relay is active.");
        Ok(())
    }

    /// Pump events until the inbound side is connected and its first
    /// subscribe batch is answered.
    ///
    /// Only an error before the first connect fails the start; losing the
    /// connection afterwards is left to the client's reconnect.
    async fn await_inbound(&mut self) -> Result<(), RelayError> {
        let timeout = self.operation_timeout();
        let deadline = Instant::now() + timeout;
        let mut connected = false;
        while !connected || self.subscriptions.has_pending(BatchKind::Subscribe) {
            let event = match timeout_at(deadline, self.connections.next_event()).await {
                Ok(Some(event)) => event,
                Ok(None) => return Err(RelayError::ChannelClosed),
                Err(_) if connected => {
                    self.log.warn(format_args!(
                        "No subscribe acknowledgement within {}ms, continuing.",
                        timeout.as_millis()
                    ));
                    return Ok(());
                }
                Err(_) => {
                    self.log.error(format_args!(
                        "Timed out after {}ms waiting for the IN broker.",
                        timeout.as_millis()
                    ));
                    return Err(RelayError::ConnectTimeout(timeout));
                }
            };
            let inbound = event.side == Side::Inbound;
            let connects = inbound && matches!(event.event, BrokerEvent::Connected { .. });
            let failure = match &event.event {
                BrokerEvent::Error(message) if inbound => Some(message.clone()),
                BrokerEvent::Closed if inbound => Some("connection closed".to_string()),
                _ => None,
            };
            if let Some(message) = self.absorb(event) {
                self.defer(message);
            }
            connected |= connects;
            if let Some(message) = failure {
                if !connected {
                    return Err(RelayError::InboundConnect(message));
                }
                self.log
                    .warn("IN connection lost before subscriptions were acknowledged.");
                return Ok(());
            }
        }
        Ok(())
    }

    /// Unsubscribe everything and close both connections.
    pub async fn stop(&mut self) {
        self.log.info("Stopping relay...");
        self.running = false;
        let timeout = self.operation_timeout();
        let received = self
            .connections
            .shutdown(&mut self.subscriptions, &self.log, timeout)
            .await;
        for message in received {
            self.defer(message);
        }
        self.subscriptions.clear();
        self.log.info("Relay stopped.");
    }

    async fn restart(&mut self) -> Result<(), RelayError> {
        self.stop().await;
        self.rebuild()?;
        self.start().await
    }

    /// Drive the relay until shut down.
    pub async fn run(mut self, mut commands: mpsc::Receiver<RelayCommand>) {
        // Commands received while starting
        self.drain_deferred().await;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(RelayCommand::Replace(tree)) => self.replace_config(tree).await,
                    Some(RelayCommand::Shutdown) | None => break,
                },
                Some(event) = self.connections.next_event() => self.dispatch(event).await,
            }
        }
        self.drain_deferred().await;
        self.stop().await;
        if !self.deferred.is_empty() {
            self.log.warn(format_args!(
                "Dropping {} control command(s) received during shutdown.",
                self.deferred.len()
            ));
            self.deferred.clear();
        }
    }

    /// Process every already-queued event and deferred command without
    /// waiting for new ones.
    pub async fn process_pending(&mut self) {
        self.drain_deferred().await;
        while let Some(event) = self.connections.try_next_event() {
            self.dispatch(event).await;
        }
    }

    /// Swap in a new configuration tree and restart.
    pub async fn replace_config(&mut self, tree: Value) {
        if *self.tree == tree {
            self.log.debug("Configuration unchanged.");
            return;
        }
        if let Err(err) = RelaySettings::from_tree(&tree) {
            self.log
                .error(format_args!("Rejected configuration update: {}", err));
            return;
        }
        self.log
            .info("Configuration replaced, re-initializing relay.");
        self.tree = Arc::new(tree);
        if let Err(err) = self.restart().await {
            self.log.error(format_args!("Restart failed: {}", err));
        }
        self.drain_deferred().await;
    }

    async fn dispatch(&mut self, event: ConnectionEvent) {
        if let Some(message) = self.absorb(event) {
            self.process_message(message).await;
        }
        self.drain_deferred().await;
    }

    /// Handle the control commands queued during a reconfiguration cycle.
    async fn drain_deferred(&mut self) {
        while let Some(command) = self.deferred.pop_front() {
            self.handle_control(&command.remainder, &command.payload).await;
        }
    }

    /// Apply a connection event. Inbound messages are handed back.
    fn absorb(&mut self, event: ConnectionEvent) -> Option<InboundMessage> {
        let side = event.side;
        match event.event {
            BrokerEvent::Connected { session_present } => {
                self.log.info(format_args!(
                    "Connected to {} broker: {}",
                    side,
                    self.connections.connection(side).url()
                ));
                if side == Side::Inbound {
                    if !session_present {
                        self.subscriptions.clear();
                    }
                    self.running = true;
                    self.update_subscriptions();
                }
            }
            BrokerEvent::Message(message) => {
                if side == Side::Inbound {
                    return Some(message);
                }
                self.log.debug(format_args!(
                    "Ignoring message on OUT client: {}",
                    message.topic
                ));
            }
            BrokerEvent::Subscribed { request, results } => {
                if let Some(outcome) = self.subscriptions.complete_subscribe(request, &results) {
                    for (topic, qos) in &outcome.granted {
                        self.log
                            .info(format_args!("Subscribed to: {} (QoS {})", topic, qos));
                    }
                    for topic in &outcome.rejected {
                        self.log.error(format_args!(
                            "Subscription to {} was rejected by the IN broker.",
                            topic
                        ));
                    }
                }
            }
            BrokerEvent::Unsubscribed { request } => {
                if let Some(topics) = self.subscriptions.complete_unsubscribe(request) {
                    self.log
                        .info(format_args!("Unsubscribed from: {}", topics.join(", ")));
                }
            }
            BrokerEvent::Offline => {
                self.log.warn(format_args!("{} broker offline.", side));
                if side == Side::Inbound {
                    self.running = false;
                }
            }
            BrokerEvent::Error(message) => {
                self.log
                    .error(format_args!("{} broker error: {}", side, message));
                if side == Side::Inbound {
                    self.running = false;
                }
            }
            BrokerEvent::Closed => {
                self.log
                    .info(format_args!("{} broker connection closed.", side));
                if side == Side::Inbound {
                    self.running = false;
                }
            }
        }
        None
    }

    /// Queue control messages that arrive mid-cycle; handle data messages now.
    fn defer(&mut self, message: InboundMessage) {
        if let Some(remainder) = self.namespace.strip(&message.topic) {
            if self.deferred.len() >= MAX_DEFERRED_COMMANDS {
                self.log.error(format_args!(
                    "Reconfiguration in progress, rejecting control command on {}",
                    message.topic
                ));
                self.publish_status("Error: Reconfiguration in progress, command rejected.");
                return;
            }
            self.log.debug(format_args!(
                "Deferring control command on {} until reconfiguration completes",
                message.topic
            ));
            self.deferred.push_back(DeferredCommand {
                remainder: remainder.to_string(),
                payload: message.payload,
            });
        } else if self.running {
            self.handle_data(&message);
        } else {
            self.log.debug(format_args!(
                "Discarding message on {} while not running",
                message.topic
            ));
        }
    }

    async fn process_message(&mut self, message: InboundMessage) {
        match self.namespace.strip(&message.topic) {
            Some(remainder) => {
                let remainder = remainder.to_string();
                self.handle_control(&remainder, &message.payload).await;
            }
            None if self.running => self.handle_data(&message),
            None => self.log.debug(format_args!(
                "Discarding message on {} while not running",
                message.topic
            )),
        }
    }

    fn desired_subscriptions(&self) -> BTreeSet<String> {
        let mut desired = self.mapper.subscriptions();
        desired.insert(self.namespace.subscription());
        desired
    }

    /// Bring the inbound subscriptions in line with the rules.
    pub fn update_subscriptions(&mut self) {
        if !self.connections.connection(Side::Inbound).is_connected() {
            self.log
                .debug("IN client not connected, subscription update skipped.");
            return;
        }
        let plan = self.subscriptions.plan(&self.desired_subscriptions());
        if plan.is_empty() {
            self.log.debug("Subscriptions already up to date.");
            return;
        }

        if !plan.unsubscribe.is_empty() {
            match self.connections.unsubscribe(&plan.unsubscribe) {
                Ok(request) => {
                    self.log.info(format_args!(
                        "Unsubscribing from: {}",
                        plan.unsubscribe.join(", ")
                    ));
                    self.subscriptions
                        .track(request, BatchKind::Unsubscribe, plan.unsubscribe.clone());
                }
                Err(err) => self.log.error(format_args!(
                    "Error unsubscribing from {}: {}",
                    plan.unsubscribe.join(", "),
                    err
                )),
            }
        }

        if !plan.subscribe.is_empty() {
            let control = self.namespace.subscription();
            let topics: Vec<(String, Qos)> = plan
                .subscribe
                .iter()
                .map(|topic| {
                    let qos = if *topic == control {
                        CONTROL_SUBSCRIPTION_QOS
                    } else {
                        DATA_SUBSCRIPTION_QOS
                    };
                    (topic.clone(), qos)
                })
                .collect();
            match self.connections.subscribe(&topics) {
                Ok(request) => {
                    self.log.info(format_args!(
                        "Subscribing to: {}",
                        plan.subscribe.join(", ")
                    ));
                    self.subscriptions
                        .track(request, BatchKind::Subscribe, plan.subscribe);
                }
                Err(err) => self.log.error(format_args!(
                    "Error subscribing to {}: {}",
                    plan.subscribe.join(", "),
                    err
                )),
            }
        }
    }

    fn handle_data(&mut self, message: &InboundMessage) {
        let suppress = self.settings.log_options.suppress_mqtt;
        let log_payloads = self.settings.log_mqtt_messages();
        if log_payloads && !suppress {
            self.log.info(format_args!(
                "MQTT IN [{}]: {}",
                message.topic,
                String::from_utf8_lossy(&message.payload)
            ));
        }

        let Some(mapped) = self.mapper.map(&message.topic) else {
            self.stats.record_unmatched();
            self.log.debug(format_args!(
                "No topicMap rule matches {}",
                message.topic
            ));
            return;
        };

        let resolution = self
            .mapper
            .resolve(mapped.rule, message.qos, message.retain);
        if resolution.qos_fallback {
            if let Setting::Invalid(raw) = mapped.rule.qos() {
                self.log.warn(format_args!(
                    "Invalid qos {} in topicMap entry #{}, using {}.",
                    raw, mapped.index, resolution.options.qos
                ));
            }
        }
        if resolution.retain_fallback {
            if let Setting::Invalid(raw) = mapped.rule.retain() {
                self.log.warn(format_args!(
                    "Invalid retain {} in topicMap entry #{}, using {}.",
                    raw, mapped.index, resolution.options.retain
                ));
            }
        }

        if self.settings.broker_in_url == self.settings.broker_out_url && mapped.topic == message.topic {
            self.stats.record_looped();
            self.log.warn(format_args!(
                "Loop detected: {} would be republished unchanged to the same broker, dropping.",
                message.topic
            ));
            return;
        }

        match self.connections.publish(
            Side::Outbound,
            &mapped.topic,
            &message.payload,
            resolution.options,
        ) {
            Ok(()) => {
                self.stats.record_relayed(message.payload.len());
                if !suppress {
                    self.log.info(format_args!(
                        "Relayed {} -> {} (QoS {}, retain {})",
                        message.topic, mapped.topic, resolution.options.qos, resolution.options.retain
                    ));
                }
                if !log_payloads && self.log.enabled(LogLevel::Debug) {
                    self.log.debug(format_args!(
                        "Payload: {}",
                        payload_preview(&message.payload, PAYLOAD_PREVIEW_CHARS)
                    ));
                }
            }
            Err(ConnectionError::NotConnected(_)) => {
                self.stats.record_error();
                self.log.warn(format_args!(
                    "Cannot publish to OUT topic {}, OUT client not connected.",
                    mapped.topic
                ));
            }
            Err(err) => {
                self.stats.record_error();
                self.log.error(format_args!(
                    "Error publishing to OUT topic {}: {}",
                    mapped.topic, err
                ));
            }
        }
    }

    async fn handle_control(&mut self, remainder: &str, payload: &[u8]) {
        let command = match ControlCommand::parse(remainder) {
            Ok(command) => command,
            Err(err) => {
                self.log
                    .warn(format_args!("Control command rejected: {}", err));
                self.publish_status(&format!("Error: {}", err));
                return;
            }
        };
        let argument = command.decode_payload(payload);
        self.log
            .info(format_args!("Received control command: {}", command.action()));

        match command {
            ControlCommand::GetStatus => self.publish_status("Status requested."),
            ControlCommand::ConfigGet(path) => self.publish_config_value(&path),
            ControlCommand::ConfigSet(path) => {
                self.apply_mutation(&path, Mutation::Set(argument.unwrap_or(Value::Null)))
                    .await
            }
            ControlCommand::ConfigMod(path) => {
                self.apply_mutation(&path, Mutation::Merge(argument.unwrap_or(Value::Null)))
                    .await
            }
            ControlCommand::SetLogLevel => self.set_log_level(argument),
            ControlCommand::StopInstance => self.stop_instance().await,
            ControlCommand::StartInstance => self.start_instance().await,
        }
    }

    fn publish_config_value(&mut self, path: &ConfigPath) {
        let topic = self.namespace.config_value_topic(path);
        let payload = match tree::get(&self.tree, path) {
            Some(value) => serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
            None => {
                self.log
                    .warn(format_args!("config:get path not found: {}", path));
                json!({ "error": "Path not found", "requestedPath": path.to_string() }).to_string()
            }
        };
        match self.connections.publish(
            Side::Inbound,
            &topic,
            payload.as_bytes(),
            PublishOptions::default(),
        ) {
            Ok(()) => self
                .log
                .debug(format_args!("Published config value for {} to {}", path, topic)),
            Err(err) => self.log.error(format_args!(
                "Cannot publish config value to {}: {}",
                topic, err
            )),
        }
    }

    async fn apply_mutation(&mut self, path: &ConfigPath, mutation: Mutation) {
        let action = mutation.action();
        let mut candidate = (*self.tree).clone();
        let outcome = match mutation {
            Mutation::Set(value) => tree::set(&mut candidate, path, value)
                .map(|()| format!("Configuration set for path: {}", path)),
            Mutation::Merge(value) => tree::merge(&mut candidate, path, value).map(|merged| match merged {
                MergeOutcome::Merged => format!("Configuration modified for path: {}", path),
                MergeOutcome::Overwritten => {
                    format!("Configuration modified (overwritten) for path: {}", path)
                }
            }),
        };
        let event = match outcome {
            Ok(event) => event,
            Err(PathError::NotFound(_)) => {
                self.log
                    .warn(format_args!("config:{} path not found: {}", action, path));
                self.publish_status(&format!(
                    "Error: Path not found for config:{} - \"{}\".",
                    action, path
                ));
                return;
            }
            Err(err) => {
                self.log.error(format_args!(
                    "Failed to {} config for path {}: {}",
                    action, path, err
                ));
                self.publish_status(&format!(
                    "Error: Failed to {} config for path: {}",
                    action, path
                ));
                return;
            }
        };

        if let Err(err) = RelaySettings::from_tree(&candidate) {
            self.log.error(format_args!(
                "Rejected config:{} for path {}: {}",
                action, path, err
            ));
            self.publish_status(&format!(
                "Error: Failed to {} config for path: {}",
                action, path
            ));
            return;
        }

        self.log.info(format_args!(
            "Configuration updated at {}, re-initializing relay.",
            path
        ));
        self.tree = Arc::new(candidate);
        if let Err(err) = self.restart().await {
            self.log
                .error(format_args!("Restart after config:{} failed: {}", action, err));
        }
        self.publish_status(&event);
    }

    fn set_log_level(&mut self, argument: Option<Value>) {
        let requested = match &argument {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Object(map)) => map
                .get("level")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let Some(level) = LogLevel::parse(&requested) else {
            self.log.error(format_args!(
                "Invalid level for setLogLevel: \"{}\". Valid levels: {}",
                requested,
                LogLevel::valid_names()
            ));
            self.publish_status(&format!(
                "Error: Invalid level for setLogLevel - \"{}\".",
                requested
            ));
            return;
        };

        let mut candidate = (*self.tree).clone();
        let path = ConfigPath::parse("logOptions/logLevel");
        if tree::set(&mut candidate, &path, json!(level.as_str())).is_ok() {
            if let Ok(settings) = RelaySettings::from_tree(&candidate) {
                self.tree = Arc::new(candidate);
                self.settings = settings;
            }
        }
        self.log.set_level(level);
        self.log
            .info(format_args!("Log level changed to {} via API.", level));
        self.publish_status(&format!("Log level updated to {}.", level));
    }

    async fn stop_instance(&mut self) {
        self.log.info("Stopping instance via API.");
        self.running = false;
        self.publish_status("Relay instance stopped via API.");
        self.stop().await;
    }

    async fn start_instance(&mut self) {
        if self.running && self.connections.connection(Side::Inbound).is_connected() {
            self.log.warn("startInstance ignored, relay already running.");
            self.publish_status("Instance already running.");
            return;
        }
        let result = match self.rebuild() {
            Ok(()) => self.start().await,
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => self.log.info("Relay (re)started via API."),
            Err(err) => {
                self.log
                    .error(format_args!("Failed to (re)start relay: {}", err));
                self.publish_status("Error: Failed to (re)start instance.");
            }
        }
    }

    /// Snapshot of the relay's state.
    pub fn status(&self, event: &str) -> StatusSnapshot {
        let control = self.namespace.subscription();
        let inbound = self.connections.connection(Side::Inbound);
        let outbound = self.connections.connection(Side::Outbound);
        StatusSnapshot {
            name: self.settings.name.clone(),
            timestamp: crate::logging::local_timestamp(),
            event: event.to_string(),
            is_running: self.running,
            log_level: self.log.level().as_str().to_string(),
            broker_in: BrokerStatus {
                url: self.settings.broker_in_url.clone(),
                connected: inbound.is_connected(),
            },
            broker_out: BrokerStatus {
                url: self.settings.broker_out_url.clone(),
                connected: outbound.is_connected(),
            },
            active_data_subscriptions: self
                .subscriptions
                .active()
                .iter()
                .filter(|topic| **topic != control)
                .cloned()
                .collect(),
            topic_map_count: self.mapper.len(),
            stats: self.stats,
        }
    }

    /// Publish a status snapshot on the status topic of the inbound broker.
    pub fn publish_status(&mut self, event: &str) {
        if !self.connections.connection(Side::Inbound).is_connected() {
            self.log.warn(format_args!(
                "Cannot publish status \"{}\", IN client not connected.",
                event
            ));
            return;
        }
        let snapshot = self.status(event);
        let payload = match serde_json::to_vec(&snapshot) {
            Ok(payload) => payload,
            Err(err) => {
                self.log
                    .error(format_args!("Error serializing status: {}", err));
                json!({ "error": "Status serialization failed", "details": err.to_string() })
                    .to_string()
                    .into_bytes()
            }
        };
        let topic = self.namespace.status_topic();
        match self
            .connections
            .publish(Side::Inbound, &topic, &payload, PublishOptions::default())
        {
            Ok(()) => self
                .log
                .debug(format_args!("Published status \"{}\" to {}", event, topic)),
            Err(err) => self.log.error(format_args!(
                "Error publishing status to {}: {}",
                topic, err
            )),
        }
    }
}

fn payload_preview(payload: &[u8], max_chars: usize) -> String {
    let text = String::from_utf8_lossy(payload);
    if text.chars().count() <= max_chars {
        return text.into_owned();
    }
    let mut preview: String = text.chars().take(max_chars).collect();
    preview.push_str("...");
    preview
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;
    use crate::mock::MockConnector;

    fn relay_with(tree: Value) -> (Relay, MockConnector, Arc<MemorySink>) {
        let mock = MockConnector::new();
        let sink = Arc::new(MemorySink::new());
        let relay = Relay::with_sink(tree, Arc::new(mock.clone()), sink.clone()).unwrap();
        (relay, mock, sink)
    }

    #[test]
    fn test_payload_preview() {
        assert_eq!(payload_preview(b"short", 10), "short");
        assert_eq!(payload_preview(b"abcdef", 3), "abc...");
    }

    #[test]
    fn test_invalid_tree_rejected() {
        let mock = MockConnector::new();
        assert!(Relay::new(json!({"name": "a/b"}), Arc::new(mock)).is_err());
    }

    #[test]
    fn test_desired_includes_control() {
        let (relay, _, _) = relay_with(json!({"name": "r", "topicMap": [{"in": "a/#"}]}));
        let desired = relay.desired_subscriptions();
        assert!(desired.contains("a/#"));
        assert!(desired.contains("mqtt-relay/r/#"));
        assert_eq!(desired.len(), 2);
    }

    #[tokio::test]
    async fn test_update_subscriptions_without_connection() {
        let (mut relay, mock, sink) = relay_with(json!({"name": "r", "debug": true}));
        relay.update_subscriptions();
        assert!(mock.subscribe_calls().is_empty());
        assert!(sink.contains(LogLevel::Debug, "subscription update skipped"));
    }

    #[tokio::test]
    async fn test_subscription_qos_split() {
        let (mut relay, mock, _) = relay_with(json!({"name": "r", "topicMap": [{"in": "a/#"}]}));
        relay.start().await.unwrap();
        let calls = mock.subscribe_calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains(&("a/#".to_string(), DATA_SUBSCRIPTION_QOS)));
        assert!(calls[0].contains(&("mqtt-relay/r/#".to_string(), CONTROL_SUBSCRIPTION_QOS)));
    }

    #[tokio::test]
    async fn test_deferred_queue_bounded() {
        let (mut relay, _, sink) = relay_with(json!({"name": "r"}));
        for _ in 0..(MAX_DEFERRED_COMMANDS + 2) {
            relay.defer(InboundMessage::new("mqtt-relay/r/getstatus", ""));
        }
        assert_eq!(relay.deferred.len(), MAX_DEFERRED_COMMANDS);
        assert!(sink.contains(LogLevel::Error, "rejecting control command"));
    }
}
