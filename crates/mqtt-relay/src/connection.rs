// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker connections.
//!
//! A relay owns one inbound and one outbound connection. Clients are opened
//! through a [`Connector`] and report back through a shared event channel.
//! Every opened pair gets a generation number; events from older
//! generations are discarded.

use crate::config::BrokerOptions;
use crate::logging::RelayLog;
use crate::mapping::{PublishOptions, Qos};
use crate::subscriptions::{BatchKind, SubscriptionSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

/// Connection errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Invalid broker URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Unsupported broker URL scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("{0} client not connected")]
    NotConnected(Side),

    #[error("Client request failed: {0}")]
    Client(String),
}

/// Which broker a connection talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Inbound,
    Outbound,
}

impl Side {
    /// Short tag used in client identifiers.
    pub fn tag(&self) -> &'static str {
        match self {
            Side::Inbound => "in",
            Side::Outbound => "out",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Inbound => f.write_str("IN"),
            Side::Outbound => f.write_str("OUT"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Offline,
    Error,
    Closed,
}

/// Correlates subscribe and unsubscribe requests with their acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// Per-topic subscribe acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeResult {
    Granted(Qos),
    Rejected,
}

/// Message received from a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: Qos::AtMostOnce,
            retain: false,
        }
    }

    pub fn with_qos(mut self, qos: Qos) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Lifecycle and traffic events reported by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected { session_present: bool },
    Message(InboundMessage),
    Subscribed { request: RequestId, results: Vec<SubscribeResult> },
    Unsubscribed { request: RequestId },
    Offline,
    Error(String),
    /// The client has stopped for good.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub side: Side,
    pub generation: u64,
    pub event: BrokerEvent,
}

pub type EventSender = mpsc::UnboundedSender<ConnectionEvent>;

/// Parameters for opening one client.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub side: Side,
    pub generation: u64,
    pub url: String,
    pub options: BrokerOptions,
    pub client_id: String,
}

/// A live broker client.
///
/// Calls only enqueue work; outcomes are reported as [`BrokerEvent`]s. A
/// client must emit [`BrokerEvent::Closed`] once it has stopped, and stop
/// its background work when dropped.
pub trait BrokerClient: Send {
    fn subscribe(&mut self, request: RequestId, topics: &[(String, Qos)]) -> Result<(), ConnectionError>;

    fn unsubscribe(&mut self, request: RequestId, topics: &[String]) -> Result<(), ConnectionError>;

    fn publish(&mut self, topic: &str, payload: &[u8], options: PublishOptions) -> Result<(), ConnectionError>;

    fn disconnect(&mut self) -> Result<(), ConnectionError>;
}

/// Factory for broker clients.
pub trait Connector: Send + Sync {
    fn connect(&self, request: ConnectRequest, events: EventSender) -> Result<Box<dyn BrokerClient>, ConnectionError>;
}

/// One side of a relay.
pub struct Connection {
    side: Side,
    url: String,
    state: ConnectionState,
    client: Option<Box<dyn BrokerClient>>,
}

impl Connection {
    fn new(side: Side) -> Self {
        Self {
            side,
            url: String::new(),
            state: ConnectionState::Disconnected,
            client: None,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.client.is_some()
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    fn client_mut(&mut self) -> Result<&mut Box<dyn BrokerClient>, ConnectionError> {
        if self.state != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected(self.side));
        }
        self.client
            .as_mut()
            .ok_or(ConnectionError::NotConnected(self.side))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("side", &self.side)
            .field("url", &self.url)
            .field("state", &self.state)
            .field("has_client", &self.client.is_some())
            .finish()
    }
}

/// Owns both connections of a relay and their event stream.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    events_tx: EventSender,
    events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    inbound: Connection,
    outbound: Connection,
    generation: u64,
    current: Option<u64>,
    next_request: u64,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            connector,
            events_tx,
            events_rx,
            inbound: Connection::new(Side::Inbound),
            outbound: Connection::new(Side::Outbound),
            generation: 0,
            current: None,
            next_request: 1,
        }
    }

    pub fn connection(&self, side: Side) -> &Connection {
        match side {
            Side::Inbound => &self.inbound,
            Side::Outbound => &self.outbound,
        }
    }

    fn connection_mut(&mut self, side: Side) -> &mut Connection {
        match side {
            Side::Inbound => &mut self.inbound,
            Side::Outbound => &mut self.outbound,
        }
    }

    /// Generation of the live connection pair, if any.
    pub fn generation(&self) -> Option<u64> {
        self.current
    }

    pub fn has_clients(&self) -> bool {
        self.inbound.has_client() || self.outbound.has_client()
    }

    /// Start a new generation. Events of earlier pairs are ignored from now on.
    pub fn begin(&mut self) -> u64 {
        self.generation += 1;
        self.current = Some(self.generation);
        self.generation
    }

    /// Open one side of the current generation.
    pub fn open(
        &mut self,
        side: Side,
        relay_name: &str,
        url: &str,
        options: &BrokerOptions,
    ) -> Result<(), ConnectionError> {
        let generation = match self.current {
            Some(generation) => generation,
            None => self.begin(),
        };
        let request = ConnectRequest {
            side,
            generation,
            url: url.to_string(),
            options: options.clone(),
            client_id: client_id(side, relay_name),
        };
        let connector = Arc::clone(&self.connector);
        let events = self.events_tx.clone();
        let connection = self.connection_mut(side);
        connection.url = url.to_string();
        match connector.connect(request, events) {
            Ok(client) => {
                connection.client = Some(client);
                connection.state = ConnectionState::Connecting;
                Ok(())
            }
            Err(err) => {
                connection.client = None;
                connection.state = ConnectionState::Error;
                Err(err)
            }
        }
    }

    fn next_request_id(&mut self) -> RequestId {
        let id = RequestId(self.next_request);
        self.next_request += 1;
        id
    }

    /// Subscribe the inbound client to `topics`.
    pub fn subscribe(&mut self, topics: &[(String, Qos)]) -> Result<RequestId, ConnectionError> {
        let request = self.next_request_id();
        self.inbound.client_mut()?.subscribe(request, topics)?;
        Ok(request)
    }

    /// Unsubscribe the inbound client from `topics`.
    pub fn unsubscribe(&mut self, topics: &[String]) -> Result<RequestId, ConnectionError> {
        let request = self.next_request_id();
        self.inbound.client_mut()?.unsubscribe(request, topics)?;
        Ok(request)
    }

    pub fn publish(
        &mut self,
        side: Side,
        topic: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<(), ConnectionError> {
        self.connection_mut(side)
            .client_mut()?
            .publish(topic, payload, options)
    }

    /// Next event of the current generation.
    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        loop {
            let event = self.events_rx.recv().await?;
            if self.accept(&event) {
                return Some(event);
            }
        }
    }

    /// Next already-queued event of the current generation, without waiting.
    pub fn try_next_event(&mut self) -> Option<ConnectionEvent> {
        loop {
            let event = self.events_rx.try_recv().ok()?;
            if self.accept(&event) {
                return Some(event);
            }
        }
    }

    fn accept(&mut self, event: &ConnectionEvent) -> bool {
        if self.current != Some(event.generation) {
            return false;
        }
        let connection = self.connection_mut(event.side);
        connection.state = match &event.event {
            BrokerEvent::Connected { .. } => ConnectionState::Connected,
            BrokerEvent::Offline => ConnectionState::Offline,
            BrokerEvent::Error(_) => ConnectionState::Error,
            BrokerEvent::Closed => ConnectionState::Closed,
            _ => connection.state,
        };
        true
    }

    /// Unsubscribe everything and close both clients.
    ///
    /// Each phase waits at most `timeout`. Messages received meanwhile are
    /// returned to the caller.
    pub async fn shutdown(
        &mut self,
        subscriptions: &mut SubscriptionSet,
        log: &RelayLog,
        timeout: Duration,
    ) -> Vec<InboundMessage> {
        let mut received = Vec::new();

        if self.inbound.is_connected() && !subscriptions.active().is_empty() {
            let topics: Vec<String> = subscriptions.active().iter().cloned().collect();
            match self.unsubscribe(&topics) {
                Ok(request) => subscriptions.track(request, BatchKind::Unsubscribe, topics),
                Err(err) => log.error(format_args!("Error unsubscribing {}: {}", topics.join(", "), err)),
            }
        }

        let deadline = Instant::now() + timeout;
        while subscriptions.has_pending(BatchKind::Unsubscribe) && self.inbound.is_connected() {
            match timeout_at(deadline, self.next_event()).await {
                Ok(Some(event)) => match event.event {
                    BrokerEvent::Unsubscribed { request } if event.side == Side::Inbound => {
                        if let Some(topics) = subscriptions.complete_unsubscribe(request) {
                            log.info(format_args!("Unsubscribed from: {}", topics.join(", ")));
                        }
                    }
                    BrokerEvent::Message(message) if event.side == Side::Inbound => received.push(message),
                    _ => {}
                },
                Ok(None) => break,
                Err(_) => {
                    log.warn(format_args!(
                        "Timed out after {}ms waiting for unsubscribe acknowledgement",
                        timeout.as_millis()
                    ));
                    break;
                }
            }
        }

        let mut closing: Vec<(Side, Box<dyn BrokerClient>)> = Vec::new();
        for side in [Side::Inbound, Side::Outbound] {
            if let Some(mut client) = self.connection_mut(side).client.take() {
                match client.disconnect() {
                    Ok(()) => {
                        log.debug(format_args!("Closing {} client", side));
                        closing.push((side, client));
                    }
                    Err(err) => log.error(format_args!("Error ending {} client: {}", side, err)),
                }
            }
        }

        let deadline = Instant::now() + timeout;
        let mut open: Vec<Side> = closing.iter().map(|(side, _)| *side).collect();
        while !open.is_empty() {
            match timeout_at(deadline, self.next_event()).await {
                Ok(Some(event)) => match event.event {
                    BrokerEvent::Closed => {
                        open.retain(|side| *side != event.side);
                        log.info(format_args!("{} client ended.", event.side));
                    }
                    BrokerEvent::Message(message) if event.side == Side::Inbound => received.push(message),
                    _ => {}
                },
                Ok(None) => break,
                Err(_) => {
                    log.warn(format_args!(
                        "Timed out after {}ms waiting for clients to close",
                        timeout.as_millis()
                    ));
                    break;
                }
            }
        }
        drop(closing);

        self.current = None;
        for side in [Side::Inbound, Side::Outbound] {
            let connection = self.connection_mut(side);
            if connection.state != ConnectionState::Closed {
                connection.state = ConnectionState::Disconnected;
            }
        }
        received
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("inbound", &self.inbound)
            .field("outbound", &self.outbound)
            .field("generation", &self.current)
            .finish()
    }
}

fn client_id(side: Side, relay_name: &str) -> String {
    let uuid = uuid::Uuid::new_v4().to_string();
    let short = uuid.split('-').next().unwrap_or("xxxxxxxx");
    format!("relay_{}_{}_{}", side.tag(), relay_name, short)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnector;
    use crate::logging::MemorySink;

    #[test]
    fn test_client_id_format() {
        let id = client_id(Side::Inbound, "edge");
        assert!(id.starts_with("relay_in_edge_"));
        assert_eq!(id.len(), "relay_in_edge_".len() + 8);
    }

    #[tokio::test]
    async fn test_open_and_connect() {
        let mock = MockConnector::new();
        let mut manager = ConnectionManager::new(Arc::new(mock.clone()));
        manager.begin();
        manager
            .open(Side::Inbound, "r", "mqtt://a:1883", &BrokerOptions::default())
            .unwrap();
        assert_eq!(manager.connection(Side::Inbound).state(), ConnectionState::Connecting);

        let event = manager.next_event().await.unwrap();
        assert_eq!(event.event, BrokerEvent::Connected { session_present: false });
        assert!(manager.connection(Side::Inbound).is_connected());
        assert_eq!(manager.connection(Side::Inbound).url(), "mqtt://a:1883");
    }

    #[tokio::test]
    async fn test_stale_generation_ignored() {
        let mock = MockConnector::new();
        let mut manager = ConnectionManager::new(Arc::new(mock.clone()));
        manager.begin();
        manager
            .open(Side::Outbound, "r", "mqtt://a:1883", &BrokerOptions::default())
            .unwrap();
        manager.begin();

        assert!(manager.try_next_event().is_none());
        assert_eq!(manager.connection(Side::Outbound).state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let mock = MockConnector::new();
        let mut manager = ConnectionManager::new(Arc::new(mock.clone()));
        let err = manager
            .publish(Side::Outbound, "t", b"x", PublishOptions::default())
            .unwrap_err();
        assert_eq!(err, ConnectionError::NotConnected(Side::Outbound));
    }

    #[tokio::test]
    async fn test_shutdown_unsubscribes_and_closes() {
        let mock = MockConnector::new();
        let mut manager = ConnectionManager::new(Arc::new(mock.clone()));
        let log = RelayLog::new("r", Arc::new(MemorySink::new()));
        let mut subs = SubscriptionSet::new();

        manager.begin();
        manager
            .open(Side::Inbound, "r", "mqtt://a:1883", &BrokerOptions::default())
            .unwrap();
        manager.next_event().await.unwrap();
        let request = manager
            .subscribe(&[("a/#".to_string(), Qos::AtMostOnce)])
            .unwrap();
        subs.track(request, BatchKind::Subscribe, vec!["a/#".into()]);
        if let Some(ConnectionEvent {
            event: BrokerEvent::Subscribed { request, results },
            ..
        }) = manager.next_event().await
        {
            subs.complete_subscribe(request, &results);
        }
        assert!(subs.contains("a/#"));

        manager.shutdown(&mut subs, &log, Duration::from_millis(500)).await;

        assert!(subs.active().is_empty());
        assert_eq!(mock.unsubscribe_calls(), vec![vec!["a/#".to_string()]]);
        assert!(!manager.has_clients());
        assert_eq!(manager.generation(), None);
        assert_eq!(manager.connection(Side::Inbound).state(), ConnectionState::Closed);
    }
}
