// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory connector for tests and dry runs.
//!
//! Connections succeed immediately (unless refused), subscribe and
//! unsubscribe requests are acknowledged at once, and publishes are
//! recorded instead of sent. Any of these answers can be withheld to
//! exercise timeouts.

use crate::connection::{
    BrokerClient, BrokerEvent, ConnectRequest, ConnectionError, ConnectionEvent, Connector,
    EventSender, InboundMessage, RequestId, Side, SubscribeResult,
};
use crate::mapping::{PublishOptions, Qos};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// A publish recorded by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub side: Side,
    pub topic: String,
    pub payload: Vec<u8>,
    pub options: PublishOptions,
}

impl PublishedMessage {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn payload_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

/// A broker answer the mock can hold back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Withheld {
    /// The first event after connecting on this side.
    ConnAck(Side),
    SubAck,
    UnsubAck,
    /// The `Closed` event after a disconnect on this side.
    Close(Side),
}

#[derive(Default)]
struct MockState {
    connects: Vec<ConnectRequest>,
    live: HashMap<Side, (u64, EventSender)>,
    published: Vec<PublishedMessage>,
    subscribe_calls: Vec<Vec<(String, Qos)>>,
    unsubscribe_calls: Vec<Vec<String>>,
    refused: HashSet<Side>,
    rejected_topics: HashSet<String>,
    withheld: HashSet<Withheld>,
    session_present: bool,
}

/// Mock broker connector.
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        lock_state(&self.state)
    }

    /// Make future connects on `side` fail with an error event.
    pub fn refuse(&self, side: Side) {
        self.lock().refused.insert(side);
    }

    pub fn accept(&self, side: Side) {
        self.lock().refused.remove(&side);
    }

    /// Answer subscriptions to `topic` with a failure code.
    pub fn reject_subscription(&self, topic: &str) {
        self.lock().rejected_topics.insert(topic.to_string());
    }

    /// Stop sending `answer` until [`MockConnector::release`].
    pub fn withhold(&self, answer: Withheld) {
        self.lock().withheld.insert(answer);
    }

    pub fn release(&self, answer: Withheld) {
        self.lock().withheld.remove(&answer);
    }

    /// Report `session_present` on future connects.
    pub fn set_session_present(&self, present: bool) {
        self.lock().session_present = present;
    }

    pub fn connects(&self) -> Vec<ConnectRequest> {
        self.lock().connects.clone()
    }

    pub fn connect_count(&self, side: Side) -> usize {
        self.lock().connects.iter().filter(|r| r.side == side).count()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn published_on(&self, side: Side) -> Vec<PublishedMessage> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.side == side)
            .cloned()
            .collect()
    }

    pub fn clear_published(&self) {
        self.lock().published.clear();
    }

    pub fn subscribe_calls(&self) -> Vec<Vec<(String, Qos)>> {
        self.lock().subscribe_calls.clone()
    }

    pub fn unsubscribe_calls(&self) -> Vec<Vec<String>> {
        self.lock().unsubscribe_calls.clone()
    }

    /// Deliver `message` on the latest connection of `side`.
    pub fn inject(&self, side: Side, message: InboundMessage) -> bool {
        self.emit(side, BrokerEvent::Message(message))
    }

    /// Emit an arbitrary event on the latest connection of `side`.
    pub fn emit(&self, side: Side, event: BrokerEvent) -> bool {
        let state = self.lock();
        match state.live.get(&side) {
            Some((generation, events)) => events
                .send(ConnectionEvent {
                    side,
                    generation: *generation,
                    event,
                })
                .is_ok(),
            None => false,
        }
    }
}

impl Connector for MockConnector {
    fn connect(&self, request: ConnectRequest, events: EventSender) -> Result<Box<dyn BrokerClient>, ConnectionError> {
        let mut state = self.lock();
        let side = request.side;
        let generation = request.generation;
        let first = if state.refused.contains(&side) {
            BrokerEvent::Error("connection refused".to_string())
        } else {
            BrokerEvent::Connected {
                session_present: state.session_present,
            }
        };
        if !state.withheld.contains(&Withheld::ConnAck(side)) {
            // Receiver may already be gone when a relay is torn down.
            let _ = events.send(ConnectionEvent {
                side,
                generation,
                event: first,
            });
        }
        state.live.insert(side, (generation, events.clone()));
        state.connects.push(request);

        Ok(Box::new(MockClient {
            side,
            generation,
            events,
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockClient {
    side: Side,
    generation: u64,
    events: EventSender,
    state: Arc<Mutex<MockState>>,
}

impl MockClient {
    fn withheld(&self, answer: Withheld) -> bool {
        lock_state(&self.state).withheld.contains(&answer)
    }

    fn send(&self, event: BrokerEvent) {
        let _ = self.events.send(ConnectionEvent {
            side: self.side,
            generation: self.generation,
            event,
        });
    }
}

impl BrokerClient for MockClient {
    fn subscribe(&mut self, request: RequestId, topics: &[(String, Qos)]) -> Result<(), ConnectionError> {
        let results = {
            let mut state = lock_state(&self.state);
            state.subscribe_calls.push(topics.to_vec());
            topics
                .iter()
                .map(|(topic, qos)| {
                    if state.rejected_topics.contains(topic) {
                        SubscribeResult::Rejected
                    } else {
                        SubscribeResult::Granted(*qos)
                    }
                })
                .collect()
        };
        if !self.withheld(Withheld::SubAck) {
            self.send(BrokerEvent::Subscribed { request, results });
        }
        Ok(())
    }

    fn unsubscribe(&mut self, request: RequestId, topics: &[String]) -> Result<(), ConnectionError> {
        lock_state(&self.state).unsubscribe_calls.push(topics.to_vec());
        if !self.withheld(Withheld::UnsubAck) {
            self.send(BrokerEvent::Unsubscribed { request });
        }
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &[u8], options: PublishOptions) -> Result<(), ConnectionError> {
        lock_state(&self.state).published.push(PublishedMessage {
            side: self.side,
            topic: topic.to_string(),
            payload: payload.to_vec(),
            options,
        });
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), ConnectionError> {
        if !self.withheld(Withheld::Close(self.side)) {
            self.send(BrokerEvent::Closed);
        }
        Ok(())
    }
}

fn lock_state(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
