// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Inbound subscription bookkeeping.

use crate::connection::{RequestId, SubscribeResult};
use crate::mapping::Qos;
use std::collections::{BTreeSet, HashMap};

/// Topics to subscribe and unsubscribe to reach a desired set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionPlan {
    pub subscribe: Vec<String>,
    pub unsubscribe: Vec<String>,
}

impl SubscriptionPlan {
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }
}

/// Compute the difference between `desired` and `active`.
pub fn reconcile(desired: &BTreeSet<String>, active: &BTreeSet<String>) -> SubscriptionPlan {
    SubscriptionPlan {
        subscribe: desired.difference(active).cloned().collect(),
        unsubscribe: active.difference(desired).cloned().collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone)]
struct PendingBatch {
    kind: BatchKind,
    topics: Vec<String>,
}

/// Outcome of an acknowledged subscribe batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOutcome {
    pub granted: Vec<(String, Qos)>,
    pub rejected: Vec<String>,
}

/// Active subscriptions of the inbound connection plus in-flight requests.
///
/// A topic enters the active set only once the broker grants it, and leaves
/// it only once an unsubscribe is acknowledged.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    active: BTreeSet<String>,
    pending: HashMap<RequestId, PendingBatch>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> &BTreeSet<String> {
        &self.active
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.active.contains(topic)
    }

    /// Plan towards `desired`, leaving out topics already in flight.
    pub fn plan(&self, desired: &BTreeSet<String>) -> SubscriptionPlan {
        let mut plan = reconcile(desired, &self.active);
        plan.subscribe
            .retain(|t| !self.is_pending(BatchKind::Subscribe, t));
        plan.unsubscribe
            .retain(|t| !self.is_pending(BatchKind::Unsubscribe, t));
        plan
    }

    fn is_pending(&self, kind: BatchKind, topic: &str) -> bool {
        self.pending
            .values()
            .any(|b| b.kind == kind && b.topics.iter().any(|t| t == topic))
    }

    pub fn has_pending(&self, kind: BatchKind) -> bool {
        self.pending.values().any(|b| b.kind == kind)
    }

    /// Record an issued request.
    pub fn track(&mut self, request: RequestId, kind: BatchKind, topics: Vec<String>) {
        self.pending.insert(request, PendingBatch { kind, topics });
    }

    /// Apply a subscribe acknowledgement.
    ///
    /// Results are matched to topics by position; topics without a result
    /// count as rejected. Returns `None` for unknown requests.
    pub fn complete_subscribe(
        &mut self,
        request: RequestId,
        results: &[SubscribeResult],
    ) -> Option<SubscribeOutcome> {
        let batch = self.take(request, BatchKind::Subscribe)?;
        let mut outcome = SubscribeOutcome::default();
        for (i, topic) in batch.topics.into_iter().enumerate() {
            match results.get(i) {
                Some(SubscribeResult::Granted(qos)) => {
                    self.active.insert(topic.clone());
                    outcome.granted.push((topic, *qos));
                }
                _ => outcome.rejected.push(topic),
            }
        }
        Some(outcome)
    }

    /// Apply an unsubscribe acknowledgement.
    pub fn complete_unsubscribe(&mut self, request: RequestId) -> Option<Vec<String>> {
        let batch = self.take(request, BatchKind::Unsubscribe)?;
        for topic in &batch.topics {
            self.active.remove(topic);
        }
        Some(batch.topics)
    }

    fn take(&mut self, request: RequestId, kind: BatchKind) -> Option<PendingBatch> {
        match self.pending.get(&request) {
            Some(batch) if batch.kind == kind => self.pending.remove(&request),
            _ => None,
        }
    }

    /// Forget everything, e.g. after a session loss.
    pub fn clear(&mut self) {
        self.active.clear();
        self.pending.clear();
    }
}
