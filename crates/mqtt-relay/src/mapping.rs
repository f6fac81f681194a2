// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topic mapping rules.
//!
//! Each rule selects inbound topics with an MQTT subscription pattern and
//! names the outbound topic. Rules are evaluated in configuration order and
//! the first match wins.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// MQTT delivery guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(format!("invalid QoS {}, expected 0, 1 or 2", other)),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

impl fmt::Display for Qos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self))
    }
}

/// QoS and retain flag for an outgoing publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishOptions {
    #[serde(default)]
    pub qos: Qos,

    #[serde(default)]
    pub retain: bool,
}

/// A per-rule publish setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Setting<T> {
    /// Fixed value.
    Fixed(T),
    /// Carry over the inbound message's value.
    Auto,
    /// Unusable configured value, kept verbatim for diagnostics.
    Invalid(String),
}

impl<T: Copy> Setting<T> {
    fn resolve(&self, inbound: T) -> Option<T> {
        match self {
            Setting::Fixed(value) => Some(*value),
            Setting::Auto => Some(inbound),
            Setting::Invalid(_) => None,
        }
    }
}

/// Rule compilation errors. The offending rule is skipped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("Invalid topicMap entry #{index}: {entry} (missing 'in' topic)")]
    MissingIn { index: usize, entry: String },

    #[error("Invalid topicMap entry #{index}: pattern '{pattern}' failed to compile: {reason}")]
    Pattern {
        index: usize,
        pattern: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Output {
    AsReceived,
    Base(String),
}

/// A compiled mapping rule.
#[derive(Debug, Clone)]
pub struct TopicRule {
    subscription: String,
    matcher: Regex,
    output: Output,
    literal_prefix: String,
    has_wildcard: bool,
    qos: Setting<Qos>,
    retain: Setting<bool>,
}

impl TopicRule {
    /// Compile one `topicMap` entry.
    pub fn compile(index: usize, entry: &Value, defaults: PublishOptions) -> Result<Self, MappingError> {
        let subscription = entry
            .get("in")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| MappingError::MissingIn {
                index,
                entry: entry.to_string(),
            })?
            .to_string();

        let output = match entry.get("out").and_then(Value::as_str) {
            Some(out) if !out.trim().is_empty() => Output::Base(out.to_string()),
            _ => Output::AsReceived,
        };

        let matcher = Regex::new(&pattern_for(&subscription)).map_err(|e| MappingError::Pattern {
            index,
            pattern: subscription.clone(),
            reason: e.to_string(),
        })?;

        let wildcard_at = wildcard_position(&subscription);
        let literal_prefix = match wildcard_at {
            Some(pos) => subscription[..pos].to_string(),
            None => subscription.clone(),
        };

        Ok(Self {
            qos: qos_setting(entry.get("qos"), defaults.qos),
            retain: retain_setting(entry.get("retain"), defaults.retain),
            has_wildcard: wildcard_at.is_some(),
            subscription,
            matcher,
            output,
            literal_prefix,
        })
    }

    /// Subscription pattern used on the inbound broker.
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn qos(&self) -> &Setting<Qos> {
        &self.qos
    }

    pub fn retain(&self) -> &Setting<bool> {
        &self.retain
    }

    /// Outbound topic for `topic`, or `None` when the rule does not match.
    pub fn apply(&self, topic: &str) -> Option<String> {
        if !self.matcher.is_match(topic) {
            return None;
        }
        let out = match &self.output {
            Output::AsReceived => return Some(topic.to_string()),
            Output::Base(out) => out,
        };
        if !self.has_wildcard {
            return Some(normalize_topic(out));
        }
        let suffix = topic.strip_prefix(self.literal_prefix.as_str()).unwrap_or(topic);
        Some(join_topic(out, suffix))
    }
}

/// Result of resolving a rule's publish settings for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub options: PublishOptions,
    /// The configured QoS was unusable; the default was used.
    pub qos_fallback: bool,
    /// The configured retain flag was unusable; the default was used.
    pub retain_fallback: bool,
}

/// Successful match of an inbound topic.
#[derive(Debug, Clone)]
pub struct MappedTopic<'a> {
    pub rule: &'a TopicRule,
    pub index: usize,
    pub topic: String,
}

/// Ordered set of compiled rules.
#[derive(Debug, Clone)]
pub struct TopicMapper {
    rules: Vec<TopicRule>,
    defaults: PublishOptions,
    forward_all: bool,
}

impl TopicMapper {
    /// Compile a `topicMap` value.
    ///
    /// An absent, non-sequence or empty map becomes a single forward-all rule.
    /// Invalid entries are skipped and returned alongside the mapper.
    pub fn compile(entries: Option<&Value>, defaults: PublishOptions) -> (Self, Vec<MappingError>) {
        let forward_all_entry;
        let (items, forward_all) = match entries.and_then(Value::as_array) {
            Some(items) if !items.is_empty() => (items.as_slice(), false),
            _ => {
                forward_all_entry = [serde_json::json!({ "in": "#" })];
                (&forward_all_entry[..], true)
            }
        };

        let mut rules = Vec::with_capacity(items.len());
        let mut skipped = Vec::new();
        for (index, entry) in items.iter().enumerate() {
            match TopicRule::compile(index, entry, defaults) {
                Ok(rule) => rules.push(rule),
                Err(err) => skipped.push(err),
            }
        }

        (
            Self {
                rules,
                defaults,
                forward_all,
            },
            skipped,
        )
    }

    pub fn rules(&self) -> &[TopicRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether the implicit forward-all rule is in use.
    pub fn is_forward_all(&self) -> bool {
        self.forward_all
    }

    /// Distinct subscription patterns of all rules.
    pub fn subscriptions(&self) -> BTreeSet<String> {
        self.rules.iter().map(|r| r.subscription.clone()).collect()
    }

    /// First rule matching `topic`, with the computed outbound topic.
    pub fn map(&self, topic: &str) -> Option<MappedTopic<'_>> {
        self.rules.iter().enumerate().find_map(|(index, rule)| {
            rule.apply(topic).map(|out| MappedTopic {
                rule,
                index,
                topic: out,
            })
        })
    }

    /// Publish options for a message matched by `rule`.
    pub fn resolve(&self, rule: &TopicRule, inbound_qos: Qos, inbound_retain: bool) -> Resolution {
        let qos = rule.qos.resolve(inbound_qos);
        let retain = rule.retain.resolve(inbound_retain);
        Resolution {
            options: PublishOptions {
                qos: qos.unwrap_or(self.defaults.qos),
                retain: retain.unwrap_or(self.defaults.retain),
            },
            qos_fallback: qos.is_none(),
            retain_fallback: retain.is_none(),
        }
    }
}

fn qos_setting(value: Option<&Value>, default: Qos) -> Setting<Qos> {
    match value {
        None | Some(Value::Null) => Setting::Fixed(default),
        Some(Value::String(s)) if s == "auto" => Setting::Auto,
        Some(Value::Number(n)) => match n.as_u64().and_then(|v| u8::try_from(v).ok()).map(Qos::try_from) {
            Some(Ok(qos)) => Setting::Fixed(qos),
            _ => Setting::Invalid(n.to_string()),
        },
        Some(other) => Setting::Invalid(other.to_string()),
    }
}

fn retain_setting(value: Option<&Value>, default: bool) -> Setting<bool> {
    match value {
        None | Some(Value::Null) => Setting::Fixed(default),
        Some(Value::String(s)) if s == "auto" => Setting::Auto,
        Some(Value::Bool(b)) => Setting::Fixed(*b),
        Some(other) => Setting::Invalid(other.to_string()),
    }
}

/// Anchored regular expression equivalent to an MQTT subscription pattern.
fn pattern_for(subscription: &str) -> String {
    if subscription == "#" {
        return "^(.*)$".to_string();
    }
    if let Some(base) = subscription.strip_suffix("/#") {
        return format!("^{}/(.*)$", levels_pattern(base));
    }
    format!("^{}$", levels_pattern(subscription))
}

fn levels_pattern(levels: &str) -> String {
    levels
        .split('/')
        .map(|level| {
            if level == "+" {
                "([^/]+)".to_string()
            } else {
                regex::escape(level)
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Byte offset of the first wildcard: any `+`, or a trailing `#`.
fn wildcard_position(subscription: &str) -> Option<usize> {
    let plus = subscription.find('+');
    let hash = subscription
        .strip_suffix('#')
        .map(|rest| rest.len());
    match (plus, hash) {
        (Some(p), Some(h)) => Some(p.min(h)),
        (p, h) => p.or(h),
    }
}

fn join_topic(base: &str, suffix: &str) -> String {
    let base = base.trim_end_matches('/');
    let suffix = suffix.trim_start_matches('/');
    let joined = if suffix.is_empty() {
        base.to_string()
    } else if base.is_empty() {
        suffix.to_string()
    } else {
        format!("{}/{}", base, suffix)
    };
    normalize_topic(&joined)
}

/// Collapse runs of `/` and drop a trailing separator.
pub fn normalize_topic(topic: &str) -> String {
    let mut out = String::with_capacity(topic.len());
    let mut previous_slash = false;
    for c in topic.chars() {
        if c == '/' {
            if previous_slash {
                continue;
            }
            previous_slash = true;
        } else {
            previous_slash = false;
        }
        out.push(c);
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}
