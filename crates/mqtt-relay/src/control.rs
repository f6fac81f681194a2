// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control plane topics and commands.
//!
//! Commands arrive on `<apiBase>/<name>/<action>[/<path>]`. Status and
//! query responses are published under `<apiBase>/status/<name>/`.

use crate::tree::ConfigPath;
use serde_json::Value;
use thiserror::Error;

/// Control message parse errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ControlError {
    #[error("Missing command action.")]
    MissingAction,

    #[error("Unknown command - \"{0}\".")]
    Unknown(String),
}

/// Topic namespace of one relay instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
    status_base: String,
}

impl Namespace {
    pub fn new(api_base: &str, name: &str) -> Self {
        let base = api_base.trim_end_matches('/');
        Self {
            prefix: format!("{}/{}/", base, name),
            status_base: format!("{}/status/{}", base, name),
        }
    }

    /// Prefix shared by all command topics, including the trailing `/`.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Wildcard subscription covering all command topics.
    pub fn subscription(&self) -> String {
        format!("{}#", self.prefix)
    }

    pub fn status_topic(&self) -> String {
        format!("{}/info", self.status_base)
    }

    pub fn config_value_topic(&self, path: &ConfigPath) -> String {
        format!("{}/configValue/{}", self.status_base, path.response_key())
    }

    /// Command part of `topic`, when it belongs to this namespace.
    pub fn strip<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic.strip_prefix(self.prefix.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    GetStatus,
    ConfigGet(ConfigPath),
    ConfigSet(ConfigPath),
    ConfigMod(ConfigPath),
    SetLogLevel,
    StopInstance,
    StartInstance,
}

impl ControlCommand {
    pub fn action(&self) -> &'static str {
        match self {
            ControlCommand::GetStatus => "getstatus",
            ControlCommand::ConfigGet(_) => "config:get",
            ControlCommand::ConfigSet(_) => "config:set",
            ControlCommand::ConfigMod(_) => "config:mod",
            ControlCommand::SetLogLevel => "setloglevel",
            ControlCommand::StopInstance => "stopinstance",
            ControlCommand::StartInstance => "startinstance",
        }
    }

    /// Commands whose empty payload means "no argument".
    fn argument_optional(&self) -> bool {
        matches!(
            self,
            ControlCommand::GetStatus
                | ControlCommand::ConfigGet(_)
                | ControlCommand::StopInstance
                | ControlCommand::StartInstance
        )
    }

    /// Parse the part of a command topic after the namespace prefix.
    pub fn parse(remainder: &str) -> Result<Self, ControlError> {
        let (action, path) = match remainder.split_once('/') {
            Some((action, path)) => (action, path),
            None => (remainder, ""),
        };
        let action = action.trim().to_lowercase();
        if action.is_empty() {
            return Err(ControlError::MissingAction);
        }
        let path = ConfigPath::parse(path);
        Ok(match action.as_str() {
            "getstatus" => ControlCommand::GetStatus,
            "config:get" => ControlCommand::ConfigGet(path),
            "config:set" => ControlCommand::ConfigSet(path),
            "config:mod" => ControlCommand::ConfigMod(path),
            "setloglevel" => ControlCommand::SetLogLevel,
            "stopinstance" => ControlCommand::StopInstance,
            "startinstance" => ControlCommand::StartInstance,
            _ => return Err(ControlError::Unknown(action)),
        })
    }

    /// Decode a command payload: JSON when it parses, the raw text otherwise.
    pub fn decode_payload(&self, payload: &[u8]) -> Option<Value> {
        let text = String::from_utf8_lossy(payload);
        if text.trim().is_empty() && self.argument_optional() {
            return None;
        }
        Some(serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text.into_owned())))
    }
}
