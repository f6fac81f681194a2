// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runs a set of relay instances from one configuration document.

use crate::config::{relay_entries, ConfigError};
use crate::connection::Connector;
use crate::logging::LogSink;
use crate::relay::{Relay, RelayHandle};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// What a [`RelayHost::reload`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadReport {
    pub started: Vec<String>,
    pub updated: Vec<String>,
    pub stopped: Vec<String>,
    /// Entries whose configuration was invalid, with the reason.
    pub rejected: Vec<(String, String)>,
}

struct Instance {
    handle: RelayHandle,
    task: JoinHandle<()>,
}

/// Owns one task per relay instance.
pub struct RelayHost {
    connector: Arc<dyn Connector>,
    sink: Arc<dyn LogSink>,
    instances: BTreeMap<String, Instance>,
}

impl RelayHost {
    pub fn new(connector: Arc<dyn Connector>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            connector,
            sink,
            instances: BTreeMap::new(),
        }
    }

    /// Names of the running instances.
    pub fn names(&self) -> Vec<String> {
        self.instances.keys().cloned().collect()
    }

    pub fn handle(&self, name: &str) -> Option<RelayHandle> {
        self.instances.get(name).map(|i| i.handle.clone())
    }

    /// Apply a configuration document.
    ///
    /// New names are started, existing ones receive their new tree, and
    /// instances missing from the document are shut down.
    pub async fn reload(&mut self, document: &Value) -> Result<ReloadReport, ConfigError> {
        let entries = relay_entries(document)?;
        let mut report = ReloadReport::default();

        let wanted: Vec<&str> = entries.iter().map(|(name, _)| name.as_str()).collect();
        let removed: Vec<String> = self
            .instances
            .keys()
            .filter(|name| !wanted.contains(&name.as_str()))
            .cloned()
            .collect();
        for name in removed {
            if let Some(instance) = self.instances.remove(&name) {
                stop_instance(&name, instance).await;
                report.stopped.push(name);
            }
        }

        for (name, tree) in entries {
            let closed = self.instances.get(&name).map(|i| i.handle.is_closed());
            match closed {
                Some(false) => {
                    if let Some(instance) = self.instances.get(&name) {
                        match instance.handle.replace_config(tree).await {
                            Ok(()) => report.updated.push(name),
                            Err(err) => {
                                tracing::warn!(relay = %name, "Update not delivered: {}", err)
                            }
                        }
                    }
                }
                Some(true) => {
                    tracing::warn!(relay = %name, "Relay task gone, restarting instance");
                    self.instances.remove(&name);
                    self.spawn(name, tree, &mut report);
                }
                None => self.spawn(name, tree, &mut report),
            }
        }
        Ok(report)
    }

    fn spawn(&mut self, name: String, tree: Value, report: &mut ReloadReport) {
        let mut relay = match Relay::with_sink(tree, Arc::clone(&self.connector), Arc::clone(&self.sink)) {
            Ok(relay) => relay,
            Err(err) => {
                tracing::error!(relay = %name, "Invalid relay configuration: {}", err);
                report.rejected.push((name, err.to_string()));
                return;
            }
        };
        let (handle, commands) = RelayHandle::channel();
        let task_name = name.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = relay.start().await {
                tracing::error!(relay = %task_name, "Initial start failed: {}", err);
            }
            relay.run(commands).await;
        });
        self.instances.insert(name.clone(), Instance { handle, task });
        report.started.push(name);
    }

    /// Stop every instance.
    pub async fn shutdown(&mut self) {
        let instances = std::mem::take(&mut self.instances);
        for (name, instance) in instances {
            stop_instance(&name, instance).await;
        }
    }
}

async fn stop_instance(name: &str, instance: Instance) {
    if instance.handle.shutdown().await.is_err() {
        tracing::debug!(relay = %name, "Relay task already finished");
    }
    if let Err(err) = instance.task.await {
        tracing::error!(relay = %name, "Relay task failed: {}", err);
    }
}
