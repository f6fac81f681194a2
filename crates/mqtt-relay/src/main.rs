// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT relay CLI
//!
//! Runs every relay instance listed in a configuration file.
//!
//! # Usage
//!
//! ```bash
//! # Run the relays in ./relay-config.yaml
//! mqtt-relay
//!
//! # Use another file (YAML, TOML or JSON)
//! mqtt-relay --config /etc/mqtt-relay/relays.toml
//!
//! # Write a starter configuration
//! mqtt-relay init --output relay-config.yaml
//!
//! # Check a configuration without connecting
//! mqtt-relay validate --config relay-config.yaml
//! ```
//!
//! Send SIGHUP to reload the configuration file.

use clap::{Parser, Subcommand};
use mqtt_relay::config::{self, DEFAULT_CONFIG_PATH, SAMPLE_CONFIG};
use mqtt_relay::{MqttConnector, RelayHost, RelaySettings, TopicMapper, TracingSink};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// MQTT broker-to-broker relay
#[derive(Parser, Debug)]
#[command(name = "mqtt-relay")]
#[command(about = "MQTT relay - broker bridging with topic remapping and a live control plane")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Tracing filter for the process log (relay thresholds apply on top)
    #[arg(long, default_value = "mqtt_relay=debug,warn")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a starter configuration file
    Init {
        /// Output file path
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Relay lines carry their own timestamp and level
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(false)
        .without_time()
        .init();

    if let Some(cmd) = args.command {
        return match cmd {
            Commands::Init { output, force } => cmd_init(&output, force),
            Commands::Validate { config } => cmd_validate(&config),
        };
    }

    println!("MQTT Relay v{}", env!("CARGO_PKG_VERSION"));
    println!("Using configuration from {}", args.config.display());

    let document = config::load_document(&args.config)?;
    let mut host = RelayHost::new(Arc::new(MqttConnector::default()), Arc::new(TracingSink));
    let report = host.reload(&document).await?;
    println!("Started relays: {}", report.started.join(", "));
    for (name, reason) in &report.rejected {
        eprintln!("Relay {} not started: {}", name, reason);
    }
    println!("Press Ctrl+C to stop...");

    wait_for_signals(&mut host, &args.config).await?;

    println!("\nShutting down...");
    host.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signals(host: &mut RelayHost, config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => return result.map_err(Into::into),
            _ = terminate.recv() => return Ok(()),
            _ = hangup.recv() => reload(host, config_path).await,
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(_host: &mut RelayHost, _config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

#[cfg(unix)]
async fn reload(host: &mut RelayHost, config_path: &Path) {
    println!("SIGHUP received, reloading {}", config_path.display());
    let document = match config::load_document(config_path) {
        Ok(document) => document,
        Err(e) => {
            eprintln!("Reload failed, keeping current relays: {}", e);
            return;
        }
    };
    match host.reload(&document).await {
        Ok(report) => {
            println!(
                "Reloaded: started [{}], updated [{}], stopped [{}]",
                report.started.join(", "),
                report.updated.join(", "),
                report.stopped.join(", ")
            );
            for (name, reason) in &report.rejected {
                eprintln!("Relay {} not started: {}", name, reason);
            }
        }
        Err(e) => eprintln!("Reload failed, keeping current relays: {}", e),
    }
}

fn cmd_init(output: &Path, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    if output.exists() && !force {
        eprintln!(
            "{} already exists (use --force to overwrite)",
            output.display()
        );
        std::process::exit(1);
    }
    std::fs::write(output, SAMPLE_CONFIG)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let document = match config::load_document(config_path) {
        Ok(document) => document,
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    };
    let entries = match config::relay_entries(&document) {
        Ok(entries) => entries,
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    };

    let mut failures = 0;
    println!("Relays: {}", entries.len());
    for (name, tree) in &entries {
        match RelaySettings::from_tree(tree) {
            Ok(settings) => {
                let (mapper, skipped) =
                    TopicMapper::compile(settings.topic_map.as_ref(), settings.publish_options);
                println!(
                    "  [{}] {} -> {} ({} rule(s){})",
                    name,
                    settings.broker_in_url,
                    settings.broker_out_url,
                    mapper.len(),
                    if mapper.is_forward_all() { ", forward all" } else { "" }
                );
                for err in skipped {
                    println!("      skipped: {}", err);
                }
            }
            Err(e) => {
                failures += 1;
                println!("  [{}] invalid: {}", name, e);
            }
        }
    }

    if failures > 0 {
        eprintln!("Configuration invalid: {} relay(s) with errors", failures);
        std::process::exit(1);
    }
    println!("Configuration valid!");
    Ok(())
}
