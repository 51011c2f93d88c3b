//! CLI commands for the bridge
//!
//! Implements all command handlers for the CLI interface.

use crate::config::BridgeConfig;
use crate::crypto::KeyPair;
use crate::network::health::{HealthMonitor, PeerHealth};
use crate::network::message::MessageType;
use crate::network::node::{Bridge, BridgeHandle};
use crate::network::sync::SyncEngine;
use crate::storage::{JsonKnowledgeStore, StorageConfig};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Result type for CLI operations
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Command-line overrides applied on top of the config file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub instance_id: Option<String>,
    pub port: Option<u16>,
    pub peers: Vec<String>,
    pub health_interval: Option<u64>,
}

/// Split a comma-separated peer list
pub fn parse_peers(peers: Option<&str>) -> Vec<String> {
    peers
        .map(|p| {
            p.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Load the config file (or defaults) and apply overrides
pub fn load_config(path: Option<&Path>, overrides: Overrides) -> CliResult<BridgeConfig> {
    let mut config = match path {
        Some(path) => BridgeConfig::load(path)?,
        None => BridgeConfig::default(),
    };

    if let Some(id) = overrides.instance_id {
        config.instance_id = id;
    }
    if let Some(port) = overrides.port {
        config.listen_port = Some(port);
    }
    if !overrides.peers.is_empty() {
        config.bootstrap_peers = overrides.peers;
    }
    if overrides.health_interval.is_some() {
        config.health_interval_secs = overrides.health_interval;
    }

    config.validate()?;
    Ok(config)
}

async fn connect_all(bridge: &BridgeHandle, peers: &[String]) -> usize {
    let mut connected = 0;
    for uri in peers {
        match bridge.establish_connection(uri).await {
            Ok(conn) => {
                println!("   🔗 {} at {}", conn.peer_id, uri);
                connected += 1;
            }
            Err(e) => println!("   ❌ {}: {}", uri, e),
        }
    }
    connected
}

/// Run a bridge until Ctrl+C
pub async fn cmd_start(config: BridgeConfig, data_dir: &Path) -> CliResult<()> {
    let store = Arc::new(JsonKnowledgeStore::open(StorageConfig {
        data_dir: data_dir.to_path_buf(),
        ..Default::default()
    })?);

    let health_interval = config.health_interval_secs;
    let bootstrap = config.bootstrap_peers.len();
    let bridge = Bridge::start(config).await?;

    let engine = SyncEngine::new(bridge.clone(), store);
    engine.install_handlers().await;

    println!("🌉 Bridge {} started", bridge.instance_id());
    println!("   🔑 Key fingerprint: {}", bridge.identity().fingerprint());
    match bridge.listen_addr() {
        Some(addr) => println!("   📡 Listening on {}", addr),
        None => println!("   📡 Inbound connections disabled"),
    }
    if bootstrap > 0 {
        println!("   🔗 Dialing {} bootstrap peer(s)", bootstrap);
    }

    if let Some(secs) = health_interval {
        HealthMonitor::new(bridge.clone()).spawn_periodic(Duration::from_secs(secs));
        println!("   🩺 Health check every {}s", secs);
    }

    tokio::signal::ctrl_c().await?;
    println!("\n📴 Shutting down bridge...");
    bridge.shutdown().await;

    Ok(())
}

/// Connect to one peer, send one message and print the ack
pub async fn cmd_send(
    mut config: BridgeConfig,
    peer_uri: &str,
    message_type: &str,
    payload: &str,
) -> CliResult<()> {
    let message_type: MessageType = message_type.parse()?;
    let payload: Value = serde_json::from_str(payload)?;

    config.listen_port = None;
    config.bootstrap_peers.clear();
    let bridge = Bridge::start(config).await?;

    let peer = bridge.establish_connection(peer_uri).await?;
    println!("🔗 Connected to {} at {}", peer.peer_id, peer_uri);

    let message = bridge.identity().message(message_type, payload)?;
    let message_id = message.message_id().to_string();
    let result = bridge
        .send(&peer.peer_id, message, bridge.config().send_timeout())
        .await;
    bridge.shutdown().await;

    let ack = result?;
    println!("✅ Message {} acknowledged ({:?})", message_id, ack.status);
    if let Some(detail) = &ack.detail {
        println!("   ⚠️  {}", detail);
    }
    if let Some(response) = &ack.response {
        println!("   📨 {}", serde_json::to_string_pretty(response)?);
    }

    Ok(())
}

/// Connect to peers and print one health report
pub async fn cmd_health(mut config: BridgeConfig, peers: &[String]) -> CliResult<()> {
    config.listen_port = None;
    config.bootstrap_peers.clear();
    let bridge = Bridge::start(config).await?;

    println!("🩺 Checking {} peer(s)...", peers.len());
    connect_all(&bridge, peers).await;

    let report = HealthMonitor::new(bridge.clone())
        .check_network_health()
        .await?;
    bridge.shutdown().await;

    println!(
        "\n📊 {} of {} peers responsive",
        report.responsive_peers, report.total_peers
    );
    for (peer_id, health) in &report.peers {
        match health {
            PeerHealth::CheckSent {
                round_trip_ms,
                connected_duration_secs,
                ..
            } => println!(
                "   ✅ {} ({}ms, connected {}s)",
                peer_id, round_trip_ms, connected_duration_secs
            ),
            PeerHealth::Error { error } => println!("   ❌ {}: {}", peer_id, error),
        }
    }

    Ok(())
}

/// Print a fresh identity key
pub fn cmd_keygen() -> CliResult<()> {
    let keys = KeyPair::generate();

    println!("🔐 New bridge identity");
    println!("   🔑 Private key: {}", keys.private_key_hex());
    println!("   📍 Public key: {}", keys.public_key_hex());
    println!("   🏷️  Fingerprint: {}", keys.fingerprint());
    println!("\n   ⚠️  Put the private key in the config's private_key_hex to keep this identity.");

    Ok(())
}

/// Print the default config, or write it to a file
pub fn cmd_config(output: Option<&PathBuf>) -> CliResult<()> {
    let config = BridgeConfig::default();

    match output {
        Some(path) => {
            config.save(path)?;
            println!("✅ Config written to {:?}", path);
        }
        None => println!("{}", serde_json::to_string_pretty(&config)?),
    }

    Ok(())
}
