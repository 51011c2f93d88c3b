//! Fixtures for loopback tests

use crate::config::BridgeConfig;
use crate::crypto::KeyPair;
use crate::network::message::{Capabilities, Handshake, PROTOCOL_VERSION};
use crate::network::node::{Bridge, BridgeHandle};
use crate::network::server::{handshake_inbound, Server};
use futures::stream::StreamExt;
use std::time::Duration;

/// Loopback config with short timeouts and an ephemeral port
pub fn test_config(instance_id: &str) -> BridgeConfig {
    BridgeConfig {
        instance_id: instance_id.to_string(),
        listen_host: "127.0.0.1".to_string(),
        listen_port: Some(0),
        send_timeout_ms: 2_000,
        health_timeout_ms: 300,
        handshake_timeout_ms: 2_000,
        connect_timeout_ms: 2_000,
        ..Default::default()
    }
}

pub async fn start_bridge(instance_id: &str) -> BridgeHandle {
    start_with(test_config(instance_id)).await
}

pub async fn start_with(config: BridgeConfig) -> BridgeHandle {
    Bridge::start(config).await.unwrap()
}

/// A peer that completes the handshake and then never answers.
///
/// Returns the address to dial.
pub async fn silent_peer(instance_id: &str) -> String {
    versioned_peer(instance_id, PROTOCOL_VERSION).await
}

/// Like `silent_peer`, but its signed handshake advertises `version`
pub async fn versioned_peer(instance_id: &str, version: &str) -> String {
    let server = Server::bind("127.0.0.1", 0).await.unwrap();
    let addr = server.local_addr().to_string();
    let instance_id = instance_id.to_string();
    let version = version.to_string();

    tokio::spawn(async move {
        let keys = KeyPair::generate();
        while let Ok((stream, remote)) = server.accept().await {
            let handshake = Handshake::with_version(
                &keys,
                &instance_id,
                Capabilities::default(),
                None,
                &version,
            )
            .unwrap();
            let local_id = instance_id.clone();
            tokio::spawn(async move {
                if let Ok((mut framed, _)) = handshake_inbound(
                    stream,
                    remote,
                    handshake,
                    &local_id,
                    Duration::from_secs(2),
                )
                .await
                {
                    // Swallow everything
                    while let Some(Ok(_)) = framed.next().await {}
                }
            });
        }
    });

    addr
}
