// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The mesh manager (C6): resolves SELF vs. PEER within each service's
//! `MeshGateways` list and dials every PEER, retrying on a 30-second
//! timer on failure. Grounded on the original `MeshManager::
//! parseMeshConfig`/`enrichConfig` (resolve each gateway's host, compare
//! `(ip, port)` to this process's own listening address).
//!
//! Runs entirely on the Gateway's own loop (spec §4.7: "hosts the C6"),
//! so it reaches service managers through
//! [`crate::gateway::get_or_create_service_manager`] rather than holding
//! any state of its own.

use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use crate::config::MeshConfig;
use crate::event_loop::LoopContext;
use crate::socket::{Socket, SocketEvent};
use crate::wire::{Action, Frame, Header};

const RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// One entry this Gateway must dial for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerTarget {
    pub service: String,
    pub peer_key: String,
}

/// Splits `config` into the services this Gateway is SELF for (so the
/// Gateway must have a service manager ready for them even with no
/// client connected yet) and the peers it must dial.
pub fn plan(config: &MeshConfig, own_port: u16) -> (Vec<String>, Vec<PeerTarget>) {
    let mut self_services = Vec::new();
    let mut peers = Vec::new();

    for mesh in &config.startup_meshes {
        let mut is_self_member = false;
        for entry in &mesh.mesh_gateways {
            if is_self_entry(entry, own_port) {
                is_self_member = true;
            } else {
                peers.push(PeerTarget {
                    service: mesh.name.clone(),
                    peer_key: entry.clone(),
                });
            }
        }
        if is_self_member {
            self_services.push(mesh.name.clone());
        }
    }

    (self_services, peers)
}

/// Whether `entry` (`host:port`) names this process. Hostname/IP
/// resolution is explicitly out of scope plumbing (spec §1); this
/// resolves far enough to tell loopback/this-machine addresses apart
/// from a genuine remote peer, which is all `>=` the original's own
/// `enrichConfig` comparison needs in practice for a single-box mesh.
fn is_self_entry(entry: &str, own_port: u16) -> bool {
    let Some((host, port)) = entry.rsplit_once(':') else {
        return false;
    };
    let Ok(port) = port.parse::<u16>() else {
        return false;
    };
    if port != own_port {
        return false;
    }

    if matches!(host, "localhost" | "127.0.0.1" | "::1" | "0.0.0.0") {
        return true;
    }

    (host, 0u16)
        .to_socket_addrs()
        .ok()
        .into_iter()
        .flatten()
        .any(|addr| addr.ip().is_loopback())
}

/// Dials one peer; on success sends `ConnectMeshPeer(service)` and hands
/// the socket to that service's manager as an outbound peer. On failure,
/// schedules a retry after [`RECONNECT_DELAY`] (spec §4.3/§4.6).
pub fn connect_peer(ctx: &LoopContext, target: PeerTarget) {
    let Some((host, port)) = target.peer_key.rsplit_once(':') else {
        log::warn!("mesh peer entry '{}' is not host:port, skipping", target.peer_key);
        return;
    };
    let Ok(port) = port.parse::<u16>() else {
        log::warn!("mesh peer entry '{}' has an invalid port, skipping", target.peer_key);
        return;
    };

    let loop_handle = ctx.handle().clone();
    let service = target.service.clone();
    let peer_key = target.peer_key.clone();

    Socket::connect(&loop_handle, host, port, move |ctx, socket, event| {
        match event {
            SocketEvent::Connected => {
                let frame = Frame::control(Header::new(Action::ConnectMeshPeer, service.clone()));
                socket.write(Arc::new(frame.to_bytes()), None);

                let manager = crate::gateway::get_or_create_service_manager(ctx, &service);
                match manager {
                    Ok(manager) => manager.register_peer_outbound(ctx, socket.clone(), peer_key.clone()),
                    Err(err) => {
                        log::warn!("mesh peer '{peer_key}': {err}");
                        socket.close();
                    }
                }
            }
            SocketEvent::ConnectionFailed(err) => {
                log::warn!("mesh peer '{peer_key}' ({service}) connect failed: {err}, retrying in 30s");
                let retry_target = PeerTarget {
                    service: service.clone(),
                    peer_key: peer_key.clone(),
                };
                ctx.handle().schedule_once(RECONNECT_DELAY, move |ctx| {
                    connect_peer(ctx, retry_target);
                });
            }
            _ => {}
        }
    });
}

/// Starts the mesh: ensures a service manager exists for every service
/// this Gateway is SELF for, then dials every peer. Called once at
/// startup from the Gateway's loop.
pub fn start(ctx: &LoopContext, config: &MeshConfig, own_port: u16) {
    let (self_services, peers) = plan(config, own_port);

    for service in self_services {
        if let Err(err) = crate::gateway::get_or_create_service_manager(ctx, &service) {
            log::warn!("failed to prime service '{service}' at mesh startup: {err}");
        }
    }

    for target in peers {
        connect_peer(ctx, target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StartupMesh;

    fn config_with(entries: Vec<&str>) -> MeshConfig {
        MeshConfig {
            coordinator_gateway: None,
            startup_meshes: vec![StartupMesh {
                name: "svc".into(),
                discover_mesh_using_coordinator: false,
                mesh_gateways: entries.into_iter().map(String::from).collect(),
            }],
        }
    }

    #[test]
    fn loopback_entry_on_own_port_is_self() {
        let config = config_with(vec!["127.0.0.1:5050", "peer.example.com:5050"]);
        let (selves, peers) = plan(&config, 5050);
        assert_eq!(selves, vec!["svc".to_owned()]);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].peer_key, "peer.example.com:5050");
    }

    #[test]
    fn mismatched_port_is_always_a_peer() {
        let config = config_with(vec!["127.0.0.1:9999"]);
        let (selves, peers) = plan(&config, 5050);
        assert!(selves.is_empty());
        assert_eq!(peers.len(), 1);
    }

    #[test]
    fn malformed_entry_yields_neither_self_nor_peer() {
        assert!(!is_self_entry("not-a-host-port", 5050));
    }
}
