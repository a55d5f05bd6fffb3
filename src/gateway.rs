// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The Gateway (C7): one cold event loop, one listening socket, a
//! `pending_connections` table awaiting each accepted socket's first
//! frame, and the service-manager registry every other component reaches
//! through [`get_or_create_service_manager`]. Grounded on the original
//! `Gateway::onNewConnection`/`onConnect`/`getOrCreateServiceManager`.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

use crate::config::MeshConfig;
use crate::error::{GatewayError, Result};
use crate::event_loop::{EventLoopHandle, EventLoopHost, LoopContext, LoopMode};
use crate::mesh;
use crate::service::ServiceManager;
use crate::socket::{Socket, SocketEvent, SocketId, Upcall};
use crate::wire::{Action, Frame};

/// The Gateway's loop-local state: every service manager created so far,
/// and every accepted socket still waiting on its first frame.
struct GatewayState {
    pending_connections: HashMap<SocketId, Socket>,
    service_managers: HashMap<String, Arc<ServiceManager>>,
}

impl GatewayState {
    fn new() -> GatewayState {
        GatewayState {
            pending_connections: HashMap::new(),
            service_managers: HashMap::new(),
        }
    }

    fn get_or_create(&mut self, name: &str) -> Result<Arc<ServiceManager>> {
        if let Some(existing) = self.service_managers.get(name) {
            return Ok(existing.clone());
        }
        let manager = ServiceManager::spawn(name).map_err(|err| {
            GatewayError::ResourceExhaustion(format!("failed to spawn loop for service '{name}': {err}"))
        })?;
        let manager = Arc::new(manager);
        self.service_managers.insert(name.to_owned(), manager.clone());
        Ok(manager)
    }
}

/// Looks up (creating if necessary) the service manager for `name`. The
/// entry point every pending-connection and mesh-peer-connect callback
/// uses to reach the Gateway's registry, since that registry is
/// `Rc`-based loop-local state reachable only through `ctx`.
pub fn get_or_create_service_manager(ctx: &LoopContext, name: &str) -> Result<Arc<ServiceManager>> {
    ctx.with_owner_state::<GatewayState, _>(|state| state.get_or_create(name))
        .unwrap_or_else(|| {
            Err(GatewayError::InternalInvariant(
                "gateway owner state not installed".into(),
            ))
        })
}

fn forget_pending(ctx: &LoopContext, id: SocketId) {
    ctx.with_owner_state::<GatewayState, _>(|state| {
        state.pending_connections.remove(&id);
    });
}

fn on_pending_accept(ctx: &LoopContext, socket: Socket) {
    ctx.with_owner_state::<GatewayState, _>(|state| {
        state.pending_connections.insert(socket.id(), socket);
    });
}

/// The upcall shared by every freshly-accepted socket, until its first
/// frame hands it to a service manager (which rebinds the upcall via
/// [`Socket::set_upcall`], see `service.rs`).
fn pending_dispatch(ctx: &LoopContext, socket: &Socket, event: SocketEvent) {
    match event {
        SocketEvent::FrameReceived(payload) => {
            let frame = match Frame::from_payload(&payload) {
                Ok(frame) => frame,
                Err(err) => {
                    log::warn!("[{}] {err}", socket.name());
                    forget_pending(ctx, socket.id());
                    socket.close();
                    return;
                }
            };

            let service = frame.header.subject.clone();
            match frame.header.action {
                Action::Connect => {
                    forget_pending(ctx, socket.id());
                    hand_off(ctx, socket, &service, false);
                }
                Action::ConnectMeshPeer => {
                    forget_pending(ctx, socket.id());
                    hand_off(ctx, socket, &service, true);
                }
                other => {
                    log::warn!(
                        "[{}] expected Connect/ConnectMeshPeer as the first frame, got {other:?}",
                        socket.name()
                    );
                    forget_pending(ctx, socket.id());
                    socket.close();
                }
            }
        }
        SocketEvent::Disconnected(_) => {
            // "If the socket disconnects before sending a valid connect
            // frame, it is simply dropped" (spec §4.7).
            forget_pending(ctx, socket.id());
        }
        _ => {}
    }
}

fn hand_off(ctx: &LoopContext, socket: &Socket, service: &str, is_mesh_peer: bool) {
    match get_or_create_service_manager(ctx, service) {
        Ok(manager) => {
            if is_mesh_peer {
                manager.register_peer_inbound(ctx, socket.clone());
            } else {
                manager.register_client(ctx, socket.clone());
            }
        }
        Err(err) => {
            log::warn!("[{}] {err}", socket.name());
            socket.close();
        }
    }
}

fn build_pending_upcall() -> Upcall {
    Arc::new(Mutex::new(Box::new(pending_dispatch)
        as Box<dyn FnMut(&LoopContext, &Socket, SocketEvent) + Send>))
}

/// Owns the Gateway's loop for the lifetime of the returned handle.
pub struct Gateway {
    host: EventLoopHost,
    port: u16,
}

impl Gateway {
    /// Spawns the Gateway's (cold, spec §4.2) loop, binds the listening
    /// socket, and starts the mesh manager. Returns once the loop thread
    /// exists; binding and mesh startup happen asynchronously on it, so
    /// a bind failure is only visible in the log (there is no separate
    /// "gateway failed to start" signal by design, matching a long-lived
    /// server process that logs and otherwise stays up).
    pub fn run(port: u16, config: MeshConfig) -> io::Result<Gateway> {
        let host = EventLoopHost::spawn(format!("gateway:{port}"), LoopMode::Cold)?;
        let loop_handle = host.handle.clone();

        host.handle.marshal(move |ctx| {
            ctx.set_owner_state(GatewayState::new());
            mesh::start(ctx, &config, port);

            let upcall = build_pending_upcall();
            if let Err(err) =
                crate::socket::Listener::bind(ctx, port, loop_handle.clone(), on_pending_accept, upcall)
            {
                log::error!("gateway failed to bind port {port}: {err}");
            } else {
                log::info!("gateway listening on 0.0.0.0:{port}");
            }
        });

        Ok(Gateway { host, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn handle(&self) -> &EventLoopHandle {
        &self.host.handle
    }
}
