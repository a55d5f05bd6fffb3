// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The service manager (C5): one per service, owning a dedicated (hot)
//! event loop, the three socket tables, and one subject-matching engine.
//! Grounded on the original `ServiceManager::onDataReceived` action
//! dispatch, with the mesh-relay and `already_updated` de-dup logic
//! spec §4.5 adds on top of it.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use crate::event_loop::{EventLoopHandle, EventLoopHost, LoopContext, LoopMode};
use crate::matcher::MatchEngine;
use crate::message::Message;
use crate::socket::{Socket, SocketEvent, SocketId};
use crate::subject::{validate_pattern, validate_publish_subject};
use crate::wire::{Action, Frame, Header};

/// What table a socket belongs in once its move to this service's loop
/// completes: decided by the Gateway (client vs. mesh peer) or the mesh
/// manager (outbound peer, keyed by the peer gateway's `host:port`).
#[derive(Clone)]
enum SocketRole {
    Client,
    PeerInbound,
    PeerOutbound(String),
}

/// The service's loop-local state (spec §4.5's three tables plus the
/// matching engine). Lives behind `LoopContext::set_owner_state` on the
/// service's own loop, exactly like a `Socket`'s own `Rc`-based state:
/// reached from socket event callbacks running on that same loop, never
/// touched cross-thread directly.
struct ServiceManagerState {
    name: String,
    matcher: MatchEngine<Socket>,
    client_sockets: HashMap<SocketId, Socket>,
    peer_sockets_inbound: HashMap<SocketId, Socket>,
    peer_sockets_outbound: HashMap<String, Socket>,
}

impl ServiceManagerState {
    fn new(name: String) -> ServiceManagerState {
        ServiceManagerState {
            name,
            matcher: MatchEngine::new(),
            client_sockets: HashMap::new(),
            peer_sockets_inbound: HashMap::new(),
            peer_sockets_outbound: HashMap::new(),
        }
    }

    fn file_socket(&mut self, socket: Socket, role: &SocketRole) {
        match role {
            SocketRole::Client => {
                self.client_sockets.insert(socket.id(), socket);
            }
            SocketRole::PeerInbound => {
                self.peer_sockets_inbound.insert(socket.id(), socket);
            }
            SocketRole::PeerOutbound(key) => {
                self.peer_sockets_outbound.insert(key.clone(), socket);
            }
        }
    }

    fn forget_socket(&mut self, socket: &Socket) {
        let id = socket.id();
        self.matcher.remove_all_for_owner(id);
        self.client_sockets.remove(&id);
        self.peer_sockets_inbound.remove(&id);
        self.peer_sockets_outbound.retain(|_, v| v.id() != id);
    }

    fn relay_to_peers(&self, bytes: Arc<Vec<u8>>) {
        for peer in self.peer_sockets_outbound.values() {
            peer.write(bytes.clone(), None);
        }
    }

    fn on_subscribe(&mut self, source: &Socket, subject: &str, subscription_id: u32) {
        if let Err(err) = validate_pattern(subject) {
            log::warn!("[{}] {err}", source.name());
            return;
        }
        let count = self
            .matcher
            .add_subscription(subject, subscription_id, source.id(), source.clone());
        if count == 1 && !source.is_mesh_peer() {
            let bytes = Arc::new(Frame::control(Header::new(Action::Subscribe, subject)).to_bytes());
            self.relay_to_peers(bytes);
        }
    }

    fn on_unsubscribe(&mut self, source: &Socket, subject: &str) {
        let count = self.matcher.remove_subscription(subject, source.id());
        if count == 0 && !source.is_mesh_peer() {
            let bytes = Arc::new(Frame::control(Header::new(Action::Unsubscribe, subject)).to_bytes());
            self.relay_to_peers(bytes);
        }
    }

    /// The fan-out algorithm, normative per spec §4.5: match, then for
    /// each matched target either deliver directly (non-peer target) or
    /// relay once to a peer (only when the publish didn't itself
    /// originate from a peer, and only the first matching record per
    /// peer socket: the `already_updated` flag de-dups across multiple
    /// subscription records at the same peer).
    fn on_publish(
        &mut self,
        source: &Socket,
        subject: &str,
        reply_subject: &str,
        body: Message,
    ) {
        if let Err(err) = validate_publish_subject(subject) {
            log::warn!("[{}] {err}", source.name());
            return;
        }

        // Subscription-id 0 here is a placeholder: write-coalescing
        // patches it to each recipient's own id (spec §4.3), so the
        // frame body is serialized exactly once regardless of fan-out.
        let header = Header::new(Action::Publish, subject).with_reply_subject(reply_subject);
        let bytes = Arc::new(Frame::publish(header, body).to_bytes());

        let source_is_peer = source.is_mesh_peer();
        let matches = self.matcher.match_subject(subject);
        let mut touched: Vec<Socket> = Vec::new();

        for record in &matches {
            let target = &record.target;
            if !target.is_mesh_peer() {
                // Unconditional: a client holding K distinct matching
                // patterns receives K deliveries (invariant I3), so this
                // is never gated on `already_updated` the way peer
                // targets are below.
                target.write(bytes.clone(), Some(record.subscription_id));
                target.set_already_updated(true);
                touched.push(target.clone());
            } else if !source_is_peer && !target.already_updated() {
                target.write(bytes.clone(), Some(record.subscription_id));
                target.set_already_updated(true);
                touched.push(target.clone());
            }
        }

        for target in touched {
            target.set_already_updated(false);
        }
    }

    fn on_frame(&mut self, source: &Socket, frame: Frame) {
        match frame.header.action {
            Action::Subscribe => self.on_subscribe(source, &frame.header.subject, frame.header.subscription_id),
            Action::Unsubscribe => self.on_unsubscribe(source, &frame.header.subject),
            Action::Publish => {
                let body = frame.body.unwrap_or_default();
                self.on_publish(source, &frame.header.subject, &frame.header.reply_subject, body);
            }
            Action::Disconnect => self.forget_socket(source),
            Action::Connect | Action::ConnectMeshPeer | Action::Ack => {
                log::warn!(
                    "[{}] service '{}': unexpected action {:?} on a registered socket",
                    source.name(),
                    self.name,
                    frame.header.action
                );
                source.close();
            }
        }
    }
}

/// One service: a dedicated loop plus everything spec §4.5 describes.
pub struct ServiceManager {
    host: EventLoopHost,
    name: String,
}

impl ServiceManager {
    /// Spawns the service's own (hot, spec §4.2/§2) event loop and
    /// installs its state on it.
    pub fn spawn(name: impl Into<String>) -> io::Result<ServiceManager> {
        let name = name.into();
        let host = EventLoopHost::spawn(format!("service:{name}"), LoopMode::Hot)?;
        let state_name = name.clone();
        host.handle.marshal(move |ctx| {
            ctx.set_owner_state(ServiceManagerState::new(state_name));
        });
        Ok(ServiceManager { host, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> &EventLoopHandle {
        &self.host.handle
    }

    /// Registers a newly-accepted or newly-connected socket per spec
    /// §4.5's sequence: marks the mesh-peer flag, rebinds the socket's
    /// upcall to this service's dispatch, and moves it to this service's
    /// loop. Table filing and the `Ack` happen once the move completes
    /// (see `ServiceManagerState::file_socket` / the `MoveToLoopComplete`
    /// arm below), which runs synchronously within the same loop turn
    /// the move finishes in; no frame can arrive on the socket before
    /// its table entry exists.
    ///
    /// Must be called with `ctx` for the loop the socket currently lives
    /// on (the Gateway's loop for an inbound accept, or whichever loop
    /// drove the outbound `Socket::connect` for a mesh peer).
    pub fn register_client(&self, ctx: &LoopContext, socket: Socket) {
        self.register_with_role(ctx, socket, false, SocketRole::Client);
    }

    pub fn register_peer_inbound(&self, ctx: &LoopContext, socket: Socket) {
        self.register_with_role(ctx, socket, true, SocketRole::PeerInbound);
    }

    pub fn register_peer_outbound(&self, ctx: &LoopContext, socket: Socket, peer_key: impl Into<String>) {
        self.register_with_role(ctx, socket, true, SocketRole::PeerOutbound(peer_key.into()));
    }

    fn register_with_role(&self, ctx: &LoopContext, socket: Socket, is_mesh_peer: bool, role: SocketRole) {
        socket.set_mesh_peer(is_mesh_peer);
        let service_name = self.name.clone();
        socket.set_upcall(move |ctx, socket, event| {
            dispatch(ctx, socket, event, &service_name, &role);
        });
        socket.move_to_loop(ctx, self.handle().clone());
    }
}

fn dispatch(
    ctx: &LoopContext,
    socket: &Socket,
    event: SocketEvent,
    service_name: &str,
    role: &SocketRole,
) {
    match event {
        SocketEvent::Connected => {}
        SocketEvent::ConnectionFailed(err) => {
            log::warn!("[{}] service '{service_name}': {err}", socket.name());
        }
        SocketEvent::MoveToLoopComplete => {
            ctx.with_owner_state::<ServiceManagerState, _>(|state| {
                state.file_socket(socket.clone(), role);
            });
            // Per §4.5/§6's action table, `Ack` only flows gw->peer, i.e.
            // only to the side that connected in. The outbound dialing side
            // (mesh.rs's `connect_peer`) must never receive one back.
            if !matches!(role, SocketRole::PeerOutbound(_)) {
                let ack = Frame::control(Header::new(Action::Ack, service_name)).to_bytes();
                socket.write(Arc::new(ack), None);
            }
        }
        SocketEvent::FrameReceived(payload) => {
            let frame = match Frame::from_payload(&payload) {
                Ok(frame) => frame,
                Err(err) => {
                    log::warn!("[{}] {err}", socket.name());
                    socket.close();
                    return;
                }
            };
            ctx.with_owner_state::<ServiceManagerState, _>(|state| {
                state.on_frame(socket, frame);
            });
        }
        SocketEvent::Disconnected(err) => {
            if let Some(err) = err {
                log::info!("[{}] service '{service_name}': disconnected: {err}", socket.name());
            }
            ctx.with_owner_state::<ServiceManagerState, _>(|state| {
                state.forget_socket(socket);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::FieldValue;

    fn new_state(name: &str) -> ServiceManagerState {
        ServiceManagerState::new(name.to_owned())
    }

    #[test]
    fn publish_frame_carries_placeholder_subscription_id() {
        let header = Header::new(Action::Publish, "orders.new").with_reply_subject("");
        let body = Message::new().with_field("qty", FieldValue::Int32(5));
        let frame = Frame::publish(header, body);
        assert_eq!(frame.header.subscription_id, 0);
    }

    #[test]
    fn state_starts_with_empty_tables() {
        let state = new_state("svc");
        assert!(state.client_sockets.is_empty());
        assert!(state.peer_sockets_inbound.is_empty());
        assert!(state.peer_sockets_outbound.is_empty());
    }
}
