// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The client connection (C8): one socket to a Gateway, a client-side
//! subscription registry, and publish/subscribe/request APIs. Grounded
//! on `examples/original_source/MessagingMeshLib/ConnectionImpl.h`'s
//! subscription-by-id/by-subject maps and message backlog, and on
//! scaproust's `socket_facade.rs` (a cross-thread facade blocking on a
//! channel, `Drop` sending a final command).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::error::{GatewayError, Result};
use crate::event_loop::{EventLoopHandle, EventLoopHost, LoopContext, LoopMode};
use crate::message::Message;
use crate::socket::{Socket, SocketEvent, SocketWriter};
use crate::wire::{Action, Frame, Header};

const CONSTRUCTION_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Invoked with `(subject, reply_subject, message)` for each delivery.
pub type SubscriptionCallback = Arc<dyn Fn(&str, &str, Message) + Send + Sync>;

/// Construction-time choice of how inbound publishes reach application
/// code (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Callbacks run inline on the connection's own loop thread. Lowest
    /// latency; callbacks must not block.
    InlineCallback,
    /// Callbacks only run when the application calls
    /// [`Connection::process_message_queue`].
    PullQueue,
}

pub struct ConnectionParams {
    pub gateway_host: String,
    pub gateway_port: u16,
    pub service: String,
    pub client_id: String,
    pub dispatch_mode: DispatchMode,
}

/// Returned by [`Connection::process_message_queue`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageQueueInfo {
    pub messages_processed: usize,
    pub queue_size: usize,
}

#[derive(Clone)]
struct CallbackEntry {
    id: u64,
    callback: SubscriptionCallback,
}

#[derive(Clone)]
struct SubscriptionInfo {
    subject: String,
    subscription_id: u32,
    callbacks: Vec<CallbackEntry>,
}

/// The subscription registry's mutable state, behind one mutex shared
/// by every application thread that subscribes/unsubscribes (spec §5:
/// "guarded by a mutex on mutation").
struct Registry {
    by_id: HashMap<u32, SubscriptionInfo>,
    by_subject: HashMap<String, u32>,
    next_subscription_id: u32,
}

impl Registry {
    fn new() -> Registry {
        Registry {
            by_id: HashMap::new(),
            by_subject: HashMap::new(),
            next_subscription_id: 1,
        }
    }
}

struct QueuedMessage {
    subject: String,
    reply_subject: String,
    subscription_id: u32,
    message: Message,
}

/// `PullQueue` backlog: live queue plus leftover from a previous
/// `max_messages`-capped drain (spec §4.8's "the destructor of the
/// connection"-adjacent `m_messageBacklog` in the original, needed so a
/// bounded `process_message_queue` call never drops a message that
/// arrived while the cap was already reached).
struct Backlog {
    live: Mutex<VecDeque<QueuedMessage>>,
    condvar: Condvar,
    carried_over: Mutex<VecDeque<QueuedMessage>>,
}

impl Backlog {
    fn new() -> Backlog {
        Backlog {
            live: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            carried_over: Mutex::new(VecDeque::new()),
        }
    }

    fn push(&self, msg: QueuedMessage) {
        self.live.lock().unwrap().push_back(msg);
        self.condvar.notify_all();
    }

    fn wake(&self) {
        self.condvar.notify_all();
    }
}

/// Cross-thread shared state: everything `subscribe`/`send_message`/
/// `send_request`/`process_message_queue` touch from an arbitrary
/// application thread. Holds no `Rc`/`RefCell` so it can live behind an
/// `Arc` (see [`crate::socket::SocketWriter`] for the same pattern
/// applied to one socket).
struct ConnectionInner {
    service: String,
    client_id: String,
    dispatch_mode: DispatchMode,
    registry: Mutex<Registry>,
    registry_dirty: AtomicBool,
    request_subscription_ids: Mutex<HashSet<u32>>,
    backlog: Backlog,
    writer: Mutex<Option<SocketWriter>>,
    next_callback_id: AtomicU64,
}

impl ConnectionInner {
    fn send_control_frame(&self, action: Action, subject: &str, subscription_id: u32) {
        let header = Header::new(action, subject).with_subscription_id(subscription_id);
        let bytes = Arc::new(Frame::control(header).to_bytes());
        if let Some(writer) = self.writer.lock().unwrap().as_ref() {
            writer.write(bytes, None);
        }
    }

    fn add_callback(&self, subject: &str, callback: SubscriptionCallback) -> (u32, u64) {
        let callback_id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        let mut send_subscribe = false;

        let subscription_id = {
            let mut registry = self.registry.lock().unwrap();
            match registry.by_subject.get(subject).copied() {
                Some(id) => {
                    registry
                        .by_id
                        .get_mut(&id)
                        .expect("subject->id and id->info tables are kept in sync")
                        .callbacks
                        .push(CallbackEntry { id: callback_id, callback });
                    id
                }
                None => {
                    let id = registry.next_subscription_id;
                    registry.next_subscription_id += 1;
                    registry.by_subject.insert(subject.to_owned(), id);
                    registry.by_id.insert(
                        id,
                        SubscriptionInfo {
                            subject: subject.to_owned(),
                            subscription_id: id,
                            callbacks: vec![CallbackEntry { id: callback_id, callback }],
                        },
                    );
                    send_subscribe = true;
                    id
                }
            }
        };
        self.registry_dirty.store(true, Ordering::Release);

        if send_subscribe {
            self.send_control_frame(Action::Subscribe, subject, subscription_id);
        }
        (subscription_id, callback_id)
    }

    /// Removes one callback entry; if its subscription's list empties,
    /// removes the subscription itself and tells the Gateway to
    /// unsubscribe (spec §4.8: "unsubscribe is sent only when the list
    /// empties").
    fn release_callback(&self, subscription_id: u32, callback_id: u64) {
        let subject_to_unsubscribe = {
            let mut registry = self.registry.lock().unwrap();
            let Some(info) = registry.by_id.get_mut(&subscription_id) else {
                return;
            };
            info.callbacks.retain(|entry| entry.id != callback_id);
            if info.callbacks.is_empty() {
                let subject = info.subject.clone();
                registry.by_id.remove(&subscription_id);
                registry.by_subject.remove(&subject);
                Some(subject)
            } else {
                None
            }
        };
        self.registry_dirty.store(true, Ordering::Release);

        if let Some(subject) = subject_to_unsubscribe {
            self.send_control_frame(Action::Unsubscribe, &subject, subscription_id);
        }
    }

    fn resolve_callbacks(&self, subscription_id: u32) -> Option<Vec<CallbackEntry>> {
        self.registry
            .lock()
            .unwrap()
            .by_id
            .get(&subscription_id)
            .map(|info| info.callbacks.clone())
    }
}

/// The loop-thread-only half of a connection's state (installed via
/// [`LoopContext::set_owner_state`], exactly like a service manager's
/// state): the private copy-on-write subscription cache spec §5
/// describes, refreshed from [`ConnectionInner::registry`] whenever
/// `registry_dirty` is set.
struct ConnectionLoopState {
    local_cache: HashMap<u32, SubscriptionInfo>,
}

impl ConnectionLoopState {
    fn new() -> ConnectionLoopState {
        ConnectionLoopState {
            local_cache: HashMap::new(),
        }
    }

    fn refresh_if_dirty(&mut self, inner: &ConnectionInner) {
        if inner.registry_dirty.swap(false, Ordering::AcqRel) {
            self.local_cache = inner.registry.lock().unwrap().by_id.clone();
        }
    }
}

fn on_publish_frame(ctx: &LoopContext, inner: &Arc<ConnectionInner>, frame: Frame) {
    let subscription_id = frame.header.subscription_id;
    let subject = frame.header.subject;
    let reply_subject = frame.header.reply_subject;
    let message = frame.body.unwrap_or_default();

    let is_request_bypass = inner
        .request_subscription_ids
        .lock()
        .unwrap()
        .contains(&subscription_id);

    if is_request_bypass || inner.dispatch_mode == DispatchMode::InlineCallback {
        let callbacks = ctx
            .with_owner_state::<ConnectionLoopState, _>(|state| {
                state.refresh_if_dirty(inner);
                state.local_cache.get(&subscription_id).map(|info| info.callbacks.clone())
            })
            .flatten();
        if let Some(callbacks) = callbacks {
            for entry in &callbacks {
                (entry.callback)(&subject, &reply_subject, message.clone());
            }
        }
    } else {
        inner.backlog.push(QueuedMessage {
            subject,
            reply_subject,
            subscription_id,
            message,
        });
    }
}

/// Handles every post-handshake frame except `Ack` (consumed by the
/// caller before this is reached; see `Connection::new`.
fn handle_frame(ctx: &LoopContext, socket: &Socket, inner: &Arc<ConnectionInner>, frame: Frame) {
    if frame.header.action == Action::Publish {
        on_publish_frame(ctx, inner, frame);
    } else {
        log::warn!(
            "[connection {}] unexpected action {:?} from gateway",
            inner.client_id,
            frame.header.action
        );
        let _ = socket;
    }
}

/// A live subscription. Dropping it releases this callback entry; if it
/// was the last one for its subject, this also unsubscribes from the
/// Gateway (spec §4.8: "dropping the handle releases that callback
/// entry").
pub struct Subscription {
    inner: Weak<ConnectionInner>,
    subscription_id: u32,
    callback_id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.release_callback(self.subscription_id, self.callback_id);
        }
    }
}

/// One connected client. Owns its own (cold) event loop; dropping it
/// sends `Disconnect` and tears the loop down (spec §4.8: "the
/// destructor of the connection drops all handles and sends
/// `Disconnect`").
pub struct Connection {
    inner: Arc<ConnectionInner>,
    _host: EventLoopHost,
}

impl Connection {
    /// Connects to the Gateway and blocks until its `Ack` arrives or 30
    /// seconds elapse (spec §4.8's construction handshake: this is what
    /// guarantees a `publish`/`subscribe` call immediately after
    /// construction cannot race the service handoff on the Gateway
    /// side).
    pub fn new(params: ConnectionParams) -> Result<Connection> {
        let host = EventLoopHost::spawn(format!("connection:{}", params.client_id), LoopMode::Cold)?;
        let loop_handle = host.handle.clone();

        let inner = Arc::new(ConnectionInner {
            service: params.service.clone(),
            client_id: params.client_id.clone(),
            dispatch_mode: params.dispatch_mode,
            registry: Mutex::new(Registry::new()),
            registry_dirty: AtomicBool::new(false),
            request_subscription_ids: Mutex::new(HashSet::new()),
            backlog: Backlog::new(),
            writer: Mutex::new(None),
            next_callback_id: AtomicU64::new(1),
        });

        let (ack_tx, ack_rx) = mpsc::sync_channel::<Result<()>>(1);
        let service = params.service.clone();
        let client_id = params.client_id.clone();
        let inner_for_dispatch = inner.clone();

        Socket::connect(&loop_handle, &params.gateway_host, params.gateway_port, move |ctx, socket, event| {
            match event {
                SocketEvent::Connected => {
                    ctx.set_owner_state(ConnectionLoopState::new());
                    *inner_for_dispatch.writer.lock().unwrap() = Some(socket.writer());
                    let header = Header::new(Action::Connect, service.clone()).with_reply_subject(client_id.clone());
                    socket.write(Arc::new(Frame::control(header).to_bytes()), None);
                }
                SocketEvent::ConnectionFailed(err) => {
                    let _ = ack_tx.try_send(Err(err));
                }
                SocketEvent::FrameReceived(payload) => match Frame::from_payload(&payload) {
                    Ok(frame) if frame.header.action == Action::Ack => {
                        let _ = ack_tx.try_send(Ok(()));
                    }
                    Ok(frame) => handle_frame(ctx, socket, &inner_for_dispatch, frame),
                    Err(err) => {
                        log::warn!("[connection {client_id}] {err}");
                        socket.close();
                    }
                },
                SocketEvent::Disconnected(err) => {
                    log::warn!("[connection {client_id}] disconnected: {err:?}");
                    let _ = ack_tx.try_send(Err(err.unwrap_or_else(|| {
                        GatewayError::TransportFailure(std::io::Error::new(
                            std::io::ErrorKind::ConnectionReset,
                            "disconnected before the gateway's ack arrived",
                        ))
                    })));
                    inner_for_dispatch.backlog.wake();
                }
                SocketEvent::MoveToLoopComplete => {}
            }
        });

        match ack_rx.recv_timeout(CONSTRUCTION_ACK_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(GatewayError::Timeout(format!(
                    "ack from gateway for service '{}'",
                    params.service
                )))
            }
        }

        Ok(Connection { inner, _host: host })
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Sends `message` to `subject`. `reply_subject` is empty unless the
    /// caller is answering a request.
    pub fn send_message(&self, subject: &str, message: Message, reply_subject: &str) {
        let header = Header::new(Action::Publish, subject).with_reply_subject(reply_subject);
        let bytes = Arc::new(Frame::publish(header, message).to_bytes());
        if let Some(writer) = self.inner.writer.lock().unwrap().as_ref() {
            writer.write(bytes, None);
        }
    }

    /// Subscribes `callback` to `subject`. The Gateway is told to
    /// subscribe only the first time any local callback joins this
    /// subject (spec §4.8).
    pub fn subscribe(
        &self,
        subject: impl Into<String>,
        callback: impl Fn(&str, &str, Message) + Send + Sync + 'static,
    ) -> Subscription {
        let subject = subject.into();
        let (subscription_id, callback_id) = self.inner.add_callback(&subject, Arc::new(callback));
        Subscription {
            inner: Arc::downgrade(&self.inner),
            subscription_id,
            callback_id,
        }
    }

    /// Sends `message` to `subject` with a fresh inbox reply address,
    /// then blocks up to `timeout` for the first reply (spec §4.8).
    /// Returns `None` on timeout, matching the original's "reply or
    /// nullptr".
    pub fn send_request(&self, subject: &str, message: Message, timeout: Duration) -> Option<Message> {
        let inbox = format!("_INBOX.{}", uuid::Uuid::new_v4());
        let (reply_tx, reply_rx) = mpsc::sync_channel::<Message>(1);

        let subscription = self.subscribe(inbox.clone(), move |_subject, _reply_subject, reply| {
            let _ = reply_tx.try_send(reply);
        });

        self.inner
            .request_subscription_ids
            .lock()
            .unwrap()
            .insert(subscription.subscription_id);

        self.send_message(subject, message, &inbox);
        let reply = reply_rx.recv_timeout(timeout).ok();

        self.inner
            .request_subscription_ids
            .lock()
            .unwrap()
            .remove(&subscription.subscription_id);
        // `subscription` drops here, unsubscribing from the inbox.
        reply
    }

    /// Drains queued (`PullQueue`-mode, non-request) messages, waiting
    /// up to `timeout` for at least one to arrive if none are queued
    /// yet. `max_messages < 0` means unbounded; any leftover past the
    /// cap is kept in the backlog for the next call.
    pub fn process_message_queue(&self, timeout: Duration, max_messages: i64) -> MessageQueueInfo {
        let deadline = Instant::now() + timeout;
        let mut processed = 0usize;
        let mut backlog = self.inner.backlog.carried_over.lock().unwrap();

        loop {
            while let Some(msg) = backlog.pop_front() {
                self.dispatch_queued(msg);
                processed += 1;
                if max_messages >= 0 && processed as i64 >= max_messages {
                    let remaining = backlog.len() + self.inner.backlog.live.lock().unwrap().len();
                    return MessageQueueInfo {
                        messages_processed: processed,
                        queue_size: remaining,
                    };
                }
            }

            let mut live = self.inner.backlog.live.lock().unwrap();
            if live.is_empty() {
                let now = Instant::now();
                if now >= deadline {
                    return MessageQueueInfo {
                        messages_processed: processed,
                        queue_size: 0,
                    };
                }
                let (guard, _) = self
                    .inner
                    .backlog
                    .condvar
                    .wait_timeout(live, deadline - now)
                    .unwrap();
                live = guard;
                if live.is_empty() {
                    return MessageQueueInfo {
                        messages_processed: processed,
                        queue_size: 0,
                    };
                }
            }
            backlog.extend(live.drain(..));
        }
    }

    /// Unblocks a concurrent [`Connection::process_message_queue`] call
    /// without waiting for its timeout (spec §4.8/§5).
    pub fn wake_up(&self) {
        self.inner.backlog.wake();
    }

    fn dispatch_queued(&self, msg: QueuedMessage) {
        if let Some(callbacks) = self.inner.resolve_callbacks(msg.subscription_id) {
            for entry in &callbacks {
                (entry.callback)(&msg.subject, &msg.reply_subject, msg.message.clone());
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.inner.send_control_frame(Action::Disconnect, &self.inner.service, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_callback_shares_one_subscription_id_per_subject() {
        let inner = ConnectionInner {
            service: "svc".into(),
            client_id: "client".into(),
            dispatch_mode: DispatchMode::InlineCallback,
            registry: Mutex::new(Registry::new()),
            registry_dirty: AtomicBool::new(false),
            request_subscription_ids: Mutex::new(HashSet::new()),
            backlog: Backlog::new(),
            writer: Mutex::new(None),
            next_callback_id: AtomicU64::new(1),
        };

        let (id_a, callback_a) = inner.add_callback("orders.new", Arc::new(|_: &str, _: &str, _: Message| {}));
        let (id_b, callback_b) = inner.add_callback("orders.new", Arc::new(|_: &str, _: &str, _: Message| {}));
        assert_eq!(id_a, id_b);
        assert_ne!(callback_a, callback_b);
        assert_eq!(inner.registry.lock().unwrap().by_id[&id_a].callbacks.len(), 2);
    }

    #[test]
    fn release_last_callback_removes_subscription() {
        let inner = ConnectionInner {
            service: "svc".into(),
            client_id: "client".into(),
            dispatch_mode: DispatchMode::InlineCallback,
            registry: Mutex::new(Registry::new()),
            registry_dirty: AtomicBool::new(false),
            request_subscription_ids: Mutex::new(HashSet::new()),
            backlog: Backlog::new(),
            writer: Mutex::new(None),
            next_callback_id: AtomicU64::new(1),
        };

        let (id, callback_id) = inner.add_callback("orders.new", Arc::new(|_: &str, _: &str, _: Message| {}));
        inner.release_callback(id, callback_id);
        assert!(inner.registry.lock().unwrap().by_id.is_empty());
        assert!(inner.registry.lock().unwrap().by_subject.is_empty());
    }

    #[test]
    fn resolve_callbacks_finds_registered_subject() {
        let inner = ConnectionInner {
            service: "svc".into(),
            client_id: "client".into(),
            dispatch_mode: DispatchMode::PullQueue,
            registry: Mutex::new(Registry::new()),
            registry_dirty: AtomicBool::new(false),
            request_subscription_ids: Mutex::new(HashSet::new()),
            backlog: Backlog::new(),
            writer: Mutex::new(None),
            next_callback_id: AtomicU64::new(1),
        };
        let (id, _) = inner.add_callback("orders.new", Arc::new(|_: &str, _: &str, _: Message| {}));
        assert!(inner.resolve_callbacks(id).is_some());
        assert!(inner.resolve_callbacks(id + 1).is_none());
    }

    #[test]
    fn message_queue_info_defaults_to_zero() {
        let info = MessageQueueInfo::default();
        assert_eq!(info.messages_processed, 0);
        assert_eq!(info.queue_size, 0);
    }
}
