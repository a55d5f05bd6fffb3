// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The socket (C3): a TCP endpoint bound to one event loop at a time.
//! State machine grounded on the teacher's `pipe.rs` (`Initial ->
//! HandshakeTx -> HandshakeRx -> Idle -> Dead` becomes our `Fresh ->
//! Connecting -> Connected -> Migrating -> Closing -> Closed`); read
//! reassembly grounded on the teacher's `RecvOperation` pattern, redone
//! against [`crate::frame::FrameAssembler`] instead of the fixed nanomsg
//! header the teacher parses.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::ToSocketAddrs;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};

use crate::error::{GatewayError, Result};
use crate::event_loop::{EventLoopHandle, LoopContext};
use crate::frame::{FrameAssembler, FrameWriter};
use crate::wire::MAX_FRAME_LEN;

/// Threshold for the small-write aggregate (spec §4.3's reference value).
pub const COALESCE_THRESHOLD: usize = 8 * 1024;

pub type SocketId = u64;

fn next_socket_id() -> SocketId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

fn next_token() -> Token {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    Token(NEXT.fetch_add(1, Ordering::Relaxed) as usize)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Fresh,
    Connecting,
    Connected,
    Migrating,
    Closing,
    Closed,
}

/// One entry in the pending-write queue. `bytes` is reference-counted
/// because the same published frame is frequently queued, with distinct
/// subscription-id overrides, to many target sockets.
#[derive(Clone)]
pub struct PendingWrite {
    pub bytes: Arc<Vec<u8>>,
    pub override_subscription_id: Option<u32>,
}

impl PendingWrite {
    pub fn new(bytes: Arc<Vec<u8>>) -> PendingWrite {
        PendingWrite {
            bytes,
            override_subscription_id: None,
        }
    }

    pub fn with_override(bytes: Arc<Vec<u8>>, subscription_id: u32) -> PendingWrite {
        PendingWrite {
            bytes,
            override_subscription_id: Some(subscription_id),
        }
    }
}

/// The write-coalescing algorithm from spec §4.3, as a pure function over
/// a snapshot of the pending queue: every buffer's bytes (after applying
/// its override) appear in the output, in order, split only across an
/// aggregate boundary: never reordered, never dropped (invariant I6).
pub fn coalesce_writes(pending: &[PendingWrite], threshold: usize) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut aggregate: Vec<u8> = Vec::new();

    for item in pending {
        let mut bytes = (*item.bytes).clone();
        if let Some(id) = item.override_subscription_id {
            if bytes.len() >= 9 {
                FrameWriter::overwrite_subscription_id_slot(&mut bytes, id);
            }
        }

        if bytes.len() > threshold {
            if !aggregate.is_empty() {
                out.push(std::mem::take(&mut aggregate));
            }
            out.push(bytes);
            continue;
        }

        if aggregate.len() + bytes.len() > threshold {
            out.push(std::mem::take(&mut aggregate));
        }
        aggregate.extend_from_slice(&bytes);
        if aggregate.len() == threshold {
            out.push(std::mem::take(&mut aggregate));
        }
    }

    if !aggregate.is_empty() {
        out.push(aggregate);
    }

    out
}

/// Emitted by a socket after an I/O turn; consumed by whoever owns the
/// [`Socket`] handle (service manager, gateway, client connection).
pub enum SocketEvent {
    Connected,
    ConnectionFailed(GatewayError),
    FrameReceived(Vec<u8>),
    Disconnected(Option<GatewayError>),
    MoveToLoopComplete,
}

/// `Arc<Mutex<..>>`, not `Rc<RefCell<..>>`, and `+ Send`, even though an
/// upcall is only ever *called* from whichever loop thread currently
/// owns the socket: `move_to_loop` hands the same upcall to a brand new
/// `Socket` constructed on the *target* loop's thread (see
/// `Socket::move_to_loop`), so the value itself must be able to cross
/// that boundary even though no two threads ever call it concurrently.
/// The `Box` makes the callback replaceable in place, needed because
/// ownership of a socket's events changes hands over its lifetime (the
/// Gateway's pending-connection upcall hands off to a service manager's
/// once the first frame names a service, see [`Socket::set_upcall`]).
pub type Upcall = Arc<Mutex<Box<dyn FnMut(&LoopContext, &Socket, SocketEvent) + Send>>>;

fn boxed_upcall(upcall: impl FnMut(&LoopContext, &Socket, SocketEvent) + Send + 'static) -> Upcall {
    Arc::new(Mutex::new(Box::new(upcall)))
}

struct SocketInner {
    id: SocketId,
    name: String,
    state: SocketState,
    token: Token,
    stream: Option<TcpStream>,
    loop_handle: EventLoopHandle,
    read_assembler: Option<FrameAssembler>,
    write_queue: Arc<Mutex<VecDeque<PendingWrite>>>,
    is_mesh_peer: bool,
    already_updated: bool,
    upcall: Upcall,
}

/// A cheaply-cloneable handle to one socket. All state lives behind an
/// `Rc<RefCell<_>>`; a `Socket` is only ever touched on its owning loop's
/// thread, per spec §9's "cyclic ownership between socket and loop." Code
/// running on another thread (most notably the application thread behind
/// a [`crate::client::Connection`]) must go through [`SocketWriter`]
/// instead, which only ever carries `Send` data across the boundary.
#[derive(Clone)]
pub struct Socket {
    inner: Rc<RefCell<SocketInner>>,
}

impl Socket {
    fn from_stream(
        stream: TcpStream,
        name: String,
        state: SocketState,
        loop_handle: EventLoopHandle,
        upcall: Upcall,
    ) -> Socket {
        Socket::from_stream_with_id(
            next_socket_id(),
            stream,
            name,
            state,
            loop_handle,
            upcall,
            Arc::new(Mutex::new(VecDeque::new())),
            None,
        )
    }

    /// Like `from_stream`, but keeps a caller-supplied id instead of
    /// minting a new one, and takes over an existing write queue and
    /// in-progress read assembler rather than starting with fresh ones.
    /// `move_to_loop` is the only caller: the socket id is a
    /// process-unique *connection* identity (spec §3) used as the
    /// subscription owner-key and the service manager's table key, and
    /// both it and any bytes already queued for write or partially read
    /// must survive the handle being duplicated onto a new loop (spec
    /// §4.3: "no bytes are lost; reads pause during migration").
    #[allow(clippy::too_many_arguments)]
    fn from_stream_with_id(
        id: SocketId,
        stream: TcpStream,
        name: String,
        state: SocketState,
        loop_handle: EventLoopHandle,
        upcall: Upcall,
        write_queue: Arc<Mutex<VecDeque<PendingWrite>>>,
        read_assembler: Option<FrameAssembler>,
    ) -> Socket {
        let _ = stream.set_nodelay(true);
        Socket {
            inner: Rc::new(RefCell::new(SocketInner {
                id,
                name,
                state,
                token: next_token(),
                stream: Some(stream),
                loop_handle,
                read_assembler,
                write_queue,
                is_mesh_peer: false,
                already_updated: false,
                upcall,
            })),
        }
    }

    /// Registers this socket in the owning loop's socket table so that a
    /// [`SocketWriter`] (or any other `SocketId`-keyed cross-thread call)
    /// can find it again from inside a marshalled closure.
    fn register_in_loop(&self, ctx: &LoopContext) {
        ctx.register_socket(self.id(), self.clone());
    }

    pub fn id(&self) -> SocketId {
        self.inner.borrow().id
    }

    /// A `Send + Sync` handle other threads use to enqueue writes or
    /// request a close without touching this (loop-thread-only) handle.
    pub fn writer(&self) -> SocketWriter {
        let inner = self.inner.borrow();
        SocketWriter {
            id: inner.id,
            queue: inner.write_queue.clone(),
            loop_handle: inner.loop_handle.clone(),
        }
    }

    /// Replaces this socket's domain-event callback in place. Used when
    /// ownership of a socket passes from one component to another (the
    /// Gateway's pending-connection handling hands off to the service
    /// manager that ends up owning the socket) without needing to
    /// recreate the socket or re-run `move_to_loop` just to rebind it.
    pub fn set_upcall(&self, upcall: impl FnMut(&LoopContext, &Socket, SocketEvent) + Send + 'static) {
        let existing = self.inner.borrow().upcall.clone();
        *existing.lock().unwrap() = Box::new(upcall);
    }

    pub fn name(&self) -> String {
        self.inner.borrow().name.clone()
    }

    pub fn state(&self) -> SocketState {
        self.inner.borrow().state
    }

    pub fn is_mesh_peer(&self) -> bool {
        self.inner.borrow().is_mesh_peer
    }

    pub fn set_mesh_peer(&self, is_mesh_peer: bool) {
        self.inner.borrow_mut().is_mesh_peer = is_mesh_peer;
    }

    pub fn already_updated(&self) -> bool {
        self.inner.borrow().already_updated
    }

    pub fn set_already_updated(&self, value: bool) {
        self.inner.borrow_mut().already_updated = value;
    }

    /// Initiates an outbound connection. Resolution runs on a background
    /// thread (DNS is out of scope per spec §1; this satisfies "resolves
    /// host via async DNS" without a bespoke resolver) and the result is
    /// marshalled back onto `loop_handle`.
    pub fn connect(
        loop_handle: &EventLoopHandle,
        host: &str,
        port: u16,
        upcall: impl FnMut(&LoopContext, &Socket, SocketEvent) + Send + 'static,
    ) {
        let host = host.to_owned();
        let loop_handle_for_thread = loop_handle.clone();
        let upcall: Upcall = boxed_upcall(upcall);

        std::thread::spawn(move || {
            let resolved = (host.as_str(), port)
                .to_socket_addrs()
                .ok()
                .and_then(|mut it| it.next());

            loop_handle_for_thread.marshal(move |ctx| {
                let loop_handle = ctx.handle().clone();
                let addr = match resolved {
                    Some(addr) => addr,
                    None => {
                        log::warn!("DNS resolution failed for {host}:{port}");
                        let placeholder = Socket::placeholder(loop_handle, upcall.clone());
                        upcall.lock().unwrap()(
                            ctx,
                            &placeholder,
                            SocketEvent::ConnectionFailed(GatewayError::TransportFailure(
                                io::Error::new(io::ErrorKind::NotFound, "dns resolution failed"),
                            )),
                        );
                        return;
                    }
                };

                match TcpStream::connect(addr) {
                    Ok(stream) => {
                        let socket = Socket::from_stream(
                            stream,
                            format!("{host}:{port}"),
                            SocketState::Connecting,
                            loop_handle,
                            upcall,
                        );
                        socket.register(ctx, Interest::READABLE | Interest::WRITABLE);
                        socket.arm_ready_handler(ctx);
                        socket.register_in_loop(ctx);
                    }
                    Err(err) => {
                        log::warn!("connect to {host}:{port} failed: {err}");
                        let loop_handle = ctx.handle().clone();
                        let placeholder = Socket::placeholder(loop_handle, upcall.clone());
                        upcall.lock().unwrap()(
                            ctx,
                            &placeholder,
                            SocketEvent::ConnectionFailed(GatewayError::TransportFailure(err)),
                        );
                    }
                }
            });
        });
    }

    /// A `Closed` socket with no backing stream, used only to carry a
    /// `ConnectionFailed` event to an upcall that expects a `&Socket`.
    fn placeholder(loop_handle: EventLoopHandle, upcall: Upcall) -> Socket {
        Socket {
            inner: Rc::new(RefCell::new(SocketInner {
                id: next_socket_id(),
                name: String::new(),
                state: SocketState::Closed,
                token: next_token(),
                stream: None,
                loop_handle,
                read_assembler: None,
                write_queue: Arc::new(Mutex::new(VecDeque::new())),
                is_mesh_peer: false,
                already_updated: false,
                upcall,
            })),
        }
    }

    fn register(&self, ctx: &LoopContext, interest: Interest) {
        let mut inner = self.inner.borrow_mut();
        let token = inner.token;
        if let Some(stream) = inner.stream.as_mut() {
            if let Err(err) = ctx.registry().register(stream, token, interest) {
                log::warn!("[{}] register failed: {err}", inner.name);
            }
        }
    }

    fn reregister(&self, ctx: &LoopContext, interest: Interest) {
        let mut inner = self.inner.borrow_mut();
        let token = inner.token;
        if let Some(stream) = inner.stream.as_mut() {
            let _ = ctx.registry().reregister(stream, token, interest);
        }
    }

    fn arm_ready_handler(&self, ctx: &LoopContext) {
        let token = self.inner.borrow().token;
        let socket = self.clone();
        ctx.set_ready_handler(token, move |ctx: &LoopContext, event: &Event| {
            socket.on_ready(ctx, event);
        });
    }

    fn on_ready(&self, ctx: &LoopContext, event: &Event) {
        let was_connecting = self.inner.borrow().state == SocketState::Connecting;
        if was_connecting {
            if event.is_error() || event.is_write_closed() {
                self.fail_connect(ctx, io::Error::new(io::ErrorKind::Other, "connect failed"));
                return;
            }
            if event.is_writable() {
                let established = {
                    let inner = self.inner.borrow();
                    inner
                        .stream
                        .as_ref()
                        .and_then(|s| s.take_error().ok().flatten())
                        .is_none()
                };
                if !established {
                    self.fail_connect(ctx, io::Error::new(io::ErrorKind::Other, "connect failed"));
                    return;
                }
                self.inner.borrow_mut().state = SocketState::Connected;
                self.reregister(ctx, Interest::READABLE);
                self.emit(ctx, SocketEvent::Connected);
                return;
            }
        }

        if event.is_readable() {
            self.do_read(ctx);
        }
        if event.is_writable() {
            self.drain_writes(ctx);
        }
        if event.is_read_closed() && !event.is_readable() {
            self.fail(ctx, None);
        }
    }

    fn fail_connect(&self, ctx: &LoopContext, err: io::Error) {
        self.inner.borrow_mut().state = SocketState::Closed;
        self.emit(ctx, SocketEvent::ConnectionFailed(GatewayError::TransportFailure(err)));
    }

    fn do_read(&self, ctx: &LoopContext) {
        let mut buf = [0u8; 16 * 1024];
        loop {
            let read_result = {
                let mut inner = self.inner.borrow_mut();
                inner.stream.as_mut().map(|s| s.read(&mut buf))
            };
            let n = match read_result {
                Some(Ok(0)) => return, // spurious wakeup, spec §4.3
                Some(Ok(n)) => n,
                Some(Err(err)) if err.kind() == io::ErrorKind::WouldBlock => return,
                Some(Err(err)) => {
                    self.fail(ctx, Some(GatewayError::TransportFailure(err)));
                    return;
                }
                None => return,
            };

            let mut offset = 0;
            while offset < n {
                let max_frame_len = MAX_FRAME_LEN;
                let consumed = {
                    let mut inner = self.inner.borrow_mut();
                    let assembler = inner
                        .read_assembler
                        .get_or_insert_with(|| FrameAssembler::new(max_frame_len));
                    match assembler.append_from_stream(&buf[offset..n]) {
                        Ok(c) => c,
                        Err(err) => {
                            drop(inner);
                            self.fail(ctx, Some(err));
                            return;
                        }
                    }
                };
                offset += consumed;

                let complete = self
                    .inner
                    .borrow()
                    .read_assembler
                    .as_ref()
                    .map(|a| a.has_complete_frame())
                    .unwrap_or(false);
                if complete {
                    let assembler = self.inner.borrow_mut().read_assembler.take().unwrap();
                    self.emit(ctx, SocketEvent::FrameReceived(assembler.take_payload()));
                }
            }
        }
    }

    /// Enqueues `bytes` for write and schedules a drain on the owning
    /// loop. Convenience for same-thread (loop-thread) callers; code on
    /// another thread must go through [`Socket::writer`] instead, since
    /// `Socket` itself is `Rc`-based and not `Send`.
    pub fn write(&self, bytes: Arc<Vec<u8>>, override_subscription_id: Option<u32>) {
        self.writer().write(bytes, override_subscription_id);
    }

    fn drain_writes(&self, ctx: &LoopContext) {
        let state = self.inner.borrow().state;
        if state != SocketState::Connected {
            // Held per spec §4.3: buffers enqueue during Connecting/
            // Migrating and drain only once Connected is (re)entered.
            return;
        }

        let queued: Vec<PendingWrite> = {
            let inner = self.inner.borrow();
            let mut q = inner.write_queue.lock().unwrap();
            q.drain(..).collect()
        };
        if queued.is_empty() {
            return;
        }

        let chunks = coalesce_writes(&queued, COALESCE_THRESHOLD);
        for (index, chunk) in chunks.iter().enumerate() {
            let mut offset = 0;
            loop {
                if offset >= chunk.len() {
                    break;
                }
                let write_result = {
                    let mut inner = self.inner.borrow_mut();
                    inner.stream.as_mut().map(|s| s.write(&chunk[offset..]))
                };
                match write_result {
                    Some(Ok(0)) => {
                        self.requeue_remainder(&chunks, index, offset);
                        self.reregister(ctx, Interest::READABLE | Interest::WRITABLE);
                        return;
                    }
                    Some(Ok(n)) => offset += n,
                    Some(Err(err)) if err.kind() == io::ErrorKind::WouldBlock => {
                        self.requeue_remainder(&chunks, index, offset);
                        self.reregister(ctx, Interest::READABLE | Interest::WRITABLE);
                        return;
                    }
                    Some(Err(err)) => {
                        self.fail(ctx, Some(GatewayError::TransportFailure(err)));
                        return;
                    }
                    None => return,
                }
            }
        }

        // Every queued chunk made it out; drop any earlier WRITABLE
        // interest so the loop isn't woken for writability it no longer
        // needs (spec §9: a drained socket goes back to read-only watch).
        self.reregister(ctx, Interest::READABLE);
    }

    /// Puts back, in order, the bytes of `chunks[from_index]` starting at
    /// `offset` plus every chunk after it, none of which made it onto the
    /// wire. Used when a partial write hits `WouldBlock` so a slow
    /// subscriber's queue keeps growing instead of losing bytes mid-frame
    /// (spec §9, invariant I6).
    fn requeue_remainder(&self, chunks: &[Vec<u8>], from_index: usize, offset: usize) {
        let inner = self.inner.borrow();
        let mut q = inner.write_queue.lock().unwrap();
        for chunk in chunks[from_index + 1..].iter().rev() {
            q.push_front(PendingWrite::new(Arc::new(chunk.clone())));
        }
        if offset < chunks[from_index].len() {
            q.push_front(PendingWrite::new(Arc::new(chunks[from_index][offset..].to_vec())));
        }
    }

    fn fail(&self, ctx: &LoopContext, err: Option<GatewayError>) {
        let (token, id) = {
            let inner = self.inner.borrow();
            (inner.token, inner.id)
        };
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state == SocketState::Closed {
                return;
            }
            inner.state = SocketState::Closed;
            inner.write_queue.lock().unwrap().clear();
            inner.stream = None;
        }
        ctx.remove_ready_handler(token);
        ctx.unregister_socket(id);
        self.emit(ctx, SocketEvent::Disconnected(err));
    }

    /// Disconnects and releases OS resources. Always marshalled to the
    /// owning loop (spec §9: the handle may only be manipulated there).
    pub fn close(&self) {
        self.writer().close();
    }

    /// Duplicates the underlying OS handle onto `target_loop` and retires
    /// this handle in place (spec §4.3/§9), via [`duplicate_stream`], the
    /// `dup()`-based stand-in for the platform-specific duplication APIs
    /// spec.md names. Must be called on this socket's owning loop thread
    /// (the only thread that can ever hold a `Socket` to begin with),
    /// hence it takes `ctx` directly rather than marshalling to itself.
    pub fn move_to_loop(&self, ctx: &LoopContext, target_loop: EventLoopHandle) {
        let (token, id) = {
            let inner = self.inner.borrow();
            (inner.token, inner.id)
        };
        let dup = {
            let mut inner = self.inner.borrow_mut();
            inner.state = SocketState::Migrating;
            inner.stream.as_ref().map(duplicate_stream)
        };

        let dup = match dup {
            Some(Ok(stream)) => stream,
            _ => {
                log::warn!("[{}] move_to_loop: handle duplication failed", self.name());
                return;
            }
        };

        ctx.remove_ready_handler(token);
        ctx.unregister_socket(id);

        let (write_queue, read_assembler) = {
            let mut inner = self.inner.borrow_mut();
            inner.stream = None;
            (inner.write_queue.clone(), inner.read_assembler.take())
        };

        let name = self.name();
        let is_mesh_peer = self.is_mesh_peer();
        let upcall = self.inner.borrow().upcall.clone();
        let target_loop_for_job = target_loop.clone();

        target_loop.marshal(move |ctx| {
            let new_socket = Socket::from_stream_with_id(
                id,
                dup,
                name,
                SocketState::Connected,
                target_loop_for_job,
                upcall,
                write_queue,
                read_assembler,
            );
            new_socket.set_mesh_peer(is_mesh_peer);
            new_socket.register(ctx, Interest::READABLE);
            new_socket.arm_ready_handler(ctx);
            new_socket.register_in_loop(ctx);
            // Anything enqueued on the old handle before the move completed
            // (e.g. mesh.rs's ConnectMeshPeer frame, written right before
            // register_peer_outbound triggers this move) would otherwise sit
            // in a queue nobody ever drains.
            new_socket.drain_writes(ctx);
            new_socket.emit(ctx, SocketEvent::MoveToLoopComplete);
        });
    }

    fn emit(&self, ctx: &LoopContext, event: SocketEvent) {
        let upcall = self.inner.borrow().upcall.clone();
        upcall.lock().unwrap()(ctx, self, event);
    }
}

/// A `Send + Sync` handle to one socket's write queue and owning loop.
/// This is what crosses thread boundaries; a [`Socket`] itself never
/// does, since it is `Rc`-based. Obtained via [`Socket::writer`].
#[derive(Clone)]
pub struct SocketWriter {
    id: SocketId,
    queue: Arc<Mutex<VecDeque<PendingWrite>>>,
    loop_handle: EventLoopHandle,
}

impl SocketWriter {
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Enqueues `bytes` for write; callable from any thread. Uses
    /// `marshal_unique` keyed by socket id so many concurrent writers
    /// coalesce into a single drain turn (spec §4.2/§4.3).
    pub fn write(&self, bytes: Arc<Vec<u8>>, override_subscription_id: Option<u32>) {
        let pending = match override_subscription_id {
            Some(id) => PendingWrite::with_override(bytes, id),
            None => PendingWrite::new(bytes),
        };
        self.queue.lock().unwrap().push_back(pending);

        let id = self.id;
        self.loop_handle.marshal_unique(id, move |ctx| {
            if let Some(socket) = ctx.lookup_socket(id) {
                socket.drain_writes(ctx);
            }
        });
    }

    /// Requests a close; callable from any thread.
    pub fn close(&self) {
        let id = self.id;
        self.loop_handle.marshal(move |ctx| {
            if let Some(socket) = ctx.lookup_socket(id) {
                socket.fail(ctx, None);
            }
        });
    }
}

/// Duplicates the kernel socket object behind an `mio::net::TcpStream`,
/// producing a second, independently-owned handle to the same
/// connection. On Unix this is `dup(2)`, as spec §4.3 names; Windows'
/// equivalent (`WSADuplicateSocket`) needs a socket API this crate's
/// dependency stack doesn't carry, so moves are refused there rather
/// than faked.
#[cfg(unix)]
fn duplicate_stream(stream: &TcpStream) -> io::Result<TcpStream> {
    use std::os::unix::io::{AsRawFd, FromRawFd};
    let dup_fd = unsafe { libc::dup(stream.as_raw_fd()) };
    if dup_fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let std_stream = unsafe { std::net::TcpStream::from_raw_fd(dup_fd) };
    Ok(TcpStream::from_std(std_stream))
}

#[cfg(not(unix))]
fn duplicate_stream(_stream: &TcpStream) -> io::Result<TcpStream> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "move_to_loop handle duplication is only implemented for unix targets",
    ))
}

/// Accepts inbound connections on one loop, handing each accepted
/// [`Socket`] (already `Connected`) to `on_accept`.
pub struct Listener {
    token: Token,
    listener: RefCell<Option<TcpListener>>,
}

impl Listener {
    /// Binds `0.0.0.0:port` and disables Nagle on every accepted stream
    /// (spec §4.3's `listen(port)`).
    pub fn bind(
        ctx: &LoopContext,
        port: u16,
        loop_handle: EventLoopHandle,
        mut on_accept: impl FnMut(&LoopContext, Socket) + 'static,
        upcall_for_accepted: Upcall,
    ) -> Result<Rc<Listener>> {
        let addr = format!("0.0.0.0:{port}").parse().map_err(|_| {
            GatewayError::InternalInvariant("invalid listen address".into())
        })?;
        let mut listener = TcpListener::bind(addr)?;
        let token = next_token();
        ctx.registry().register(&mut listener, token, Interest::READABLE)?;

        let listener = Rc::new(Listener {
            token,
            listener: RefCell::new(Some(listener)),
        });

        let listener_for_handler = listener.clone();
        ctx.set_ready_handler(token, move |ctx: &LoopContext, _event: &Event| {
            listener_for_handler.accept_loop(ctx, &loop_handle, &mut on_accept, &upcall_for_accepted);
        });

        Ok(listener)
    }

    fn accept_loop(
        &self,
        ctx: &LoopContext,
        loop_handle: &EventLoopHandle,
        on_accept: &mut impl FnMut(&LoopContext, Socket),
        upcall_for_accepted: &Upcall,
    ) {
        loop {
            let accepted = {
                let mut guard = self.listener.borrow_mut();
                match guard.as_mut() {
                    Some(listener) => listener.accept(),
                    None => return,
                }
            };
            match accepted {
                Ok((stream, addr)) => {
                    let socket = Socket::from_stream(
                        stream,
                        addr.to_string(),
                        SocketState::Connected,
                        loop_handle.clone(),
                        upcall_for_accepted.clone(),
                    );
                    socket.register(ctx, Interest::READABLE);
                    socket.arm_ready_handler(ctx);
                    socket.register_in_loop(ctx);
                    on_accept(ctx, socket);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    log::warn!("accept failed: {err}");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Action, Frame, Header};

    fn frame_bytes(subscription_id: u32, subject: &str) -> Vec<u8> {
        Frame::control(Header::new(Action::Publish, subject).with_subscription_id(subscription_id))
            .to_bytes()
    }

    #[test]
    fn coalesce_preserves_concatenation_and_order() {
        let a = Arc::new(frame_bytes(1, "a"));
        let b = Arc::new(frame_bytes(2, "b"));
        let c = Arc::new(vec![0u8; 20_000]); // larger than threshold

        let pending = vec![
            PendingWrite::new(a.clone()),
            PendingWrite::new(b.clone()),
            PendingWrite::new(c.clone()),
        ];

        let chunks = coalesce_writes(&pending, COALESCE_THRESHOLD);
        let concatenated: Vec<u8> = chunks.into_iter().flatten().collect();
        let expected: Vec<u8> = a.iter().chain(b.iter()).chain(c.iter()).copied().collect();
        assert_eq!(concatenated, expected);
    }

    #[test]
    fn small_buffers_aggregate_below_threshold() {
        let a = Arc::new(vec![1u8; 100]);
        let b = Arc::new(vec![2u8; 100]);
        let pending = vec![PendingWrite::new(a), PendingWrite::new(b)];

        let chunks = coalesce_writes(&pending, COALESCE_THRESHOLD);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 200);
    }

    #[test]
    fn oversized_buffer_flushes_and_stands_alone() {
        let small = Arc::new(vec![1u8; 10]);
        let big = Arc::new(vec![2u8; COALESCE_THRESHOLD + 1]);
        let pending = vec![PendingWrite::new(small), PendingWrite::new(big)];

        let chunks = coalesce_writes(&pending, COALESCE_THRESHOLD);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 10);
        assert_eq!(chunks[1].len(), COALESCE_THRESHOLD + 1);
    }

    #[test]
    fn override_subscription_id_rewrites_header_slot() {
        let frame = Arc::new(frame_bytes(0, "orders.new"));
        let pending = vec![PendingWrite::with_override(frame, 42)];
        let chunks = coalesce_writes(&pending, COALESCE_THRESHOLD);
        let written = &chunks[0];

        let decoded = Frame::from_payload(&written[4..]).unwrap();
        assert_eq!(decoded.header.subscription_id, 42);
    }
}
