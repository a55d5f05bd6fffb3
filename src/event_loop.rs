// Copyright 2016 Benoît Labaere (benoit.labaere@gmail.com)
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! The event loop host (C2): one OS thread driving one `mio` reactor,
//! with a marshal queue other threads use to run closures on that
//! thread. Grounded on the `EventLoopSignal`/`mio::Sender` pattern in
//! the teacher's `event_loop_msg.rs`, reworked against a modern `mio`
//! (0.8 dropped the built-in notification channel the teacher relied
//! on, so the wakeup here is a `mio::Waker` over a `std::sync::mpsc`
//! channel instead).

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::io;
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::event::Event;
use mio::{Events, Poll, Token, Waker};

use crate::socket::{Socket, SocketId};

const WAKE_TOKEN: Token = Token(usize::MAX);

/// Hot loops busy-spin the reactor with a zero timeout (used for the
/// latency-critical per-service loops); cold loops block until the next
/// event (used for the Gateway's own management loop). Fixed at
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    Hot,
    Cold,
}

type BoxedJob = Box<dyn FnOnce(&LoopContext) + Send>;
type ReadyHandler = Rc<RefCell<dyn FnMut(&LoopContext, &Event)>>;

enum Command {
    Run(BoxedJob),
    RunUnique(u64, BoxedJob),
    Shutdown,
}

/// Context handed to every marshalled closure and every readiness
/// handler; always called from the owning loop's thread.
pub struct LoopContext<'a> {
    registry: &'a mio::Registry,
    handle: &'a EventLoopHandle,
    handlers: &'a RefCell<HashMap<Token, ReadyHandler>>,
    sockets: &'a RefCell<HashMap<SocketId, Socket>>,
    owner_state: &'a RefCell<Option<Box<dyn Any>>>,
}

impl<'a> LoopContext<'a> {
    pub fn registry(&self) -> &mio::Registry {
        self.registry
    }

    pub fn handle(&self) -> &EventLoopHandle {
        self.handle
    }

    /// Files `socket` under its id in this loop's socket table. Sockets
    /// register themselves here on creation/accept/move-in so that
    /// cross-thread callers, which can only pass `Send` data like a
    /// `SocketId` through `marshal`, can look the real (`Rc`-based,
    /// loop-thread-only) `Socket` handle back up once running on the
    /// loop thread.
    pub fn register_socket(&self, id: SocketId, socket: Socket) {
        self.sockets.borrow_mut().insert(id, socket);
    }

    pub fn unregister_socket(&self, id: SocketId) {
        self.sockets.borrow_mut().remove(&id);
    }

    pub fn lookup_socket(&self, id: SocketId) -> Option<Socket> {
        self.sockets.borrow().get(&id).cloned()
    }

    /// Registers (or replaces) the readiness handler for `token`. Safe
    /// to call from inside a handler running for a *different* token;
    /// a handler may also safely replace its own entry, since the
    /// dispatch loop clones the handler out of the map before invoking
    /// it (see `EventLoopHost::run`).
    pub fn set_ready_handler<F>(&self, token: Token, handler: F)
    where
        F: FnMut(&LoopContext, &Event) + 'static,
    {
        self.handlers
            .borrow_mut()
            .insert(token, Rc::new(RefCell::new(handler)));
    }

    pub fn remove_ready_handler(&self, token: Token) {
        self.handlers.borrow_mut().remove(&token);
    }

    /// Installs this loop's owner state (the service manager, mesh
    /// manager, gateway, or client connection running on it). Must be
    /// called once, on the loop thread, before any other component
    /// reaches for it.
    pub fn set_owner_state<T: 'static>(&self, state: T) {
        *self.owner_state.borrow_mut() = Some(Box::new(state));
    }

    /// Runs `f` against the loop's owner state, if any has been set and
    /// its type matches `T`. This is how a marshalled closure, which can
    /// only carry `Send` data like a `SocketId` or a plain string across
    /// threads, reaches the `Rc`-based state that actually lives on the
    /// loop thread.
    pub fn with_owner_state<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slot = self.owner_state.borrow_mut();
        slot.as_mut().and_then(|boxed| boxed.downcast_mut::<T>()).map(f)
    }
}

/// A cloneable, `Send` reference to a running event loop. This is what
/// sockets and components hold to call `marshal`/`marshal_unique` from
/// any thread.
#[derive(Clone)]
pub struct EventLoopHandle {
    name: Arc<str>,
    cmd_tx: mpsc::Sender<Command>,
    waker: Arc<Waker>,
    pending_unique: Arc<Mutex<HashSet<u64>>>,
}

impl EventLoopHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `job` on the loop thread. Callable from any thread.
    pub fn marshal<F>(&self, job: F)
    where
        F: FnOnce(&LoopContext) + Send + 'static,
    {
        let _ = self.cmd_tx.send(Command::Run(Box::new(job)));
        let _ = self.waker.wake();
    }

    /// Like `marshal`, but if a closure with the same `key` is already
    /// queued and not yet processed, this call is dropped. This is how
    /// many small `write()` calls from worker threads coalesce into a
    /// single "drain the write queue" turn on the loop thread.
    pub fn marshal_unique<F>(&self, key: u64, job: F)
    where
        F: FnOnce(&LoopContext) + Send + 'static,
    {
        {
            let mut pending = self.pending_unique.lock().unwrap();
            if !pending.insert(key) {
                return;
            }
        }
        let _ = self.cmd_tx.send(Command::RunUnique(key, Box::new(job)));
        let _ = self.waker.wake();
    }

    /// Runs `job` on the loop thread after `delay` has elapsed. Backed
    /// by a one-shot background thread that sleeps then marshals;
    /// the same offload idiom used for DNS resolution in `socket.rs`,
    /// standing in for the teacher's `event_loop.timeout_ms`, which has
    /// no equivalent in modern `mio`.
    pub fn schedule_once<F>(&self, delay: Duration, job: F)
    where
        F: FnOnce(&LoopContext) + Send + 'static,
    {
        let handle = self.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            handle.marshal(job);
        });
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        let _ = self.waker.wake();
    }
}

/// Owns the OS thread and the `mio` reactor. Dropping the returned
/// join handle does not stop the loop; call `handle.shutdown()`.
pub struct EventLoopHost {
    pub handle: EventLoopHandle,
    join: Option<JoinHandle<()>>,
}

impl EventLoopHost {
    pub fn spawn(name: impl Into<String>, mode: LoopMode) -> io::Result<EventLoopHost> {
        let name: Arc<str> = Arc::from(name.into());
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let pending_unique = Arc::new(Mutex::new(HashSet::new()));

        let handle = EventLoopHandle {
            name: name.clone(),
            cmd_tx,
            waker,
            pending_unique: pending_unique.clone(),
        };

        let thread_handle = handle.clone();
        let thread_name = name.to_string();
        let join = thread::Builder::new()
            .name(thread_name)
            .spawn(move || run(poll, cmd_rx, thread_handle, pending_unique, mode))?;

        Ok(EventLoopHost {
            handle,
            join: Some(join),
        })
    }
}

impl Drop for EventLoopHost {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn run(
    mut poll: Poll,
    cmd_rx: mpsc::Receiver<Command>,
    handle: EventLoopHandle,
    pending_unique: Arc<Mutex<HashSet<u64>>>,
    mode: LoopMode,
) {
    let mut events = Events::with_capacity(1024);
    let handlers: RefCell<HashMap<Token, ReadyHandler>> = RefCell::new(HashMap::new());
    let sockets: RefCell<HashMap<SocketId, Socket>> = RefCell::new(HashMap::new());
    let owner_state: RefCell<Option<Box<dyn Any>>> = RefCell::new(None);
    let poll_timeout = match mode {
        LoopMode::Hot => Some(Duration::from_millis(0)),
        LoopMode::Cold => None,
    };

    loop {
        if let Err(err) = poll.poll(&mut events, poll_timeout) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("[{}] poll failed: {err}", handle.name());
            break;
        }

        let ctx = LoopContext {
            registry: poll.registry(),
            handle: &handle,
            handlers: &handlers,
            sockets: &sockets,
            owner_state: &owner_state,
        };

        let mut woken = false;
        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                woken = true;
                continue;
            }

            let handler_ref = handlers.borrow().get(&event.token()).cloned();
            if let Some(handler_ref) = handler_ref {
                if let Ok(mut handler) = handler_ref.try_borrow_mut() {
                    handler(&ctx, event);
                } else {
                    log::warn!(
                        "[{}] readiness handler for {:?} re-entered, dropping event",
                        handle.name(),
                        event.token()
                    );
                }
            }
        }

        if woken {
            let mut shutting_down = false;
            while let Ok(cmd) = cmd_rx.try_recv() {
                match cmd {
                    Command::Run(job) => job(&ctx),
                    Command::RunUnique(key, job) => {
                        pending_unique.lock().unwrap().remove(&key);
                        job(&ctx);
                    }
                    Command::Shutdown => {
                        shutting_down = true;
                    }
                }
            }
            if shutting_down {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration as StdDuration;

    #[test]
    fn marshal_runs_on_the_loop_thread() {
        let host = EventLoopHost::spawn("test-loop", LoopMode::Cold).unwrap();
        let (tx, rx) = std_mpsc::channel();
        host.handle.marshal(move |_ctx| {
            tx.send(thread::current().name().map(|s| s.to_owned())).unwrap();
        });
        let name = rx.recv_timeout(StdDuration::from_secs(2)).unwrap();
        assert_eq!(name.as_deref(), Some("test-loop"));
    }

    #[test]
    fn marshal_unique_drops_duplicate_while_pending() {
        let host = EventLoopHost::spawn("dedup-loop", LoopMode::Cold).unwrap();
        let (tx, rx) = std_mpsc::channel();

        // Block the loop thread briefly so both marshal_unique calls
        // are guaranteed to race while the first is still "pending".
        let (gate_tx, gate_rx) = std_mpsc::channel::<()>();
        host.handle.marshal(move |_ctx| {
            let _ = gate_rx.recv();
        });

        let tx2 = tx.clone();
        host.handle.marshal_unique(42, move |_ctx| {
            tx2.send(1).unwrap();
        });
        host.handle.marshal_unique(42, move |_ctx| {
            tx.send(2).unwrap();
        });

        gate_tx.send(()).unwrap();

        let first = rx.recv_timeout(StdDuration::from_secs(2)).unwrap();
        assert_eq!(first, 1);
        assert!(rx.recv_timeout(StdDuration::from_millis(200)).is_err());
    }

    #[test]
    fn schedule_once_runs_after_delay() {
        let host = EventLoopHost::spawn("timer-loop", LoopMode::Cold).unwrap();
        let (tx, rx) = std_mpsc::channel();
        let start = std::time::Instant::now();
        host.handle
            .schedule_once(StdDuration::from_millis(50), move |_ctx| {
                tx.send(start.elapsed()).unwrap();
            });
        let elapsed = rx.recv_timeout(StdDuration::from_secs(2)).unwrap();
        assert!(elapsed >= StdDuration::from_millis(40));
    }
}
