//! Deterministic test doubles for [`crate::reactor::Reactor`],
//! [`crate::socket::Socket`] and [`crate::connect::Connector`], in the
//! spirit of this crate's teacher's own hand-rolled reactor test harness
//! (`testing/three_stage_reactor.rs`): no `proptest`, just enough control
//! to drive a state machine through its exact transitions from a test
//! body.

use std::{
    any::Any,
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::Rc,
};

use async_trait::async_trait;

use crate::{
    connect::Connector,
    error::PoolError,
    options::{CryptoOptionsMap, PoolOptions},
    reactor::{Reactor, WatcherId},
    socket::{Socket, SocketHandle, SocketId, StreamKind},
};

/// Installs a `tracing_subscriber::fmt` subscriber once per test binary, so
/// `tracing::debug!`/`warn!` events from the crate under test print during
/// `cargo test -- --nocapture` the way the teacher's own test modules rely
/// on a subscriber for diagnosis. Dev-only: `tracing-subscriber` is not a
/// runtime dependency of this crate.
#[cfg(test)]
pub fn init_test_logging() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

struct IoWatcher {
    enabled: bool,
    callback: Box<dyn FnMut()>,
}

struct TimerWatcher {
    enabled: bool,
    callback: Option<Box<dyn FnOnce()>>,
}

/// A [`Reactor`] whose watchers and timers only fire when the test calls
/// [`MockReactor::fire_readable`]/[`MockReactor::fire_timer`] explicitly.
/// Unlike [`crate::reactor::TokioReactor`] nothing here is actually
/// scheduled on a runtime, so a test controls ordering exactly.
#[derive(Default)]
pub struct MockReactor {
    next_id: std::cell::Cell<WatcherId>,
    io: RefCell<HashMap<WatcherId, IoWatcher>>,
    timers: RefCell<HashMap<WatcherId, TimerWatcher>>,
}

impl MockReactor {
    pub fn new() -> Rc<Self> {
        Rc::new(MockReactor::default())
    }

    fn next(&self) -> WatcherId {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        id
    }

    /// Invokes the readability callback for `id`, if it is registered and
    /// enabled. A no-op for an unknown, disabled, or cancelled watcher.
    pub fn fire_readable(&self, id: WatcherId) {
        let mut io = self.io.borrow_mut();
        if let Some(watcher) = io.get_mut(&id) {
            if watcher.enabled {
                (watcher.callback)();
            }
        }
    }

    /// Fires the one-shot timer for `id`, consuming it. A no-op for an
    /// unknown, disabled, or already-fired/cancelled timer.
    pub fn fire_timer(&self, id: WatcherId) {
        let callback = {
            let mut timers = self.timers.borrow_mut();
            match timers.get_mut(&id) {
                Some(watcher) if watcher.enabled => watcher.callback.take(),
                _ => None,
            }
        };
        if let Some(callback) = callback {
            callback();
        }
        self.timers.borrow_mut().remove(&id);
    }

    pub fn has_io_watcher(&self, id: WatcherId) -> bool {
        self.io.borrow().contains_key(&id)
    }

    pub fn has_timer(&self, id: WatcherId) -> bool {
        self.timers.borrow().contains_key(&id)
    }
}

impl Reactor for MockReactor {
    fn on_readable(&self, _socket: crate::socket::SocketHandle, callback: Box<dyn FnMut()>) -> WatcherId {
        let id = self.next();
        self.io.borrow_mut().insert(
            id,
            IoWatcher {
                enabled: true,
                callback,
            },
        );
        id
    }

    fn once(&self, _delay_ms: u64, callback: Box<dyn FnOnce()>) -> WatcherId {
        let id = self.next();
        self.timers.borrow_mut().insert(
            id,
            TimerWatcher {
                enabled: true,
                callback: Some(callback),
            },
        );
        id
    }

    fn disable(&self, id: WatcherId) {
        if let Some(w) = self.io.borrow_mut().get_mut(&id) {
            w.enabled = false;
        }
        if let Some(w) = self.timers.borrow_mut().get_mut(&id) {
            w.enabled = false;
        }
    }

    fn enable(&self, id: WatcherId) {
        if let Some(w) = self.io.borrow_mut().get_mut(&id) {
            w.enabled = true;
        }
        if let Some(w) = self.timers.borrow_mut().get_mut(&id) {
            w.enabled = true;
        }
    }

    fn cancel(&self, id: WatcherId) {
        self.io.borrow_mut().remove(&id);
        self.timers.borrow_mut().remove(&id);
    }
}

/// A [`Socket`] whose liveness, stream kind, and bind address are set
/// directly by a test rather than backed by a real stream.
pub struct MockSocket {
    id: SocketId,
    dead: std::cell::Cell<bool>,
    kind: StreamKind,
    bindto: RefCell<String>,
    options: RefCell<Option<CryptoOptionsMap>>,
}

impl MockSocket {
    pub fn new(id: SocketId) -> Rc<Self> {
        Rc::new(MockSocket {
            id,
            dead: std::cell::Cell::new(false),
            kind: StreamKind::Tcp,
            bindto: RefCell::new(String::new()),
            options: RefCell::new(None),
        })
    }

    pub fn with_bindto(id: SocketId, bindto: &str) -> Rc<Self> {
        let socket = MockSocket::new(id);
        *socket.bindto.borrow_mut() = bindto.to_string();
        socket
    }

    pub fn with_kind(id: SocketId, kind: StreamKind) -> Rc<Self> {
        Rc::new(MockSocket {
            id,
            dead: std::cell::Cell::new(false),
            kind,
            bindto: RefCell::new(String::new()),
            options: RefCell::new(None),
        })
    }

    pub fn mark_dead(&self) {
        self.dead.set(true);
    }
}

#[async_trait(?Send)]
impl Socket for MockSocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn is_dead(&self) -> bool {
        self.dead.get()
    }

    fn stream_kind(&self) -> StreamKind {
        self.kind
    }

    fn bindto(&self) -> String {
        self.bindto.borrow().clone()
    }

    fn context_options(&self) -> Option<CryptoOptionsMap> {
        self.options.borrow().clone()
    }

    fn set_context_options(&self, options: Option<CryptoOptionsMap>) {
        *self.options.borrow_mut() = options;
    }

    async fn readable(&self) -> std::io::Result<()> {
        std::future::pending().await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A [`Connector`] that hands out fresh [`MockSocket`]s without touching the
/// network, optionally forced to fail, counting how many times it was asked
/// to connect (used to assert a pool reused a slot instead of reconnecting).
#[derive(Default)]
pub struct MockConnector {
    next_id: Cell<SocketId>,
    calls: Cell<u64>,
    fail: Cell<bool>,
}

impl MockConnector {
    pub fn new() -> Rc<Self> {
        Rc::new(MockConnector::default())
    }

    pub fn calls(&self) -> u64 {
        self.calls.get()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.set(fail);
    }
}

#[async_trait(?Send)]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _uri: &str,
        _options: &PoolOptions,
    ) -> Result<SocketHandle, PoolError> {
        self.calls.set(self.calls.get() + 1);
        if self.fail.get() {
            return Err(PoolError::Connect(anyhow::anyhow!("mock connect failure")));
        }
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        Ok(MockSocket::new(id))
    }
}
