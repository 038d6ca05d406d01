//! The reactor contract (spec.md §6) and a `tokio`-backed implementation.
//!
//! spec.md models the reactor as an external collaborator providing
//! readable-socket watchers and one-shot timers, both independently
//! cancellable. The source's `once`/`delay` naming is the same primitive
//! under two names (DESIGN NOTES do not distinguish them); this crate
//! exposes a single `once` timer registration.

use std::{
    cell::Cell,
    collections::HashMap,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use tokio::task::JoinHandle;

use crate::socket::SocketHandle;

/// Identity of a registered watcher (I/O or timer), returned by
/// [`Reactor::on_readable`] / [`Reactor::once`].
pub type WatcherId = u64;

fn next_watcher_id() -> WatcherId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// External event source: readability watchers and one-shot timers.
///
/// Implementations are not required to be `Send`/`Sync` — per spec.md §5
/// all registered callbacks run on a single logical executor.
pub trait Reactor {
    /// Registers a persistent readability watcher on `socket`. The
    /// callback fires every time the socket becomes readable until the
    /// watcher is cancelled.
    fn on_readable(&self, socket: SocketHandle, callback: Box<dyn FnMut()>) -> WatcherId;

    /// Registers a one-shot timer firing after `delay_ms`. No-op to
    /// disable/enable/cancel after it has already fired.
    fn once(&self, delay_ms: u64, callback: Box<dyn FnOnce()>) -> WatcherId;

    /// Pauses a watcher: its callback will not run until `enable`d again.
    /// No-op on an already-disabled or already-fired/cancelled watcher.
    fn disable(&self, id: WatcherId);

    /// Resumes a previously `disable`d watcher.
    fn enable(&self, id: WatcherId);

    /// Cancels a watcher. No-op if it already fired or was cancelled.
    fn cancel(&self, id: WatcherId);
}

struct Watcher {
    enabled: Rc<Cell<bool>>,
    task: JoinHandle<()>,
}

/// A `Reactor` built on `tokio`'s readiness and timer primitives.
///
/// Must be driven inside a `tokio::task::LocalSet` since the registered
/// callbacks are typically `!Send` (they close over `Rc`-shared state, per
/// spec.md §5's single-threaded cooperative model).
#[derive(Default)]
pub struct TokioReactor {
    watchers: std::cell::RefCell<HashMap<WatcherId, Watcher>>,
}

impl TokioReactor {
    pub fn new() -> Rc<Self> {
        Rc::new(TokioReactor::default())
    }
}

impl Reactor for TokioReactor {
    fn on_readable(&self, socket: SocketHandle, mut callback: Box<dyn FnMut()>) -> WatcherId {
        let id = next_watcher_id();
        let enabled = Rc::new(Cell::new(true));
        let enabled_for_task = enabled.clone();
        let task = tokio::task::spawn_local(async move {
            loop {
                // `readable()` resolves on every readiness edge; errors are
                // surfaced to the caller the same way a ready-but-dead
                // socket would be, by letting the next handshake step
                // observe the dead socket.
                let _ = socket.readable().await;
                if enabled_for_task.get() {
                    callback();
                }
            }
        });
        self.watchers
            .borrow_mut()
            .insert(id, Watcher { enabled, task });
        id
    }

    fn once(&self, delay_ms: u64, callback: Box<dyn FnOnce()>) -> WatcherId {
        let id = next_watcher_id();
        let enabled = Rc::new(Cell::new(true));
        let enabled_for_task = enabled.clone();
        let task = tokio::task::spawn_local(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if enabled_for_task.get() {
                callback();
            }
        });
        self.watchers
            .borrow_mut()
            .insert(id, Watcher { enabled, task });
        id
    }

    fn disable(&self, id: WatcherId) {
        if let Some(w) = self.watchers.borrow().get(&id) {
            w.enabled.set(false);
        }
    }

    fn enable(&self, id: WatcherId) {
        if let Some(w) = self.watchers.borrow().get(&id) {
            w.enabled.set(true);
        }
    }

    fn cancel(&self, id: WatcherId) {
        if let Some(w) = self.watchers.borrow_mut().remove(&id) {
            w.task.abort();
        }
    }
}
