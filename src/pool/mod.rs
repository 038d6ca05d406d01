//! Per-Authority Socket Pool (spec.md §4.2).
//!
//! Reuses idle sockets per authority, enforces per-authority concurrency
//! limits, queues overflow waiters, and evicts dead or idle sockets.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    rc::Rc,
};

use tracing::debug;

use crate::{
    connect::Connector,
    deferred::{deferred, Deferred, Promise},
    error::PoolError,
    options::{canonicalize_authority, OptionValue, PoolOptions},
    reactor::{Reactor, WatcherId},
    socket::{SocketHandle, SocketId},
};

/// One pooled connection (spec.md §3).
///
/// Invariant P-3: `idle_timer` is armed iff `available == true` and the
/// slot is not mid-handout.
struct PoolSlot {
    id: SocketId,
    uri: String,
    resource: SocketHandle,
    available: Cell<bool>,
    idle_timer: Cell<Option<WatcherId>>,
    idle_timeout_ms: Cell<i64>,
}

/// A waiter blocked on per-authority capacity (spec.md §3 `queue[uri]`).
struct Waiter {
    deferred: RefCell<Option<Deferred<SocketHandle, PoolError>>>,
    options: PoolOptions,
}

/// Connection reuse layer. Depends on a [`Reactor`] for idle timers and a
/// [`Connector`] for the external `rawConnect` primitive (spec.md §2).
pub struct SocketPool<R: Reactor, C: Connector> {
    reactor: Rc<R>,
    connector: Rc<C>,
    defaults: PoolOptions,
    slots: RefCell<HashMap<String, Vec<Rc<PoolSlot>>>>,
    id_to_uri: RefCell<HashMap<SocketId, String>>,
    pending: RefCell<HashMap<String, u64>>,
    queue: RefCell<HashMap<String, VecDeque<Rc<Waiter>>>>,
}

impl<R: Reactor + 'static, C: Connector + 'static> SocketPool<R, C> {
    pub fn new(reactor: Rc<R>, connector: Rc<C>, defaults: PoolOptions) -> Self {
        SocketPool {
            reactor,
            connector,
            defaults,
            slots: RefCell::new(HashMap::new()),
            id_to_uri: RefCell::new(HashMap::new()),
            pending: RefCell::new(HashMap::new()),
            queue: RefCell::new(HashMap::new()),
        }
    }

    /// spec.md §4.2 `checkout(uri, options) → Promise<socket>`.
    pub fn checkout(
        self: &Rc<Self>,
        uri: &str,
        overrides: &HashMap<String, OptionValue>,
    ) -> Promise<SocketHandle, PoolError> {
        let uri = canonicalize_authority(uri);
        let options = match self.defaults.merge_overrides(overrides) {
            Ok(options) => options,
            Err(e) => return failed_promise(e),
        };
        self.checkout_with(uri, options)
    }

    fn checkout_with(
        self: &Rc<Self>,
        uri: String,
        options: PoolOptions,
    ) -> Promise<SocketHandle, PoolError> {
        let (scan_result, needs_rebind) = self.reuse_scan(&uri, &options.bindto);

        if let Some(slot) = scan_result {
            return ready_promise(slot.resource.clone());
        }

        if self.capacity_allows(&uri, options.host_connection_limit, needs_rebind) {
            self.begin_connect(uri, options)
        } else {
            let (inner, promise) = deferred();
            let waiter = Rc::new(Waiter {
                deferred: RefCell::new(Some(inner)),
                options,
            });
            self.queue
                .borrow_mut()
                .entry(uri)
                .or_default()
                .push_back(waiter);
            promise
        }
    }

    /// Reuse scan over `slots[uri]` in insertion order (spec.md §4.2 step
    /// 3). Removes dead slots encountered along the way. Returns the
    /// selected slot, if any, and whether a live-but-mismatched `bindto`
    /// was seen (the `needs_rebind` latch, modeled per DESIGN NOTES as a
    /// local return value rather than an instance field).
    fn reuse_scan(&self, uri: &str, bindto: &str) -> (Option<Rc<PoolSlot>>, bool) {
        let mut needs_rebind = false;
        let mut dead_ids = Vec::new();
        let mut selected = None;

        {
            let slots = self.slots.borrow();
            if let Some(list) = slots.get(uri) {
                for slot in list {
                    if !slot.available.get() {
                        continue;
                    }
                    if slot.resource.is_dead() {
                        debug!(socket_id = slot.id, %uri, "dropping dead slot during reuse scan");
                        dead_ids.push(slot.id);
                        continue;
                    }

                    let slot_bindto = slot.resource.bindto();
                    let matches = if !slot_bindto.is_empty() {
                        if slot_bindto == bindto {
                            true
                        } else {
                            needs_rebind = true;
                            false
                        }
                    } else {
                        true
                    };

                    if matches {
                        selected = Some(slot.clone());
                        break;
                    }
                }
            }
        }

        for id in dead_ids {
            self.remove_slot(uri, id);
        }

        if let Some(slot) = &selected {
            slot.available.set(false);
            if let Some(timer) = slot.idle_timer.get() {
                self.reactor.disable(timer);
            }
        }

        (selected, needs_rebind)
    }

    /// spec.md §4.2 capacity check.
    fn capacity_allows(&self, uri: &str, host_connection_limit: i64, needs_rebind: bool) -> bool {
        if host_connection_limit <= 0 || needs_rebind {
            return true;
        }
        let in_slots = self
            .slots
            .borrow()
            .get(uri)
            .map(|v| v.len())
            .unwrap_or(0) as i64;
        let pending = *self.pending.borrow().get(uri).unwrap_or(&0) as i64;
        in_slots + pending < host_connection_limit
    }

    fn begin_connect(
        self: &Rc<Self>,
        uri: String,
        options: PoolOptions,
    ) -> Promise<SocketHandle, PoolError> {
        *self.pending.borrow_mut().entry(uri.clone()).or_insert(0) += 1;

        let (mut outer, outer_promise) = deferred();
        let this = self.clone();
        let connector = self.connector.clone();

        tokio::task::spawn_local(async move {
            let result = connector.connect(&uri, &options).await;
            this.finish_connect(&uri, result, &mut outer, options.idle_timeout_ms);
        });

        outer_promise
    }

    fn finish_connect(
        self: &Rc<Self>,
        uri: &str,
        result: Result<SocketHandle, PoolError>,
        outer: &mut Deferred<SocketHandle, PoolError>,
        idle_timeout_ms: i64,
    ) {
        {
            let mut pending = self.pending.borrow_mut();
            if let Some(count) = pending.get_mut(uri) {
                *count -= 1;
                if *count == 0 {
                    pending.remove(uri);
                }
            }
        }

        match result {
            Ok(socket) => {
                let slot = Rc::new(PoolSlot {
                    id: socket.id(),
                    uri: uri.to_string(),
                    resource: socket.clone(),
                    available: Cell::new(false),
                    idle_timer: Cell::new(None),
                    idle_timeout_ms: Cell::new(idle_timeout_ms),
                });
                self.id_to_uri
                    .borrow_mut()
                    .insert(slot.id, uri.to_string());
                self.slots
                    .borrow_mut()
                    .entry(uri.to_string())
                    .or_default()
                    .push(slot);
                outer.resolve(socket);
            }
            Err(e) => outer.fail(e),
        }
    }

    /// spec.md §4.2 `checkin(socket)`. `idle_timeout_ms` is re-captured
    /// from `overrides` at this call (spec.md §3: "captured at
    /// checkin-time from the per-request options"), so a caller can widen
    /// or shorten a slot's idle budget on each return to the pool.
    pub fn checkin(
        self: &Rc<Self>,
        socket: &SocketHandle,
        overrides: &HashMap<String, OptionValue>,
    ) -> Result<(), PoolError> {
        let id = socket.id();
        let uri = self
            .id_to_uri
            .borrow()
            .get(&id)
            .cloned()
            .ok_or(PoolError::UnknownSocket)?;

        if socket.is_dead() {
            self.evict(&uri, id);
            self.dispatch_queue(&uri);
            return Ok(());
        }

        let slot = self.find_slot(&uri, id);
        let Some(slot) = slot else {
            return Err(PoolError::UnknownSocket);
        };

        let options = self.defaults.merge_overrides(overrides)?;
        slot.idle_timeout_ms.set(options.idle_timeout_ms);
        slot.available.set(true);

        if self.dispatch_queue(&uri) {
            return Ok(());
        }

        let idle_timeout_ms = slot.idle_timeout_ms.get();
        if idle_timeout_ms > 0 {
            self.arm_idle_timer(&slot, &uri, idle_timeout_ms);
        }

        Ok(())
    }

    /// spec.md §4.2 `clear(socket)`: unconditional eviction.
    pub fn clear(self: &Rc<Self>, socket: &SocketHandle) -> Result<(), PoolError> {
        let id = socket.id();
        let uri = self
            .id_to_uri
            .borrow()
            .get(&id)
            .cloned()
            .ok_or(PoolError::UnknownSocket)?;
        self.evict(&uri, id);
        self.dispatch_queue(&uri);
        Ok(())
    }

    fn find_slot(&self, uri: &str, id: SocketId) -> Option<Rc<PoolSlot>> {
        self.slots
            .borrow()
            .get(uri)
            .and_then(|list| list.iter().find(|s| s.id == id).cloned())
    }

    fn arm_idle_timer(self: &Rc<Self>, slot: &Rc<PoolSlot>, uri: &str, idle_timeout_ms: i64) {
        if let Some(existing) = slot.idle_timer.get() {
            self.reactor.enable(existing);
            return;
        }

        let this = self.clone();
        let uri = uri.to_string();
        let id = slot.id;
        let watcher = self.reactor.once(
            idle_timeout_ms.max(0) as u64,
            Box::new(move || {
                debug!(socket_id = id, %uri, "idle timer expired, evicting slot");
                this.evict(&uri, id);
                this.dispatch_queue(&uri);
            }),
        );
        slot.idle_timer.set(Some(watcher));
    }

    /// Removes a slot (by id) from `slots[uri]` and `id_to_uri`, cancelling
    /// its idle timer if any. Used by both dead-socket removal during the
    /// reuse scan and by `checkin`/`clear` eviction.
    fn evict(&self, uri: &str, id: SocketId) {
        if let Some(slot) = self.remove_slot(uri, id) {
            if let Some(timer) = slot.idle_timer.get() {
                self.reactor.cancel(timer);
            }
        }
    }

    fn remove_slot(&self, uri: &str, id: SocketId) -> Option<Rc<PoolSlot>> {
        self.id_to_uri.borrow_mut().remove(&id);
        let mut slots = self.slots.borrow_mut();
        let list = slots.get_mut(uri)?;
        let pos = list.iter().position(|s| s.id == id)?;
        let slot = list.remove(pos);
        if list.is_empty() {
            slots.remove(uri);
        }
        Some(slot)
    }

    /// Dispatches the head waiter for `uri`, if any (spec.md §4.2
    /// "Dispatch of queued waiters"). Returns `true` if a waiter consumed
    /// the just-freed capacity.
    ///
    /// DESIGN NOTES (spec.md §9): dead-slot removal during iteration is
    /// avoided here by snapshotting the head waiter out of the deque
    /// before recursing into `checkout_with`, rather than mutating the
    /// deque while a borrow over it is outstanding.
    fn dispatch_queue(self: &Rc<Self>, uri: &str) -> bool {
        let head = {
            let queue = self.queue.borrow();
            match queue.get(uri).and_then(|q| q.front()) {
                Some(waiter) => waiter.clone(),
                None => return false,
            }
        };

        let bindto = head.options.bindto.clone();
        let (scan_result, needs_rebind) = self.reuse_scan(uri, &bindto);

        if let Some(slot) = scan_result {
            self.pop_waiter(uri);
            if let Some(mut d) = head.deferred.borrow_mut().take() {
                d.resolve(slot.resource.clone());
            }
            return true;
        }

        if self.capacity_allows(uri, head.options.host_connection_limit, needs_rebind) {
            self.pop_waiter(uri);
            *self.pending.borrow_mut().entry(uri.to_string()).or_insert(0) += 1;

            let waiter_deferred = head.deferred.borrow_mut().take();
            let connector = self.connector.clone();
            let this = self.clone();
            let uri_owned = uri.to_string();
            let options = head.options.clone();
            tokio::task::spawn_local(async move {
                let result = connector.connect(&uri_owned, &options).await;
                if let Some(mut d) = waiter_deferred {
                    this.finish_connect(&uri_owned, result, &mut d, options.idle_timeout_ms);
                }
            });
            return true;
        }

        false
    }

    fn pop_waiter(&self, uri: &str) {
        if let Some(q) = self.queue.borrow_mut().get_mut(uri) {
            q.pop_front();
        }
    }
}

fn ready_promise(socket: SocketHandle) -> Promise<SocketHandle, PoolError> {
    let (mut d, p) = deferred();
    d.resolve(socket);
    p
}

fn failed_promise(error: PoolError) -> Promise<SocketHandle, PoolError> {
    let (mut d, p) = deferred();
    d.fail(error);
    p
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::testing::{init_test_logging, MockConnector, MockReactor, MockSocket};

    fn pool(
        host_connection_limit: i64,
        idle_timeout_ms: i64,
    ) -> (Rc<SocketPool<MockReactor, MockConnector>>, Rc<MockReactor>, Rc<MockConnector>) {
        init_test_logging();
        let reactor = MockReactor::new();
        let connector = MockConnector::new();
        let defaults = PoolOptions {
            host_connection_limit,
            idle_timeout_ms,
            connect_timeout_ms: 1_000,
            bindto: String::new(),
        };
        let pool = Rc::new(SocketPool::new(reactor.clone(), connector.clone(), defaults));
        (pool, reactor, connector)
    }

    fn no_overrides() -> HashMap<String, OptionValue> {
        HashMap::new()
    }

    #[tokio::test]
    async fn checkin_makes_a_socket_available_for_the_next_checkout() {
        let (pool, _reactor, connector) = pool(8, 0);
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let first = pool
                    .checkout("Example.com:443", &no_overrides())
                    .await
                    .expect("connect should succeed");
                pool.checkin(&first, &no_overrides()).expect("known socket");

                let second = pool
                    .checkout("example.com:443", &no_overrides())
                    .await
                    .expect("reuse should succeed");

                assert_eq!(first.id(), second.id());
                assert_eq!(connector.calls(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn checkout_queues_past_the_per_authority_limit_and_dispatches_fifo() {
        let (pool, _reactor, connector) = pool(1, 0);
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let first = pool
                    .checkout("a:1", &no_overrides())
                    .await
                    .expect("first connect should succeed");

                // Capacity is already exhausted by `first` (still checked
                // out), so this one must queue rather than connect again.
                let waiting = pool.checkout("a:1", &no_overrides());

                pool.checkin(&first, &no_overrides()).expect("known socket");

                let second = waiting.await.expect("queued waiter should be dispatched");
                assert_eq!(first.id(), second.id());
                assert_eq!(connector.calls(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn checkout_connects_again_when_a_queued_waiter_frees_capacity_by_eviction() {
        let (pool, _reactor, connector) = pool(1, 0);
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let first = pool
                    .checkout("a:1", &no_overrides())
                    .await
                    .expect("first connect should succeed");
                let waiting = pool.checkout("a:1", &no_overrides());

                // Dead, not idle: `clear` evicts unconditionally and lets
                // the waiter's connect attempt proceed instead of reusing.
                pool.clear(&first).expect("known socket");

                let second = waiting.await.expect("queued waiter should connect");
                assert_ne!(first.id(), second.id());
                assert_eq!(connector.calls(), 2);
            })
            .await;
    }

    #[tokio::test]
    async fn checkin_of_a_dead_socket_evicts_without_arming_an_idle_timer() {
        let (pool, _reactor, _connector) = pool(8, 5_000);
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let socket = pool
                    .checkout("a:1", &no_overrides())
                    .await
                    .expect("connect should succeed");
                socket
                    .as_any()
                    .downcast_ref::<MockSocket>()
                    .expect("mock socket")
                    .mark_dead();

                pool.checkin(&socket, &no_overrides()).expect("known socket");

                assert!(pool.slots.borrow().get("a:1").is_none());
                assert!(pool.id_to_uri.borrow().get(&socket.id()).is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn idle_timer_eviction_removes_the_slot_via_the_reactor() {
        let (pool, reactor, _connector) = pool(8, 5_000);
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let socket = pool
                    .checkout("a:1", &no_overrides())
                    .await
                    .expect("connect should succeed");
                pool.checkin(&socket, &no_overrides()).expect("known socket");

                let timer = pool
                    .slots
                    .borrow()
                    .get("a:1")
                    .and_then(|slots| slots.first().cloned())
                    .and_then(|slot| slot.idle_timer.get())
                    .expect("checkin with a positive idle_timeout_ms arms a timer");

                reactor.fire_timer(timer);

                assert!(pool.slots.borrow().get("a:1").is_none());
                assert!(pool.id_to_uri.borrow().get(&socket.id()).is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn checkin_of_an_unknown_socket_fails() {
        let (pool, _reactor, _connector) = pool(8, 0);
        let socket: SocketHandle = MockSocket::new(1);

        let result = pool.checkin(&socket, &no_overrides());

        assert_matches!(result, Err(PoolError::UnknownSocket));
    }

    #[tokio::test]
    async fn authority_is_canonicalized_so_case_only_differences_reuse() {
        let (pool, _reactor, connector) = pool(8, 0);
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let first = pool
                    .checkout("Example.COM:443", &no_overrides())
                    .await
                    .unwrap();
                pool.checkin(&first, &no_overrides()).unwrap();
                let second = pool.checkout("example.com:443", &no_overrides()).await.unwrap();

                assert_eq!(first.id(), second.id());
                assert_eq!(connector.calls(), 1);
            })
            .await;
    }
}
