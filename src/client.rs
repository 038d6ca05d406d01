//! Public façade tying the [`crate::crypto::Encryptor`] and
//! [`crate::pool::SocketPool`] together (spec.md §2's `SPEC_FULL`
//! supplemented surface — neither subsystem's own crate module needs a
//! caller-facing combinator, but a single entry point is what callers
//! actually reach for).

use std::{collections::HashMap, rc::Rc};

use crate::{
    connect::{Connector, TcpConnector},
    crypto::{Encryptor, PeerVerifier},
    deferred::Promise,
    error::{CryptoError, PoolError},
    options::{CryptoOptionsMap, OptionValue, PoolOptions},
    pool::SocketPool,
    reactor::{Reactor, TokioReactor},
    socket::SocketHandle,
};

/// Establishes and pools encrypted outgoing connections: `checkout` (and
/// optionally `encrypt`) a socket for an authority, `checkin` it when
/// done.
pub struct Client<R: Reactor = TokioReactor, C: Connector = TcpConnector> {
    pool: Rc<SocketPool<R, C>>,
    encryptor: Rc<Encryptor<R>>,
}

impl Client<TokioReactor, TcpConnector> {
    /// Builds a client over the default `tokio`-backed reactor and
    /// connector. Must be called from within a `tokio::task::LocalSet`.
    pub fn new(ca_file: impl Into<String>, verifier: PeerVerifier) -> Self {
        let reactor = TokioReactor::new();
        let connector = Rc::new(TcpConnector);
        Client::with_parts(reactor, connector, ca_file.into(), verifier, PoolOptions::default())
    }
}

impl<R: Reactor + 'static, C: Connector + 'static> Client<R, C> {
    pub fn with_parts(
        reactor: Rc<R>,
        connector: Rc<C>,
        ca_file: String,
        verifier: PeerVerifier,
        pool_defaults: PoolOptions,
    ) -> Self {
        let encryptor = Rc::new(Encryptor::new(reactor.clone(), ca_file, verifier));
        let pool = Rc::new(SocketPool::new(reactor, connector, pool_defaults));
        Client { pool, encryptor }
    }

    /// Checks out a plaintext socket for `uri`, reusing a pooled
    /// connection when possible.
    pub fn checkout(
        &self,
        uri: &str,
        overrides: &HashMap<String, OptionValue>,
    ) -> Promise<SocketHandle, PoolError> {
        self.pool.checkout(uri, overrides)
    }

    /// Returns a socket to the pool for reuse.
    pub fn checkin(
        &self,
        socket: &SocketHandle,
        overrides: &HashMap<String, OptionValue>,
    ) -> Result<(), PoolError> {
        self.pool.checkin(socket, overrides)
    }

    /// Unconditionally evicts a socket from the pool.
    pub fn clear(&self, socket: &SocketHandle) -> Result<(), PoolError> {
        self.pool.clear(socket)
    }

    /// Upgrades a checked-out socket to TLS.
    pub fn encrypt(
        &self,
        socket: SocketHandle,
        options: CryptoOptionsMap,
    ) -> Promise<SocketHandle, CryptoError> {
        self.encryptor.enable(socket, options)
    }

    /// Tears down TLS on a socket, leaving the underlying transport open.
    pub fn decrypt(&self, socket: SocketHandle) -> Promise<SocketHandle, CryptoError> {
        self.encryptor.disable(socket)
    }
}
