//! Error kinds for the crypto and pool subsystems.
//!
//! Both subsystems report failures as concrete, matchable enums rather than
//! an opaque `anyhow::Error` — callers need to distinguish e.g.
//! `CryptoBusy` (retry makes no sense) from `CryptoTimeout` (retry might).

use thiserror::Error;

/// Failure kinds produced by [`crate::crypto::Encryptor`] operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// A handshake is already in flight for this socket (invariant E-1).
    #[error("a crypto operation is already in progress for this socket")]
    CryptoBusy,

    /// The socket's stream type cannot be upgraded to TLS.
    #[error("socket does not support upgrade to TLS")]
    InvalidStream,

    /// The transport reported a fatal handshake error.
    #[error("TLS handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    /// The handshake deadline elapsed before completion.
    #[error("handshake timed out")]
    CryptoTimeout,

    /// A disable→enable renegotiation sequence failed.
    #[error("renegotiation failed")]
    RenegotiationFailed(#[source] Box<CryptoError>),

    /// An option key in the crypto options mapping is not recognized.
    #[error("unrecognized crypto option: {0}")]
    UnknownOption(String),

    /// Manual peer verification (fingerprint or name) failed.
    #[error("peer verification failed: {0}")]
    VerificationFailed(String),

    /// The `Encryptor` (or its owning `Client`) was dropped while this
    /// operation's `Promise` was still outstanding.
    #[error("crypto operation was cancelled before it settled")]
    Cancelled,
}

/// Failure kinds produced by [`crate::pool::SocketPool`] operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// `checkin`/`clear` was given a socket identity the pool never issued.
    #[error("socket is not known to this pool")]
    UnknownSocket,

    /// An option key in the pool options mapping is not recognized.
    #[error("unrecognized pool option: {0}")]
    UnknownOption(String),

    /// The external `rawConnect` primitive failed.
    #[error("connect failed")]
    Connect(#[source] anyhow::Error),

    /// The `SocketPool` (or its owning `Client`) was dropped while this
    /// checkout's `Promise` was still queued or in flight.
    #[error("pool operation was cancelled before it settled")]
    Cancelled,
}

impl crate::deferred::Cancellable for CryptoError {
    fn cancelled() -> Self {
        CryptoError::Cancelled
    }
}

impl crate::deferred::Cancellable for PoolError {
    fn cancelled() -> Self {
        PoolError::Cancelled
    }
}
