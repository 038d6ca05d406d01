//! Non-blocking client-side network primitives: a TLS handshake
//! controller and a per-authority socket pool, coordinated through a
//! single-threaded cooperative reactor.
//!
//! The two subsystems are independent and may be used on their own:
//!
//! - [`crypto::Encryptor`] drives a non-blocking TLS handshake (or
//!   graceful shutdown) to completion over an already-connected socket.
//! - [`pool::SocketPool`] reuses idle connections keyed by remote
//!   authority, limiting concurrency and evicting dead/idle sockets.
//!
//! [`client::Client`] is a thin façade combining both for the common case
//! of "get me an encrypted connection to this authority".

pub mod client;
pub mod connect;
pub mod crypto;
pub mod deferred;
pub mod error;
pub mod options;
pub mod pool;
pub mod reactor;
pub mod socket;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use client::Client;
pub use error::{CryptoError, PoolError};
