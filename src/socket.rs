//! The `Socket` abstraction.
//!
//! spec.md treats the socket handle as opaque and externally owned; this
//! module gives it just enough shape for the Encryptor and SocketPool to
//! operate on: a stable identity, a liveness check, a stream-kind tag, and
//! the free-form context-options mapping the TLS layer reads/writes.

use std::{
    any::Any,
    cell::RefCell,
    mem::ManuallyDrop,
    os::unix::io::{AsRawFd, FromRawFd},
    rc::{Rc, Weak},
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;

use crate::options::CryptoOptionsMap;

/// Classifies the result of a non-destructive peek the way both socket
/// adapters below need: a zero-length peek means the peer sent a FIN,
/// `WouldBlock` means alive but quiet, anything else is treated as dead.
fn classify_peek(result: std::io::Result<usize>) -> bool {
    match result {
        Ok(0) => true,
        Ok(_) => false,
        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
        Err(_) => true,
    }
}

/// Stable identity of a socket, used as a map key for its entire lifetime.
///
/// Mirrors the source runtime's stream-id coercion (DESIGN NOTES, spec.md
/// §9): any monotonically-assigned integer handle works, we just need it to
/// never repeat while the socket is live.
pub type SocketId = u64;

fn next_socket_id() -> SocketId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Stream kinds a socket can report. Only `Tcp` and `Unix` support upgrade
/// to TLS; anything else fails `Encryptor::enable` with `InvalidStream`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Tcp,
    Unix,
    /// A stream type that cannot be upgraded to TLS (e.g. a pipe).
    Other,
}

impl StreamKind {
    pub fn supports_tls(self) -> bool {
        matches!(self, StreamKind::Tcp | StreamKind::Unix)
    }
}

/// A non-blocking socket handle, shared by reference between the pool and
/// the encryptor for the socket's lifetime.
///
/// `readable` is the one async method: it is what `TokioReactor::on_readable`
/// awaits to turn raw OS readiness into the watcher-fires-callback contract
/// of spec.md §6. `?Send` because the rest of this crate is built on `Rc`
/// per the single-threaded cooperative model of spec.md §5.
#[async_trait(?Send)]
pub trait Socket {
    /// Stable identity, used as the map key in both subsystems.
    fn id(&self) -> SocketId;

    /// Whether the peer has closed the connection or the local side has
    /// otherwise gone bad (not a transient `WouldBlock`).
    fn is_dead(&self) -> bool;

    /// The stream type, used to gate TLS upgrade eligibility.
    fn stream_kind(&self) -> StreamKind;

    /// The local bind address this socket was connected from, or `""` if
    /// unspecified. Used by the pool's reuse scan (spec.md §4.2).
    fn bindto(&self) -> String;

    /// Current TLS/context options installed on this socket, if any.
    fn context_options(&self) -> Option<CryptoOptionsMap>;

    /// Installs new context options (called by `Encryptor::enable`/`disable`).
    fn set_context_options(&self, options: Option<CryptoOptionsMap>);

    /// Resolves once the socket is readable (or errors out).
    async fn readable(&self) -> std::io::Result<()>;

    /// Exposes the concrete socket type so `crate::crypto::io` can recover
    /// an owned `Rc<TcpSocket>`/`Rc<UnixSocket>` to drive the raw,
    /// non-blocking `openssl` handshake (which needs ownership of the I/O
    /// object, not just a borrow).
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle type both subsystems pass around.
///
/// Per spec.md §5 ("single-threaded cooperative"), this crate's core state
/// machines are not `Send`; a single `Rc` handle per socket is sufficient
/// and avoids the `Arc<Mutex<_>>` overhead an actor model doesn't need.
pub type SocketHandle = Rc<dyn Socket>;

/// In-memory bookkeeping shared by the concrete socket adapters below.
#[derive(Default)]
pub(crate) struct SocketState {
    pub(crate) options: RefCell<Option<CryptoOptionsMap>>,
    pub(crate) bindto: RefCell<String>,
}

impl SocketState {
    pub(crate) fn new(bindto: String) -> Self {
        SocketState {
            options: RefCell::new(None),
            bindto: RefCell::new(bindto),
        }
    }
}

/// A [`Socket`] backed by a non-blocking `tokio::net::TcpStream`.
pub struct TcpSocket {
    id: SocketId,
    pub(crate) stream: RefCell<tokio::net::TcpStream>,
    state: SocketState,
    self_ref: RefCell<Weak<TcpSocket>>,
}

impl TcpSocket {
    pub fn new(stream: tokio::net::TcpStream, bindto: String) -> Rc<Self> {
        let rc = Rc::new(TcpSocket {
            id: next_socket_id(),
            stream: RefCell::new(stream),
            state: SocketState::new(bindto),
            self_ref: RefCell::new(Weak::new()),
        });
        *rc.self_ref.borrow_mut() = Rc::downgrade(&rc);
        rc
    }

    /// Recovers an owned `Rc` to this socket from a plain `&self` borrow.
    pub(crate) fn self_rc(&self) -> Rc<TcpSocket> {
        self.self_ref
            .borrow()
            .upgrade()
            .expect("TcpSocket dropped while a borrow was outstanding")
    }
}

#[async_trait(?Send)]
impl Socket for TcpSocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn is_dead(&self) -> bool {
        // Non-blocking peek on the underlying std socket: unlike `try_read`
        // this never consumes the peeked byte, so a peer that starts
        // sending on a reused or idling connection still has its opening
        // bytes there for whoever reads next.
        let stream = self.stream.borrow();
        let raw = ManuallyDrop::new(unsafe { std::net::TcpStream::from_raw_fd(stream.as_raw_fd()) });
        let mut buf = [0u8; 1];
        classify_peek(raw.peek(&mut buf))
    }

    fn stream_kind(&self) -> StreamKind {
        StreamKind::Tcp
    }

    fn bindto(&self) -> String {
        self.state.bindto.borrow().clone()
    }

    fn context_options(&self) -> Option<CryptoOptionsMap> {
        self.state.options.borrow().clone()
    }

    fn set_context_options(&self, options: Option<CryptoOptionsMap>) {
        *self.state.options.borrow_mut() = options;
    }

    async fn readable(&self) -> std::io::Result<()> {
        let guard = self.stream.borrow();
        guard.readable().await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A [`Socket`] backed by a non-blocking `tokio::net::UnixStream`.
pub struct UnixSocket {
    id: SocketId,
    pub(crate) stream: RefCell<tokio::net::UnixStream>,
    state: SocketState,
    self_ref: RefCell<Weak<UnixSocket>>,
}

impl UnixSocket {
    pub fn new(stream: tokio::net::UnixStream) -> Rc<Self> {
        let rc = Rc::new(UnixSocket {
            id: next_socket_id(),
            stream: RefCell::new(stream),
            state: SocketState::new(String::new()),
            self_ref: RefCell::new(Weak::new()),
        });
        *rc.self_ref.borrow_mut() = Rc::downgrade(&rc);
        rc
    }

    /// Recovers an owned `Rc` to this socket from a plain `&self` borrow.
    pub(crate) fn self_rc(&self) -> Rc<UnixSocket> {
        self.self_ref
            .borrow()
            .upgrade()
            .expect("UnixSocket dropped while a borrow was outstanding")
    }
}

#[async_trait(?Send)]
impl Socket for UnixSocket {
    fn id(&self) -> SocketId {
        self.id
    }

    fn is_dead(&self) -> bool {
        // `tokio::net::UnixStream` has no `peek` of its own; recover the
        // underlying `std::os::unix::net::UnixStream` (which does) via its
        // raw fd, the same trick the teacher's transport adapters use to
        // borrow an owned I/O object out of a `RefCell`-wrapped tokio type.
        let stream = self.stream.borrow();
        let raw = ManuallyDrop::new(unsafe {
            std::os::unix::net::UnixStream::from_raw_fd(stream.as_raw_fd())
        });
        let mut buf = [0u8; 1];
        classify_peek(raw.peek(&mut buf))
    }

    fn stream_kind(&self) -> StreamKind {
        StreamKind::Unix
    }

    fn bindto(&self) -> String {
        String::new()
    }

    fn context_options(&self) -> Option<CryptoOptionsMap> {
        self.state.options.borrow().clone()
    }

    fn set_context_options(&self, options: Option<CryptoOptionsMap>) {
        *self.state.options.borrow_mut() = options;
    }

    async fn readable(&self) -> std::io::Result<()> {
        let guard = self.stream.borrow();
        guard.readable().await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
