//! Non-blocking TLS step driver.
//!
//! spec.md §4.1 describes a three-valued synchronous step result
//! (`Completed` / `Fatal` / `WouldBlock`) rather than an `async`/`await`
//! handshake. `openssl::ssl::Ssl::connect`/`accept` already returns exactly
//! this shape via `HandshakeError::{WouldBlock, Failure}`, provided the
//! underlying `Read`/`Write` impl surfaces `WouldBlock` instead of
//! blocking — which is what `OwnedTcpIo`/`OwnedUnixIo` do by deferring to
//! `tokio`'s `try_read`/`try_write`.

use std::{
    io::{self, Read, Write},
    rc::Rc,
};

use openssl::ssl::{ErrorCode, MidHandshakeSslStream, Ssl, SslStream};

use crate::socket::{Socket, TcpSocket, UnixSocket};

/// Outcome of a single non-blocking handshake (or shutdown) attempt.
/// DESIGN NOTES (spec.md §9): do not conflate `Fatal` and `WouldBlock`.
pub enum StepResult {
    Completed,
    Fatal(io::Error),
    WouldBlock,
}

/// `Read`/`Write` adapter over a pooled `TcpSocket`'s non-blocking stream.
pub(crate) struct OwnedTcpIo(pub(crate) Rc<TcpSocket>);

impl Read for OwnedTcpIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.stream.borrow().try_read(buf)
    }
}

impl Write for OwnedTcpIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.stream.borrow().try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// `Read`/`Write` adapter over a pooled `UnixSocket`'s non-blocking stream.
pub(crate) struct OwnedUnixIo(pub(crate) Rc<UnixSocket>);

impl Read for OwnedUnixIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.stream.borrow().try_read(buf)
    }
}

impl Write for OwnedUnixIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.stream.borrow().try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// In-progress or completed TLS state for one socket, kept by the
/// `Encryptor` in a side-table keyed by `SocketId` (spec.md's
/// `HandshakeRecord.socket` plus whatever the transport needs between
/// `WouldBlock` retries).
pub(crate) enum TlsIo {
    MidTcp(MidHandshakeSslStream<OwnedTcpIo>),
    MidUnix(MidHandshakeSslStream<OwnedUnixIo>),
    DoneTcp(SslStream<OwnedTcpIo>),
    DoneUnix(SslStream<OwnedUnixIo>),
}

impl TlsIo {
    /// Begins a client-side handshake (`enable`) over `socket`.
    pub(crate) fn start_connect(socket: &dyn Socket, ssl: Ssl) -> (StepResult, Option<TlsIo>) {
        if let Some(tcp) = socket.as_any().downcast_ref::<TcpSocket>() {
            match ssl.connect(OwnedTcpIo(tcp.self_rc())) {
                Ok(stream) => (StepResult::Completed, Some(TlsIo::DoneTcp(stream))),
                Err(openssl::ssl::HandshakeError::WouldBlock(mid)) => {
                    (StepResult::WouldBlock, Some(TlsIo::MidTcp(mid)))
                }
                Err(openssl::ssl::HandshakeError::Failure(mid)) => {
                    (StepResult::Fatal(ssl_io_error(&mid.error())), None)
                }
                Err(openssl::ssl::HandshakeError::SetupFailure(e)) => {
                    (StepResult::Fatal(io::Error::new(io::ErrorKind::Other, e)), None)
                }
            }
        } else if let Some(unx) = socket.as_any().downcast_ref::<UnixSocket>() {
            match ssl.connect(OwnedUnixIo(unx.self_rc())) {
                Ok(stream) => (StepResult::Completed, Some(TlsIo::DoneUnix(stream))),
                Err(openssl::ssl::HandshakeError::WouldBlock(mid)) => {
                    (StepResult::WouldBlock, Some(TlsIo::MidUnix(mid)))
                }
                Err(openssl::ssl::HandshakeError::Failure(mid)) => {
                    (StepResult::Fatal(ssl_io_error(&mid.error())), None)
                }
                Err(openssl::ssl::HandshakeError::SetupFailure(e)) => {
                    (StepResult::Fatal(io::Error::new(io::ErrorKind::Other, e)), None)
                }
            }
        } else {
            (
                StepResult::Fatal(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "socket does not support TLS upgrade",
                )),
                None,
            )
        }
    }

    /// Resumes a previously `WouldBlock`ed handshake or shutdown attempt.
    pub(crate) fn resume(self) -> (StepResult, Option<TlsIo>) {
        match self {
            TlsIo::MidTcp(mid) => match mid.handshake() {
                Ok(stream) => (StepResult::Completed, Some(TlsIo::DoneTcp(stream))),
                Err(openssl::ssl::HandshakeError::WouldBlock(mid)) => {
                    (StepResult::WouldBlock, Some(TlsIo::MidTcp(mid)))
                }
                Err(openssl::ssl::HandshakeError::Failure(mid)) => {
                    (StepResult::Fatal(ssl_io_error(&mid.error())), None)
                }
                Err(openssl::ssl::HandshakeError::SetupFailure(e)) => {
                    (StepResult::Fatal(io::Error::new(io::ErrorKind::Other, e)), None)
                }
            },
            TlsIo::MidUnix(mid) => match mid.handshake() {
                Ok(stream) => (StepResult::Completed, Some(TlsIo::DoneUnix(stream))),
                Err(openssl::ssl::HandshakeError::WouldBlock(mid)) => {
                    (StepResult::WouldBlock, Some(TlsIo::MidUnix(mid)))
                }
                Err(openssl::ssl::HandshakeError::Failure(mid)) => {
                    (StepResult::Fatal(ssl_io_error(&mid.error())), None)
                }
                Err(openssl::ssl::HandshakeError::SetupFailure(e)) => {
                    (StepResult::Fatal(io::Error::new(io::ErrorKind::Other, e)), None)
                }
            },
            done => (StepResult::Completed, Some(done)),
        }
    }

    /// Attempts a graceful TLS shutdown (`disable`).
    pub(crate) fn shutdown(&mut self) -> StepResult {
        let result = match self {
            TlsIo::DoneTcp(stream) => stream.shutdown(),
            TlsIo::DoneUnix(stream) => stream.shutdown(),
            _ => return StepResult::Completed,
        };
        match result {
            Ok(_) => StepResult::Completed,
            Err(ref e) if e.code() == ErrorCode::WANT_READ || e.code() == ErrorCode::WANT_WRITE => {
                StepResult::WouldBlock
            }
            Err(e) => StepResult::Fatal(ssl_io_error(&e)),
        }
    }

    pub(crate) fn peer_certificate(&self) -> Option<openssl::x509::X509> {
        match self {
            TlsIo::DoneTcp(s) => s.ssl().peer_certificate(),
            TlsIo::DoneUnix(s) => s.ssl().peer_certificate(),
            _ => None,
        }
    }
}

fn ssl_io_error(e: &openssl::ssl::Error) -> io::Error {
    match e.io_error() {
        Some(io_err) => io::Error::new(io_err.kind(), e.to_string()),
        None => io::Error::new(io::ErrorKind::Other, e.to_string()),
    }
}
