//! The external `rawConnect` primitive (spec.md §6), and a default
//! `tokio`-backed implementation.
//!
//! spec.md explicitly treats `rawConnect` as opaque beyond its contract —
//! establish a TCP (or Unix-domain) connection honoring `bindto` and
//! `connect_timeout`. DNS resolution itself is a Non-goal of the crate as a
//! whole, but *some* resolver has to back the default connector for it to
//! be runnable, the same boundary `casper-node`'s `connect_outgoing` draws
//! around `TcpStream::connect` (`components/small_network/tasks.rs`).

use std::time::Duration;

use async_trait::async_trait;

use crate::{
    error::PoolError,
    options::PoolOptions,
    socket::{SocketHandle, TcpSocket, UnixSocket},
};

/// Establishes a fresh connection for `uri`, honoring `options.bindto` and
/// `options.connect_timeout_ms`.
#[async_trait(?Send)]
pub trait Connector {
    async fn connect(
        &self,
        uri: &str,
        options: &PoolOptions,
    ) -> Result<SocketHandle, PoolError>;
}

/// Default `Connector`: plain TCP for `host:port` authorities, Unix-domain
/// for `unix://path` authorities.
#[derive(Debug, Default)]
pub struct TcpConnector;

#[async_trait(?Send)]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        uri: &str,
        options: &PoolOptions,
    ) -> Result<SocketHandle, PoolError> {
        let timeout = Duration::from_millis(options.connect_timeout_ms);
        let fut = async {
            if let Some(path) = uri.strip_prefix("unix://") {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(anyhow::Error::from)?;
                Ok(UnixSocket::new(stream) as SocketHandle)
            } else {
                let addr = tokio::net::lookup_host(uri)
                    .await
                    .map_err(anyhow::Error::from)?
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("no addresses found for {uri}"))?;

                let socket = if addr.is_ipv4() {
                    tokio::net::TcpSocket::new_v4()
                } else {
                    tokio::net::TcpSocket::new_v6()
                }
                .map_err(anyhow::Error::from)?;

                if !options.bindto.is_empty() {
                    let bind_addr: std::net::SocketAddr = format!("{}:0", options.bindto)
                        .parse()
                        .map_err(|e| anyhow::anyhow!("invalid bindto {}: {e}", options.bindto))?;
                    socket.bind(bind_addr).map_err(anyhow::Error::from)?;
                }

                let stream = socket.connect(addr).await.map_err(anyhow::Error::from)?;
                Ok(TcpSocket::new(stream, options.bindto.clone()) as SocketHandle)
            }
        };

        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result.map_err(PoolError::Connect),
            Err(_) => Err(PoolError::Connect(anyhow::anyhow!(
                "connect to {uri} timed out after {}ms",
                options.connect_timeout_ms
            ))),
        }
    }
}
