//! TCP transport: peers are reached through a directory of host addresses.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::ToSocketAddrs;
use tracing::debug;

use super::IoConn;
use crate::address::{AddressKey, AddressMap};
use crate::conn::{Conn, Dialer, Listener};
use crate::serializer::EnvelopeSerializer;
use crate::sync::Closer;
use crate::{Error, Result};

/// Dials peers over TCP, looking up their host in a registered directory.
pub struct TcpDialer {
    hosts: RwLock<HashMap<AddressKey, String>>,
    serializer: Arc<dyn EnvelopeSerializer>,
    closer: Closer,
}

impl TcpDialer {
    /// A dialer with an empty host directory.
    pub fn new(serializer: impl EnvelopeSerializer) -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
            serializer: Arc::new(serializer),
            closer: Closer::new(),
        }
    }

    /// Route dials for `addr` to `host` (`"ip:port"` or `"name:port"`).
    pub fn register(&self, addr: &AddressMap, host: impl Into<String>) {
        self.hosts.write().insert(addr.key(), host.into());
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &AddressMap) -> Result<Box<dyn Conn>> {
        if self.closer.is_closed() {
            return Err(Error::Closed("dialer"));
        }
        let host = self
            .hosts
            .read()
            .get(&addr.key())
            .cloned()
            .ok_or_else(|| Error::UnknownPeer(addr.clone()))?;

        debug!(peer = %addr, %host, "connecting");
        let stream = tokio::select! {
            _ = self.closer.closed() => return Err(Error::Closed("dialer")),
            res = tokio::net::TcpStream::connect(&host) => res?,
        };
        stream.set_nodelay(true)?;
        Ok(Box::new(IoConn::new(stream, Arc::clone(&self.serializer))))
    }

    fn close(&self) -> Result<()> {
        if self.closer.close() {
            Ok(())
        } else {
            Err(Error::Closed("dialer"))
        }
    }
}

/// Accepts TCP connections.
pub struct TcpListener {
    inner: tokio::net::TcpListener,
    serializer: Arc<dyn EnvelopeSerializer>,
    closer: Closer,
}

impl TcpListener {
    /// Bind to `addr`.
    pub async fn bind(addr: impl ToSocketAddrs, serializer: impl EnvelopeSerializer) -> Result<Self> {
        let inner = tokio::net::TcpListener::bind(addr).await?;
        Ok(Self {
            inner,
            serializer: Arc::new(serializer),
            closer: Closer::new(),
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&self) -> Result<Box<dyn Conn>> {
        if self.closer.is_closed() {
            return Err(Error::Closed("listener"));
        }
        let (stream, remote) = tokio::select! {
            _ = self.closer.closed() => return Err(Error::Closed("listener")),
            res = self.inner.accept() => res?,
        };
        debug!(%remote, "accepted TCP connection");
        stream.set_nodelay(true)?;
        Ok(Box::new(IoConn::new(stream, Arc::clone(&self.serializer))))
    }

    fn close(&self) -> Result<()> {
        if self.closer.close() {
            Ok(())
        } else {
            Err(Error::Closed("listener"))
        }
    }
}
