//! Transport abstractions the registry is built on.
//!
//! Concrete substrates live in [`crate::net`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::address::AddressMap;
use crate::envelope::Envelope;
use crate::Result;

/// A bidirectional envelope connection.
///
/// Implementations close themselves on any send or receive error, and
/// [`close`](Conn::close) interrupts sends and receives in progress on other
/// tasks.
#[async_trait]
pub trait Conn: Send + Sync + 'static {
    /// Send one envelope.
    async fn send(&self, env: Envelope) -> Result<()>;

    /// Receive the next envelope.
    async fn recv(&self) -> Result<Envelope>;

    /// Close the connection. Closing twice may return an error.
    fn close(&self) -> Result<()>;
}

#[async_trait]
impl<C: Conn + ?Sized> Conn for Arc<C> {
    async fn send(&self, env: Envelope) -> Result<()> {
        (**self).send(env).await
    }

    async fn recv(&self) -> Result<Envelope> {
        (**self).recv().await
    }

    fn close(&self) -> Result<()> {
        (**self).close()
    }
}

/// Opens outbound connections to peers.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Connect to the peer with identity `addr`.
    ///
    /// The returned connection is not yet authenticated.
    async fn dial(&self, addr: &AddressMap) -> Result<Box<dyn Conn>>;

    /// Close the dialer, aborting dials in progress.
    fn close(&self) -> Result<()>;
}

/// Accepts inbound connections.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Wait for the next inbound connection.
    async fn accept(&self) -> Result<Box<dyn Conn>>;

    /// Close the listener, aborting a pending accept.
    fn close(&self) -> Result<()>;
}
