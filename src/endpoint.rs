//! Authenticated connection handle to one peer.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::address::AddressMap;
use crate::conn::Conn;
use crate::consumer::Consumer;
use crate::envelope::Envelope;
use crate::{Error, Result};

/// A live, authenticated connection to a peer.
///
/// Created by the [`EndpointRegistry`](crate::EndpointRegistry) after a
/// successful address exchange. At most one send is in flight at a time.
/// Once closed, an endpoint stays unusable; reconnecting produces a new one.
pub struct Endpoint {
    address: AddressMap,
    conn: Arc<dyn Conn>,
    sending: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl Endpoint {
    pub(crate) fn new(address: AddressMap, conn: Arc<dyn Conn>) -> Self {
        Self {
            address,
            conn,
            sending: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// The peer's identity.
    pub fn address(&self) -> &AddressMap {
        &self.address
    }

    /// Whether the endpoint has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send an envelope to the peer.
    ///
    /// The raw send runs on its own task because the transport cannot be
    /// interrupted mid-envelope. Dropping this future before the send settled,
    /// whether still waiting for the send lock or for the transport, closes
    /// the endpoint instead of leaving it half-sent. Transport errors close
    /// the endpoint as well.
    pub async fn send(&self, env: Envelope) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed("endpoint"));
        }
        let mut abort = CloseOnDrop {
            endpoint: self,
            armed: true,
        };

        let _sending = self.sending.lock().await;
        let conn = Arc::clone(&self.conn);
        let res = match tokio::spawn(async move { conn.send(env).await }).await {
            Ok(res) => res,
            Err(e) => Err(Error::connection(format!("send task failed: {e}"))),
        };
        abort.armed = false;

        if let Err(err) = &res {
            debug!(peer = %self.address, error = %err, "send failed, closing endpoint");
            let _ = self.close();
        }
        res.map_err(|e| e.context("sending envelope"))
    }

    /// Feed every received envelope to `consumer` until the connection fails.
    ///
    /// Closes the endpoint and returns the receive error.
    pub(crate) async fn recv_loop(&self, consumer: Arc<dyn Consumer>) -> Result<()> {
        loop {
            match self.conn.recv().await {
                Ok(env) => {
                    trace!(peer = %self.address, kind = %env.msg().kind(), "received envelope");
                    consumer.put(env).await;
                }
                Err(err) => {
                    let _ = self.close();
                    return Err(err.context("recv loop"));
                }
            }
        }
    }

    /// Close the connection. A second call returns an error.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed("endpoint"));
        }
        self.conn.close()
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct CloseOnDrop<'a> {
    endpoint: &'a Endpoint,
    armed: bool,
}

impl Drop for CloseOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(peer = %self.endpoint.address, "send cancelled, closing endpoint");
            let _ = self.endpoint.close();
        }
    }
}
