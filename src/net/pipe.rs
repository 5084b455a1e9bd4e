//! In-memory envelope pipes and a hub wiring dialers to listeners.
//!
//! A pipe send completes only once the other end has taken the envelope off
//! the pipe, so a send that fails or is interrupted by `close` was never
//! delivered. This makes the hub suitable for exact delivery-count tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

use crate::address::{AddressKey, AddressMap};
use crate::conn::{Conn, Dialer, Listener};
use crate::envelope::Envelope;
use crate::sync::Closer;
use crate::{Error, Result};

const HUB_BACKLOG: usize = 16;

struct Packet {
    env: Envelope,
    ack: oneshot::Sender<()>,
}

/// One end of an in-memory pipe.
pub struct PipeConn {
    tx: Mutex<Option<mpsc::Sender<Packet>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
    closer: Closer,
}

/// Create a connected pair of pipe ends.
pub fn pipe() -> (PipeConn, PipeConn) {
    let (tx_a, rx_b) = mpsc::channel(1);
    let (tx_b, rx_a) = mpsc::channel(1);
    (PipeConn::new(tx_a, rx_a), PipeConn::new(tx_b, rx_b))
}

impl PipeConn {
    fn new(tx: mpsc::Sender<Packet>, rx: mpsc::Receiver<Packet>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            closer: Closer::new(),
        }
    }

    /// Whether this end has been closed.
    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }

    // Refuse further packets and drop queued ones, failing their senders.
    fn shut_rx(rx: &mut mpsc::Receiver<Packet>) {
        rx.close();
        while rx.try_recv().is_ok() {}
    }

    fn close_quietly(&self) {
        let _ = self.close();
    }
}

#[async_trait]
impl Conn for PipeConn {
    async fn send(&self, env: Envelope) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or(Error::Closed("connection"))?;
        let (ack, mut acked) = oneshot::channel();

        tokio::select! {
            biased;
            _ = self.closer.closed() => return Err(Error::Closed("connection")),
            res = tx.send(Packet { env, ack }) => {
                if res.is_err() {
                    self.close_quietly();
                    return Err(Error::connection("pipe closed by peer"));
                }
            }
        }
        drop(tx);

        let taken = tokio::select! {
            res = &mut acked => res.is_ok(),
            _ = self.closer.closed() => false,
        };
        if taken {
            return Ok(());
        }
        // Settle a concurrent hand-over: after `close` the peer can no longer
        // acknowledge, so the envelope was delivered iff an ack is waiting.
        acked.close();
        if acked.try_recv().is_ok() {
            return Ok(());
        }
        self.close_quietly();
        Err(Error::connection("envelope not taken by peer"))
    }

    async fn recv(&self) -> Result<Envelope> {
        loop {
            if self.closer.is_closed() {
                Self::shut_rx(&mut *self.rx.lock().await);
                return Err(Error::Closed("connection"));
            }
            let packet = tokio::select! {
                _ = self.closer.closed() => continue,
                packet = async { self.rx.lock().await.recv().await } => packet,
            };
            match packet {
                Some(Packet { env, ack }) => {
                    if ack.send(()).is_ok() {
                        return Ok(env);
                    }
                    trace!("sender abandoned envelope, skipping");
                }
                None => {
                    self.close_quietly();
                    return Err(Error::connection("pipe closed by peer"));
                }
            }
        }
    }

    fn close(&self) -> Result<()> {
        if !self.closer.close() {
            return Err(Error::Closed("connection"));
        }
        self.tx.lock().take();
        if let Ok(mut rx) = self.rx.try_lock() {
            Self::shut_rx(&mut rx);
        }
        Ok(())
    }
}

/// Both ends of a pipe created by a [`HubDialer`].
#[derive(Clone)]
pub struct PipePair {
    /// The end returned to the dialer.
    pub dialer: Arc<PipeConn>,
    /// The end handed to the listener.
    pub listener: Arc<PipeConn>,
}

impl PipePair {
    /// Whether both ends are still open.
    pub fn is_open(&self) -> bool {
        !self.dialer.is_closed() && !self.listener.is_closed()
    }
}

#[derive(Default)]
struct HubInner {
    listeners: RwLock<HashMap<AddressKey, mpsc::Sender<Arc<PipeConn>>>>,
    pipes: Mutex<Vec<PipePair>>,
}

/// An in-memory network: listeners bind to peer addresses, dialers connect
/// to them through pipes.
#[derive(Clone, Default)]
pub struct ConnHub {
    inner: Arc<HubInner>,
}

impl ConnHub {
    /// An empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a listener to `addr`. Fails if `addr` is already bound.
    pub fn listener(&self, addr: &AddressMap) -> Result<HubListener> {
        let key = addr.key();
        let mut listeners = self.inner.listeners.write();
        if listeners.contains_key(&key) {
            return Err(Error::connection(format!("address {addr} already bound")));
        }
        let (tx, rx) = mpsc::channel(HUB_BACKLOG);
        listeners.insert(key.clone(), tx);
        Ok(HubListener {
            key,
            hub: Arc::clone(&self.inner),
            incoming: tokio::sync::Mutex::new(rx),
            closer: Closer::new(),
        })
    }

    /// A dialer connecting to this hub's listeners.
    pub fn dialer(&self) -> HubDialer {
        HubDialer {
            hub: Arc::clone(&self.inner),
            closer: Closer::new(),
        }
    }

    /// Every pipe created so far.
    pub fn pipes(&self) -> Vec<PipePair> {
        self.inner.pipes.lock().clone()
    }
}

/// Accepts pipes dialed to one address of a [`ConnHub`].
pub struct HubListener {
    key: AddressKey,
    hub: Arc<HubInner>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Arc<PipeConn>>>,
    closer: Closer,
}

#[async_trait]
impl Listener for HubListener {
    async fn accept(&self) -> Result<Box<dyn Conn>> {
        if self.closer.is_closed() {
            return Err(Error::Closed("listener"));
        }
        tokio::select! {
            _ = self.closer.closed() => Err(Error::Closed("listener")),
            conn = async { self.incoming.lock().await.recv().await } => match conn {
                Some(conn) => Ok(Box::new(conn) as Box<dyn Conn>),
                None => Err(Error::Closed("listener")),
            },
        }
    }

    fn close(&self) -> Result<()> {
        if !self.closer.close() {
            return Err(Error::Closed("listener"));
        }
        self.hub.listeners.write().remove(&self.key);
        Ok(())
    }
}

impl Drop for HubListener {
    fn drop(&mut self) {
        let _ = Listener::close(self);
    }
}

/// Dials listeners of a [`ConnHub`].
pub struct HubDialer {
    hub: Arc<HubInner>,
    closer: Closer,
}

#[async_trait]
impl Dialer for HubDialer {
    async fn dial(&self, addr: &AddressMap) -> Result<Box<dyn Conn>> {
        if self.closer.is_closed() {
            return Err(Error::Closed("dialer"));
        }
        let incoming = self
            .hub
            .listeners
            .read()
            .get(&addr.key())
            .cloned()
            .ok_or_else(|| Error::UnknownPeer(addr.clone()))?;

        let (local, remote) = pipe();
        let pair = PipePair {
            dialer: Arc::new(local),
            listener: Arc::new(remote),
        };
        self.hub.pipes.lock().push(pair.clone());

        tokio::select! {
            _ = self.closer.closed() => Err(Error::Closed("dialer")),
            res = incoming.send(pair.listener) => match res {
                Ok(()) => Ok(Box::new(pair.dialer) as Box<dyn Conn>),
                Err(_) => Err(Error::connection(format!("listener for {addr} closed"))),
            },
        }
    }

    fn close(&self) -> Result<()> {
        if self.closer.close() {
            Ok(())
        } else {
            Err(Error::Closed("dialer"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Account;
    use crate::ed25519::Ed25519Account;
    use crate::envelope::{Msg, PingMsg};
    use std::time::Duration;

    fn addr(seed: u8) -> AddressMap {
        AddressMap::single(0, Ed25519Account::from_seed([seed; 32]).address())
    }

    fn ping() -> Envelope {
        Envelope::new(addr(1), addr(2), Msg::Ping(PingMsg::now()))
    }

    #[tokio::test]
    async fn send_completes_when_taken() {
        let (a, b) = pipe();
        let env = ping();
        let (sent, received) = tokio::join!(a.send(env.clone()), b.recv());
        sent.unwrap();
        assert_eq!(received.unwrap(), env);
    }

    #[tokio::test]
    async fn close_propagates_to_peer() {
        let (a, b) = pipe();
        a.close().unwrap();
        assert!(a.close().is_err());

        let err = b.recv().await.unwrap_err();
        assert!(matches!(err, Error::Connection(_)));
        assert!(b.is_closed(), "recv error must close the conn");
    }

    #[tokio::test]
    async fn interrupted_send_is_not_delivered() {
        let (a, b) = pipe();
        let a = Arc::new(a);
        let pending = {
            let a = a.clone();
            tokio::spawn(async move { a.send(ping()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.close().unwrap();

        assert!(pending.await.unwrap().is_err());
        assert!(b.recv().await.is_err(), "nothing may be delivered");
    }

    #[tokio::test]
    async fn hub_connects_dialer_to_listener() {
        let hub = ConnHub::new();
        let listener = hub.listener(&addr(2)).unwrap();
        assert!(hub.listener(&addr(2)).is_err());

        let dialer = hub.dialer();
        let target = addr(2);
        let (dialed, accepted) = tokio::join!(dialer.dial(&target), listener.accept());
        let (dialed, accepted) = (dialed.unwrap(), accepted.unwrap());

        let env = ping();
        let (sent, received) = tokio::join!(dialed.send(env.clone()), accepted.recv());
        sent.unwrap();
        assert_eq!(received.unwrap(), env);
        assert_eq!(hub.pipes().len(), 1);
        assert!(hub.pipes()[0].is_open());

        assert!(matches!(
            dialer.dial(&addr(3)).await,
            Err(Error::UnknownPeer(_))
        ));
    }

    #[tokio::test]
    async fn closing_listener_unbinds_and_aborts_accept() {
        let hub = ConnHub::new();
        let listener = Arc::new(hub.listener(&addr(2)).unwrap());
        let pending = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        Listener::close(listener.as_ref()).unwrap();
        assert!(pending.await.unwrap().is_err());
        assert!(hub.listener(&addr(2)).is_ok(), "address is free again");
    }
}
