//! Envelope sinks fed by endpoints and the bus.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use crate::envelope::Envelope;
use crate::sync::Closer;
use crate::{Error, Result};

/// Capacity of a [`Receiver`]'s queue.
pub const RECEIVER_BUFFER_SIZE: usize = 16;

/// Something that accepts envelopes.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Hand over an envelope. May wait while the consumer is backlogged;
    /// envelopes put into a closed consumer are dropped.
    async fn put(&self, env: Envelope);

    /// Run `hook` when the consumer closes, or right away if it already is.
    fn on_close(&self, hook: Box<dyn FnOnce() + Send>);
}

/// A bounded queue [`Consumer`] read through [`next`](Receiver::next).
pub struct Receiver {
    tx: mpsc::Sender<Envelope>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Envelope>>,
    closer: Closer,
}

impl Receiver {
    /// A new, open receiver.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(RECEIVER_BUFFER_SIZE);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closer: Closer::new(),
        }
    }

    /// Wait for the next envelope. Fails once the receiver is closed.
    pub async fn next(&self) -> Result<Envelope> {
        if self.closer.is_closed() {
            return Err(Error::Closed("receiver"));
        }
        tokio::select! {
            _ = self.closer.closed() => Err(Error::Closed("receiver")),
            env = async { self.rx.lock().await.recv().await } => {
                // `tx` lives in `self`, the channel cannot run dry.
                env.ok_or(Error::Closed("receiver"))
            }
        }
    }

    /// Close the receiver, waking pending [`next`](Receiver::next) calls.
    pub fn close(&self) -> Result<()> {
        if self.closer.close() {
            Ok(())
        } else {
            Err(Error::Closed("receiver"))
        }
    }

    /// Whether the receiver has been closed.
    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Consumer for Receiver {
    async fn put(&self, env: Envelope) {
        let sender = env.sender().clone();
        tokio::select! {
            _ = self.closer.closed() => {
                trace!(%sender, "receiver closed, dropping envelope");
            }
            _ = self.tx.send(env) => {}
        }
    }

    fn on_close(&self, hook: Box<dyn FnOnce() + Send>) {
        self.closer.on_close(hook);
    }
}
