//! [`Conn`] over any tokio byte stream.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::trace;

use crate::conn::Conn;
use crate::envelope::Envelope;
use crate::serializer::EnvelopeSerializer;
use crate::sync::Closer;
use crate::{Error, Result};

type Reader = Box<dyn AsyncRead + Unpin + Send>;
type Writer = Box<dyn AsyncWrite + Unpin + Send>;

/// An envelope connection over a byte stream such as a TCP socket.
///
/// Reads and writes use separate halves of the stream, so a pending `recv`
/// does not block `send`. The stream is released once the connection closes.
pub struct IoConn {
    reader: Mutex<Option<Reader>>,
    writer: Mutex<Option<Writer>>,
    serializer: Arc<dyn EnvelopeSerializer>,
    closer: Closer,
}

impl IoConn {
    /// Wrap `stream`, framing envelopes with `serializer`.
    pub fn new<S>(stream: S, serializer: Arc<dyn EnvelopeSerializer>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w): (ReadHalf<S>, WriteHalf<S>) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(Some(Box::new(r))),
            writer: Mutex::new(Some(Box::new(w))),
            serializer,
            closer: Closer::new(),
        }
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.closer.is_closed()
    }

    async fn write(&self, env: &Envelope) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let w = writer.as_mut().ok_or(Error::Closed("connection"))?;
        self.serializer.encode(&mut **w, env).await
    }

    async fn read(&self) -> Result<Envelope> {
        let mut reader = self.reader.lock().await;
        let r = reader.as_mut().ok_or(Error::Closed("connection"))?;
        self.serializer.decode(&mut **r).await
    }

    /// Close and drop both stream halves. Operations still holding a half
    /// are interrupted by the close signal and release it first.
    async fn shut(&self) {
        let _ = self.close();
        self.writer.lock().await.take();
        self.reader.lock().await.take();
    }
}

#[async_trait]
impl Conn for IoConn {
    async fn send(&self, env: Envelope) -> Result<()> {
        if self.closer.is_closed() {
            return Err(Error::Closed("connection"));
        }
        let res = tokio::select! {
            _ = self.closer.closed() => Err(Error::Closed("connection")),
            res = self.write(&env) => res,
        };
        if res.is_err() {
            self.shut().await;
        }
        res
    }

    async fn recv(&self) -> Result<Envelope> {
        if self.closer.is_closed() {
            return Err(Error::Closed("connection"));
        }
        let res = tokio::select! {
            _ = self.closer.closed() => Err(Error::Closed("connection")),
            res = self.read() => res,
        };
        match &res {
            Ok(env) => trace!(sender = %env.sender(), "decoded envelope"),
            Err(_) => self.shut().await,
        }
        res
    }

    fn close(&self) -> Result<()> {
        if !self.closer.close() {
            return Err(Error::Closed("connection"));
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        Ok(())
    }
}
