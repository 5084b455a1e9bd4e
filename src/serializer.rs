//! Envelope framing for byte-stream transports.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::address::{AddressDecoder, AddressMap, BackendId};
use crate::envelope::{Envelope, Msg};
use crate::{Error, Result};

/// Default upper bound on an encoded envelope.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Writes envelopes to and reads them from a byte stream.
#[async_trait]
pub trait EnvelopeSerializer: Send + Sync + 'static {
    /// Write one envelope.
    async fn encode(&self, w: &mut (dyn AsyncWrite + Unpin + Send), env: &Envelope) -> Result<()>;

    /// Read one envelope.
    async fn decode(&self, r: &mut (dyn AsyncRead + Unpin + Send)) -> Result<Envelope>;
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    sender: Vec<(BackendId, Vec<u8>)>,
    recipient: Vec<(BackendId, Vec<u8>)>,
    msg: Msg,
}

/// Frames envelopes as a big-endian `u32` length followed by the postcard
/// encoding of the envelope.
#[derive(Clone)]
pub struct PostcardSerializer {
    decoder: Arc<dyn AddressDecoder>,
    max_frame_len: usize,
}

impl PostcardSerializer {
    /// A serializer decoding addresses with `decoder`.
    pub fn new(decoder: impl AddressDecoder) -> Self {
        Self {
            decoder: Arc::new(decoder),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Reject frames longer than `len` bytes, in both directions.
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len.min(u32::MAX as usize);
        self
    }

    fn decode_addrs(&self, entries: Vec<(BackendId, Vec<u8>)>) -> Result<AddressMap> {
        AddressMap::from_wire(entries, self.decoder.as_ref())
    }
}

impl fmt::Debug for PostcardSerializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostcardSerializer")
            .field("max_frame_len", &self.max_frame_len)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EnvelopeSerializer for PostcardSerializer {
    async fn encode(&self, w: &mut (dyn AsyncWrite + Unpin + Send), env: &Envelope) -> Result<()> {
        let wire = WireEnvelope {
            sender: env.sender().to_wire(),
            recipient: env.recipient().to_wire(),
            msg: env.msg().clone(),
        };
        let body = postcard::to_stdvec(&wire)?;
        if body.len() > self.max_frame_len {
            return Err(Error::connection(format!(
                "envelope of {} bytes exceeds frame limit {}",
                body.len(),
                self.max_frame_len
            )));
        }

        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        w.write_all(&frame).await?;
        w.flush().await?;
        Ok(())
    }

    async fn decode(&self, r: &mut (dyn AsyncRead + Unpin + Send)) -> Result<Envelope> {
        let len = r.read_u32().await? as usize;
        if len > self.max_frame_len {
            return Err(Error::connection(format!(
                "frame of {len} bytes exceeds limit {}",
                self.max_frame_len
            )));
        }
        let mut body = vec![0u8; len];
        r.read_exact(&mut body).await?;

        let wire: WireEnvelope = postcard::from_bytes(&body)?;
        Ok(Envelope::new(
            self.decode_addrs(wire.sender)?,
            self.decode_addrs(wire.recipient)?,
            wire.msg,
        ))
    }
}
