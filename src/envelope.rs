//! Addressed messages exchanged over the wire.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::address::{AccountMap, AddressMap, BackendId};
use crate::Result;

/// A message addressed from one peer identity to another.
///
/// Envelopes are immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    sender: AddressMap,
    recipient: AddressMap,
    msg: Msg,
}

impl Envelope {
    /// Build an envelope.
    pub fn new(sender: AddressMap, recipient: AddressMap, msg: Msg) -> Self {
        Self {
            sender,
            recipient,
            msg,
        }
    }

    /// Identity of the sending peer.
    pub fn sender(&self) -> &AddressMap {
        &self.sender
    }

    /// Identity of the receiving peer.
    pub fn recipient(&self) -> &AddressMap {
        &self.recipient
    }

    /// The carried message.
    pub fn msg(&self) -> &Msg {
        &self.msg
    }

    /// Consume the envelope, returning the message.
    pub fn into_msg(self) -> Msg {
        self.msg
    }
}

/// Messages understood by the wire layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Msg {
    /// Liveness probe.
    Ping(PingMsg),
    /// Answer to a [`Msg::Ping`].
    Pong(PongMsg),
    /// Signed identity proof sent during the address exchange.
    AuthResponse(AuthResponseMsg),
    /// Opaque application payload.
    Payload(Vec<u8>),
}

impl Msg {
    /// The kind of this message.
    pub fn kind(&self) -> MsgType {
        match self {
            Self::Ping(_) => MsgType::Ping,
            Self::Pong(_) => MsgType::Pong,
            Self::AuthResponse(_) => MsgType::AuthResponse,
            Self::Payload(_) => MsgType::Payload,
        }
    }
}

/// Discriminant of [`Msg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    /// [`Msg::Ping`]
    Ping,
    /// [`Msg::Pong`]
    Pong,
    /// [`Msg::AuthResponse`]
    AuthResponse,
    /// [`Msg::Payload`]
    Payload,
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ping => "Ping",
            Self::Pong => "Pong",
            Self::AuthResponse => "AuthResponse",
            Self::Payload => "Payload",
        };
        f.write_str(name)
    }
}

/// Liveness probe carrying its creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingMsg {
    /// Milliseconds since the unix epoch when the ping was created.
    pub created_ms: u64,
}

impl PingMsg {
    /// A ping stamped with the current time.
    pub fn now() -> Self {
        Self {
            created_ms: unix_millis(),
        }
    }
}

/// Answer to a ping, stamped with the answer's creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongMsg {
    /// Milliseconds since the unix epoch when the pong was created.
    pub created_ms: u64,
}

impl PongMsg {
    /// A pong stamped with the current time.
    pub fn now() -> Self {
        Self {
            created_ms: unix_millis(),
        }
    }
}

/// Proof of identity: one signature per backend over the canonical encoding
/// of the sender's [`AddressMap`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponseMsg {
    /// Signatures keyed by backend.
    pub signatures: BTreeMap<BackendId, Vec<u8>>,
}

impl AuthResponseMsg {
    /// Sign our own identity with every account.
    pub fn new(accounts: &AccountMap) -> Result<Self> {
        let payload = accounts.address_map().encode();
        Ok(Self {
            signatures: accounts.sign_all(&payload)?,
        })
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
