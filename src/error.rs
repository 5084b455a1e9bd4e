//! Error types for perun-wire.

use std::fmt;

use crate::address::AddressMap;
use crate::envelope::MsgType;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The peer failed to prove the identity it claimed.
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),

    /// An operation did not finish before its deadline.
    #[error("{op} timed out")]
    Timeout {
        /// Name of the operation that timed out.
        op: &'static str,
    },

    /// The named component was already closed.
    #[error("{0} closed")]
    Closed(&'static str),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Envelope encoding or decoding failed.
    #[error("encoding error: {0}")]
    Encoding(#[from] postcard::Error),

    /// A message of the wrong kind arrived.
    #[error("unexpected message: expected {expected}, got {got}")]
    UnexpectedMsg {
        /// The kind the protocol required.
        expected: MsgType,
        /// The kind that was received.
        got: MsgType,
    },

    /// A signature or key could not be parsed or did not verify.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// The dialer has no route to the given peer.
    #[error("unknown peer {0}")]
    UnknownPeer(AddressMap),

    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Another error, annotated with the operation that produced it.
    #[error("{context}: {source}")]
    Context {
        /// Description of the failed operation.
        context: &'static str,
        /// The underlying error.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a connection error.
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Self::Connection(msg.into())
    }

    /// Wrap the error with a description of the failed operation.
    pub fn context(self, context: &'static str) -> Self {
        Self::Context {
            context,
            source: Box::new(self),
        }
    }

    /// The innermost error, with every [`Context`](Self::Context) removed.
    pub fn root(&self) -> &Error {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// The authentication failure behind this error, if any.
    pub fn authentication(&self) -> Option<&AuthenticationError> {
        match self.root() {
            Self::Authentication(auth) => Some(auth),
            _ => None,
        }
    }

    /// Whether this error, or any error it wraps, is an authentication failure.
    pub fn is_authentication(&self) -> bool {
        self.authentication().is_some()
    }

    /// Whether this error, or any error it wraps, is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Self::Timeout { .. })
    }
}

/// Failure to authenticate a peer during the address exchange.
///
/// Carries the addresses involved so a failed handshake can be diagnosed from
/// the log line alone.
#[derive(Debug, Clone)]
pub struct AuthenticationError {
    /// Sender declared by the offending envelope.
    pub sender: AddressMap,
    /// Recipient declared by the offending envelope.
    pub receiver: AddressMap,
    /// Our own identity.
    pub own: AddressMap,
    /// What did not match.
    pub reason: String,
}

impl AuthenticationError {
    pub(crate) fn new(
        sender: &AddressMap,
        receiver: &AddressMap,
        own: &AddressMap,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.clone(),
            receiver: receiver.clone(),
            own: own.clone(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for AuthenticationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "authentication failed: {} (sender {}, receiver {}, own {})",
            self.reason, self.sender, self.receiver, self.own
        )
    }
}

impl std::error::Error for AuthenticationError {}
