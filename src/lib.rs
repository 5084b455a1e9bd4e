//! Authenticated peer-to-peer wire transport for state-channel nodes.
//!
//! An [`EndpointRegistry`] turns a peer identity into a live, mutually
//! authenticated [`Endpoint`], deduplicating concurrent dials between the same
//! two peers. A [`Bus`] on top of it routes [`Envelope`]s between local
//! subscribers and remote peers, retrying failed publishes.

#![deny(missing_docs)]

pub mod address;
pub mod bus;
pub mod conn;
pub mod consumer;
pub mod ed25519;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod handshake;
pub mod net;
pub mod registry;
pub mod serializer;
pub mod sync;

// Re-export key types
pub use address::{Account, AccountMap, Address, AddressDecoder, AddressKey, AddressMap, BackendId};
pub use bus::{Bus, BusConfig};
pub use conn::{Conn, Dialer, Listener};
pub use consumer::{Consumer, Receiver};
pub use endpoint::Endpoint;
pub use envelope::{Envelope, Msg, MsgType};
pub use error::{AuthenticationError, Error, Result};
pub use registry::{EndpointRegistry, RegistryConfig};
pub use serializer::{EnvelopeSerializer, PostcardSerializer};
