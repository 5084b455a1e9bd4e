//! Ed25519 identity backend.

use std::fmt;
use std::sync::Arc;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::address::{Account, Address, AddressDecoder, BackendId};
use crate::{Error, Result};

/// An Ed25519 public key used as a peer address.
#[derive(Clone, PartialEq, Eq)]
pub struct Ed25519Address(VerifyingKey);

impl Ed25519Address {
    /// Parse a 32-byte public key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: &[u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidSignature(format!("bad key length {}", bytes.len())))?;
        VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|e| Error::InvalidSignature(e.to_string()))
    }
}

impl Address for Ed25519Address {
    fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes().to_vec()
    }

    fn verify(&self, msg: &[u8], sig: &[u8]) -> Result<()> {
        let sig = Signature::from_slice(sig).map_err(|e| Error::InvalidSignature(e.to_string()))?;
        self.0
            .verify(msg, &sig)
            .map_err(|e| Error::InvalidSignature(e.to_string()))
    }
}

impl fmt::Debug for Ed25519Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self
            .0
            .as_bytes()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<String>();
        write!(f, "Ed25519Address({hex})")
    }
}

/// An Ed25519 signing key.
pub struct Ed25519Account {
    key: SigningKey,
}

impl Ed25519Account {
    /// Generate a fresh random account.
    pub fn random() -> Self {
        Self::from_seed(rand::random())
    }

    /// Deterministic account from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }
}

impl Account for Ed25519Account {
    fn address(&self) -> Arc<dyn Address> {
        Arc::new(Ed25519Address(self.key.verifying_key()))
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>> {
        Ok(self.key.sign(msg).to_bytes().to_vec())
    }
}

impl fmt::Debug for Ed25519Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519Account")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Decodes every backend's addresses as Ed25519 public keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Decoder;

impl AddressDecoder for Ed25519Decoder {
    fn decode_address(&self, _backend: BackendId, bytes: &[u8]) -> Result<Arc<dyn Address>> {
        Ok(Arc::new(Ed25519Address::from_bytes(bytes)?))
    }
}
