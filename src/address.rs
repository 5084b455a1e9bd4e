//! Peer identities: addresses, accounts and their per-backend groupings.
//!
//! A peer may hold one identity per backend (one per chain it participates
//! in). Peers are therefore addressed by an [`AddressMap`], compared entry by
//! entry, and nodes sign with an [`AccountMap`].

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::Result;

/// Identifier of the backend (chain) an address belongs to.
pub type BackendId = u32;

/// A cryptographic identity of a peer.
///
/// Addresses are compared by their binary marshaling, which must be byte
/// exact: two addresses are equal iff their bytes are equal.
pub trait Address: fmt::Debug + Send + Sync + 'static {
    /// Binary marshaling of the address.
    fn to_bytes(&self) -> Vec<u8>;

    /// Verify that `sig` is a signature over `msg` made by this address.
    fn verify(&self, msg: &[u8], sig: &[u8]) -> Result<()>;

    /// Total order over addresses, used for deterministic tie-breaking.
    fn compare(&self, other: &dyn Address) -> Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }

    /// Equality of the binary marshaling.
    fn equal(&self, other: &dyn Address) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

/// Private signing material bound to an [`Address`].
pub trait Account: Send + Sync + 'static {
    /// The address this account signs for.
    fn address(&self) -> Arc<dyn Address>;

    /// Sign `msg`.
    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>>;
}

/// Unmarshals addresses received from the wire.
pub trait AddressDecoder: Send + Sync + 'static {
    /// Decode the binary marshaling of an address of the given backend.
    fn decode_address(&self, backend: BackendId, bytes: &[u8]) -> Result<Arc<dyn Address>>;
}

/// The identity of one peer: one address per backend.
#[derive(Clone, Default)]
pub struct AddressMap {
    entries: BTreeMap<BackendId, Arc<dyn Address>>,
}

impl AddressMap {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// A map with a single entry.
    pub fn single(backend: BackendId, address: Arc<dyn Address>) -> Self {
        let mut map = Self::new();
        map.insert(backend, address);
        map
    }

    /// Set the address for `backend`, returning the previous one.
    pub fn insert(
        &mut self,
        backend: BackendId,
        address: Arc<dyn Address>,
    ) -> Option<Arc<dyn Address>> {
        self.entries.insert(backend, address)
    }

    /// The address for `backend`.
    pub fn get(&self, backend: BackendId) -> Option<&Arc<dyn Address>> {
        self.entries.get(&backend)
    }

    /// Entries in backend order.
    pub fn iter(&self) -> impl Iterator<Item = (BackendId, &Arc<dyn Address>)> {
        self.entries.iter().map(|(id, addr)| (*id, addr))
    }

    /// Number of backends.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Canonical encoding: entry count, then backend id, length and bytes of
    /// each address, all integers u32 big-endian.
    ///
    /// This is the payload signed during the address exchange, binding the
    /// signature to the exact identity set being asserted.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.entries.len() * 40);
        out.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());
        for (backend, addr) in &self.entries {
            let bytes = addr.to_bytes();
            out.extend_from_slice(&backend.to_be_bytes());
            out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            out.extend_from_slice(&bytes);
        }
        out
    }

    /// Directory key for this identity.
    pub fn key(&self) -> AddressKey {
        AddressKey(self.encode())
    }

    /// Pairs of backend id and address bytes, for serialization.
    pub(crate) fn to_wire(&self) -> Vec<(BackendId, Vec<u8>)> {
        self.entries
            .iter()
            .map(|(id, addr)| (*id, addr.to_bytes()))
            .collect()
    }

    /// Rebuild a map from [`to_wire`](Self::to_wire) pairs.
    pub(crate) fn from_wire(
        entries: Vec<(BackendId, Vec<u8>)>,
        decoder: &dyn AddressDecoder,
    ) -> Result<Self> {
        let mut map = Self::new();
        for (backend, bytes) in entries {
            map.insert(backend, decoder.decode_address(backend, &bytes)?);
        }
        Ok(map)
    }
}

impl PartialEq for AddressMap {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for AddressMap {}

impl PartialOrd for AddressMap {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AddressMap {
    fn cmp(&self, other: &Self) -> Ordering {
        for ((id_a, a), (id_b, b)) in self.entries.iter().zip(other.entries.iter()) {
            let ord = id_a.cmp(id_b).then_with(|| a.compare(b.as_ref()));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.entries.len().cmp(&other.entries.len())
    }
}

impl Hash for AddressMap {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.encode().hash(state);
    }
}

impl fmt::Display for AddressMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (backend, addr)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            // Four bytes are plenty to tell peers apart in a log line.
            let short = addr
                .to_bytes()
                .iter()
                .take(4)
                .map(|b| format!("{b:02x}"))
                .collect::<String>();
            write!(f, "{backend}:{short}")?;
        }
        f.write_str("}")
    }
}

impl fmt::Debug for AddressMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

/// Hashable directory key derived from an [`AddressMap`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressKey(Vec<u8>);

impl AddressKey {
    /// The canonical encoding the key was built from.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// The signing identity of this node: one account per backend.
#[derive(Clone, Default)]
pub struct AccountMap {
    entries: BTreeMap<BackendId, Arc<dyn Account>>,
}

impl AccountMap {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// A map with a single account.
    pub fn single(backend: BackendId, account: Arc<dyn Account>) -> Self {
        let mut map = Self::new();
        map.insert(backend, account);
        map
    }

    /// Set the account for `backend`.
    pub fn insert(&mut self, backend: BackendId, account: Arc<dyn Account>) {
        self.entries.insert(backend, account);
    }

    /// The addresses of all accounts.
    pub fn address_map(&self) -> AddressMap {
        let mut map = AddressMap::new();
        for (backend, account) in &self.entries {
            map.insert(*backend, account.address());
        }
        map
    }

    /// Sign `msg` with every account.
    pub fn sign_all(&self, msg: &[u8]) -> Result<BTreeMap<BackendId, Vec<u8>>> {
        self.entries
            .iter()
            .map(|(backend, account)| Ok((*backend, account.sign(msg)?)))
            .collect()
    }
}

impl fmt::Debug for AccountMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountMap")
            .field("addresses", &self.address_map())
            .finish()
    }
}
