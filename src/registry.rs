//! Endpoint registry: dialing, accepting and deduplicating peer connections.
//!
//! The registry turns a peer identity into a live [`Endpoint`]. Concurrent
//! requests for the same peer share a single dial. When both peers dial each
//! other at the same time, each side ends up with two authenticated
//! connections; both sides then independently keep the same one (see
//! [`FullEndpoint::install`]).

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::address::{AccountMap, AddressKey, AddressMap};
use crate::conn::{Conn, Dialer, Listener};
use crate::consumer::Consumer;
use crate::endpoint::Endpoint;
use crate::error::AuthenticationError;
use crate::handshake;
use crate::sync::Closer;
use crate::{Error, Result};

/// Timeouts applied by an [`EndpointRegistry`].
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Deadline for the address exchange on a fresh connection.
    pub handshake_timeout: Duration,
    /// Deadline for dialing plus authenticating an outbound connection.
    pub dial_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(15),
        }
    }
}

impl RegistryConfig {
    /// Set the address exchange deadline.
    pub fn with_handshake_timeout(mut self, d: Duration) -> Self {
        self.handshake_timeout = d;
        self
    }

    /// Set the dial deadline.
    pub fn with_dial_timeout(mut self, d: Duration) -> Self {
        self.dial_timeout = d;
        self
    }
}

/// Wires a freshly authenticated endpoint's inbound stream to its consumer.
pub type NewEndpointHandler = dyn Fn(&AddressMap) -> Arc<dyn Consumer> + Send + Sync;

/// Directory of authenticated connections to peers.
///
/// Cloning is cheap; clones share the same directory.
#[derive(Clone)]
pub struct EndpointRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    id: AccountMap,
    own: AddressMap,
    dialer: Box<dyn Dialer>,
    on_new_endpoint: Box<NewEndpointHandler>,
    config: RegistryConfig,
    state: RwLock<State>,
    closer: Closer,
}

#[derive(Default)]
struct State {
    endpoints: HashMap<AddressKey, Arc<FullEndpoint>>,
    dialing: HashMap<AddressKey, Arc<DialingEndpoint>>,
}

impl EndpointRegistry {
    /// Create a registry for identity `id`.
    ///
    /// `on_new_endpoint` is called once per installed endpoint and returns the
    /// consumer its received envelopes are fed to.
    pub fn new<D, F>(id: AccountMap, dialer: D, on_new_endpoint: F, config: RegistryConfig) -> Self
    where
        D: Dialer,
        F: Fn(&AddressMap) -> Arc<dyn Consumer> + Send + Sync + 'static,
    {
        let own = id.address_map();
        Self {
            inner: Arc::new(Inner {
                id,
                own,
                dialer: Box::new(dialer),
                on_new_endpoint: Box::new(on_new_endpoint),
                config,
                state: RwLock::new(State::default()),
                closer: Closer::new(),
            }),
        }
    }

    /// This node's identity.
    pub fn address(&self) -> &AddressMap {
        &self.inner.own
    }

    /// The live endpoint for `addr`, dialing the peer if there is none.
    ///
    /// If a dial to `addr` is already in progress, waits for its outcome
    /// instead of dialing again. Dropping the returned future abandons the
    /// request; an abandoned dial fails every caller waiting on it.
    ///
    /// # Panics
    ///
    /// If `addr` is this registry's own identity.
    pub async fn endpoint(&self, addr: &AddressMap) -> Result<Arc<Endpoint>> {
        let inner = &self.inner;
        assert!(*addr != inner.own, "tried to dial self ({addr})");
        if inner.closer.is_closed() {
            return Err(Error::Closed("registry"));
        }

        let key = addr.key();
        let (dialing, created) = {
            let mut state = inner.state.write();
            if let Some(ep) = state
                .endpoints
                .get(&key)
                .and_then(|fe| fe.load())
                .filter(|ep| !ep.is_closed())
            {
                return Ok(ep);
            }
            match state.dialing.get(&key) {
                Some(dialing) => (Arc::clone(dialing), false),
                None => {
                    let dialing = Arc::new(DialingEndpoint::new());
                    state.dialing.insert(key.clone(), Arc::clone(&dialing));
                    (dialing, true)
                }
            }
        };

        if !created {
            trace!(peer = %addr, "joining dial in progress");
            let res = tokio::select! {
                _ = inner.closer.closed() => Err(Error::Closed("registry")),
                outcome = dialing.wait() => outcome.into_result(),
            };
            return res.map_err(|e| e.context("failed to dial peer"));
        }

        let mut settle = SettleOnDrop {
            inner,
            key,
            dialing,
            outcome: None,
        };
        let res = self.authenticated_dial(addr).await;
        settle.outcome = Some(DialOutcome::of(&res));
        drop(settle);
        res.map_err(|e| e.context("failed to dial peer"))
    }

    async fn authenticated_dial(&self, addr: &AddressMap) -> Result<Arc<Endpoint>> {
        let inner = &self.inner;
        let dial = async {
            debug!(peer = %addr, "dialing");
            let conn: Arc<dyn Conn> = inner
                .dialer
                .dial(addr)
                .await
                .map_err(|e| e.context("failed to dial"))?
                .into();
            let mut guard = CloseConnOnDrop {
                conn: conn.as_ref(),
                armed: true,
            };
            handshake::exchange_addrs_active(
                &inner.id,
                addr,
                conn.as_ref(),
                inner.config.handshake_timeout,
            )
            .await
            .map_err(|e| e.context("ExchangeAddrs failed"))?;
            guard.armed = false;
            drop(guard);
            self.add_endpoint(addr.clone(), conn, true)
        };

        tokio::select! {
            _ = inner.closer.closed() => Err(Error::Closed("registry")),
            res = tokio::time::timeout(inner.config.dial_timeout, dial) => {
                res.unwrap_or(Err(Error::Timeout { op: "dial" }))
            }
        }
    }

    /// Accept inbound connections from `listener` until it is closed.
    ///
    /// Each connection is authenticated on its own task, so a slow peer does
    /// not hold up the next accept. Closing the registry closes the listener.
    /// Run this as a separate task.
    pub async fn listen<L: Listener>(&self, listener: L) {
        let listener: Arc<dyn Listener> = Arc::new(listener);
        {
            let listener = Arc::clone(&listener);
            self.inner.closer.on_close(move || {
                let _ = listener.close();
            });
        }

        loop {
            let conn = match listener.accept().await {
                Ok(conn) => conn,
                Err(err) => {
                    debug!(error = %err, "accept loop stopped");
                    return;
                }
            };
            debug!("setting up inbound connection");
            let registry = self.clone();
            tokio::spawn(async move {
                if let Err(err) = registry.setup_conn(conn.into()).await {
                    warn!(error = %err, "could not set up inbound connection");
                }
            });
        }
    }

    async fn setup_conn(&self, conn: Arc<dyn Conn>) -> Result<()> {
        let inner = &self.inner;
        let exchange = handshake::exchange_addrs_passive(
            &inner.id,
            conn.as_ref(),
            inner.config.handshake_timeout,
        );
        let peer = tokio::select! {
            _ = inner.closer.closed() => {
                let _ = conn.close();
                return Err(Error::Closed("registry"));
            }
            res = exchange => res.map_err(|e| e.context("ExchangeAddrs failed"))?,
        };
        if peer == inner.own {
            let _ = conn.close();
            return Err(Error::connection("peer claims our own identity"));
        }
        self.add_endpoint(peer, conn, false).map(|_| ())
    }

    /// Install an authenticated connection, resolving dial races, and start
    /// its receive loop. Returns the endpoint that is live for the peer
    /// afterwards.
    fn add_endpoint(
        &self,
        addr: AddressMap,
        conn: Arc<dyn Conn>,
        dialer: bool,
    ) -> Result<Arc<Endpoint>> {
        let inner = &self.inner;
        let key = addr.key();
        let new = Arc::new(Endpoint::new(addr, conn));

        // Install under the state lock, so `close` and slot pruning see it.
        let (slot, ep) = {
            let mut state = inner.state.write();
            if inner.closer.is_closed() {
                let _ = new.close();
                return Err(Error::Closed("registry"));
            }
            let slot = Arc::clone(state.endpoints.entry(key.clone()).or_default());
            match slot.install(new, &inner.own, dialer) {
                Install::Installed(ep) => (slot, ep),
                Install::Kept(existing) => return Ok(existing),
            }
        };

        let consumer = (inner.on_new_endpoint)(ep.address());
        let registry = Arc::downgrade(&self.inner);
        let receiving = Arc::clone(&ep);
        tokio::spawn(async move {
            if let Err(err) = receiving.recv_loop(consumer).await {
                debug!(peer = %receiving.address(), error = %err, "endpoint closed");
            }
            match registry.upgrade() {
                Some(inner) => inner.remove_endpoint(&key, &slot, &receiving),
                None => slot.remove(&receiving),
            }
        });
        debug!(peer = %ep.address(), dialer, "endpoint installed");
        Ok(ep)
    }

    /// Whether a live connection to `addr` exists or is being dialed.
    pub fn has(&self, addr: &AddressMap) -> bool {
        let key = addr.key();
        let state = self.inner.state.read();
        state.dialing.contains_key(&key)
            || state
                .endpoints
                .get(&key)
                .is_some_and(|fe| fe.load().is_some())
    }

    /// Number of peers that are connected or being dialed.
    pub fn num_peers(&self) -> usize {
        let state = self.inner.state.read();
        let live = state
            .endpoints
            .iter()
            .filter(|(key, fe)| fe.load().is_some() && !state.dialing.contains_key(*key))
            .count();
        live + state.dialing.len()
    }

    /// Close the dialer, every listener and every endpoint.
    ///
    /// A second call returns an error.
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.closer.close() {
            return Err(Error::Closed("registry"));
        }
        let res = inner
            .dialer
            .close()
            .map_err(|e| e.context("closing dialer"));

        let state = std::mem::take(&mut *inner.state.write());
        for fe in state.endpoints.into_values() {
            if let Some(ep) = fe.load() {
                if let Err(err) = ep.close() {
                    debug!(peer = %ep.address(), error = %err, "endpoint already closed");
                }
            }
        }
        debug!(own = %inner.own, "registry closed");
        res
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closer.is_closed()
    }
}

impl Inner {
    /// Clear `slot` if it still holds `ep`, and forget the peer once its slot
    /// is empty.
    fn remove_endpoint(&self, key: &AddressKey, slot: &Arc<FullEndpoint>, ep: &Arc<Endpoint>) {
        let mut state = self.state.write();
        slot.remove(ep);
        if slot.load().is_none()
            && state
                .endpoints
                .get(key)
                .is_some_and(|fe| Arc::ptr_eq(fe, slot))
        {
            state.endpoints.remove(key);
            trace!(peer = %ep.address(), "peer forgotten");
        }
    }
}

impl fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("own", &self.inner.own)
            .field("peers", &self.num_peers())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Slot holding the current endpoint to one peer.
#[derive(Default)]
struct FullEndpoint {
    current: ArcSwapOption<Endpoint>,
}

enum Install {
    /// The new endpoint is now current.
    Installed(Arc<Endpoint>),
    /// The new endpoint lost the race and was closed; carries the current one.
    Kept(Arc<Endpoint>),
}

impl FullEndpoint {
    fn load(&self) -> Option<Arc<Endpoint>> {
        self.current.load_full()
    }

    /// Make `new` the current endpoint.
    ///
    /// An empty slot, or one still holding a closed endpoint, is filled by
    /// compare-and-swap. A live occupant means both peers dialed each other
    /// concurrently. Each side then closes the same physical connection: the
    /// new endpoint loses iff `dialer == (own < peer)`, so the connection
    /// dialed by the greater address survives on both ends.
    fn install(&self, new: Arc<Endpoint>, own: &AddressMap, dialer: bool) -> Install {
        let existing = loop {
            let current = self.load();
            if let Some(live) = current.as_ref().filter(|ep| !ep.is_closed()) {
                break Arc::clone(live);
            }
            let prev = self
                .current
                .compare_and_swap(&current, Some(Arc::clone(&new)));
            if same_endpoint((*prev).as_ref(), current.as_ref()) {
                return Install::Installed(new);
            }
        };

        if dialer == (own < new.address()) {
            debug!(peer = %new.address(), dialer, "dial race: keeping existing connection");
            if let Err(err) = new.close() {
                warn!(peer = %new.address(), error = %err, "new endpoint already closed");
            }
            return Install::Kept(existing);
        }

        debug!(peer = %new.address(), dialer, "dial race: replacing existing connection");
        if let Some(old) = self.current.swap(Some(Arc::clone(&new))) {
            // The peer may have closed the old connection already.
            if let Err(err) = old.close() {
                debug!(peer = %old.address(), error = %err, "replaced endpoint already closed");
            }
        }
        Install::Installed(new)
    }

    /// Clear the slot if it still holds `expected`.
    fn remove(&self, expected: &Arc<Endpoint>) {
        let expected = Some(Arc::clone(expected));
        self.current.compare_and_swap(&expected, None);
    }
}

fn same_endpoint(a: Option<&Arc<Endpoint>>, b: Option<&Arc<Endpoint>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

/// Closes a dialed connection whose handshake did not finish.
struct CloseConnOnDrop<'a> {
    conn: &'a dyn Conn,
    armed: bool,
}

impl Drop for CloseConnOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            trace!("dial abandoned, closing connection");
            let _ = self.conn.close();
        }
    }
}

/// How a shared dial ended, as seen by the callers that joined it.
#[derive(Clone)]
enum DialOutcome {
    Connected(Arc<Endpoint>),
    Rejected(AuthenticationError),
    TimedOut,
    Failed,
}

impl DialOutcome {
    fn of(res: &Result<Arc<Endpoint>>) -> Self {
        match res {
            Ok(ep) => Self::Connected(Arc::clone(ep)),
            Err(err) => match err.authentication() {
                Some(auth) => Self::Rejected(auth.clone()),
                None if err.is_timeout() => Self::TimedOut,
                None => Self::Failed,
            },
        }
    }

    fn into_result(self) -> Result<Arc<Endpoint>> {
        match self {
            Self::Connected(ep) => Ok(ep),
            Self::Rejected(auth) => Err(Error::from(auth).context("concurrent dial failed")),
            Self::TimedOut => Err(Error::Timeout { op: "dial" }.context("concurrent dial failed")),
            Self::Failed => Err(Error::connection("concurrent dial failed")),
        }
    }
}

/// Placeholder for a dial in progress, shared by all callers waiting on it.
struct DialingEndpoint {
    done: watch::Sender<Option<DialOutcome>>,
}

impl DialingEndpoint {
    fn new() -> Self {
        let (done, _) = watch::channel(None);
        Self { done }
    }

    /// Resolve every waiter with the dial's outcome.
    fn settle(&self, outcome: DialOutcome) {
        self.done.send_replace(Some(outcome));
    }

    async fn wait(&self) -> DialOutcome {
        let mut rx = self.done.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(DialOutcome::Failed),
            Err(_) => DialOutcome::Failed,
        };
        outcome
    }
}

/// Removes the dialing placeholder and wakes its waiters, also when the
/// dialing caller is cancelled.
struct SettleOnDrop<'a> {
    inner: &'a Inner,
    key: AddressKey,
    dialing: Arc<DialingEndpoint>,
    outcome: Option<DialOutcome>,
}

impl Drop for SettleOnDrop<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.write();
            if state
                .dialing
                .get(&self.key)
                .is_some_and(|d| Arc::ptr_eq(d, &self.dialing))
            {
                state.dialing.remove(&self.key);
            }
        }
        let outcome = self.outcome.take().unwrap_or(DialOutcome::Failed);
        self.dialing.settle(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::Receiver;
    use crate::ed25519::Ed25519Account;
    use crate::envelope::{AuthResponseMsg, Envelope, Msg};
    use crate::net::pipe::{pipe, ConnHub};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn identity(seed: u8) -> AccountMap {
        AccountMap::single(0, Arc::new(Ed25519Account::from_seed([seed; 32])))
    }

    fn fast() -> RegistryConfig {
        RegistryConfig::default()
            .with_handshake_timeout(Duration::from_secs(2))
            .with_dial_timeout(Duration::from_secs(3))
    }

    fn registry<D: Dialer>(id: AccountMap, dialer: D) -> (EndpointRegistry, Arc<Receiver>) {
        registry_with(id, dialer, fast())
    }

    fn registry_with<D: Dialer>(
        id: AccountMap,
        dialer: D,
        config: RegistryConfig,
    ) -> (EndpointRegistry, Arc<Receiver>) {
        let recv = Arc::new(Receiver::new());
        let consumer = Arc::clone(&recv);
        let reg = EndpointRegistry::new(
            id,
            dialer,
            move |_: &AddressMap| -> Arc<dyn Consumer> { consumer.clone() },
            config,
        );
        (reg, recv)
    }

    fn serve(
        reg: &EndpointRegistry,
        listener: crate::net::HubListener,
    ) -> tokio::task::JoinHandle<()> {
        let reg = reg.clone();
        tokio::spawn(async move { reg.listen(listener).await })
    }

    fn tracked_peers(reg: &EndpointRegistry) -> usize {
        reg.inner.state.read().endpoints.len()
    }

    /// Accepts connections on `addr` and answers every handshake in the name
    /// of `addr`, signing with `forger`'s keys.
    fn forge_handshakes(
        listener: crate::net::HubListener,
        addr: AddressMap,
        forger: AccountMap,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Ok(conn) = listener.accept().await {
                let Ok(hello) = conn.recv().await else { continue };
                let forged = AuthResponseMsg {
                    signatures: forger.sign_all(&addr.encode()).unwrap(),
                };
                let reply =
                    Envelope::new(addr.clone(), hello.sender().clone(), Msg::AuthResponse(forged));
                let _ = conn.send(reply).await;
            }
        })
    }

    /// Counts dials and delegates to another dialer.
    struct CountingDialer<D> {
        inner: D,
        dials: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl<D: Dialer> Dialer for CountingDialer<D> {
        async fn dial(&self, addr: &AddressMap) -> Result<Box<dyn Conn>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            self.inner.dial(addr).await
        }

        fn close(&self) -> Result<()> {
            self.inner.close()
        }
    }

    /// Never completes a dial.
    struct StuckDialer;

    #[async_trait]
    impl Dialer for StuckDialer {
        async fn dial(&self, _addr: &AddressMap) -> Result<Box<dyn Conn>> {
            std::future::pending().await
        }

        fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn endpoint_over(peer: &AddressMap, conn: crate::net::pipe::PipeConn) -> Arc<Endpoint> {
        Arc::new(Endpoint::new(peer.clone(), Arc::new(conn)))
    }

    /// Install `first` then `second` into an empty slot owned by `own`.
    fn resolve(
        own: &AddressMap,
        first: (&Arc<Endpoint>, bool),
        second: (&Arc<Endpoint>, bool),
    ) -> Arc<Endpoint> {
        let slot = FullEndpoint::default();
        assert!(matches!(
            slot.install(Arc::clone(first.0), own, first.1),
            Install::Installed(_)
        ));
        let _ = slot.install(Arc::clone(second.0), own, second.1);
        slot.load().expect("slot must hold an endpoint")
    }

    #[test]
    fn dial_race_keeps_the_same_connection_on_both_sides() {
        let (x, y) = (identity(1).address_map(), identity(2).address_map());
        let (low, high) = if x < y { (x, y) } else { (y, x) };

        for low_first in [true, false] {
            // c1 is dialed by `low`, c2 by `high`.
            let (c1_low, c1_high) = pipe();
            let (c2_high, c2_low) = pipe();

            let at_low_c1 = endpoint_over(&high, c1_low);
            let at_low_c2 = endpoint_over(&high, c2_low);
            let at_high_c1 = endpoint_over(&low, c1_high);
            let at_high_c2 = endpoint_over(&low, c2_high);

            let (kept_low, kept_high) = if low_first {
                (
                    resolve(&low, (&at_low_c1, true), (&at_low_c2, false)),
                    resolve(&high, (&at_high_c1, false), (&at_high_c2, true)),
                )
            } else {
                (
                    resolve(&low, (&at_low_c2, false), (&at_low_c1, true)),
                    resolve(&high, (&at_high_c2, true), (&at_high_c1, false)),
                )
            };

            assert!(Arc::ptr_eq(&kept_low, &at_low_c2), "order {low_first}");
            assert!(Arc::ptr_eq(&kept_high, &at_high_c2), "order {low_first}");
            assert!(at_low_c1.is_closed() && at_high_c1.is_closed());
            assert!(!at_low_c2.is_closed() && !at_high_c2.is_closed());
        }
    }

    #[test]
    fn remove_only_clears_matching_endpoint() {
        let peer = identity(2).address_map();
        let (a, _b) = pipe();
        let (c, _d) = pipe();
        let current = endpoint_over(&peer, a);
        let stale = endpoint_over(&peer, c);

        let slot = FullEndpoint::default();
        slot.install(Arc::clone(&current), &identity(1).address_map(), true);
        slot.remove(&stale);
        assert!(slot.load().is_some());
        slot.remove(&current);
        assert!(slot.load().is_none());
    }

    #[test_log::test(tokio::test)]
    async fn concurrent_requests_share_one_dial() {
        let hub = ConnHub::new();
        let (alice, bob) = (identity(1), identity(2));
        let bob_addr = bob.address_map();

        let dials = Arc::new(AtomicUsize::new(0));
        let (a, _) = registry(
            alice,
            CountingDialer {
                inner: hub.dialer(),
                dials: dials.clone(),
            },
        );
        let (b, _) = registry(bob, hub.dialer());
        let listener = hub.listener(&bob_addr).unwrap();
        let listening = {
            let b = b.clone();
            tokio::spawn(async move { b.listen(listener).await })
        };

        let requests = (0..8).map(|_| a.endpoint(&bob_addr));
        let endpoints = futures_util::future::try_join_all(requests).await.unwrap();

        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert!(endpoints.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert!(a.has(&bob_addr));
        assert_eq!(a.num_peers(), 1);

        a.close().unwrap();
        b.close().unwrap();
        listening.await.unwrap();
    }

    #[tokio::test]
    async fn failed_dial_leaves_no_trace() {
        let hub = ConnHub::new();
        let (a, _) = registry(identity(1), hub.dialer());
        let nobody = identity(9).address_map();

        let err = a.endpoint(&nobody).await.unwrap_err();
        assert!(!err.is_authentication());
        assert!(!a.has(&nobody));
        assert_eq!(a.num_peers(), 0);
    }

    #[tokio::test]
    async fn abandoned_dial_releases_placeholder() {
        let (a, _) = registry(identity(1), StuckDialer);
        let peer = identity(2).address_map();

        let res = tokio::time::timeout(Duration::from_millis(20), a.endpoint(&peer)).await;
        assert!(res.is_err());
        assert!(!a.has(&peer));
        assert_eq!(a.num_peers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_dial_times_out() {
        let (a, _) = registry(identity(1), StuckDialer);
        let err = a.endpoint(&identity(2).address_map()).await.unwrap_err();
        assert!(err.is_timeout(), "got {err}");
    }

    #[tokio::test]
    async fn waiters_fail_with_their_dial() {
        let (a, _) = registry(identity(1), StuckDialer);
        let peer = identity(2).address_map();

        let first = {
            let a = a.clone();
            let peer = peer.clone();
            tokio::spawn(async move { a.endpoint(&peer).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(a.has(&peer));
        assert_eq!(a.num_peers(), 1);

        let waiter = {
            let a = a.clone();
            let peer = peer.clone();
            tokio::spawn(async move { a.endpoint(&peer).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        first.abort();
        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must be woken")
            .unwrap();
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn impostor_is_rejected_without_endpoint() {
        let hub = ConnHub::new();
        let (alice, bob, mallory) = (identity(1), identity(2), identity(3));
        let bob_addr = bob.address_map();
        let (a, _) = registry(alice, hub.dialer());

        // Mallory listens on Bob's address and answers in his name.
        let forger = forge_handshakes(hub.listener(&bob_addr).unwrap(), bob_addr.clone(), mallory);

        let err = a.endpoint(&bob_addr).await.unwrap_err();
        assert!(err.is_authentication(), "got {err}");
        assert!(!a.has(&bob_addr));
        forger.abort();
    }

    #[test_log::test(tokio::test)]
    async fn joined_dial_reports_authentication_failure() {
        let hub = ConnHub::new();
        let (alice, bob, mallory) = (identity(1), identity(2), identity(3));
        let bob_addr = bob.address_map();
        let forger = forge_handshakes(hub.listener(&bob_addr).unwrap(), bob_addr.clone(), mallory);

        let dials = Arc::new(AtomicUsize::new(0));
        let (a, _) = registry(
            alice,
            CountingDialer {
                inner: hub.dialer(),
                dials: dials.clone(),
            },
        );
        let (dialed, joined) = tokio::join!(a.endpoint(&bob_addr), a.endpoint(&bob_addr));

        assert_eq!(dials.load(Ordering::SeqCst), 1);
        let (dialed, joined) = (dialed.unwrap_err(), joined.unwrap_err());
        assert!(dialed.is_authentication(), "got {dialed}");
        assert!(joined.is_authentication(), "got {joined}");
        assert!(!a.has(&bob_addr));
        forger.abort();
    }

    #[tokio::test]
    async fn timed_out_handshake_closes_connection() {
        let hub = ConnHub::new();
        let bob_addr = identity(2).address_map();
        let listener = hub.listener(&bob_addr).unwrap();
        let silent = tokio::spawn(async move {
            let _conn = listener.accept().await.unwrap();
            std::future::pending::<()>().await
        });

        let config = fast().with_dial_timeout(Duration::from_millis(100));
        let (a, _) = registry_with(identity(1), hub.dialer(), config);
        let err = a.endpoint(&bob_addr).await.unwrap_err();
        assert!(err.is_timeout(), "got {err}");

        let pipes = hub.pipes();
        assert_eq!(pipes.len(), 1);
        assert!(pipes[0].dialer.is_closed());
        assert!(!a.has(&bob_addr));
        silent.abort();
    }

    #[tokio::test]
    async fn close_during_handshake_closes_connection() {
        let hub = ConnHub::new();
        let bob_addr = identity(2).address_map();
        let listener = hub.listener(&bob_addr).unwrap();
        let (accepted_tx, accepted) = tokio::sync::oneshot::channel();
        let silent = tokio::spawn(async move {
            let _conn = listener.accept().await.unwrap();
            let _ = accepted_tx.send(());
            std::future::pending::<()>().await
        });

        let (a, _) = registry(identity(1), hub.dialer());
        let dialing = {
            let a = a.clone();
            let bob_addr = bob_addr.clone();
            tokio::spawn(async move { a.endpoint(&bob_addr).await })
        };
        accepted.await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        a.close().unwrap();
        let err = dialing.await.unwrap().unwrap_err();
        assert!(matches!(err.root(), Error::Closed(_)), "got {err}");
        assert!(hub.pipes()[0].dialer.is_closed());
        silent.abort();
    }

    #[test_log::test(tokio::test)]
    async fn closed_endpoint_is_replaced_by_a_fresh_dial() {
        let hub = ConnHub::new();
        let (alice, bob) = (identity(1), identity(2));
        let bob_addr = bob.address_map();
        let (a, _) = registry(alice, hub.dialer());
        let (b, _) = registry(bob, hub.dialer());
        let listening = serve(&b, hub.listener(&bob_addr).unwrap());

        let first = a.endpoint(&bob_addr).await.unwrap();
        // No yield in between: the slot still holds the closed endpoint.
        first.close().unwrap();
        let second = a.endpoint(&bob_addr).await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_closed());
        assert_eq!(hub.pipes().len(), 2);

        a.close().unwrap();
        b.close().unwrap();
        listening.await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn disconnected_peer_is_forgotten() {
        let hub = ConnHub::new();
        let (alice, bob) = (identity(1), identity(2));
        let bob_addr = bob.address_map();
        let (a, _) = registry(alice, hub.dialer());
        let (b, _) = registry(bob, hub.dialer());
        let listening = serve(&b, hub.listener(&bob_addr).unwrap());

        let ep = a.endpoint(&bob_addr).await.unwrap();
        assert_eq!(tracked_peers(&a), 1);

        b.close().unwrap();
        listening.await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while tracked_peers(&a) != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("slot must be dropped once the peer hangs up");
        assert!(ep.is_closed());
        assert!(!a.has(&bob_addr));
        assert_eq!(a.num_peers(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn inbound_peer_with_own_identity_is_rejected() {
        let hub = ConnHub::new();
        let alice = identity(1);
        let own = alice.address_map();
        let (a, _) = registry(alice.clone(), hub.dialer());
        let listening = serve(&a, hub.listener(&own).unwrap());

        // A genuine signature over our own identity, arriving from outside.
        let conn = hub.dialer().dial(&own).await.unwrap();
        let claim = Envelope::new(
            own.clone(),
            own.clone(),
            Msg::AuthResponse(AuthResponseMsg::new(&alice).unwrap()),
        );
        conn.send(claim).await.unwrap();
        let reply = conn.recv().await.unwrap();
        assert_eq!(reply.msg().kind(), crate::envelope::MsgType::AuthResponse);

        let hangup = tokio::time::timeout(Duration::from_secs(1), conn.recv())
            .await
            .expect("registry must hang up");
        assert!(hangup.is_err());
        assert!(!a.has(&own));
        assert_eq!(a.num_peers(), 0);
        assert_eq!(tracked_peers(&a), 0);

        a.close().unwrap();
        listening.await.unwrap();
    }

    #[tokio::test]
    async fn closed_registry_refuses_work() {
        let hub = ConnHub::new();
        let (a, _) = registry(identity(1), hub.dialer());
        a.close().unwrap();
        assert!(a.close().is_err());

        let err = a.endpoint(&identity(2).address_map()).await.unwrap_err();
        assert!(matches!(err, Error::Closed("registry")));
    }

    #[tokio::test]
    async fn close_stops_listen() {
        let hub = ConnHub::new();
        let id = identity(1);
        let listener = hub.listener(&id.address_map()).unwrap();
        let (a, _) = registry(id, hub.dialer());

        let listening = {
            let a = a.clone();
            tokio::spawn(async move { a.listen(listener).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        a.close().unwrap();
        tokio::time::timeout(Duration::from_secs(1), listening)
            .await
            .expect("listen must return after close")
            .unwrap();
    }

    #[tokio::test]
    #[should_panic(expected = "tried to dial self")]
    async fn dialing_self_panics() {
        let id = identity(1);
        let own = id.address_map();
        let (a, _) = registry(id, ConnHub::new().dialer());
        let _ = a.endpoint(&own).await;
    }
}
