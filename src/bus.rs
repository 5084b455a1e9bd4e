//! Message bus: routes envelopes between local subscribers and remote peers.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn, Instrument};

use crate::address::{AccountMap, AddressKey, AddressMap};
use crate::conn::{Dialer, Listener};
use crate::consumer::{Consumer, Receiver};
use crate::registry::{EndpointRegistry, RegistryConfig};
use crate::sync::Closer;
use crate::{Envelope, Error, Result};

/// Retry and timeout policy of a [`Bus`].
#[derive(Clone, Debug)]
pub struct BusConfig {
    /// Total publish attempts before giving up.
    pub publish_attempts: usize,
    /// Pause between two publish attempts.
    pub publish_cooldown: Duration,
    /// Deadline for a single endpoint send.
    pub send_timeout: Duration,
    /// Settings of the underlying registry.
    pub registry: RegistryConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            publish_attempts: 3,
            publish_cooldown: Duration::from_secs(3),
            send_timeout: Duration::from_secs(10),
            registry: RegistryConfig::default(),
        }
    }
}

impl BusConfig {
    /// Set the attempt budget. Values below one are treated as one.
    pub fn with_publish_attempts(mut self, attempts: usize) -> Self {
        self.publish_attempts = attempts.max(1);
        self
    }

    /// Set the pause between attempts.
    pub fn with_publish_cooldown(mut self, d: Duration) -> Self {
        self.publish_cooldown = d;
        self
    }

    /// Set the per-send deadline.
    pub fn with_send_timeout(mut self, d: Duration) -> Self {
        self.send_timeout = d;
        self
    }

    /// Set the registry settings.
    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }
}

type Subscribers = Mutex<HashMap<AddressKey, Arc<dyn Consumer>>>;

/// Publish/subscribe layer over an [`EndpointRegistry`].
///
/// All endpoints feed one shared inbound queue. A dispatch task drains it and
/// forwards each envelope to the consumer subscribed for its recipient.
/// Cloning is cheap; clones share the same bus.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

struct BusInner {
    registry: EndpointRegistry,
    main_recv: Arc<Receiver>,
    recvs: Arc<Subscribers>,
    config: BusConfig,
    closer: Closer,
    dispatch: JoinHandle<()>,
}

impl Bus {
    /// Create a bus for identity `id` dialing through `dialer`.
    ///
    /// Spawns the dispatch task, so this must run inside a tokio runtime.
    pub fn new<D: Dialer>(id: AccountMap, dialer: D, config: BusConfig) -> Self {
        let main_recv = Arc::new(Receiver::new());
        let recvs: Arc<Subscribers> = Arc::default();

        let feed = Arc::clone(&main_recv);
        let registry = EndpointRegistry::new(
            id,
            dialer,
            move |_: &AddressMap| -> Arc<dyn Consumer> { feed.clone() },
            config.registry.clone(),
        );

        let span = tracing::debug_span!("bus_dispatch", own = %registry.address());
        let dispatch = tokio::spawn(
            dispatch(Arc::clone(&main_recv), Arc::clone(&recvs)).instrument(span),
        );

        Self {
            inner: Arc::new(BusInner {
                registry,
                main_recv,
                recvs,
                config,
                closer: Closer::new(),
                dispatch,
            }),
        }
    }

    /// The underlying registry.
    pub fn registry(&self) -> &EndpointRegistry {
        &self.inner.registry
    }

    /// Make `consumer` the local recipient of envelopes addressed to `addr`.
    ///
    /// The subscription ends when the consumer closes.
    ///
    /// # Panics
    ///
    /// If `addr` already has a subscriber.
    pub fn subscribe_client(&self, consumer: Arc<dyn Consumer>, addr: &AddressMap) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed("bus"));
        }
        let key = addr.key();
        {
            let mut recvs = self.inner.recvs.lock();
            assert!(
                !recvs.contains_key(&key),
                "duplicate subscription for {addr}"
            );
            recvs.insert(key.clone(), Arc::clone(&consumer));
        }
        debug!(%addr, "client subscribed");

        let recvs: Weak<Subscribers> = Arc::downgrade(&self.inner.recvs);
        let subscribed = Arc::as_ptr(&consumer) as *const () as usize;
        consumer.on_close(Box::new(move || {
            let Some(recvs) = recvs.upgrade() else {
                return;
            };
            let mut recvs = recvs.lock();
            if recvs
                .get(&key)
                .is_some_and(|c| Arc::as_ptr(c) as *const () as usize == subscribed)
            {
                recvs.remove(&key);
            }
        }));
        Ok(())
    }

    /// Deliver `env` to its recipient.
    ///
    /// Failed attempts are retried after a cooldown until the attempt budget
    /// is spent; the last error is returned. Authentication failures and a
    /// closed bus or registry end the publish at once. Dropping the future
    /// abandons it.
    pub async fn publish(&self, env: Envelope) -> Result<()> {
        let inner = &self.inner;
        let mut attempt = 1;
        loop {
            if self.is_closed() {
                return Err(Error::Closed("bus"));
            }
            let res = tokio::select! {
                _ = inner.closer.closed() => return Err(Error::Closed("bus")),
                res = self.try_publish(&env) => res,
            };
            let err = match res {
                Ok(()) => {
                    trace!(peer = %env.recipient(), attempt, "published");
                    return Ok(());
                }
                Err(err) => err,
            };
            let terminal =
                err.is_authentication() || matches!(err.root(), Error::Closed("registry"));
            if terminal || attempt >= inner.config.publish_attempts {
                return Err(err);
            }

            warn!(peer = %env.recipient(), attempt, error = %err, "publish failed, retrying");
            tokio::select! {
                _ = inner.closer.closed() => return Err(Error::Closed("bus")),
                _ = tokio::time::sleep(inner.config.publish_cooldown) => {}
            }
            attempt += 1;
        }
    }

    async fn try_publish(&self, env: &Envelope) -> Result<()> {
        let ep = self.inner.registry.endpoint(env.recipient()).await?;
        match tokio::time::timeout(self.inner.config.send_timeout, ep.send(env.clone())).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout { op: "send" }),
        }
    }

    /// Accept inbound connections from `listener`; see
    /// [`EndpointRegistry::listen`].
    pub async fn listen<L: Listener>(&self, listener: L) {
        self.inner.registry.listen(listener).await
    }

    /// Close the inbound queue and the registry.
    ///
    /// A second call returns an error.
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.closer.close() {
            return Err(Error::Closed("bus"));
        }
        let _ = inner.main_recv.close();
        inner.registry.close()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closer.is_closed()
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("registry", &self.inner.registry)
            .field("subscribers", &self.inner.recvs.lock().len())
            .finish()
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}

async fn dispatch(main_recv: Arc<Receiver>, recvs: Arc<Subscribers>) {
    while let Ok(env) = main_recv.next().await {
        let consumer = recvs.lock().get(&env.recipient().key()).cloned();
        match consumer {
            Some(consumer) => consumer.put(env).await,
            None => warn!(
                sender = %env.sender(),
                recipient = %env.recipient(),
                kind = %env.msg().kind(),
                "no subscriber for envelope, dropping"
            ),
        }
    }
    debug!("dispatch loop stopped");
}
