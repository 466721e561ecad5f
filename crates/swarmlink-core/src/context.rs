//! Shared client context.
//!
//! Everything the pool, pollers and sender need is built once here and
//! passed down explicitly, so several identities can run side by side in one
//! process (the simulator and tests rely on this).

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use crate::clock::NetworkClock;
use crate::config::ClientConfig;
use crate::error::{SwarmError, SwarmResult};
use crate::events::{NetworkEvent, EVENT_CHANNEL_CAPACITY};
use crate::identity::Identity;
use crate::onion::{OnionClient, OnionTransport};
use crate::snode::{NodePool, SwarmResolver};
use crate::storage::{settings, SwarmStore, SwarmStoreExt};

pub struct SwarmContext {
    pub config: ClientConfig,
    pub store: Arc<dyn SwarmStore>,
    identity: Option<Arc<Identity>>,
    pub pool: Arc<NodePool>,
    pub onion: Arc<OnionClient>,
    pub resolver: Arc<SwarmResolver>,
    pub clock: Arc<NetworkClock>,
    events: broadcast::Sender<NetworkEvent>,
}

impl SwarmContext {
    pub fn new(
        config: ClientConfig,
        store: Arc<dyn SwarmStore>,
        transport: Arc<dyn OnionTransport>,
        identity: Option<Identity>,
    ) -> SwarmResult<Arc<Self>> {
        config.validate()?;
        let pool = Arc::new(NodePool::new(store.clone(), &config)?);
        let onion = Arc::new(OnionClient::new(transport, pool.clone(), config.onion_path_len));
        let resolver = Arc::new(SwarmResolver::new(onion.clone(), &config));
        let offset = store.load_json::<i64>(settings::CLOCK_OFFSET)?.unwrap_or(0);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        debug!(offset, has_identity = identity.is_some(), "Created swarm context");

        Ok(Arc::new(Self {
            config,
            store,
            identity: identity.map(Arc::new),
            pool,
            onion,
            resolver,
            clock: Arc::new(NetworkClock::new(offset)),
            events,
        }))
    }

    /// The local identity, or `NoKeyPair` when none is loaded.
    pub fn identity(&self) -> SwarmResult<&Arc<Identity>> {
        self.identity.as_ref().ok_or(SwarmError::NoKeyPair)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: NetworkEvent) {
        let _ = self.events.send(event);
    }

    /// Persist a freshly calibrated clock offset.
    pub(crate) fn save_clock_offset(&self, offset: i64) -> SwarmResult<()> {
        self.store.save_json(settings::CLOCK_OFFSET, &offset)
    }
}
