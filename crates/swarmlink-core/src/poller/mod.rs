//! Long-running poll loops.
//!
//! Every poller shares one shape:
//!
//! ```text
//!   Idle ──► ResolvingSwarm ──► Polling(node) ──ok──► sleep ──► Polling(node)
//!                  ▲                 │
//!                  └──── fault ──────┘  node dropped from the swarm,
//!                                       next unused node picked
//!   cancel ──► Stopped          kicked ──► RemovedFromGroup
//! ```
//!
//! A poller owns its state and runs inside one task, so cycles of the same
//! account never overlap. Cancellation only interrupts network calls made
//! through [`StateReporter::network`]. Once messages are fetched the cycle
//! runs to the end, so everything that advanced a cursor reaches the sink.

mod community;
mod group;
mod legacy;
mod manager;
mod user;

pub use community::CommunityPoller;
pub use group::GroupPoller;
pub use legacy::{legacy_interval, LegacyGroupPoller};
pub use manager::PollerManager;
pub use user::UserPoller;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::SwarmContext;
use crate::error::{SwarmError, SwarmResult};
use crate::events::{NetworkEvent, PollerState};
use crate::rpc::SnodeApi;
use crate::types::{AccountId, Node};

/// How a cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Keep polling; `received` envelopes were delivered
    Continue { received: usize },
    /// The local user was removed; the loop ends
    Removed,
}

/// One poll loop.
#[async_trait]
pub trait Poller: Send + 'static {
    /// Unique key used by [`PollerManager`]
    fn key(&self) -> String;

    /// Run one cycle.
    async fn poll_cycle(&mut self, status: &StateReporter) -> SwarmResult<CycleOutcome>;

    /// Delay before the next cycle, given how this one went.
    fn next_delay(&mut self, result: &SwarmResult<CycleOutcome>) -> Duration;
}

/// Shared view of a poller's state, emitting an event on every change.
/// Also carries the stop signal of the loop running the poller.
#[derive(Clone)]
pub struct StateReporter {
    key: String,
    state: Arc<Mutex<PollerState>>,
    ctx: Arc<SwarmContext>,
    cancel: CancellationToken,
}

impl StateReporter {
    pub fn new(key: String, ctx: Arc<SwarmContext>) -> Self {
        Self {
            key,
            state: Arc::new(Mutex::new(PollerState::Idle)),
            ctx,
            cancel: CancellationToken::new(),
        }
    }

    /// Tie this reporter to the stop signal of a poll loop.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Await a network call unless the poller is stopped first, in which
    /// case the call is dropped and `Cancelled` returned.
    pub async fn network<F: Future>(&self, call: F) -> SwarmResult<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SwarmError::Cancelled),
            output = call => Ok(output),
        }
    }

    pub fn get(&self) -> PollerState {
        self.state.lock().clone()
    }

    pub fn set(&self, state: PollerState) {
        {
            let mut current = self.state.lock();
            if *current == state {
                return;
            }
            *current = state.clone();
        }
        debug!(key = %self.key, %state, "Poller state changed");
        self.ctx.emit(NetworkEvent::PollerStateChanged {
            key: self.key.clone(),
            state,
        });
    }
}

/// Node choice for one polled account: stick to a node while it works,
/// never return to a failed one until the swarm is exhausted.
pub(crate) struct NodeSelector {
    account: AccountId,
    current: Option<Node>,
    failed: Vec<Node>,
}

impl NodeSelector {
    pub(crate) fn new(account: AccountId) -> Self {
        Self {
            account,
            current: None,
            failed: Vec::new(),
        }
    }

    pub(crate) fn account(&self) -> &AccountId {
        &self.account
    }

    /// The node to poll, resolving the swarm when there is none.
    pub(crate) async fn node(&mut self, api: &SnodeApi, status: &StateReporter) -> SwarmResult<Node> {
        if let Some(node) = &self.current {
            return Ok(node.clone());
        }
        status.set(PollerState::ResolvingSwarm);
        let resolver = &api.context().resolver;
        let mut node = resolver.random_swarm_node(&self.account, &self.failed).await?;
        if node.is_none() && !self.failed.is_empty() {
            debug!(account = %self.account.short(), "Swarm exhausted, starting over");
            self.failed.clear();
            node = resolver.random_swarm_node(&self.account, &self.failed).await?;
        }
        let node = node.ok_or_else(|| SwarmError::Generic("swarm has no usable node".into()))?;
        self.current = Some(node.clone());
        status.set(PollerState::Polling(node.clone()));
        Ok(node)
    }

    /// Abandon the current node after a failed cycle. The RPC layer already
    /// counted node faults; here the node only leaves this account's swarm.
    pub(crate) fn fail(&mut self, api: &SnodeApi, error: &SwarmError) {
        let Some(node) = self.current.take() else {
            return;
        };
        if matches!(error, SwarmError::ClockOutOfSync) {
            self.current = Some(node);
            return;
        }
        warn!(account = %self.account.short(), %node, error = %error, "Poll failed, switching node");
        if let Err(e) = api.context().resolver.invalidate(&self.account, &node) {
            warn!(error = %e, "Could not drop node from swarm");
        }
        self.failed.push(node);
    }
}

/// Drive `poller` until `cancel` fires or the poller reports removal.
///
/// `status` must carry the same `cancel` token (see
/// [`StateReporter::with_cancel`]); a cycle is never dropped midway.
pub async fn run_poller(mut poller: Box<dyn Poller>, status: StateReporter, cancel: CancellationToken) {
    let key = poller.key();
    info!(%key, "Poller started");
    while !cancel.is_cancelled() {
        let result = poller.poll_cycle(&status).await;
        match &result {
            Ok(CycleOutcome::Removed) => {
                status.set(PollerState::RemovedFromGroup);
                info!(%key, "Poller ended: removed from group");
                return;
            }
            Ok(CycleOutcome::Continue { received }) if *received > 0 => {
                debug!(%key, received, "Poll cycle delivered messages");
            }
            Ok(_) => {}
            Err(SwarmError::Cancelled) => break,
            Err(e) => debug!(%key, error = %e, "Poll cycle failed"),
        }
        let delay = poller.next_delay(&result);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    status.set(PollerState::Stopped);
    info!(%key, "Poller stopped");
}
