//! Background manager for the running pollers.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  PollerManager                                                  │
//! │  ├── pollers: HashMap<key, PollerSlot>                          │
//! │  │   ├── task: JoinHandle running run_poller                    │
//! │  │   ├── cancel: CancellationToken                              │
//! │  │   └── state: StateReporter                                   │
//! │  └── ctx.events: PollerStateChanged for every transition        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{run_poller, Poller, StateReporter};
use crate::context::SwarmContext;
use crate::events::PollerState;

struct PollerSlot {
    task: JoinHandle<()>,
    cancel: CancellationToken,
    state: StateReporter,
}

/// Starts, stops and reports on poll loops, one task per key.
pub struct PollerManager {
    ctx: Arc<SwarmContext>,
    pollers: Arc<RwLock<HashMap<String, PollerSlot>>>,
}

impl PollerManager {
    pub fn new(ctx: Arc<SwarmContext>) -> Self {
        Self {
            ctx,
            pollers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start `poller` in the background.
    ///
    /// Returns `false` if a poller with the same key is already running.
    pub async fn start(&self, poller: Box<dyn Poller>) -> bool {
        let key = poller.key();
        let mut pollers = self.pollers.write().await;
        if let Some(slot) = pollers.get(&key) {
            if !slot.task.is_finished() {
                debug!(%key, "Poller already running");
                return false;
            }
        }

        info!(%key, "Starting poller");
        let cancel = CancellationToken::new();
        let state = StateReporter::new(key.clone(), self.ctx.clone()).with_cancel(cancel.clone());
        let task = tokio::spawn(run_poller(poller, state.clone(), cancel.clone()));
        pollers.insert(key, PollerSlot { task, cancel, state });
        true
    }

    /// Stop the poller under `key` and wait for its task to end.
    ///
    /// Returns `false` if no such poller was running.
    pub async fn stop(&self, key: &str) -> bool {
        let slot = {
            let mut pollers = self.pollers.write().await;
            pollers.remove(key)
        };
        let Some(slot) = slot else {
            debug!(%key, "Poller not running");
            return false;
        };

        info!(%key, "Stopping poller");
        slot.cancel.cancel();
        if let Err(e) = slot.task.await {
            warn!(%key, error = %e, "Poller task ended abnormally");
        }
        // A poller that already ended on its own keeps its final state.
        if slot.state.get() != PollerState::RemovedFromGroup {
            slot.state.set(PollerState::Stopped);
        }
        true
    }

    /// Current state of a poller; `Idle` for unknown keys.
    pub async fn state(&self, key: &str) -> PollerState {
        let pollers = self.pollers.read().await;
        pollers
            .get(key)
            .map(|slot| slot.state.get())
            .unwrap_or(PollerState::Idle)
    }

    pub async fn is_running(&self, key: &str) -> bool {
        let pollers = self.pollers.read().await;
        pollers.get(key).is_some_and(|slot| !slot.task.is_finished())
    }

    pub async fn running_count(&self) -> usize {
        let pollers = self.pollers.read().await;
        pollers.values().filter(|slot| !slot.task.is_finished()).count()
    }

    pub async fn keys(&self) -> Vec<String> {
        let pollers = self.pollers.read().await;
        let mut keys: Vec<String> = pollers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Stop every poller.
    pub async fn shutdown(&self) {
        info!("Shutting down PollerManager");
        for key in self.keys().await {
            self.stop(&key).await;
        }
    }
}
