//! Per-account swarm resolution.

use std::sync::Arc;

use rand::seq::IndexedRandom;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::pool::{parse_port, NodePool};
use crate::config::ClientConfig;
use crate::error::{SwarmError, SwarmResult};
use crate::onion::{OnionClient, RpcMethod};
use crate::storage::SwarmStore;
use crate::types::{AccountId, Node, Swarm};

/// Resolves and caches the replica set of each account.
///
/// A cached swarm is trusted until something invalidates it, but only if it
/// holds at least `min_swarm_size` nodes; a short swarm is kept for use and
/// re-queried on the next resolution.
pub struct SwarmResolver {
    onion: Arc<OnionClient>,
    min_swarm_size: usize,
    max_attempts: usize,
}

impl SwarmResolver {
    pub fn new(onion: Arc<OnionClient>, config: &ClientConfig) -> Self {
        Self {
            onion,
            min_swarm_size: config.min_swarm_size,
            max_attempts: config.max_retry_count,
        }
    }

    fn pool(&self) -> &Arc<NodePool> {
        self.onion.pool()
    }

    fn store(&self) -> &Arc<dyn SwarmStore> {
        self.pool().store()
    }

    /// Cached swarm without any network activity
    pub fn cached(&self, account: &AccountId) -> SwarmResult<Swarm> {
        Ok(self.store().load_swarm(account)?.unwrap_or_default())
    }

    /// Return the account's swarm, asking the network when the cache is
    /// missing or too small.
    pub async fn resolve_swarm(&self, account: &AccountId) -> SwarmResult<Swarm> {
        if let Some(swarm) = self.store().load_swarm(account)? {
            if swarm.len() >= self.min_swarm_size {
                return Ok(swarm);
            }
            debug!(account = %account.short(), size = swarm.len(), "Cached swarm too small, re-querying");
        }

        self.pool()
            .refresh_if_needed(self.onion.transport().as_ref())
            .await?;

        let mut tried: Vec<Node> = Vec::new();
        let mut last_error = SwarmError::Generic("snode pool is empty".into());
        for _ in 0..self.max_attempts {
            let Some(node) = self.pool().random_nodes(1, &tried).pop() else {
                break;
            };
            tried.push(node.clone());

            match self.fetch_swarm(&node, account).await {
                Ok(swarm) => {
                    info!(account = %account.short(), size = swarm.len(), "Resolved swarm");
                    self.store().save_swarm(account, &swarm)?;
                    return Ok(swarm);
                }
                Err(e) if e.is_retryable() => {
                    warn!(%node, error = %e, "Swarm lookup failed, trying another node");
                    self.pool().record_failure(&node, None)?;
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(SwarmError::Generic(format!(
            "swarm lookup failed after {} attempts: {}",
            tried.len(),
            last_error
        )))
    }

    async fn fetch_swarm(&self, node: &Node, account: &AccountId) -> SwarmResult<Swarm> {
        let response = self
            .onion
            .send(RpcMethod::GetSwarm, json!({ "pubKey": account.to_hex() }), node, None)
            .await?;
        if !response.is_success() {
            return Err(SwarmError::NodeFault {
                status: response.status,
                message: "get_swarm rejected".into(),
            });
        }
        parse_swarm(&response.body).ok_or_else(|| SwarmError::NodeFault {
            status: response.status,
            message: "unparsable swarm".into(),
        })
    }

    /// A random node of the account's swarm that is not in `used`.
    pub async fn random_swarm_node(&self, account: &AccountId, used: &[Node]) -> SwarmResult<Option<Node>> {
        let swarm = self.resolve_swarm(account).await?;
        let unused: Vec<&Node> = swarm.iter().filter(|n| !used.contains(n)).collect();
        Ok(unused.choose(&mut rand::rng()).map(|n| (*n).clone()))
    }

    /// Remove `node` from the cached swarm of `account` only.
    pub fn invalidate(&self, account: &AccountId, node: &Node) -> SwarmResult<()> {
        if let Some(mut swarm) = self.store().load_swarm(account)? {
            swarm.retain(|n| n != node);
            debug!(account = %account.short(), %node, remaining = swarm.len(), "Dropped node from swarm");
            self.store().save_swarm(account, &swarm)?;
        }
        Ok(())
    }

    /// Replace the cached swarm wholesale (421 with a new swarm attached).
    pub fn replace_swarm(&self, account: &AccountId, swarm: Swarm) -> SwarmResult<()> {
        info!(account = %account.short(), size = swarm.len(), "Replacing swarm");
        self.store().save_swarm(account, &swarm)
    }

    /// Failure bookkeeping with account context, see [`NodePool::record_failure`].
    pub fn record_failure(&self, node: &Node, account: Option<&AccountId>) -> SwarmResult<bool> {
        self.pool().record_failure(node, account)
    }
}

/// Parse the `snodes` array of a `get_swarm` (or 421) body.
pub fn parse_swarm(body: &Value) -> Option<Swarm> {
    let snodes = body.get("snodes")?.as_array()?;
    Some(
        snodes
            .iter()
            .filter_map(|entry| {
                let address = entry.get("ip")?.as_str()?;
                if address.is_empty() || address == "0.0.0.0" {
                    return None;
                }
                let port = parse_port(entry.get("port")?)?;
                let ed25519 = entry.get("pubkey_ed25519")?.as_str()?;
                let x25519 = entry.get("pubkey_x25519")?.as_str()?;
                Some(Node::new(address, port, ed25519, x25519))
            })
            .collect(),
    )
}
