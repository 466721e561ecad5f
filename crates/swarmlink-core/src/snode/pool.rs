//! Global snode pool and per-node failure counters.
//!
//! The pool and the counters are the only state shared by every poller, so
//! both sit behind one mutex. The critical section never spans an `.await`
//! or a store call: callers snapshot what they need, release the lock, then
//! persist.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::seq::{IndexedRandom, SliceRandom};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::{SwarmError, SwarmResult};
use crate::onion::{OnionTransport, RpcMethod, RpcRequest};
use crate::storage::SwarmStore;
use crate::types::{AccountId, Node};

/// Address some seeds report for nodes without a public IP
const PLACEHOLDER_ADDRESS: &str = "0.0.0.0";

#[derive(Default)]
struct PoolState {
    nodes: Vec<Node>,
    failures: HashMap<Node, u32>,
}

/// The set of known storage nodes, independent of any account.
pub struct NodePool {
    state: Mutex<PoolState>,
    store: Arc<dyn SwarmStore>,
    seed_nodes: Vec<String>,
    min_pool_size: usize,
    failure_threshold: u32,
}

impl NodePool {
    /// Create a pool, loading any previously persisted nodes.
    pub fn new(store: Arc<dyn SwarmStore>, config: &ClientConfig) -> SwarmResult<Self> {
        let nodes = store.load_pool()?;
        debug!(count = nodes.len(), "Loaded snode pool");
        Ok(Self {
            state: Mutex::new(PoolState {
                nodes,
                failures: HashMap::new(),
            }),
            store,
            seed_nodes: config.seed_nodes.clone(),
            min_pool_size: config.min_pool_size,
            failure_threshold: config.failure_threshold,
        })
    }

    pub fn store(&self) -> &Arc<dyn SwarmStore> {
        &self.store
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.state.lock().nodes.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, node: &Node) -> bool {
        self.state.lock().nodes.contains(node)
    }

    pub fn random_node(&self) -> Option<Node> {
        let state = self.state.lock();
        state.nodes.choose(&mut rand::rng()).cloned()
    }

    /// Up to `count` distinct random nodes, none of them in `exclude`.
    pub fn random_nodes(&self, count: usize, exclude: &[Node]) -> Vec<Node> {
        let mut candidates: Vec<Node> = {
            let state = self.state.lock();
            state
                .nodes
                .iter()
                .filter(|n| !exclude.contains(n))
                .cloned()
                .collect()
        };
        candidates.shuffle(&mut rand::rng());
        candidates.truncate(count);
        candidates
    }

    /// Replace the whole pool and persist it.
    pub fn replace(&self, nodes: Vec<Node>) -> SwarmResult<()> {
        {
            let mut state = self.state.lock();
            state.nodes = nodes.clone();
            state.failures.retain(|node, _| nodes.contains(node));
        }
        self.store.save_pool(&nodes)
    }

    /// Refill the pool from a random seed when it has fallen below the
    /// minimum size.
    pub async fn refresh_if_needed(&self, transport: &dyn OnionTransport) -> SwarmResult<()> {
        if self.len() >= self.min_pool_size {
            return Ok(());
        }
        let seed = self
            .seed_nodes
            .choose(&mut rand::rng())
            .cloned()
            .ok_or_else(|| SwarmError::Generic("no seed nodes configured".into()))?;

        info!(%seed, current = self.len(), "Refreshing snode pool from seed");
        let request = RpcRequest {
            method: RpcMethod::GetServiceNodes,
            params: json!({
                "active_only": true,
                "limit": 256,
                "fields": {
                    "public_ip": true,
                    "storage_port": true,
                    "pubkey_x25519": true,
                    "pubkey_ed25519": true,
                },
            }),
        };
        let response = transport.send_direct(&seed, request).await?;
        if !response.is_success() {
            return Err(SwarmError::Generic(format!(
                "seed {} answered status {}",
                seed, response.status
            )));
        }

        let nodes = parse_service_nodes(&response.body)?;
        info!(count = nodes.len(), "Snode pool refreshed");
        self.replace(nodes)
    }

    pub fn failure_count(&self, node: &Node) -> u32 {
        self.state.lock().failures.get(node).copied().unwrap_or(0)
    }

    /// Count one failure against `node`.
    ///
    /// At the threshold the node leaves the pool, the named account's swarm
    /// and every other cached swarm, and its counter resets to zero. Returns
    /// `true` when the node was evicted.
    pub fn record_failure(&self, node: &Node, account: Option<&AccountId>) -> SwarmResult<bool> {
        let evicted_pool = {
            let mut state = self.state.lock();
            let count = state.failures.entry(node.clone()).or_insert(0);
            *count += 1;
            debug!(%node, failures = *count, "Recorded snode failure");
            if *count < self.failure_threshold {
                return Ok(false);
            }
            state.failures.insert(node.clone(), 0);
            state.nodes.retain(|n| n != node);
            state.nodes.clone()
        };

        warn!(%node, "Evicting snode after repeated failures");
        self.store.save_pool(&evicted_pool)?;

        let mut accounts = self.store.swarm_accounts()?;
        if let Some(account) = account {
            if !accounts.contains(account) {
                accounts.push(account.clone());
            }
        }
        for account in accounts {
            if let Some(mut swarm) = self.store.load_swarm(&account)? {
                let before = swarm.len();
                swarm.retain(|n| n != node);
                if swarm.len() != before {
                    self.store.save_swarm(&account, &swarm)?;
                }
            }
        }
        Ok(true)
    }

    /// Remove a node from the pool outright.
    pub fn drop_node(&self, node: &Node) -> SwarmResult<()> {
        let nodes = {
            let mut state = self.state.lock();
            state.nodes.retain(|n| n != node);
            state.failures.remove(node);
            state.nodes.clone()
        };
        self.store.save_pool(&nodes)
    }
}

/// Parse `result.service_node_states` from a seed response.
pub fn parse_service_nodes(body: &Value) -> SwarmResult<Vec<Node>> {
    let states = body
        .get("result")
        .and_then(|r| r.get("service_node_states"))
        .and_then(Value::as_array)
        .ok_or_else(|| SwarmError::Generic("seed response has no service_node_states".into()))?;

    let nodes: Vec<Node> = states
        .iter()
        .filter_map(|entry| {
            let address = entry.get("public_ip")?.as_str()?;
            if address.is_empty() || address == PLACEHOLDER_ADDRESS {
                return None;
            }
            let port = parse_port(entry.get("storage_port")?)?;
            let ed25519 = entry.get("pubkey_ed25519")?.as_str()?;
            let x25519 = entry.get("pubkey_x25519")?.as_str()?;
            Some(Node::new(address, port, ed25519, x25519))
        })
        .collect();

    if nodes.is_empty() {
        return Err(SwarmError::Generic("seed returned an empty node list".into()));
    }
    Ok(nodes)
}

/// Ports arrive as numbers from seeds and as strings from `get_swarm`.
pub(crate) fn parse_port(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::IdPrefix;

    fn node(n: u8) -> Node {
        Node::new(format!("10.0.0.{}", n), 22021, format!("ed{}", n), format!("x{}", n))
    }

    fn pool_with(nodes: Vec<Node>) -> NodePool {
        let store: Arc<dyn SwarmStore> = Arc::new(MemoryStore::new());
        store.save_pool(&nodes).unwrap();
        NodePool::new(store, &ClientConfig::default()).unwrap()
    }

    #[test]
    fn test_parse_service_nodes_discards_placeholders() {
        let body = json!({
            "result": {
                "service_node_states": [
                    {"public_ip": "1.2.3.4", "storage_port": 22021, "pubkey_ed25519": "e1", "pubkey_x25519": "x1"},
                    {"public_ip": "0.0.0.0", "storage_port": 22021, "pubkey_ed25519": "e2", "pubkey_x25519": "x2"},
                    {"public_ip": "5.6.7.8", "storage_port": 22021, "pubkey_ed25519": "e3"},
                ]
            }
        });
        let nodes = parse_service_nodes(&body).unwrap();
        assert_eq!(nodes, vec![Node::new("1.2.3.4", 22021, "e1", "x1")]);
    }

    #[test]
    fn test_parse_service_nodes_empty_is_error() {
        let body = json!({"result": {"service_node_states": []}});
        assert!(matches!(parse_service_nodes(&body), Err(SwarmError::Generic(_))));
        assert!(parse_service_nodes(&json!({"oops": 1})).is_err());
    }

    #[test]
    fn test_random_nodes_excludes_and_is_distinct() {
        let pool = pool_with((1..=5).map(node).collect());
        let picked = pool.random_nodes(3, &[node(1), node(2)]);
        assert_eq!(picked.len(), 3);
        assert!(!picked.contains(&node(1)));
        assert!(!picked.contains(&node(2)));
        let mut dedup = picked.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), 3);
    }

    #[test]
    fn test_failure_threshold_evicts_everywhere() {
        let pool = pool_with((1..=4).map(node).collect());
        let a = AccountId::new(IdPrefix::Standard, [1; 32]);
        let b = AccountId::new(IdPrefix::Standard, [2; 32]);
        pool.store().save_swarm(&a, &[node(1), node(2)]).unwrap();
        pool.store().save_swarm(&b, &[node(1), node(3)]).unwrap();

        assert!(!pool.record_failure(&node(1), Some(&a)).unwrap());
        assert!(!pool.record_failure(&node(1), None).unwrap());
        assert!(pool.contains(&node(1)));
        assert!(pool.record_failure(&node(1), Some(&a)).unwrap());

        assert!(!pool.contains(&node(1)));
        assert_eq!(pool.failure_count(&node(1)), 0);
        assert_eq!(pool.store().load_swarm(&a).unwrap().unwrap(), vec![node(2)]);
        assert_eq!(pool.store().load_swarm(&b).unwrap().unwrap(), vec![node(3)]);
        assert!(!pool.store().load_pool().unwrap().contains(&node(1)));
    }

    #[test]
    fn test_replace_persists() {
        let pool = pool_with(vec![]);
        pool.replace(vec![node(9)]).unwrap();
        assert_eq!(pool.store().load_pool().unwrap(), vec![node(9)]);
        assert_eq!(pool.random_node(), Some(node(9)));
    }
}
