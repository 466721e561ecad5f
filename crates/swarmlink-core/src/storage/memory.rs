//! In-process [`SwarmStore`] for tests and the simulator.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use super::{config_key, cursor_key, SwarmStore};
use crate::error::SwarmResult;
use crate::types::{AccountId, Namespace, Node};

#[derive(Default)]
struct Inner {
    pool: Vec<Node>,
    swarms: HashMap<AccountId, Vec<Node>>,
    cursors: HashMap<String, String>,
    seen: HashMap<AccountId, HashSet<String>>,
    dumps: HashMap<String, Vec<u8>>,
    config_hashes: HashMap<String, Vec<String>>,
    settings: HashMap<String, Vec<u8>>,
}

/// Non-persistent store backed by hash maps
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SwarmStore for MemoryStore {
    fn load_pool(&self) -> SwarmResult<Vec<Node>> {
        Ok(self.inner.read().pool.clone())
    }

    fn save_pool(&self, nodes: &[Node]) -> SwarmResult<()> {
        self.inner.write().pool = nodes.to_vec();
        Ok(())
    }

    fn load_swarm(&self, account: &AccountId) -> SwarmResult<Option<Vec<Node>>> {
        Ok(self.inner.read().swarms.get(account).cloned())
    }

    fn save_swarm(&self, account: &AccountId, nodes: &[Node]) -> SwarmResult<()> {
        self.inner.write().swarms.insert(account.clone(), nodes.to_vec());
        Ok(())
    }

    fn swarm_accounts(&self) -> SwarmResult<Vec<AccountId>> {
        Ok(self.inner.read().swarms.keys().cloned().collect())
    }

    fn last_hash(
        &self,
        node: &Node,
        account: &AccountId,
        namespace: Namespace,
    ) -> SwarmResult<Option<String>> {
        Ok(self
            .inner
            .read()
            .cursors
            .get(&cursor_key(node, account, namespace))
            .cloned())
    }

    fn set_last_hash(
        &self,
        node: &Node,
        account: &AccountId,
        namespace: Namespace,
        hash: &str,
    ) -> SwarmResult<()> {
        self.inner
            .write()
            .cursors
            .insert(cursor_key(node, account, namespace), hash.to_string());
        Ok(())
    }

    fn mark_seen(&self, account: &AccountId, hashes: &[String]) -> SwarmResult<HashSet<String>> {
        let mut inner = self.inner.write();
        let seen = inner.seen.entry(account.clone()).or_default();
        Ok(hashes
            .iter()
            .filter(|h| seen.insert((*h).clone()))
            .cloned()
            .collect())
    }

    fn seen_count(&self, account: &AccountId) -> SwarmResult<usize> {
        Ok(self.inner.read().seen.get(account).map_or(0, |s| s.len()))
    }

    fn load_config_dump(&self, account: &AccountId, namespace: Namespace) -> SwarmResult<Option<Vec<u8>>> {
        Ok(self.inner.read().dumps.get(&config_key(account, namespace)).cloned())
    }

    fn save_config_dump(&self, account: &AccountId, namespace: Namespace, dump: &[u8]) -> SwarmResult<()> {
        self.inner
            .write()
            .dumps
            .insert(config_key(account, namespace), dump.to_vec());
        Ok(())
    }

    fn config_hashes(&self, account: &AccountId, namespace: Namespace) -> SwarmResult<Vec<String>> {
        Ok(self
            .inner
            .read()
            .config_hashes
            .get(&config_key(account, namespace))
            .cloned()
            .unwrap_or_default())
    }

    fn set_config_hashes(
        &self,
        account: &AccountId,
        namespace: Namespace,
        hashes: &[String],
    ) -> SwarmResult<()> {
        self.inner
            .write()
            .config_hashes
            .insert(config_key(account, namespace), hashes.to_vec());
        Ok(())
    }

    fn load_setting(&self, key: &str) -> SwarmResult<Option<Vec<u8>>> {
        Ok(self.inner.read().settings.get(key).cloned())
    }

    fn save_setting(&self, key: &str, value: &[u8]) -> SwarmResult<()> {
        self.inner
            .write()
            .settings
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IdPrefix;

    #[test]
    fn test_mark_seen_is_idempotent() {
        let store = MemoryStore::new();
        let account = AccountId::new(IdPrefix::Standard, [1; 32]);
        let hashes = vec!["x".to_string(), "y".to_string(), "x".to_string()];
        assert_eq!(store.mark_seen(&account, &hashes).unwrap().len(), 2);
        assert!(store.mark_seen(&account, &hashes).unwrap().is_empty());
        assert_eq!(store.seen_count(&account).unwrap(), 2);
    }
}
