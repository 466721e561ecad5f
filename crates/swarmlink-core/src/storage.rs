//! Persistent storage using redb.
//!
//! The client caches the following through [`SwarmStore`]:
//! - the global snode pool
//! - per-account swarms
//! - poll cursors keyed by (node, account, namespace)
//! - per-account seen-hash sets
//! - config dumps and the hashes of their pushed messages
//! - the network clock offset, the local identity seed, community cursors
//!
//! [`Storage`] is the redb implementation; [`MemoryStore`] keeps everything in
//! process for tests and the simulator.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::SwarmResult;
use crate::types::{AccountId, Namespace, Node};

mod memory;

pub use memory::MemoryStore;

type BytesTable = TableDefinition<'static, &'static str, &'static [u8]>;

const POOL_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("snode_pool");
const SWARMS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("swarms");
const CURSORS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("poll_cursors");
const SEEN_TABLE: TableDefinition<&str, u64> = TableDefinition::new("seen_hashes");
const CONFIG_DUMPS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("config_dumps");
const CONFIG_HASHES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("config_hashes");
const SETTINGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("settings");

/// Cursor state for one community room
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommunityCursor {
    /// Highest message seqno seen in the room
    pub last_seqno: i64,
    /// Highest inbox message id
    pub last_inbox_id: i64,
    /// Highest outbox message id
    pub last_outbox_id: i64,
}

/// Storage collaborator used by every component of the client.
///
/// Implementations must be safe to share between pollers; each call is its
/// own transaction.
pub trait SwarmStore: Send + Sync {
    fn load_pool(&self) -> SwarmResult<Vec<Node>>;
    fn save_pool(&self, nodes: &[Node]) -> SwarmResult<()>;

    fn load_swarm(&self, account: &AccountId) -> SwarmResult<Option<Vec<Node>>>;
    fn save_swarm(&self, account: &AccountId, nodes: &[Node]) -> SwarmResult<()>;
    /// Accounts with a cached swarm
    fn swarm_accounts(&self) -> SwarmResult<Vec<AccountId>>;

    fn last_hash(&self, node: &Node, account: &AccountId, namespace: Namespace)
        -> SwarmResult<Option<String>>;
    fn set_last_hash(
        &self,
        node: &Node,
        account: &AccountId,
        namespace: Namespace,
        hash: &str,
    ) -> SwarmResult<()>;

    /// Add hashes to the account's seen set, returning those that were new.
    fn mark_seen(&self, account: &AccountId, hashes: &[String]) -> SwarmResult<HashSet<String>>;
    fn seen_count(&self, account: &AccountId) -> SwarmResult<usize>;

    fn load_config_dump(&self, account: &AccountId, namespace: Namespace) -> SwarmResult<Option<Vec<u8>>>;
    fn save_config_dump(&self, account: &AccountId, namespace: Namespace, dump: &[u8]) -> SwarmResult<()>;

    /// Hashes of the pushed messages currently holding a config
    fn config_hashes(&self, account: &AccountId, namespace: Namespace) -> SwarmResult<Vec<String>>;
    fn set_config_hashes(
        &self,
        account: &AccountId,
        namespace: Namespace,
        hashes: &[String],
    ) -> SwarmResult<()>;

    fn load_setting(&self, key: &str) -> SwarmResult<Option<Vec<u8>>>;
    fn save_setting(&self, key: &str, value: &[u8]) -> SwarmResult<()>;
}

/// Setting keys used through [`SwarmStore::load_setting`]
pub mod settings {
    pub const CLOCK_OFFSET: &str = "clock_offset_ms";
    pub const IDENTITY_SEED: &str = "identity_seed";

    pub fn community_cursor(server: &str, room: &str) -> String {
        format!("community/{}/{}", server, room)
    }

    pub fn last_message_at(account: &str) -> String {
        format!("last_message_at/{}", account)
    }
}

/// Typed helpers over the raw setting bytes
pub trait SwarmStoreExt: SwarmStore {
    fn load_json<T: DeserializeOwned>(&self, key: &str) -> SwarmResult<Option<T>> {
        match self.load_setting(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_json<T: Serialize>(&self, key: &str, value: &T) -> SwarmResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.save_setting(key, &bytes)
    }
}

impl<S: SwarmStore + ?Sized> SwarmStoreExt for S {}

fn node_key(node: &Node) -> String {
    format!("{}:{}:{}", node.address, node.port, node.ed25519_key)
}

fn cursor_key(node: &Node, account: &AccountId, namespace: Namespace) -> String {
    format!("{}/{}/{}", account, namespace, node_key(node))
}

fn seen_key(account: &AccountId, hash: &str) -> String {
    format!("{}/{}", account, hash)
}

fn config_key(account: &AccountId, namespace: Namespace) -> String {
    format!("{}/{}", account, namespace)
}

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Create a new storage instance at the given path, creating parent
    /// directories and all tables.
    pub fn new(path: impl AsRef<Path>) -> SwarmResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(POOL_TABLE)?;
            let _ = write_txn.open_table(SWARMS_TABLE)?;
            let _ = write_txn.open_table(CURSORS_TABLE)?;
            let _ = write_txn.open_table(SEEN_TABLE)?;
            let _ = write_txn.open_table(CONFIG_DUMPS_TABLE)?;
            let _ = write_txn.open_table(CONFIG_HASHES_TABLE)?;
            let _ = write_txn.open_table(SETTINGS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    const POOL_KEY: &'static str = "pool";

    fn put_bytes(&self, table: BytesTable, key: &str, value: &[u8]) -> SwarmResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(table)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_bytes(&self, table: BytesTable, key: &str) -> SwarmResult<Option<Vec<u8>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(table)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }
}

impl SwarmStore for Storage {
    fn load_pool(&self) -> SwarmResult<Vec<Node>> {
        match self.get_bytes(POOL_TABLE, Self::POOL_KEY)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    fn save_pool(&self, nodes: &[Node]) -> SwarmResult<()> {
        let data = serde_json::to_vec(nodes)?;
        self.put_bytes(POOL_TABLE, Self::POOL_KEY, &data)
    }

    fn load_swarm(&self, account: &AccountId) -> SwarmResult<Option<Vec<Node>>> {
        match self.get_bytes(SWARMS_TABLE, &account.to_hex())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_swarm(&self, account: &AccountId, nodes: &[Node]) -> SwarmResult<()> {
        let data = serde_json::to_vec(nodes)?;
        self.put_bytes(SWARMS_TABLE, &account.to_hex(), &data)
    }

    fn swarm_accounts(&self) -> SwarmResult<Vec<AccountId>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SWARMS_TABLE)?;

        let mut accounts = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            accounts.push(key.value().parse()?);
        }
        Ok(accounts)
    }

    fn last_hash(
        &self,
        node: &Node,
        account: &AccountId,
        namespace: Namespace,
    ) -> SwarmResult<Option<String>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(CURSORS_TABLE)?;
        let key = cursor_key(node, account, namespace);
        Ok(table.get(key.as_str())?.map(|v| v.value().to_string()))
    }

    fn set_last_hash(
        &self,
        node: &Node,
        account: &AccountId,
        namespace: Namespace,
        hash: &str,
    ) -> SwarmResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(CURSORS_TABLE)?;
            let key = cursor_key(node, account, namespace);
            table.insert(key.as_str(), hash)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn mark_seen(&self, account: &AccountId, hashes: &[String]) -> SwarmResult<HashSet<String>> {
        let now = crate::types::now_ms();
        let mut fresh = HashSet::new();
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SEEN_TABLE)?;
            for hash in hashes {
                let key = seen_key(account, hash);
                if table.get(key.as_str())?.is_none() {
                    table.insert(key.as_str(), now)?;
                    fresh.insert(hash.clone());
                }
            }
        }
        write_txn.commit()?;
        Ok(fresh)
    }

    fn seen_count(&self, account: &AccountId) -> SwarmResult<usize> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SEEN_TABLE)?;
        let prefix = format!("{}/", account);

        let mut count = 0;
        for entry in table.range(prefix.as_str()..)? {
            let (key, _) = entry?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    fn load_config_dump(&self, account: &AccountId, namespace: Namespace) -> SwarmResult<Option<Vec<u8>>> {
        self.get_bytes(CONFIG_DUMPS_TABLE, &config_key(account, namespace))
    }

    fn save_config_dump(&self, account: &AccountId, namespace: Namespace, dump: &[u8]) -> SwarmResult<()> {
        self.put_bytes(CONFIG_DUMPS_TABLE, &config_key(account, namespace), dump)
    }

    fn config_hashes(&self, account: &AccountId, namespace: Namespace) -> SwarmResult<Vec<String>> {
        match self.get_bytes(CONFIG_HASHES_TABLE, &config_key(account, namespace))? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    fn set_config_hashes(
        &self,
        account: &AccountId,
        namespace: Namespace,
        hashes: &[String],
    ) -> SwarmResult<()> {
        let data = serde_json::to_vec(hashes)?;
        self.put_bytes(CONFIG_HASHES_TABLE, &config_key(account, namespace), &data)
    }

    fn load_setting(&self, key: &str) -> SwarmResult<Option<Vec<u8>>> {
        self.get_bytes(SETTINGS_TABLE, key)
    }

    fn save_setting(&self, key: &str, value: &[u8]) -> SwarmResult<()> {
        self.put_bytes(SETTINGS_TABLE, key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IdPrefix;
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let storage = Storage::new(&db_path).unwrap();
        (storage, temp_dir)
    }

    fn account(n: u8) -> AccountId {
        AccountId::new(IdPrefix::Standard, [n; 32])
    }

    fn node(n: u8) -> Node {
        Node::new(format!("10.0.0.{}", n), 22021, format!("ed{}", n), format!("x{}", n))
    }

    #[test]
    fn test_storage_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("a").join("b").join("db.redb");
        assert!(Storage::new(&nested).is_ok());
        assert!(nested.exists());
    }

    #[test]
    fn test_pool_roundtrip() {
        let (storage, _dir) = create_test_storage();
        assert!(storage.load_pool().unwrap().is_empty());
        storage.save_pool(&[node(1), node(2)]).unwrap();
        assert_eq!(storage.load_pool().unwrap(), vec![node(1), node(2)]);
    }

    #[test]
    fn test_swarm_roundtrip_and_listing() {
        let (storage, _dir) = create_test_storage();
        storage.save_swarm(&account(1), &[node(1)]).unwrap();
        storage.save_swarm(&account(2), &[node(2), node(3)]).unwrap();
        assert_eq!(storage.load_swarm(&account(2)).unwrap().unwrap().len(), 2);
        assert!(storage.load_swarm(&account(3)).unwrap().is_none());
        let mut accounts = storage.swarm_accounts().unwrap();
        accounts.sort();
        assert_eq!(accounts, vec![account(1), account(2)]);
    }

    #[test]
    fn test_cursor_isolated_per_namespace() {
        let (storage, _dir) = create_test_storage();
        storage
            .set_last_hash(&node(1), &account(1), Namespace::DEFAULT, "h1")
            .unwrap();
        assert_eq!(
            storage.last_hash(&node(1), &account(1), Namespace::DEFAULT).unwrap(),
            Some("h1".to_string())
        );
        assert!(storage
            .last_hash(&node(1), &account(1), Namespace::CONTACTS)
            .unwrap()
            .is_none());
        assert!(storage
            .last_hash(&node(2), &account(1), Namespace::DEFAULT)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_mark_seen_returns_only_new_hashes() {
        let (storage, _dir) = create_test_storage();
        let first = storage
            .mark_seen(&account(1), &["a".into(), "b".into()])
            .unwrap();
        assert_eq!(first.len(), 2);
        let second = storage
            .mark_seen(&account(1), &["b".into(), "c".into()])
            .unwrap();
        assert_eq!(second, HashSet::from(["c".to_string()]));
        assert_eq!(storage.seen_count(&account(1)).unwrap(), 3);
        assert_eq!(storage.seen_count(&account(2)).unwrap(), 0);
    }

    #[test]
    fn test_config_dump_and_hashes() {
        let (storage, _dir) = create_test_storage();
        storage
            .save_config_dump(&account(1), Namespace::CONTACTS, b"dump")
            .unwrap();
        storage
            .set_config_hashes(&account(1), Namespace::CONTACTS, &["h".into()])
            .unwrap();
        assert_eq!(
            storage.load_config_dump(&account(1), Namespace::CONTACTS).unwrap(),
            Some(b"dump".to_vec())
        );
        assert_eq!(
            storage.config_hashes(&account(1), Namespace::CONTACTS).unwrap(),
            vec!["h".to_string()]
        );
        assert!(storage
            .config_hashes(&account(1), Namespace::USER_PROFILE)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_storage_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        {
            let storage = Storage::new(&db_path).unwrap();
            storage.save_pool(&[node(4)]).unwrap();
            storage
                .save_json(settings::CLOCK_OFFSET, &1234i64)
                .unwrap();
        }
        let storage = Storage::new(&db_path).unwrap();
        assert_eq!(storage.load_pool().unwrap(), vec![node(4)]);
        assert_eq!(
            storage.load_json::<i64>(settings::CLOCK_OFFSET).unwrap(),
            Some(1234)
        );
    }
}
