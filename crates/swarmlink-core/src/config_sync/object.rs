//! Versioned, encrypted config state with a convergent merge.
//!
//! Every field carries the `(seqno, tiebreak)` of the push that last wrote
//! it. The tiebreak is the BLAKE3 hash of that push's ciphertext, so two
//! devices that write the same field at the same seqno still agree on a
//! winner. Merging keeps, per field, the entry with the larger pair; the
//! result does not depend on merge order.
//!
//! ```text
//!  set() ──► dirty ──push()──► pending ──confirm_pushed()──► confirmed
//!                     ▲           │
//!                     └───────────┘ returned unchanged until confirmed
//!                                   or superseded by an edit or a merge
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::crypto::SymmetricCipher;
use crate::error::{SwarmError, SwarmResult};
use crate::types::Namespace;

/// Which config a [`ConfigObject`] holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfigKind {
    UserProfile,
    Contacts,
    ConvoInfoVolatile,
    UserGroups,
    GroupKeys,
    GroupInfo,
    GroupMembers,
}

impl ConfigKind {
    pub fn namespace(self) -> Namespace {
        match self {
            ConfigKind::UserProfile => Namespace::USER_PROFILE,
            ConfigKind::Contacts => Namespace::CONTACTS,
            ConfigKind::ConvoInfoVolatile => Namespace::CONVO_INFO_VOLATILE,
            ConfigKind::UserGroups => Namespace::USER_GROUPS,
            ConfigKind::GroupKeys => Namespace::ENCRYPTION_KEYS,
            ConfigKind::GroupInfo => Namespace::CLOSED_GROUP_INFO,
            ConfigKind::GroupMembers => Namespace::CLOSED_GROUP_MEMBERS,
        }
    }

    pub fn from_namespace(namespace: Namespace) -> Option<Self> {
        [
            ConfigKind::UserProfile,
            ConfigKind::Contacts,
            ConfigKind::ConvoInfoVolatile,
            ConfigKind::UserGroups,
            ConfigKind::GroupKeys,
            ConfigKind::GroupInfo,
            ConfigKind::GroupMembers,
        ]
        .into_iter()
        .find(|kind| kind.namespace() == namespace)
    }
}

/// A single config field value. `Deleted` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigValue {
    Text(String),
    Int(i64),
    Bytes(Vec<u8>),
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Entry {
    value: ConfigValue,
    seqno: u64,
    tiebreak: [u8; 32],
}

impl Entry {
    fn version(&self) -> (u64, [u8; 32]) {
        (self.seqno, self.tiebreak)
    }
}

/// Field as sent on the wire. A missing tiebreak means "written by this
/// push" and resolves to the hash of the carrying ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireEntry {
    value: ConfigValue,
    seqno: u64,
    tiebreak: Option<[u8; 32]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireConfig {
    kind: ConfigKind,
    seqno: u64,
    fields: BTreeMap<String, WireEntry>,
}

/// A config message retrieved from the swarm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigMessage {
    pub hash: String,
    /// Raw ciphertext
    pub data: Vec<u8>,
}

/// Result of [`ConfigObject::push`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushData {
    pub ciphertext: Vec<u8>,
    pub seqno: u64,
    /// Hashes of older pushes that can be deleted once this one is stored
    pub obsolete_hashes: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct Dump {
    kind: ConfigKind,
    seqno: u64,
    confirmed_seqno: u64,
    fields: BTreeMap<String, Entry>,
    dirty: BTreeSet<String>,
    needs_push: bool,
    pending: Option<PushData>,
    hashes: BTreeMap<String, u64>,
}

/// One encrypted config, see the module docs.
#[derive(Debug, Clone)]
pub struct ConfigObject {
    kind: ConfigKind,
    /// Decryption keys, newest first; the first one encrypts
    keys: Vec<[u8; 32]>,
    seqno: u64,
    confirmed_seqno: u64,
    fields: BTreeMap<String, Entry>,
    dirty: BTreeSet<String>,
    needs_push: bool,
    needs_dump: bool,
    pending: Option<PushData>,
    /// Hashes of every known push of this config and their seqnos
    hashes: BTreeMap<String, u64>,
}

impl ConfigObject {
    pub fn new(kind: ConfigKind, keys: Vec<[u8; 32]>) -> Self {
        Self {
            kind,
            keys,
            seqno: 0,
            confirmed_seqno: 0,
            fields: BTreeMap::new(),
            dirty: BTreeSet::new(),
            needs_push: false,
            needs_dump: false,
            pending: None,
            hashes: BTreeMap::new(),
        }
    }

    /// Restore from a [`dump`](Self::dump).
    pub fn load(kind: ConfigKind, keys: Vec<[u8; 32]>, dump: &[u8]) -> SwarmResult<Self> {
        let dump: Dump = postcard::from_bytes(dump)?;
        if dump.kind != kind {
            return Err(SwarmError::ValidationFailed(format!(
                "dump holds {:?}, expected {:?}",
                dump.kind, kind
            )));
        }
        Ok(Self {
            kind,
            keys,
            seqno: dump.seqno,
            confirmed_seqno: dump.confirmed_seqno,
            fields: dump.fields,
            dirty: dump.dirty,
            needs_push: dump.needs_push,
            needs_dump: false,
            pending: dump.pending,
            hashes: dump.hashes,
        })
    }

    pub fn kind(&self) -> ConfigKind {
        self.kind
    }

    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    /// Seqno of the newest push the network acknowledged
    pub fn confirmed_seqno(&self) -> u64 {
        self.confirmed_seqno
    }

    pub fn needs_push(&self) -> bool {
        self.needs_push || !self.dirty.is_empty() || self.pending.is_some()
    }

    pub fn needs_dump(&self) -> bool {
        self.needs_dump
    }

    /// Replace the key set (newest first). Used when group keys rotate.
    pub fn set_keys(&mut self, keys: Vec<[u8; 32]>) {
        self.keys = keys;
    }

    pub fn has_keys(&self) -> bool {
        !self.keys.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&ConfigValue> {
        self.fields
            .get(field)
            .map(|e| &e.value)
            .filter(|v| !matches!(v, ConfigValue::Deleted))
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        match self.get(field) {
            Some(ConfigValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn int(&self, field: &str) -> Option<i64> {
        match self.get(field) {
            Some(ConfigValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn bytes(&self, field: &str) -> Option<&[u8]> {
        match self.get(field) {
            Some(ConfigValue::Bytes(b)) => Some(b),
            _ => None,
        }
    }

    /// Live fields whose name starts with `prefix`
    pub fn fields_with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a ConfigValue)> + 'a {
        self.fields
            .range(prefix.to_string()..)
            .take_while(move |(name, _)| name.starts_with(prefix))
            .filter(|(_, e)| !matches!(e.value, ConfigValue::Deleted))
            .map(|(name, e)| (name.as_str(), &e.value))
    }

    /// Write a field locally. Setting the current value is a no-op.
    pub fn set(&mut self, field: impl Into<String>, value: ConfigValue) {
        let field = field.into();
        if self.fields.get(&field).map(|e| &e.value) == Some(&value) {
            return;
        }
        self.fields.insert(
            field.clone(),
            Entry {
                value,
                seqno: self.seqno + 1,
                tiebreak: [0u8; 32],
            },
        );
        self.dirty.insert(field);
        self.pending = None;
        self.needs_push = true;
        self.needs_dump = true;
    }

    /// Tombstone a field so the removal propagates.
    pub fn remove(&mut self, field: &str) {
        if self.get(field).is_some() {
            self.set(field, ConfigValue::Deleted);
        }
    }

    /// Seal the current state for storage.
    ///
    /// An unconfirmed push is returned again unchanged. Otherwise the state
    /// is sealed at one past the highest seqno seen so far, which keeps every
    /// push ahead of everything already merged.
    pub fn push(&mut self) -> SwarmResult<PushData> {
        if let Some(pending) = &self.pending {
            trace!(kind = ?self.kind, seqno = pending.seqno, "Re-using unconfirmed push");
            return Ok(pending.clone());
        }
        let key = self
            .keys
            .first()
            .ok_or_else(|| SwarmError::EncryptionFailed(format!("no key for {:?}", self.kind)))?;

        let seqno = self.seqno + 1;
        let wire = WireConfig {
            kind: self.kind,
            seqno,
            fields: self
                .fields
                .iter()
                .map(|(name, entry)| {
                    let fresh = self.dirty.contains(name);
                    (
                        name.clone(),
                        WireEntry {
                            value: entry.value.clone(),
                            seqno: if fresh { seqno } else { entry.seqno },
                            tiebreak: if fresh { None } else { Some(entry.tiebreak) },
                        },
                    )
                })
                .collect(),
        };
        let plaintext = postcard::to_allocvec(&wire)?;
        let ciphertext = SymmetricCipher::new(key).encrypt(&plaintext)?;
        let tiebreak = *blake3::hash(&ciphertext).as_bytes();

        for name in std::mem::take(&mut self.dirty) {
            if let Some(entry) = self.fields.get_mut(&name) {
                entry.seqno = seqno;
                entry.tiebreak = tiebreak;
            }
        }
        self.seqno = seqno;
        let push = PushData {
            ciphertext,
            seqno,
            obsolete_hashes: self.obsolete_hashes(seqno),
        };
        self.pending = Some(push.clone());
        self.needs_dump = true;
        debug!(kind = ?self.kind, seqno, "Sealed config push");
        Ok(push)
    }

    /// Record that the push at `seqno` was stored under `hash`.
    pub fn confirm_pushed(&mut self, seqno: u64, hash: &str) {
        if self.pending.as_ref().is_some_and(|p| p.seqno == seqno) {
            self.pending = None;
            self.needs_push = !self.dirty.is_empty();
        }
        self.confirmed_seqno = self.confirmed_seqno.max(seqno);
        self.hashes.insert(hash.to_string(), seqno);
        self.needs_dump = true;
    }

    /// Merge remote pushes, returning how many were accepted.
    ///
    /// Unknown or undecryptable messages are skipped. Locally edited fields
    /// that have not been pushed yet always survive; they will be stamped
    /// above every merged seqno on the next push.
    pub fn merge(&mut self, messages: &[ConfigMessage]) -> usize {
        let mut accepted = 0;
        let mut changed = false;
        let mut inputs: Vec<(u64, BTreeMap<String, Entry>)> = Vec::new();

        for message in messages {
            if self.hashes.contains_key(&message.hash) {
                continue;
            }
            let wire = match self.open(&message.data) {
                Ok(wire) => wire,
                Err(e) => {
                    warn!(kind = ?self.kind, hash = %message.hash, error = %e, "Skipping config message");
                    continue;
                }
            };
            if wire.kind != self.kind {
                warn!(expected = ?self.kind, got = ?wire.kind, "Config kind mismatch");
                continue;
            }

            let carried = *blake3::hash(&message.data).as_bytes();
            let remote: BTreeMap<String, Entry> = wire
                .fields
                .into_iter()
                .map(|(name, e)| {
                    (
                        name,
                        Entry {
                            value: e.value,
                            seqno: e.seqno,
                            tiebreak: e.tiebreak.unwrap_or(carried),
                        },
                    )
                })
                .collect();

            for (name, entry) in &remote {
                if self.dirty.contains(name) {
                    continue;
                }
                let wins = match self.fields.get(name) {
                    Some(local) => entry.version() > local.version(),
                    None => true,
                };
                if wins {
                    self.fields.insert(name.clone(), entry.clone());
                    changed = true;
                }
            }
            if wire.seqno > self.seqno {
                self.seqno = wire.seqno;
                changed = true;
            }
            self.hashes.insert(message.hash.clone(), wire.seqno);
            self.needs_dump = true;
            inputs.push((wire.seqno, remote));
            accepted += 1;
        }

        if changed {
            let matches_input = inputs
                .iter()
                .any(|(seqno, fields)| *seqno == self.seqno && *fields == self.fields);
            self.pending = None;
            self.needs_push = !self.dirty.is_empty() || !matches_input;
            debug!(kind = ?self.kind, accepted, seqno = self.seqno, needs_push = self.needs_push, "Merged config");
        }
        accepted
    }

    fn open(&self, data: &[u8]) -> SwarmResult<WireConfig> {
        for key in &self.keys {
            if let Ok(plaintext) = SymmetricCipher::new(key).decrypt(data) {
                return postcard::from_bytes(&plaintext).map_err(Into::into);
            }
        }
        Err(SwarmError::DecryptionFailed(format!(
            "no key opens {:?} config",
            self.kind
        )))
    }

    /// Serialize the full local state, clearing `needs_dump`.
    pub fn dump(&mut self) -> SwarmResult<Vec<u8>> {
        let bytes = postcard::to_allocvec(&Dump {
            kind: self.kind,
            seqno: self.seqno,
            confirmed_seqno: self.confirmed_seqno,
            fields: self.fields.clone(),
            dirty: self.dirty.clone(),
            needs_push: self.needs_push,
            pending: self.pending.clone(),
            hashes: self.hashes.clone(),
        })?;
        self.needs_dump = false;
        Ok(bytes)
    }

    /// Device-independent content: kind, seqno and fields. Two converged
    /// objects have identical snapshots.
    pub fn snapshot(&self) -> SwarmResult<Vec<u8>> {
        Ok(postcard::to_allocvec(&(self.kind, self.seqno, &self.fields))?)
    }

    /// Known hashes of pushes older than `seqno`
    pub fn obsolete_hashes(&self, seqno: u64) -> Vec<String> {
        self.hashes
            .iter()
            .filter(|(_, s)| **s < seqno)
            .map(|(h, _)| h.clone())
            .collect()
    }

    /// Hashes of pushes at the current seqno
    pub fn current_hashes(&self) -> Vec<String> {
        self.hashes
            .iter()
            .filter(|(_, s)| **s == self.seqno)
            .map(|(h, _)| h.clone())
            .collect()
    }

    /// Drop hashes after their messages were deleted. They stay known as
    /// far as merging goes only while recorded, so forgotten hashes are
    /// expected to be gone from the swarm.
    pub fn forget_hashes(&mut self, hashes: &[String]) {
        for hash in hashes {
            self.hashes.remove(hash);
        }
        self.needs_dump = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; 32] {
        [9u8; 32]
    }

    fn pushed(config: &mut ConfigObject, hash: &str) -> ConfigMessage {
        let push = config.push().unwrap();
        config.confirm_pushed(push.seqno, hash);
        ConfigMessage {
            hash: hash.to_string(),
            data: push.ciphertext,
        }
    }

    #[test]
    fn test_set_and_push() {
        let mut config = ConfigObject::new(ConfigKind::UserProfile, vec![key()]);
        assert!(!config.needs_push());
        config.set("name", ConfigValue::Text("Alice".into()));
        assert!(config.needs_push());
        assert!(config.needs_dump());

        let push = config.push().unwrap();
        assert_eq!(push.seqno, 1);
        assert!(config.needs_push(), "unconfirmed push still needs pushing");
        config.confirm_pushed(1, "h1");
        assert!(!config.needs_push());
        assert_eq!(config.confirmed_seqno(), 1);
        assert_eq!(config.text("name"), Some("Alice"));
    }

    #[test]
    fn test_unconfirmed_push_is_reused() {
        let mut config = ConfigObject::new(ConfigKind::Contacts, vec![key()]);
        config.set("a", ConfigValue::Int(1));
        let first = config.push().unwrap();
        let again = config.push().unwrap();
        assert_eq!(first, again);

        config.set("b", ConfigValue::Int(2));
        let superseded = config.push().unwrap();
        assert_eq!(superseded.seqno, first.seqno + 1);
        assert_ne!(superseded.ciphertext, first.ciphertext);
    }

    #[test]
    fn test_merge_skips_known_and_undecryptable() {
        let mut a = ConfigObject::new(ConfigKind::UserProfile, vec![key()]);
        a.set("name", ConfigValue::Text("A".into()));
        let msg = pushed(&mut a, "h1");

        let mut b = ConfigObject::new(ConfigKind::UserProfile, vec![key()]);
        assert_eq!(b.merge(&[msg.clone()]), 1);
        assert_eq!(b.merge(&[msg]), 0);
        assert_eq!(b.text("name"), Some("A"));

        let garbage = ConfigMessage {
            hash: "bad".into(),
            data: vec![1, 2, 3],
        };
        assert_eq!(b.merge(&[garbage]), 0);
    }

    #[test]
    fn test_merge_higher_seqno_wins() {
        let mut a = ConfigObject::new(ConfigKind::UserProfile, vec![key()]);
        a.set("name", ConfigValue::Text("old".into()));
        let first = pushed(&mut a, "h1");
        a.set("name", ConfigValue::Text("new".into()));
        let second = pushed(&mut a, "h2");

        let mut b = ConfigObject::new(ConfigKind::UserProfile, vec![key()]);
        b.merge(&[second, first]);
        assert_eq!(b.text("name"), Some("new"));
        assert_eq!(b.seqno(), 2);
        assert!(!b.needs_push(), "state equals the newest input");
    }

    #[test]
    fn test_dirty_local_edit_survives_merge_and_outranks() {
        let mut a = ConfigObject::new(ConfigKind::UserProfile, vec![key()]);
        a.set("name", ConfigValue::Text("remote".into()));
        a.set("x", ConfigValue::Int(1));
        let _ = pushed(&mut a, "h1");
        a.set("name", ConfigValue::Text("remote2".into()));
        let msg = pushed(&mut a, "h2");

        let mut b = ConfigObject::new(ConfigKind::UserProfile, vec![key()]);
        b.set("name", ConfigValue::Text("local".into()));
        b.merge(&[msg]);
        assert_eq!(b.text("name"), Some("local"));
        assert_eq!(b.int("x"), Some(1));

        let push = b.push().unwrap();
        assert_eq!(push.seqno, 3);
    }

    #[test]
    fn test_tombstone_propagates() {
        let mut a = ConfigObject::new(ConfigKind::Contacts, vec![key()]);
        a.set("c.1", ConfigValue::Int(1));
        let m1 = pushed(&mut a, "h1");
        a.remove("c.1");
        let m2 = pushed(&mut a, "h2");

        let mut b = ConfigObject::new(ConfigKind::Contacts, vec![key()]);
        b.merge(&[m1]);
        assert!(b.get("c.1").is_some());
        b.merge(&[m2]);
        assert!(b.get("c.1").is_none());
    }

    #[test]
    fn test_bidirectional_convergence() {
        let mut a = ConfigObject::new(ConfigKind::Contacts, vec![key()]);
        let mut b = ConfigObject::new(ConfigKind::Contacts, vec![key()]);
        a.set("shared", ConfigValue::Text("from a".into()));
        a.set("only_a", ConfigValue::Int(1));
        b.set("shared", ConfigValue::Text("from b".into()));
        b.set("only_b", ConfigValue::Int(2));

        let pa = pushed(&mut a, "a1");
        let pb = pushed(&mut b, "b1");
        a.merge(&[pb]);
        b.merge(&[pa]);
        assert!(a.needs_push());
        assert!(b.needs_push());

        let pa = pushed(&mut a, "a2");
        let pb = pushed(&mut b, "b2");
        a.merge(&[pb]);
        b.merge(&[pa]);

        assert_eq!(a.snapshot().unwrap(), b.snapshot().unwrap());
        assert_eq!(a.text("shared"), b.text("shared"));
        assert_eq!(a.int("only_a"), Some(1));
        assert_eq!(a.int("only_b"), Some(2));
    }

    #[test]
    fn test_dump_and_load() {
        let mut a = ConfigObject::new(ConfigKind::UserGroups, vec![key()]);
        a.set("g", ConfigValue::Bytes(vec![1, 2]));
        let _ = a.push().unwrap();
        let dump = a.dump().unwrap();
        assert!(!a.needs_dump());

        let mut restored = ConfigObject::load(ConfigKind::UserGroups, vec![key()], &dump).unwrap();
        assert_eq!(restored.bytes("g"), Some(&[1u8, 2][..]));
        assert_eq!(restored.push().unwrap(), a.push().unwrap());
        assert!(ConfigObject::load(ConfigKind::Contacts, vec![key()], &dump).is_err());
    }

    #[test]
    fn test_obsolete_hashes() {
        let mut a = ConfigObject::new(ConfigKind::UserProfile, vec![key()]);
        a.set("n", ConfigValue::Int(1));
        let _ = pushed(&mut a, "h1");
        a.set("n", ConfigValue::Int(2));
        let push = a.push().unwrap();
        assert_eq!(push.obsolete_hashes, vec!["h1".to_string()]);
        a.confirm_pushed(push.seqno, "h2");
        assert_eq!(a.current_hashes(), vec!["h2".to_string()]);
        a.forget_hashes(&push.obsolete_hashes);
        assert!(a.obsolete_hashes(push.seqno).is_empty());
    }

    #[test]
    fn test_push_without_key_fails() {
        let mut config = ConfigObject::new(ConfigKind::GroupInfo, Vec::new());
        config.set("name", ConfigValue::Text("g".into()));
        assert!(matches!(config.push(), Err(SwarmError::EncryptionFailed(_))));
    }

    #[test]
    fn test_fields_with_prefix() {
        let mut config = ConfigObject::new(ConfigKind::Contacts, vec![key()]);
        config.set("c.a.name", ConfigValue::Text("a".into()));
        config.set("c.b.name", ConfigValue::Text("b".into()));
        config.set("d", ConfigValue::Int(1));
        config.remove("c.b.name");
        let names: Vec<&str> = config.fields_with_prefix("c.").map(|(n, _)| n).collect();
        assert_eq!(names, vec!["c.a.name"]);
    }
}
