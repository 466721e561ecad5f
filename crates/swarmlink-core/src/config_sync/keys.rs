//! Group key generations.
//!
//! Each generation's symmetric key is sealed separately to every member
//! (and to the admin). Members only learn the generations sealed to them,
//! so a removed member's view stops at the generation it was kicked in.

use std::ops::{Deref, DerefMut};

use x25519_dalek::PublicKey as X25519Public;

use super::object::{ConfigKind, ConfigObject, ConfigValue};
use crate::crypto::{open_sealed, seal_for, SymmetricCipher};
use crate::error::{SwarmError, SwarmResult};
use crate::identity::Identity;
use crate::types::AccountId;

const GROUP_KEYS_CONTEXT: &str = "swarmlink 2024 group keys config";

/// Key protecting the keys config itself. Its content is sealed per member.
pub fn group_keys_config_key(group: &AccountId) -> [u8; 32] {
    blake3::derive_key(GROUP_KEYS_CONTEXT, group.key())
}

/// Generation counter plus per-member sealed keys
#[derive(Debug, Clone)]
pub struct GroupKeys(ConfigObject);

impl Deref for GroupKeys {
    type Target = ConfigObject;

    fn deref(&self) -> &ConfigObject {
        &self.0
    }
}

impl DerefMut for GroupKeys {
    fn deref_mut(&mut self) -> &mut ConfigObject {
        &mut self.0
    }
}

fn key_field(generation: u64, member: &AccountId) -> String {
    format!("key.{:020}.{}", generation, member.to_hex())
}

fn parse_key_field(field: &str) -> Option<(u64, &str)> {
    let rest = field.strip_prefix("key.")?;
    let (generation, member) = rest.split_once('.')?;
    Some((generation.parse().ok()?, member))
}

impl GroupKeys {
    pub const KIND: ConfigKind = ConfigKind::GroupKeys;

    pub fn new(group: &AccountId) -> Self {
        Self(ConfigObject::new(
            ConfigKind::GroupKeys,
            vec![group_keys_config_key(group)],
        ))
    }

    pub fn load(group: &AccountId, dump: &[u8]) -> SwarmResult<Self> {
        ConfigObject::load(ConfigKind::GroupKeys, vec![group_keys_config_key(group)], dump).map(Self)
    }

    /// Newest generation written by the admin
    pub fn current_generation(&self) -> Option<u64> {
        self.int("gen").map(|g| g as u64)
    }

    /// Start a new generation sealed to `recipients`, returning its key.
    pub fn rotate(&mut self, recipients: &[AccountId]) -> SwarmResult<[u8; 32]> {
        let generation = self.current_generation().map_or(0, |g| g + 1);
        let key = SymmetricCipher::generate_key();
        for recipient in recipients {
            self.seal_to(generation, recipient, &key)?;
        }
        self.set("gen", ConfigValue::Int(generation as i64));
        Ok(key)
    }

    /// Seal the current generation's key to one more member.
    pub fn grant(&mut self, holder: &Identity, member: &AccountId) -> SwarmResult<()> {
        let generation = self
            .current_generation()
            .ok_or_else(|| SwarmError::EncryptionFailed("group has no key yet".into()))?;
        let key = self
            .sealed_key(generation, holder)
            .ok_or(SwarmError::NoKeyPair)??;
        self.seal_to(generation, member, &key)
    }

    fn seal_to(&mut self, generation: u64, member: &AccountId, key: &[u8; 32]) -> SwarmResult<()> {
        let sealed = seal_for(&X25519Public::from(*member.key()), key)?;
        self.set(key_field(generation, member), ConfigValue::Bytes(sealed));
        Ok(())
    }

    fn sealed_key(&self, generation: u64, identity: &Identity) -> Option<SwarmResult<[u8; 32]>> {
        let sealed = self.bytes(&key_field(generation, &identity.account_id()))?;
        Some(open_sealed(identity.x25519_secret(), sealed).and_then(|plain| {
            plain
                .try_into()
                .map_err(|_| SwarmError::DecryptionFailed("group key length".into()))
        }))
    }

    /// Every key `identity` can open, newest generation first.
    pub fn keys_for(&self, identity: &Identity) -> Vec<[u8; 32]> {
        let mine = identity.account_id().to_hex();
        let mut generations: Vec<u64> = self
            .fields_with_prefix("key.")
            .filter_map(|(field, _)| parse_key_field(field))
            .filter(|(_, member)| *member == mine)
            .map(|(generation, _)| generation)
            .collect();
        generations.sort_unstable_by(|a, b| b.cmp(a));
        generations
            .into_iter()
            .filter_map(|generation| self.sealed_key(generation, identity)?.ok())
            .collect()
    }

    /// Newest generation sealed to `identity`
    pub fn member_generation(&self, identity: &Identity) -> Option<u64> {
        let mine = identity.account_id().to_hex();
        self.fields_with_prefix("key.")
            .filter_map(|(field, _)| parse_key_field(field))
            .filter(|(_, member)| *member == mine)
            .map(|(generation, _)| generation)
            .max()
    }

    /// Exclude a sub-account token from the valid set.
    pub fn revoke_token(&mut self, token_id: &str) {
        self.set(format!("revoked.{}", token_id), ConfigValue::Int(1));
    }

    pub fn is_revoked(&self, token_id: &str) -> bool {
        self.get(&format!("revoked.{}", token_id)).is_some()
    }
}
