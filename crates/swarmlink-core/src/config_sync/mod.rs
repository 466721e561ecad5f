//! Config sync engine.
//!
//! ```text
//!   local edit ──► ConfigObject::set ──► ConfigSyncJob::run ──► store (namespace)
//!                                              │  confirm_pushed(hash)
//!                                              │  delete obsolete hashes
//!                                              ▼
//!                                        SwarmStore dump
//!
//!   poller retrieve ──► ConfigSet::merge(namespace, messages)
//! ```
//!
//! User configs live in the user's own swarm; group configs live in the
//! group's swarm and only the admin pushes them.

mod job;
mod keys;
mod object;
mod types;

pub use job::{ConfigSyncJob, SyncReport};
pub use keys::{group_keys_config_key, GroupKeys};
pub use object::{ConfigKind, ConfigMessage, ConfigObject, ConfigValue, PushData};
pub use types::{
    ContactInfo, Contacts, ConvoInfoVolatile, GroupInfo, GroupMembers, UserGroups, UserProfile,
};

use base64::{engine::general_purpose::STANDARD, Engine};
use tracing::{debug, warn};

use crate::error::SwarmResult;
use crate::identity::Identity;
use crate::storage::SwarmStore;
use crate::types::{AccountId, Namespace, StoredMessage};

const USER_CONFIG_CONTEXT: &str = "swarmlink 2024 user config";

/// Symmetric key for the user's own configs, derived from the identity seed
pub fn user_config_key(identity: &Identity) -> [u8; 32] {
    blake3::derive_key(USER_CONFIG_CONTEXT, identity.seed())
}

/// Turn retrieved messages into merge input, skipping bad base64.
pub fn config_messages(messages: &[StoredMessage]) -> Vec<ConfigMessage> {
    messages
        .iter()
        .filter_map(|m| match STANDARD.decode(&m.data) {
            Ok(data) => Some(ConfigMessage {
                hash: m.hash.clone(),
                data,
            }),
            Err(e) => {
                warn!(hash = %m.hash, error = %e, "Config message is not base64");
                None
            }
        })
        .collect()
}

/// A set of config objects stored in one account's swarm.
pub trait ConfigSet: Send {
    /// Account whose swarm holds the configs
    fn account(&self) -> &AccountId;

    fn objects_mut(&mut self) -> Vec<&mut ConfigObject>;

    fn object_mut(&mut self, kind: ConfigKind) -> Option<&mut ConfigObject> {
        self.objects_mut().into_iter().find(|o| o.kind() == kind)
    }

    /// Merge messages retrieved from `namespace`.
    fn merge(&mut self, namespace: Namespace, messages: &[ConfigMessage]) -> usize {
        match ConfigKind::from_namespace(namespace).and_then(|kind| self.object_mut(kind)) {
            Some(object) => object.merge(messages),
            None => {
                debug!(%namespace, "No config object for namespace");
                0
            }
        }
    }

    /// Persist every object whose state changed.
    fn persist(&mut self, store: &dyn SwarmStore) -> SwarmResult<()> {
        let account = self.account().clone();
        for object in self.objects_mut() {
            if object.needs_dump() {
                let namespace = object.kind().namespace();
                store.save_config_dump(&account, namespace, &object.dump()?)?;
                store.set_config_hashes(&account, namespace, &object.current_hashes())?;
            }
        }
        Ok(())
    }
}

/// The four configs of a user account
#[derive(Debug, Clone)]
pub struct UserConfigs {
    account: AccountId,
    pub profile: UserProfile,
    pub contacts: Contacts,
    pub convo: ConvoInfoVolatile,
    pub groups: UserGroups,
}

impl UserConfigs {
    pub fn new(identity: &Identity) -> Self {
        let key = vec![user_config_key(identity)];
        Self {
            account: identity.account_id(),
            profile: UserProfile::new(key.clone()),
            contacts: Contacts::new(key.clone()),
            convo: ConvoInfoVolatile::new(key.clone()),
            groups: UserGroups::new(key),
        }
    }

    /// Restore from stored dumps; missing dumps start empty.
    pub fn load(identity: &Identity, store: &dyn SwarmStore) -> SwarmResult<Self> {
        let account = identity.account_id();
        let key = vec![user_config_key(identity)];
        let dump = |ns| store.load_config_dump(&account, ns);
        Ok(Self {
            profile: match dump(Namespace::USER_PROFILE)? {
                Some(d) => UserProfile::load(key.clone(), &d)?,
                None => UserProfile::new(key.clone()),
            },
            contacts: match dump(Namespace::CONTACTS)? {
                Some(d) => Contacts::load(key.clone(), &d)?,
                None => Contacts::new(key.clone()),
            },
            convo: match dump(Namespace::CONVO_INFO_VOLATILE)? {
                Some(d) => ConvoInfoVolatile::load(key.clone(), &d)?,
                None => ConvoInfoVolatile::new(key.clone()),
            },
            groups: match dump(Namespace::USER_GROUPS)? {
                Some(d) => UserGroups::load(key, &d)?,
                None => UserGroups::new(key),
            },
            account,
        })
    }
}

impl ConfigSet for UserConfigs {
    fn account(&self) -> &AccountId {
        &self.account
    }

    fn objects_mut(&mut self) -> Vec<&mut ConfigObject> {
        vec![
            &mut *self.profile,
            &mut *self.contacts,
            &mut *self.convo,
            &mut *self.groups,
        ]
    }
}

/// Keys, info and members of one v2 group
#[derive(Debug, Clone)]
pub struct GroupConfigs {
    group: AccountId,
    pub keys: GroupKeys,
    pub info: GroupInfo,
    pub members: GroupMembers,
}

impl GroupConfigs {
    pub fn new(group: AccountId) -> Self {
        Self {
            keys: GroupKeys::new(&group),
            info: GroupInfo::new(Vec::new()),
            members: GroupMembers::new(Vec::new()),
            group,
        }
    }

    /// Restore from stored dumps, unlocking info and members with the keys
    /// `identity` holds.
    pub fn load(group: AccountId, identity: &Identity, store: &dyn SwarmStore) -> SwarmResult<Self> {
        let mut configs = Self::new(group);
        if let Some(d) = store.load_config_dump(&configs.group, Namespace::ENCRYPTION_KEYS)? {
            configs.keys = GroupKeys::load(&configs.group, &d)?;
        }
        let keys = configs.keys.keys_for(identity);
        if let Some(d) = store.load_config_dump(&configs.group, Namespace::CLOSED_GROUP_INFO)? {
            configs.info = GroupInfo::load(keys.clone(), &d)?;
        }
        if let Some(d) = store.load_config_dump(&configs.group, Namespace::CLOSED_GROUP_MEMBERS)? {
            configs.members = GroupMembers::load(keys.clone(), &d)?;
        }
        configs.info.set_keys(keys.clone());
        configs.members.set_keys(keys);
        Ok(configs)
    }

    pub fn group(&self) -> &AccountId {
        &self.group
    }

    /// Re-derive the info/members keys after the keys config changed.
    pub fn refresh_keys(&mut self, identity: &Identity) -> Vec<[u8; 32]> {
        let keys = self.keys.keys_for(identity);
        self.info.set_keys(keys.clone());
        self.members.set_keys(keys.clone());
        keys
    }

    /// Merge keys, then info, then members. Info and members may only be
    /// readable with keys learned in the same round.
    pub fn merge_in_order(
        &mut self,
        identity: &Identity,
        keys: &[ConfigMessage],
        info: &[ConfigMessage],
        members: &[ConfigMessage],
    ) -> usize {
        let mut accepted = self.keys.merge(keys);
        self.refresh_keys(identity);
        accepted += self.info.merge(info);
        accepted += self.members.merge(members);
        accepted
    }
}

impl ConfigSet for GroupConfigs {
    fn account(&self) -> &AccountId {
        &self.group
    }

    fn objects_mut(&mut self) -> Vec<&mut ConfigObject> {
        vec![&mut *self.keys, &mut *self.info, &mut *self.members]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::IdPrefix;

    #[test]
    fn test_user_configs_persist_and_load() {
        let identity = Identity::generate();
        let store = MemoryStore::new();
        let mut configs = UserConfigs::new(&identity);
        configs.profile.set_name("Alice");
        configs.persist(&store).unwrap();

        let loaded = UserConfigs::load(&identity, &store).unwrap();
        assert_eq!(loaded.profile.name(), Some("Alice"));
        assert!(loaded.contacts.ids().is_empty());
    }

    #[test]
    fn test_merge_routes_by_namespace() {
        let identity = Identity::generate();
        let mut device_a = UserConfigs::new(&identity);
        let mut device_b = UserConfigs::new(&identity);
        device_a.profile.set_name("Alice");
        let push = device_a.profile.push().unwrap();
        let msg = ConfigMessage {
            hash: "h".into(),
            data: push.ciphertext,
        };
        assert_eq!(device_b.merge(Namespace::CONTACTS, &[msg.clone()]), 0);
        assert_eq!(device_b.merge(Namespace::USER_PROFILE, &[msg]), 1);
        assert_eq!(device_b.profile.name(), Some("Alice"));
        assert_eq!(device_b.merge(Namespace::DEFAULT, &[]), 0);
    }

    #[test]
    fn test_group_merge_in_order_unlocks_info() {
        let admin = Identity::generate();
        let member = Identity::generate();
        let group = AccountId::new(IdPrefix::Group, admin.ed25519_public());

        let mut admin_side = GroupConfigs::new(group.clone());
        admin_side
            .keys
            .rotate(&[admin.account_id(), member.account_id()])
            .unwrap();
        admin_side.refresh_keys(&admin);
        admin_side.info.set_name("Book club");
        let keys_push = admin_side.keys.push().unwrap();
        let info_push = admin_side.info.push().unwrap();

        let mut member_side = GroupConfigs::new(group);
        let accepted = member_side.merge_in_order(
            &member,
            &[ConfigMessage { hash: "k".into(), data: keys_push.ciphertext }],
            &[ConfigMessage { hash: "i".into(), data: info_push.ciphertext }],
            &[],
        );
        assert_eq!(accepted, 2);
        assert_eq!(member_side.info.name(), Some("Book club"));
    }

    #[test]
    fn test_config_messages_skip_bad_base64() {
        let messages = vec![
            StoredMessage {
                data: STANDARD.encode(b"ok"),
                hash: "a".into(),
                timestamp: 0,
                expiry: 0,
            },
            StoredMessage {
                data: "***".into(),
                hash: "b".into(),
                timestamp: 0,
                expiry: 0,
            },
        ];
        let parsed = config_messages(&messages);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].data, b"ok");
    }
}
