//! Typed views over [`ConfigObject`] for each config kind.

use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

use super::object::{ConfigKind, ConfigObject, ConfigValue};
use crate::types::AccountId;

macro_rules! config_view {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name(ConfigObject);

        impl $name {
            pub const KIND: ConfigKind = $kind;

            pub fn new(keys: Vec<[u8; 32]>) -> Self {
                Self(ConfigObject::new($kind, keys))
            }

            pub fn load(keys: Vec<[u8; 32]>, dump: &[u8]) -> crate::error::SwarmResult<Self> {
                ConfigObject::load($kind, keys, dump).map(Self)
            }
        }

        impl Deref for $name {
            type Target = ConfigObject;

            fn deref(&self) -> &ConfigObject {
                &self.0
            }
        }

        impl DerefMut for $name {
            fn deref_mut(&mut self) -> &mut ConfigObject {
                &mut self.0
            }
        }
    };
}

config_view!(
    /// The local user's display name and avatar
    UserProfile,
    ConfigKind::UserProfile
);
config_view!(
    /// Known contacts with approval and block flags
    Contacts,
    ConfigKind::Contacts
);
config_view!(
    /// Per-conversation read watermarks
    ConvoInfoVolatile,
    ConfigKind::ConvoInfoVolatile
);
config_view!(
    /// Groups the user belongs to
    UserGroups,
    ConfigKind::UserGroups
);
config_view!(
    /// Group name and description
    GroupInfo,
    ConfigKind::GroupInfo
);
config_view!(
    /// Group member list
    GroupMembers,
    ConfigKind::GroupMembers
);

impl UserProfile {
    pub fn name(&self) -> Option<&str> {
        self.text("name")
    }

    pub fn set_name(&mut self, name: &str) {
        self.set("name", ConfigValue::Text(name.to_string()));
    }

    /// Avatar URL and its decryption key
    pub fn picture(&self) -> Option<(&str, &[u8])> {
        Some((self.text("pic.url")?, self.bytes("pic.key")?))
    }

    pub fn set_picture(&mut self, url: &str, key: &[u8]) {
        self.set("pic.url", ConfigValue::Text(url.to_string()));
        self.set("pic.key", ConfigValue::Bytes(key.to_vec()));
    }
}

/// One entry of [`Contacts`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    pub name: Option<String>,
    pub approved: bool,
    pub blocked: bool,
}

impl Contacts {
    fn field(id: &AccountId, name: &str) -> String {
        format!("c.{}.{}", id.to_hex(), name)
    }

    pub fn get(&self, id: &AccountId) -> Option<ContactInfo> {
        let exists = self.int(&Self::field(id, "approved")).is_some();
        if !exists {
            return None;
        }
        Some(ContactInfo {
            name: self.text(&Self::field(id, "name")).map(str::to_string),
            approved: self.int(&Self::field(id, "approved")) == Some(1),
            blocked: self.int(&Self::field(id, "blocked")) == Some(1),
        })
    }

    pub fn upsert(&mut self, id: &AccountId, info: &ContactInfo) {
        match &info.name {
            Some(name) => self.set(Self::field(id, "name"), ConfigValue::Text(name.clone())),
            None => self.remove(&Self::field(id, "name")),
        }
        self.set(Self::field(id, "approved"), ConfigValue::Int(info.approved as i64));
        self.set(Self::field(id, "blocked"), ConfigValue::Int(info.blocked as i64));
    }

    pub fn erase(&mut self, id: &AccountId) {
        for name in ["name", "approved", "blocked"] {
            self.remove(&Self::field(id, name));
        }
    }

    /// Ids of all live contacts
    pub fn ids(&self) -> Vec<AccountId> {
        self.fields_with_prefix("c.")
            .filter_map(|(field, _)| field.strip_suffix(".approved"))
            .filter_map(|field| field.strip_prefix("c.")?.parse().ok())
            .collect()
    }
}

impl ConvoInfoVolatile {
    pub fn last_read(&self, conversation: &str) -> Option<i64> {
        self.int(&format!("r.{}", conversation))
    }

    /// Only ever moves the watermark forward.
    pub fn mark_read(&mut self, conversation: &str, timestamp: i64) {
        if self.last_read(conversation).is_some_and(|t| t >= timestamp) {
            return;
        }
        self.set(format!("r.{}", conversation), ConfigValue::Int(timestamp));
    }
}

impl UserGroups {
    pub fn join(&mut self, group: &AccountId, name: &str) {
        self.set(format!("g.{}", group.to_hex()), ConfigValue::Text(name.to_string()));
    }

    pub fn leave(&mut self, group: &AccountId) {
        self.remove(&format!("g.{}", group.to_hex()));
    }

    pub fn groups(&self) -> Vec<(AccountId, String)> {
        self.fields_with_prefix("g.")
            .filter_map(|(field, value)| {
                let id = field.strip_prefix("g.")?.parse().ok()?;
                match value {
                    ConfigValue::Text(name) => Some((id, name.clone())),
                    _ => None,
                }
            })
            .collect()
    }
}

impl GroupInfo {
    pub fn name(&self) -> Option<&str> {
        self.text("name")
    }

    pub fn set_name(&mut self, name: &str) {
        self.set("name", ConfigValue::Text(name.to_string()));
    }

    pub fn description(&self) -> Option<&str> {
        self.text("description")
    }

    pub fn set_description(&mut self, description: &str) {
        self.set("description", ConfigValue::Text(description.to_string()));
    }
}

impl GroupMembers {
    pub fn add(&mut self, member: &AccountId, name: &str) {
        self.set(format!("m.{}", member.to_hex()), ConfigValue::Text(name.to_string()));
    }

    pub fn remove_member(&mut self, member: &AccountId) {
        self.remove(&format!("m.{}", member.to_hex()));
    }

    pub fn is_member(&self, member: &AccountId) -> bool {
        self.get(&format!("m.{}", member.to_hex())).is_some()
    }

    pub fn member_ids(&self) -> Vec<AccountId> {
        self.fields_with_prefix("m.")
            .filter_map(|(field, _)| field.strip_prefix("m.")?.parse().ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    const KEY: [u8; 32] = [3u8; 32];

    #[test]
    fn test_profile_fields() {
        let mut profile = UserProfile::new(vec![KEY]);
        assert!(profile.name().is_none());
        profile.set_name("Alice");
        profile.set_picture("https://files/1", &[1, 2, 3]);
        assert_eq!(profile.name(), Some("Alice"));
        assert_eq!(profile.picture(), Some(("https://files/1", &[1u8, 2, 3][..])));
        assert_eq!(profile.kind(), ConfigKind::UserProfile);
    }

    #[test]
    fn test_contacts_upsert_and_erase() {
        let mut contacts = Contacts::new(vec![KEY]);
        let bob = Identity::generate().account_id();
        let info = ContactInfo {
            name: Some("Bob".into()),
            approved: true,
            blocked: false,
        };
        contacts.upsert(&bob, &info);
        assert_eq!(contacts.get(&bob), Some(info));
        assert_eq!(contacts.ids(), vec![bob.clone()]);

        contacts.erase(&bob);
        assert!(contacts.get(&bob).is_none());
        assert!(contacts.ids().is_empty());
    }

    #[test]
    fn test_convo_read_watermark_monotonic() {
        let mut convo = ConvoInfoVolatile::new(vec![KEY]);
        convo.mark_read("05ab", 10);
        convo.mark_read("05ab", 5);
        assert_eq!(convo.last_read("05ab"), Some(10));
    }

    #[test]
    fn test_members_and_groups() {
        let mut members = GroupMembers::new(vec![KEY]);
        let m = Identity::generate().account_id();
        members.add(&m, "M");
        assert!(members.is_member(&m));
        members.remove_member(&m);
        assert!(!members.is_member(&m));

        let mut groups = UserGroups::new(vec![KEY]);
        let g = Identity::generate().account_id();
        groups.join(&g, "Friends");
        assert_eq!(groups.groups(), vec![(g.clone(), "Friends".to_string())]);
        groups.leave(&g);
        assert!(groups.groups().is_empty());
    }
}
