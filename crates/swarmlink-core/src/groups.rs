//! Group administration: member tokens, removal and kicked notices.
//!
//! A v2 group is an ed25519 key pair. Its `03` id is the public half; the
//! admin holds the seed. Members write to the group swarm with a
//! [`SubAccountToken`] signed by the admin.
//!
//! Removing a member:
//!
//! ```text
//!   revoke(member)
//!     ├─ drop token from the valid list, mark it revoked in the keys config
//!     ├─ remove from the members config
//!     ├─ kicked notice "<05 member id><generation G>" sealed to the member
//!     └─ rotate keys to G+1 for the remaining members
//! ```
//!
//! The removed member never receives G+1, so its own newest generation stays
//! at G and the notice matches. Older notices (G-1) are ignored.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config_sync::GroupConfigs;
use crate::crypto::{decrypt_for_recipient, encrypt_for_recipient, standard_id_from_ed25519};
use crate::error::{SwarmError, SwarmResult};
use crate::identity::{verify_signature, Identity};
use crate::types::{AccountId, IdPrefix, Namespace};

const TOKEN_DOMAIN: &[u8] = b"swarmlink-subaccount-v1";

/// Admin-issued write capability for one member and namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubAccountToken {
    pub group: AccountId,
    pub member_ed25519: [u8; 32],
    pub namespace: i16,
    pub generation: u64,
    pub admin_signature: Vec<u8>,
}

#[derive(Serialize)]
struct TokenBody<'a> {
    group: &'a AccountId,
    member_ed25519: &'a [u8; 32],
    namespace: i16,
    generation: u64,
}

impl SubAccountToken {
    fn signed_bytes(&self) -> Vec<u8> {
        let mut bytes = TOKEN_DOMAIN.to_vec();
        bytes.extend_from_slice(self.group.key());
        bytes.extend_from_slice(&self.member_ed25519);
        bytes.extend_from_slice(&self.namespace.to_le_bytes());
        bytes.extend_from_slice(&self.generation.to_le_bytes());
        bytes
    }

    /// Check the admin signature against the group key.
    pub fn verify(&self) -> SwarmResult<()> {
        verify_signature(self.group.key(), &self.signed_bytes(), &self.admin_signature)
    }

    /// Stable identifier used in the revocation list
    pub fn token_id(&self) -> String {
        hex::encode(&blake3::hash(&self.signed_bytes()).as_bytes()[..16])
    }

    /// Base64 wire form of the token body (the signature travels separately).
    pub fn encode(&self) -> SwarmResult<String> {
        let body = TokenBody {
            group: &self.group,
            member_ed25519: &self.member_ed25519,
            namespace: self.namespace,
            generation: self.generation,
        };
        Ok(STANDARD.encode(postcard::to_allocvec(&body)?))
    }

    pub fn member_id(&self) -> SwarmResult<AccountId> {
        standard_id_from_ed25519(&self.member_ed25519)
    }
}

/// Admin side of a v2 group.
pub struct GroupAdmin {
    group: Identity,
    valid_tokens: BTreeMap<AccountId, SubAccountToken>,
}

impl GroupAdmin {
    pub fn new(group: Identity) -> Self {
        Self {
            group,
            valid_tokens: BTreeMap::new(),
        }
    }

    /// `03` id of the group
    pub fn group_id(&self) -> AccountId {
        group_id_of(&self.group)
    }

    /// The group key pair, used to sign admin writes to the group swarm
    pub fn identity(&self) -> &Identity {
        &self.group
    }

    /// Create the configs of a fresh group with generation 0.
    pub fn create(&self, name: &str) -> SwarmResult<GroupConfigs> {
        let mut configs = GroupConfigs::new(self.group_id());
        configs.keys.rotate(&[self.group.account_id()])?;
        configs.refresh_keys(&self.group);
        configs.info.set_name(name);
        Ok(configs)
    }

    /// Sign a token for `member_ed25519` on `namespace`.
    pub fn issue_token(
        &mut self,
        member_ed25519: [u8; 32],
        namespace: Namespace,
        generation: u64,
    ) -> SwarmResult<SubAccountToken> {
        let mut token = SubAccountToken {
            group: self.group_id(),
            member_ed25519,
            namespace: namespace.0,
            generation,
            admin_signature: Vec::new(),
        };
        token.admin_signature = self.group.sign(&token.signed_bytes()).to_vec();
        self.valid_tokens.insert(token.member_id()?, token.clone());
        Ok(token)
    }

    /// Add a member: list them, share the current key and issue a message
    /// token.
    pub fn add_member(
        &mut self,
        configs: &mut GroupConfigs,
        member_ed25519: [u8; 32],
        name: &str,
    ) -> SwarmResult<SubAccountToken> {
        let member = standard_id_from_ed25519(&member_ed25519)?;
        configs.members.add(&member, name);
        configs.keys.grant(&self.group, &member)?;
        let generation = configs.keys.current_generation().unwrap_or(0);
        info!(group = %self.group_id().short(), member = %member.short(), generation, "Added group member");
        self.issue_token(member_ed25519, Namespace::CLOSED_GROUP_MESSAGES, generation)
    }

    /// Tokens still considered valid
    pub fn valid_tokens(&self) -> impl Iterator<Item = &SubAccountToken> {
        self.valid_tokens.values()
    }

    pub fn is_valid(&self, token: &SubAccountToken) -> bool {
        self.valid_tokens.values().any(|t| t == token)
    }

    /// Remove `member`, returning the kicked notice to store in the revoked
    /// namespace of the group swarm.
    pub fn revoke(&mut self, configs: &mut GroupConfigs, member: &AccountId) -> SwarmResult<Vec<u8>> {
        if let Some(token) = self.valid_tokens.remove(member) {
            configs.keys.revoke_token(&token.token_id());
        }
        configs.members.remove_member(member);

        let generation = configs
            .keys
            .current_generation()
            .ok_or_else(|| SwarmError::InvalidMessage("group has no key generation".into()))?;
        let notice = kicked_text(member, generation);
        let sealed = encrypt_for_recipient(&self.group, member, notice.as_bytes())?;

        let mut recipients = configs.members.member_ids();
        recipients.push(self.group.account_id());
        configs.keys.rotate(&recipients)?;
        configs.refresh_keys(&self.group);

        info!(
            group = %self.group_id().short(),
            member = %member.short(),
            generation,
            "Revoked group member"
        );
        Ok(sealed)
    }
}

pub fn group_id_of(group: &Identity) -> AccountId {
    AccountId::new(IdPrefix::Group, group.ed25519_public())
}

/// `<05 account id hex><decimal generation>`
pub fn kicked_text(member: &AccountId, generation: u64) -> String {
    format!("{}{}", member.to_hex(), generation)
}

/// Parse a kicked notice of the form `05` + 64 hex digits + decimal
/// generation.
pub fn parse_kicked(text: &str) -> Option<(AccountId, u64)> {
    if text.len() <= 66 || !text.is_char_boundary(66) {
        return None;
    }
    let (id, generation) = text.split_at(66);
    if !id.starts_with("05") || !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    if !generation.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((id.parse().ok()?, generation.parse().ok()?))
}

/// Open a message from the revoked namespace and decide whether it removes
/// `me`. Returns the kicked generation when it does.
///
/// The notice must come from the group key, name `me`, and carry a
/// generation at least as new as the newest one `me` holds.
pub fn check_kicked(
    me: &Identity,
    group: &AccountId,
    known_generation: Option<u64>,
    data: &[u8],
) -> Option<u64> {
    let (payload, sender) = decrypt_for_recipient(me, data).ok()?;
    if sender != standard_id_from_ed25519(group.key()).ok()? {
        return None;
    }
    let (target, generation) = parse_kicked(std::str::from_utf8(&payload).ok()?)?;
    if target != me.account_id() {
        return None;
    }
    match known_generation {
        Some(known) if generation < known => None,
        _ => Some(generation),
    }
}
