//! Core data types shared across the client.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SwarmError;

/// A storage node ("snode").
///
/// Immutable once constructed; two nodes are equal only when address, port
/// and both keys match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Node {
    pub address: String,
    pub port: u16,
    /// Hex-encoded ed25519 public key
    pub ed25519_key: String,
    /// Hex-encoded x25519 public key
    pub x25519_key: String,
}

impl Node {
    pub fn new(
        address: impl Into<String>,
        port: u16,
        ed25519_key: impl Into<String>,
        x25519_key: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            port,
            ed25519_key: ed25519_key.into(),
            x25519_key: x25519_key.into(),
        }
    }

    /// The node's HTTPS endpoint
    pub fn url(&self) -> String {
        format!("https://{}:{}", self.address, self.port)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Replica set for one account
pub type Swarm = Vec<Node>;

/// Prefix byte of an [`AccountId`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdPrefix {
    /// `05`: a user, keyed by its x25519 public key
    Standard,
    /// `03`: a v2 closed group, keyed by its ed25519 public key
    Group,
    /// `15`: a community-blinded user
    Blinded,
}

impl IdPrefix {
    fn as_hex(self) -> &'static str {
        match self {
            IdPrefix::Standard => "05",
            IdPrefix::Group => "03",
            IdPrefix::Blinded => "15",
        }
    }

    fn from_hex(s: &str) -> Option<Self> {
        match s {
            "05" => Some(IdPrefix::Standard),
            "03" => Some(IdPrefix::Group),
            "15" => Some(IdPrefix::Blinded),
            _ => None,
        }
    }
}

/// Hex account identifier: one prefix byte followed by a 32-byte key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId {
    prefix: IdPrefix,
    key: [u8; 32],
}

impl PartialOrd for IdPrefix {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IdPrefix {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_hex().cmp(other.as_hex())
    }
}

impl AccountId {
    pub fn new(prefix: IdPrefix, key: [u8; 32]) -> Self {
        Self { prefix, key }
    }

    pub fn prefix(&self) -> IdPrefix {
        self.prefix
    }

    /// The 32 key bytes without the prefix
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    pub fn to_hex(&self) -> String {
        format!("{}{}", self.prefix.as_hex(), hex::encode(self.key))
    }

    /// Short form for logs
    pub fn short(&self) -> String {
        let full = self.to_hex();
        full[..10].to_string()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for AccountId {
    type Err = SwarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 66 || !s.is_ascii() {
            return Err(SwarmError::InvalidMessage(format!(
                "account id must be 66 hex chars, got {}",
                s.len()
            )));
        }
        let prefix = IdPrefix::from_hex(&s[..2])
            .ok_or_else(|| SwarmError::InvalidMessage(format!("unknown id prefix {}", &s[..2])))?;
        let bytes =
            hex::decode(&s[2..]).map_err(|e| SwarmError::InvalidMessage(e.to_string()))?;
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(Self { prefix, key })
    }
}

impl TryFrom<String> for AccountId {
    type Error = SwarmError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AccountId> for String {
    fn from(id: AccountId) -> Self {
        id.to_hex()
    }
}

/// A logical partition of an account's stored data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Namespace(pub i16);

impl Namespace {
    pub const DEFAULT: Namespace = Namespace(0);
    pub const USER_PROFILE: Namespace = Namespace(2);
    pub const CONTACTS: Namespace = Namespace(3);
    pub const CONVO_INFO_VOLATILE: Namespace = Namespace(4);
    pub const USER_GROUPS: Namespace = Namespace(5);
    pub const UNAUTHENTICATED_CLOSED_GROUP: Namespace = Namespace(-10);
    pub const REVOKED_GROUP_MESSAGES: Namespace = Namespace(-11);
    pub const CLOSED_GROUP_MESSAGES: Namespace = Namespace(11);
    pub const ENCRYPTION_KEYS: Namespace = Namespace(12);
    pub const CLOSED_GROUP_INFO: Namespace = Namespace(13);
    pub const CLOSED_GROUP_MEMBERS: Namespace = Namespace(14);

    /// Namespaces holding the user's own config objects
    pub const USER_CONFIGS: [Namespace; 4] = [
        Namespace::USER_PROFILE,
        Namespace::CONTACTS,
        Namespace::CONVO_INFO_VOLATILE,
        Namespace::USER_GROUPS,
    ];

    /// Whether the network requires an authenticated request for this namespace.
    ///
    /// The default namespace is authenticated only on networks that say so.
    pub fn requires_auth(self, default_requires_auth: bool) -> bool {
        match self {
            Namespace::UNAUTHENTICATED_CLOSED_GROUP => false,
            Namespace::DEFAULT => default_requires_auth,
            _ => true,
        }
    }

    /// Whether the namespace carries config objects rather than messages
    pub fn is_config(self) -> bool {
        matches!(
            self,
            Namespace::USER_PROFILE
                | Namespace::CONTACTS
                | Namespace::CONVO_INFO_VOLATILE
                | Namespace::USER_GROUPS
                | Namespace::ENCRYPTION_KEYS
                | Namespace::CLOSED_GROUP_INFO
                | Namespace::CLOSED_GROUP_MEMBERS
        )
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message as held by a storage node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Base64 ciphertext
    pub data: String,
    /// Network-assigned content hash, the message identity
    pub hash: String,
    /// Sender-supplied timestamp (ms)
    pub timestamp: u64,
    /// Expiry (ms since epoch)
    pub expiry: u64,
}

/// Where an outbound message goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destination {
    /// One-to-one conversation
    Contact(AccountId),
    /// v2 closed group (`03` id)
    ClosedGroup(AccountId),
    /// Legacy closed group addressed by its `05` group key
    LegacyClosedGroup(AccountId),
    /// Community room
    OpenGroup {
        server: String,
        room: String,
        whisper_to: Option<AccountId>,
    },
    /// Community direct message to a blinded id
    OpenGroupInbox {
        server: String,
        /// Hex x25519 key of the community server
        server_key: String,
        blinded_id: AccountId,
    },
}

impl Destination {
    /// The account whose swarm stores messages for this destination, if any
    pub fn swarm_account(&self) -> Option<&AccountId> {
        match self {
            Destination::Contact(id)
            | Destination::ClosedGroup(id)
            | Destination::LegacyClosedGroup(id) => Some(id),
            Destination::OpenGroup { .. } | Destination::OpenGroupInbox { .. } => None,
        }
    }
}

/// Current time in milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
