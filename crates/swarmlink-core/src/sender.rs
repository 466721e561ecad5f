//! Outbound message dispatch.
//!
//! ```text
//! send(message, destination)
//!   ├─ stamp sender + timestamp
//!   ├─ self-send of a visible message ──► success, no network
//!   ├─ encrypt per destination ─────────── direct │ group key │ blinded │ plain
//!   ├─ namespaces per destination ──────── FuturesUnordered, first success wins
//!   └─ visible message to a contact ────── sync copy into our own swarm
//! ```
//!
//! Durable retry of a failed send is the host's job queue; this module
//! reports the outcome through a [`DeliveryObserver`] and returns.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::community::CommunityApi;
use crate::crypto::{encrypt_blinded, encrypt_for_group, encrypt_for_recipient};
use crate::error::{SwarmError, SwarmResult};
use crate::groups::SubAccountToken;
use crate::identity::Identity;
use crate::receive::{EnvelopeKind, WireEnvelope};
use crate::rpc::{RequestAuth, SnodeApi, SnodeMessage};
use crate::types::{AccountId, Destination, Namespace};

/// Network feature flags affecting namespace choice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkCapabilities {
    /// The default namespace only accepts signed writes
    pub default_requires_auth: bool,
    /// Legacy groups are migrating to the unauthenticated group namespace
    pub legacy_group_migration: bool,
}

impl NetworkCapabilities {
    /// Storage namespaces for a destination, in write order.
    pub fn namespaces_for(&self, destination: &Destination) -> Vec<Namespace> {
        match destination {
            Destination::Contact(_) => vec![Namespace::DEFAULT],
            Destination::ClosedGroup(_) => vec![Namespace::CLOSED_GROUP_MESSAGES],
            Destination::LegacyClosedGroup(_) => {
                if self.default_requires_auth {
                    vec![Namespace::UNAUTHENTICATED_CLOSED_GROUP]
                } else if self.legacy_group_migration {
                    vec![Namespace::UNAUTHENTICATED_CLOSED_GROUP, Namespace::DEFAULT]
                } else {
                    vec![Namespace::DEFAULT]
                }
            }
            Destination::OpenGroup { .. } | Destination::OpenGroupInbox { .. } => Vec::new(),
        }
    }
}

/// A message handed to the sender by the application
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    /// Application id used in delivery callbacks
    pub id: String,
    pub kind: EnvelopeKind,
    pub payload: Vec<u8>,
    /// Filled with network time when unset
    pub timestamp: Option<u64>,
    /// Filled with the local account when unset
    pub sender: Option<AccountId>,
    /// Set when this message is itself a sync copy
    pub sync_target: Option<AccountId>,
}

impl OutgoingMessage {
    pub fn visible(id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            kind: EnvelopeKind::Visible,
            payload,
            timestamp: None,
            sender: None,
            sync_target: None,
        }
    }
}

/// Result of a successful send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub timestamp: u64,
    /// Storage hash or community message id; `None` for self-sends
    pub reference: Option<String>,
    pub namespace: Option<Namespace>,
    /// Hash of the sync copy, when one was stored
    pub sync_hash: Option<String>,
}

/// Host application callbacks for delivery bookkeeping.
pub trait DeliveryObserver: Send + Sync {
    fn on_sent(&self, message_id: &str, destination: &Destination, outcome: &SendOutcome);
    fn on_failed(&self, message_id: &str, destination: &Destination, error: &SwarmError);
}

/// Observer that only logs
pub struct LogObserver;

impl DeliveryObserver for LogObserver {
    fn on_sent(&self, message_id: &str, _destination: &Destination, outcome: &SendOutcome) {
        debug!(message_id, reference = ?outcome.reference, "Message sent");
    }

    fn on_failed(&self, message_id: &str, _destination: &Destination, error: &SwarmError) {
        warn!(message_id, error = %error, "Message failed");
    }
}

/// What the sender needs to write into a v2 group
#[derive(Clone)]
pub struct GroupCredentials {
    /// Current group key
    pub key: [u8; 32],
    /// Member write token
    pub token: Option<SubAccountToken>,
    /// The group key pair, when we are the admin
    pub admin: Option<Arc<Identity>>,
}

/// Owned form of [`RequestAuth`], so writes can outlive the send call
#[derive(Clone)]
enum WriteAuth {
    None,
    Owner(Arc<Identity>),
    SubAccount {
        member: Arc<Identity>,
        token: SubAccountToken,
    },
}

impl WriteAuth {
    fn as_request(&self) -> RequestAuth<'_> {
        match self {
            WriteAuth::None => RequestAuth::None,
            WriteAuth::Owner(identity) => RequestAuth::Owner(identity),
            WriteAuth::SubAccount { member, token } => RequestAuth::SubAccount { member, token },
        }
    }
}

pub struct MessageSender {
    api: Arc<SnodeApi>,
    community: Option<Arc<dyn CommunityApi>>,
    observer: Arc<dyn DeliveryObserver>,
    capabilities: NetworkCapabilities,
    groups: RwLock<HashMap<AccountId, GroupCredentials>>,
}

impl MessageSender {
    pub fn new(api: Arc<SnodeApi>, observer: Arc<dyn DeliveryObserver>) -> Self {
        Self {
            api,
            community: None,
            observer,
            capabilities: NetworkCapabilities::default(),
            groups: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_community(mut self, community: Arc<dyn CommunityApi>) -> Self {
        self.community = Some(community);
        self
    }

    pub fn with_capabilities(mut self, capabilities: NetworkCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Register or update the credentials for a v2 group.
    pub fn set_group_credentials(&self, group: AccountId, credentials: GroupCredentials) {
        self.groups.write().insert(group, credentials);
    }

    /// Send `message`, reporting the outcome to the observer.
    #[instrument(skip(self, message), fields(message_id = %message.id))]
    pub async fn send(
        &self,
        message: OutgoingMessage,
        destination: &Destination,
    ) -> SwarmResult<SendOutcome> {
        let id = message.id.clone();
        match self.dispatch(message, destination).await {
            Ok(outcome) => {
                self.observer.on_sent(&id, destination, &outcome);
                Ok(outcome)
            }
            Err(e) => {
                self.observer.on_failed(&id, destination, &e);
                Err(e)
            }
        }
    }

    async fn dispatch(
        &self,
        mut message: OutgoingMessage,
        destination: &Destination,
    ) -> SwarmResult<SendOutcome> {
        let ctx = self.api.context();
        let identity = ctx.identity()?.clone();
        let local = identity.account_id();
        let timestamp = *message.timestamp.get_or_insert_with(|| ctx.clock.now());
        message.sender.get_or_insert_with(|| local.clone());

        if message.kind == EnvelopeKind::Visible && message.payload.is_empty() {
            return Err(SwarmError::InvalidMessage("empty visible message".into()));
        }

        if let Destination::Contact(contact) = destination {
            if *contact == local && message.kind == EnvelopeKind::Visible && message.sync_target.is_none() {
                debug!("Self-send short-circuit");
                return Ok(SendOutcome {
                    timestamp,
                    reference: None,
                    namespace: None,
                    sync_hash: None,
                });
            }
        }

        let body = WireEnvelope {
            kind: message.kind,
            timestamp,
            payload: message.payload.clone(),
            sync_target: message.sync_target.clone(),
        }
        .encode()?;

        let mut outcome = match destination {
            Destination::OpenGroup {
                server,
                room,
                whisper_to,
            } => {
                let community = self.community()?;
                let id = community
                    .send_message(server, room, body, whisper_to.as_ref())
                    .await?;
                SendOutcome {
                    timestamp,
                    reference: Some(id.to_string()),
                    namespace: None,
                    sync_hash: None,
                }
            }
            Destination::OpenGroupInbox {
                server,
                server_key,
                blinded_id,
            } => {
                let key: [u8; 32] = hex::decode(server_key)
                    .ok()
                    .and_then(|k| k.try_into().ok())
                    .ok_or_else(|| SwarmError::EncryptionFailed("bad community server key".into()))?;
                let sealed = encrypt_blinded(&identity, &key, blinded_id, &body)?;
                let id = self.community()?.send_inbox(server, blinded_id, sealed).await?;
                SendOutcome {
                    timestamp,
                    reference: Some(id.to_string()),
                    namespace: None,
                    sync_hash: None,
                }
            }
            Destination::Contact(recipient) | Destination::LegacyClosedGroup(recipient) => {
                let ciphertext = encrypt_for_recipient(&identity, recipient, &body)?;
                self.store_first_success(recipient, destination, ciphertext, timestamp, WriteAuth::None)
                    .await?
            }
            Destination::ClosedGroup(group) => {
                let credentials = self
                    .groups
                    .read()
                    .get(group)
                    .cloned()
                    .ok_or_else(|| SwarmError::EncryptionFailed(format!("no key for group {}", group.short())))?;
                let ciphertext = encrypt_for_group(&identity, group, &credentials.key, &body)?;
                let auth = match (credentials.admin, credentials.token) {
                    (Some(admin), _) => WriteAuth::Owner(admin),
                    (None, Some(token)) => WriteAuth::SubAccount {
                        member: identity.clone(),
                        token,
                    },
                    (None, None) => {
                        return Err(SwarmError::SigningFailed(
                            "no credentials to write to group".into(),
                        ))
                    }
                };
                self.store_first_success(group, destination, ciphertext, timestamp, auth)
                    .await?
            }
        };

        if let Destination::Contact(contact) = destination {
            if message.kind == EnvelopeKind::Visible && message.sync_target.is_none() && *contact != local {
                outcome.sync_hash = self.send_sync_copy(&identity, &message, contact, timestamp).await;
            }
        }
        info!(destination = ?destination_label(destination), reference = ?outcome.reference, "Dispatched message");
        Ok(outcome)
    }

    fn community(&self) -> SwarmResult<&Arc<dyn CommunityApi>> {
        self.community
            .as_ref()
            .ok_or_else(|| SwarmError::Generic("no community client configured".into()))
    }

    /// Store into every namespace of `destination` concurrently. The first
    /// success decides the outcome and is returned at once; the remaining
    /// writes finish in a background task.
    async fn store_first_success(
        &self,
        recipient: &AccountId,
        destination: &Destination,
        ciphertext: Vec<u8>,
        timestamp: u64,
        auth: WriteAuth,
    ) -> SwarmResult<SendOutcome> {
        let namespaces = self.capabilities.namespaces_for(destination);
        let message = SnodeMessage {
            recipient: recipient.clone(),
            data: STANDARD.encode(&ciphertext),
            ttl_ms: self.api.context().config.message_ttl_ms,
            timestamp,
        };

        let mut writes: FuturesUnordered<_> = namespaces
            .into_iter()
            .map(|namespace| {
                let api = self.api.clone();
                let message = message.clone();
                let auth = auth.clone();
                async move {
                    let result = api.send_message(&message, namespace, auth.as_request()).await;
                    (namespace, result)
                }
            })
            .collect();

        let mut last_error = SwarmError::Generic("no namespace to store into".into());
        while let Some((namespace, result)) = writes.next().await {
            match result {
                Ok(stored) => {
                    if !writes.is_empty() {
                        tokio::spawn(async move {
                            while let Some((namespace, result)) = writes.next().await {
                                if let Err(e) = result {
                                    debug!(%namespace, error = %e, "Trailing namespace write failed");
                                }
                            }
                        });
                    }
                    return Ok(SendOutcome {
                        timestamp,
                        reference: Some(stored.hash),
                        namespace: Some(namespace),
                        sync_hash: None,
                    });
                }
                Err(e) => {
                    debug!(%namespace, error = %e, "Namespace write failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Store a copy of a visible one-to-one message in our own swarm so other
    /// devices see it. Failures are logged, not surfaced.
    async fn send_sync_copy(
        &self,
        identity: &Identity,
        message: &OutgoingMessage,
        contact: &AccountId,
        timestamp: u64,
    ) -> Option<String> {
        let local = identity.account_id();
        let result = async {
            let body = WireEnvelope {
                kind: message.kind,
                timestamp,
                payload: message.payload.clone(),
                sync_target: Some(contact.clone()),
            }
            .encode()?;
            let ciphertext = encrypt_for_recipient(identity, &local, &body)?;
            let copy = SnodeMessage {
                recipient: local.clone(),
                data: STANDARD.encode(ciphertext),
                ttl_ms: self.api.context().config.message_ttl_ms,
                timestamp,
            };
            self.api
                .send_message(&copy, Namespace::DEFAULT, RequestAuth::None)
                .await
        }
        .await;
        match result {
            Ok(stored) => Some(stored.hash),
            Err(e) => {
                warn!(error = %e, "Sync copy failed");
                None
            }
        }
    }
}

fn destination_label(destination: &Destination) -> String {
    match destination {
        Destination::Contact(id) => format!("contact {}", id.short()),
        Destination::ClosedGroup(id) => format!("group {}", id.short()),
        Destination::LegacyClosedGroup(id) => format!("legacy group {}", id.short()),
        Destination::OpenGroup { server, room, .. } => format!("{}/{}", server, room),
        Destination::OpenGroupInbox { server, .. } => format!("{} inbox", server),
    }
}
