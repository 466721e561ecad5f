//! Community (open group) servers.
//!
//! Communities are not stored in swarms; a server hosts rooms and per-user
//! blinded inboxes. The HTTP client is a collaborator behind
//! [`CommunityApi`]; this module turns poll results into ordered updates.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::crypto::decrypt_blinded;
use crate::error::{SwarmError, SwarmResult};
use crate::identity::Identity;
use crate::storage::CommunityCursor;
use crate::types::AccountId;

/// A community server and its x25519 key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommunityServer {
    pub url: String,
    /// Hex x25519 public key
    pub public_key: String,
}

impl CommunityServer {
    pub fn key_bytes(&self) -> SwarmResult<[u8; 32]> {
        hex::decode(&self.public_key)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| SwarmError::ValidationFailed("bad community server key".into()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub token: String,
    pub name: String,
    pub active_users: u64,
    /// Bumped by the server whenever room details change
    pub info_updates: i64,
}

/// A room message. `data` is absent for deletions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunityMessage {
    pub id: i64,
    pub seqno: i64,
    /// Blinded or standard id of the poster
    pub sender: String,
    pub posted_ms: u64,
    /// Base64 content
    pub data: Option<String>,
    pub whisper_to: Option<String>,
}

/// A blinded direct message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectMessage {
    pub id: i64,
    pub sender: String,
    pub recipient: String,
    pub posted_ms: u64,
    /// Base64 ciphertext
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomPoll {
    pub room: String,
    pub info: Option<RoomInfo>,
    pub messages: Vec<CommunityMessage>,
}

/// Everything one poll of a server returns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommunityPoll {
    pub capabilities: Vec<String>,
    pub rooms: Vec<RoomPoll>,
    pub inbox: Vec<DirectMessage>,
    pub outbox: Vec<DirectMessage>,
}

/// What to ask the server for
#[derive(Debug, Clone, PartialEq)]
pub struct PollRequest {
    pub rooms: Vec<(String, i64)>,
    pub inbox_since: i64,
    pub outbox_since: i64,
}

/// Community server client.
#[async_trait]
pub trait CommunityApi: Send + Sync {
    /// Capabilities, room info, new room messages and inbox/outbox in one
    /// round trip.
    async fn poll(&self, server: &str, request: PollRequest) -> SwarmResult<CommunityPoll>;

    /// Post to a room, returning the message id.
    async fn send_message(
        &self,
        server: &str,
        room: &str,
        data: Vec<u8>,
        whisper_to: Option<&AccountId>,
    ) -> SwarmResult<i64>;

    /// Send an encrypted direct message to a blinded id.
    async fn send_inbox(
        &self,
        server: &str,
        recipient: &AccountId,
        data: Vec<u8>,
    ) -> SwarmResult<i64>;
}

/// Ordered changes for one room
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoomUpdate {
    pub room: String,
    pub info: Option<RoomInfo>,
    /// New messages with their decoded content, by ascending seqno
    pub additions: Vec<(CommunityMessage, Vec<u8>)>,
    /// Ids of deleted messages
    pub deletions: Vec<i64>,
}

/// A decrypted inbox or outbox message
#[derive(Debug, Clone, PartialEq)]
pub struct DirectUpdate {
    pub id: i64,
    /// The other party's blinded id
    pub counterpart: String,
    pub payload: Vec<u8>,
    pub outgoing: bool,
}

/// Receives what the community poller learned.
#[async_trait]
pub trait CommunityHandler: Send + Sync {
    async fn on_room(&self, server: &CommunityServer, update: RoomUpdate) -> SwarmResult<()>;

    async fn on_direct(&self, server: &CommunityServer, updates: Vec<DirectUpdate>) -> SwarmResult<()>;
}

/// Split a room's poll into ordered additions and deletions, advancing the
/// cursor to the highest seqno.
pub fn process_room(poll: RoomPoll, cursor: &mut CommunityCursor) -> RoomUpdate {
    let mut messages = poll.messages;
    messages.sort_by_key(|m| m.seqno);

    let mut update = RoomUpdate {
        room: poll.room,
        info: poll.info,
        ..Default::default()
    };
    for message in messages {
        cursor.last_seqno = cursor.last_seqno.max(message.seqno);
        let decoded = message.data.as_ref().map(|data| STANDARD.decode(data));
        match decoded {
            None => update.deletions.push(message.id),
            Some(Ok(content)) => update.additions.push((message, content)),
            Some(Err(e)) => warn!(id = message.id, error = %e, "Undecodable community message"),
        }
    }
    debug!(
        room = %update.room,
        added = update.additions.len(),
        deleted = update.deletions.len(),
        seqno = cursor.last_seqno,
        "Processed community room"
    );
    update
}

/// Decrypt inbox (incoming) or outbox (our own sent) messages, advancing the
/// matching cursor. Messages that do not open are skipped.
pub fn process_direct(
    identity: &Identity,
    server: &CommunityServer,
    messages: Vec<DirectMessage>,
    outgoing: bool,
    cursor: &mut CommunityCursor,
) -> SwarmResult<Vec<DirectUpdate>> {
    let server_key = server.key_bytes()?;
    let mut messages = messages;
    messages.sort_by_key(|m| m.id);

    let mut updates = Vec::new();
    for message in messages {
        let last = if outgoing {
            &mut cursor.last_outbox_id
        } else {
            &mut cursor.last_inbox_id
        };
        *last = (*last).max(message.id);

        let opened = STANDARD
            .decode(&message.message)
            .map_err(|e| SwarmError::InvalidMessage(e.to_string()))
            .and_then(|data| {
                if outgoing {
                    // Outbox copies are sealed to the recipient; we only
                    // keep their id and counterpart.
                    Ok(data)
                } else {
                    decrypt_blinded(identity, &server_key, &data).map(|(payload, _)| payload)
                }
            });
        match opened {
            Ok(payload) => updates.push(DirectUpdate {
                id: message.id,
                counterpart: if outgoing {
                    message.recipient
                } else {
                    message.sender
                },
                payload,
                outgoing,
            }),
            Err(e) => warn!(id = message.id, error = %e, "Skipping community direct message"),
        }
    }
    Ok(updates)
}
