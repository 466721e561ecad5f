//! Receive pipeline: cursor, dedup, unwrap, batch.
//!
//! ```text
//! retrieved [StoredMessage] ──► advance cursor (node, account, namespace)
//!                              ──► seen-set filter (hashes recorded first)
//!                              ──► base64 ─► MessageOpener ─► Envelope
//!                              ──► chunks of batch_size ─► BatchSink
//! ```
//!
//! A hash is marked seen before its message is opened, so a message that
//! fails to open is never fetched again. Processing failures belong to the
//! sink, not to the network path.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::crypto::{decrypt_for_group, decrypt_for_recipient};
use crate::error::{SwarmError, SwarmResult};
use crate::identity::Identity;
use crate::storage::SwarmStore;
use crate::types::{AccountId, Namespace, Node, StoredMessage};

/// What an envelope carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// User-visible content
    Visible,
    /// Protocol control (typing, receipts, group updates)
    Control,
    /// Config or sync traffic
    Config,
}

/// Encrypted body of every stored message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub kind: EnvelopeKind,
    pub timestamp: u64,
    pub payload: Vec<u8>,
    /// Set on sync copies: the conversation the original was sent to
    pub sync_target: Option<AccountId>,
}

impl WireEnvelope {
    pub fn encode(&self) -> SwarmResult<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| SwarmError::ProtoConversionFailed(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> SwarmResult<Self> {
        postcard::from_bytes(bytes).map_err(|e| SwarmError::InvalidMessage(e.to_string()))
    }
}

/// A decrypted unit of application content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    /// Verified sender, when the encryption carries one
    pub sender: Option<AccountId>,
    pub timestamp: u64,
    pub payload: Vec<u8>,
    pub sync_target: Option<AccountId>,
    /// Hash of the stored message this came from
    pub source_hash: String,
}

/// Decrypts the ciphertext of a stored message.
pub trait MessageOpener: Send + Sync {
    /// Plaintext and verified sender
    fn open(&self, data: &[u8]) -> SwarmResult<(Vec<u8>, Option<AccountId>)>;
}

/// One-to-one messages addressed to `identity`
pub struct DirectOpener<'a>(pub &'a Identity);

impl MessageOpener for DirectOpener<'_> {
    fn open(&self, data: &[u8]) -> SwarmResult<(Vec<u8>, Option<AccountId>)> {
        let (payload, sender) = decrypt_for_recipient(self.0, data)?;
        Ok((payload, Some(sender)))
    }
}

/// v2 group messages, tried against every known key
pub struct GroupOpener<'a> {
    pub group: &'a AccountId,
    pub keys: &'a [[u8; 32]],
}

impl MessageOpener for GroupOpener<'_> {
    fn open(&self, data: &[u8]) -> SwarmResult<(Vec<u8>, Option<AccountId>)> {
        let (payload, sender) = decrypt_for_group(self.group, self.keys, data)?;
        Ok((payload, Some(sender)))
    }
}

/// A unit of downstream work
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiveBatch {
    pub account: AccountId,
    pub namespace: Namespace,
    pub envelopes: Vec<Envelope>,
}

/// Consumer of receive batches (the host's job queue).
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn submit(&self, batch: ReceiveBatch) -> SwarmResult<()>;
}

/// Sink that forwards batches over a tokio channel
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ReceiveBatch>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReceiveBatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl BatchSink for ChannelSink {
    async fn submit(&self, batch: ReceiveBatch) -> SwarmResult<()> {
        self.tx
            .send(batch)
            .map_err(|_| SwarmError::Generic("batch receiver dropped".into()))
    }
}

pub struct ReceivePipeline {
    store: Arc<dyn SwarmStore>,
    batch_size: usize,
}

impl ReceivePipeline {
    pub fn new(store: Arc<dyn SwarmStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Move the cursor of (node, account, namespace) to the last message.
    pub fn advance_cursor(
        &self,
        raw: &[StoredMessage],
        node: &Node,
        account: &AccountId,
        namespace: Namespace,
    ) -> SwarmResult<()> {
        if let Some(last) = raw.last() {
            self.store.set_last_hash(node, account, namespace, &last.hash)?;
        }
        Ok(())
    }

    /// Messages whose hash was not seen before; all of them become seen.
    pub fn dedup(&self, account: &AccountId, raw: &[StoredMessage]) -> SwarmResult<Vec<StoredMessage>> {
        let hashes: Vec<String> = raw.iter().map(|m| m.hash.clone()).collect();
        let fresh = self.store.mark_seen(account, &hashes)?;
        let mut taken = std::collections::HashSet::new();
        Ok(raw
            .iter()
            .filter(|m| fresh.contains(&m.hash) && taken.insert(m.hash.clone()))
            .cloned()
            .collect())
    }

    /// Cursor, dedup and unwrap one retrieval result.
    pub fn ingest(
        &self,
        raw: &[StoredMessage],
        node: &Node,
        account: &AccountId,
        namespace: Namespace,
        opener: &dyn MessageOpener,
    ) -> SwarmResult<Vec<Envelope>> {
        self.advance_cursor(raw, node, account, namespace)?;
        let fresh = self.dedup(account, raw)?;
        let envelopes: Vec<Envelope> = fresh
            .iter()
            .filter_map(|message| match unwrap_message(message, opener) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    warn!(hash = %message.hash, %namespace, error = %e, "Dropping message that failed to unwrap");
                    None
                }
            })
            .collect();
        debug!(
            account = %account.short(),
            %namespace,
            retrieved = raw.len(),
            new = fresh.len(),
            opened = envelopes.len(),
            "Ingested messages"
        );
        Ok(envelopes)
    }

    /// Split into chunks of at most `batch_size`.
    pub fn batches(&self, envelopes: Vec<Envelope>) -> Vec<Vec<Envelope>> {
        let mut batches = Vec::new();
        let mut iter = envelopes.into_iter().peekable();
        while iter.peek().is_some() {
            batches.push(iter.by_ref().take(self.batch_size).collect());
        }
        batches
    }

    /// Hand envelopes to `sink` in batches. Returns the number submitted.
    pub async fn deliver(
        &self,
        sink: &dyn BatchSink,
        account: &AccountId,
        namespace: Namespace,
        envelopes: Vec<Envelope>,
    ) -> SwarmResult<usize> {
        let count = envelopes.len();
        for batch in self.batches(envelopes) {
            sink.submit(ReceiveBatch {
                account: account.clone(),
                namespace,
                envelopes: batch,
            })
            .await?;
        }
        Ok(count)
    }
}

fn unwrap_message(message: &StoredMessage, opener: &dyn MessageOpener) -> SwarmResult<Envelope> {
    let data = STANDARD
        .decode(&message.data)
        .map_err(|e| SwarmError::InvalidMessage(format!("bad base64: {}", e)))?;
    let (plaintext, sender) = opener.open(&data)?;
    let wire = WireEnvelope::decode(&plaintext)?;
    Ok(Envelope {
        kind: wire.kind,
        sender,
        timestamp: wire.timestamp,
        payload: wire.payload,
        sync_target: wire.sync_target,
        source_hash: message.hash.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::encrypt_for_recipient;
    use crate::storage::MemoryStore;

    fn node() -> Node {
        Node::new("10.0.0.1", 443, "ed", "x")
    }

    fn stored(sender: &Identity, recipient: &AccountId, text: &str, hash: &str) -> StoredMessage {
        let body = WireEnvelope {
            kind: EnvelopeKind::Visible,
            timestamp: 7,
            payload: text.as_bytes().to_vec(),
            sync_target: None,
        }
        .encode()
        .unwrap();
        StoredMessage {
            data: STANDARD.encode(encrypt_for_recipient(sender, recipient, &body).unwrap()),
            hash: hash.to_string(),
            timestamp: 7,
            expiry: 100,
        }
    }

    #[test]
    fn test_ingest_dedups_and_advances_cursor() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = ReceivePipeline::new(store.clone(), 512);
        let alice = Identity::generate();
        let bob = Identity::generate();
        let raw = vec![
            stored(&alice, &bob.account_id(), "one", "h1"),
            stored(&alice, &bob.account_id(), "two", "h2"),
        ];

        let first = pipeline
            .ingest(&raw, &node(), &bob.account_id(), Namespace::DEFAULT, &DirectOpener(&bob))
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].sender, Some(alice.account_id()));
        assert_eq!(first[0].payload, b"one");
        assert_eq!(first[1].source_hash, "h2");

        let second = pipeline
            .ingest(&raw, &node(), &bob.account_id(), Namespace::DEFAULT, &DirectOpener(&bob))
            .unwrap();
        assert!(second.is_empty());
        assert_eq!(store.seen_count(&bob.account_id()).unwrap(), 2);
        assert_eq!(
            store
                .last_hash(&node(), &bob.account_id(), Namespace::DEFAULT)
                .unwrap()
                .as_deref(),
            Some("h2")
        );
    }

    #[test]
    fn test_unopenable_message_is_dropped_but_seen() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = ReceivePipeline::new(store.clone(), 512);
        let bob = Identity::generate();
        let raw = vec![StoredMessage {
            data: STANDARD.encode(b"not encrypted"),
            hash: "junk".into(),
            timestamp: 0,
            expiry: 0,
        }];
        let envelopes = pipeline
            .ingest(&raw, &node(), &bob.account_id(), Namespace::DEFAULT, &DirectOpener(&bob))
            .unwrap();
        assert!(envelopes.is_empty());
        assert_eq!(store.seen_count(&bob.account_id()).unwrap(), 1);
    }

    #[test]
    fn test_duplicate_hash_within_batch() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = ReceivePipeline::new(store, 512);
        let alice = Identity::generate();
        let bob = Identity::generate();
        let message = stored(&alice, &bob.account_id(), "x", "same");
        let fresh = pipeline
            .dedup(&bob.account_id(), &[message.clone(), message])
            .unwrap();
        assert_eq!(fresh.len(), 1);
    }

    #[test]
    fn test_batches_respect_size() {
        let pipeline = ReceivePipeline::new(Arc::new(MemoryStore::new()), 2);
        let envelope = Envelope {
            kind: EnvelopeKind::Visible,
            sender: None,
            timestamp: 0,
            payload: Vec::new(),
            sync_target: None,
            source_hash: String::new(),
        };
        let batches = pipeline.batches(vec![envelope; 5]);
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 2, 1]);
        assert!(pipeline.batches(Vec::new()).is_empty());
    }

    #[tokio::test]
    async fn test_deliver_through_channel() {
        let pipeline = ReceivePipeline::new(Arc::new(MemoryStore::new()), 512);
        let (sink, mut rx) = ChannelSink::new();
        let account = Identity::generate().account_id();
        let envelope = Envelope {
            kind: EnvelopeKind::Control,
            sender: None,
            timestamp: 1,
            payload: vec![1],
            sync_target: None,
            source_hash: "h".into(),
        };
        let count = pipeline
            .deliver(&sink, &account, Namespace::DEFAULT, vec![envelope.clone()])
            .await
            .unwrap();
        assert_eq!(count, 1);
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.envelopes, vec![envelope]);
    }
}
