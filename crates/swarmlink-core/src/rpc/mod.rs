//! Storage RPC layer.
//!
//! Typed calls against storage nodes, each wrapped in node-health-aware
//! retry:
//!
//! ```text
//! ┌──────────────┐  pick unused swarm node  ┌─────────────┐
//! │ Attempts     │ ───────────────────────► │ OnionClient │
//! │ (max 6)      │ ◄─────────────────────── │  send()     │
//! └──────┬───────┘   status / body          └─────────────┘
//!        │ non-2xx
//!        ▼
//!   handle_failure: count failure │ recalibrate clock │ replace swarm
//! ```
//!
//! Node faults are absorbed here. Callers only ever see `Generic` after the
//! budget is spent, `ClockOutOfSync`, or permanent crypto/validation errors.

mod auth;
mod classify;
mod retry;

use std::collections::HashMap;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, instrument, warn};

pub use auth::{namespaced_message, RequestAuth};
pub use retry::Attempts;

use crate::context::SwarmContext;
use crate::crypto::SymmetricCipher;
use crate::error::{SwarmError, SwarmResult};
use crate::identity::verify_signature;
use crate::onion::RpcMethod;
use crate::types::{AccountId, IdPrefix, Namespace, Node, StoredMessage, Swarm};

/// Number of nodes that must agree on an ONS lookup
pub const ONS_VALIDATION_COUNT: usize = 3;

const ONS_VALUE_CONTEXT: &str = "swarmlink 2024 ons value";

/// A message ready to be stored in a swarm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnodeMessage {
    /// Account whose swarm receives the message
    pub recipient: AccountId,
    /// Base64 payload
    pub data: String,
    pub ttl_ms: u64,
    pub timestamp: u64,
}

/// Where and under which hash a message was stored
#[derive(Debug, Clone, PartialEq)]
pub struct StoreResult {
    pub hash: String,
    pub node: Node,
}

/// Typed client for storage node RPCs.
pub struct SnodeApi {
    pub(crate) ctx: Arc<SwarmContext>,
}

impl SnodeApi {
    pub fn new(ctx: Arc<SwarmContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<SwarmContext> {
        &self.ctx
    }

    /// One call to one node, with failure classification but no retry.
    pub(crate) async fn invoke(
        &self,
        method: RpcMethod,
        params: Value,
        node: &Node,
        account: Option<&AccountId>,
        identity_key: Option<&str>,
    ) -> SwarmResult<Value> {
        let response = match self.ctx.onion.send(method, params, node, identity_key).await {
            Ok(response) => response,
            Err(e) => return Err(self.handle_transport_error(node, account, e)),
        };
        if response.is_success() {
            Ok(response.body)
        } else {
            Err(self.handle_failure(node, account, &response).await)
        }
    }

    /// Call `method` on random nodes of `account`'s swarm until one succeeds
    /// or the retry budget runs out. A node is never tried twice.
    pub(crate) async fn invoke_on_swarm(
        &self,
        method: RpcMethod,
        account: &AccountId,
        params: Value,
        identity_key: Option<&str>,
    ) -> SwarmResult<(Node, Value)> {
        let mut attempts = Attempts::new(self.ctx.config.max_retry_count);
        while attempts.begin() {
            let Some(node) = self
                .ctx
                .resolver
                .random_swarm_node(account, attempts.used())
                .await?
            else {
                debug!(%method, account = %account.short(), "No untried swarm node left");
                break;
            };
            attempts.mark_used(node.clone());

            match self
                .invoke(method, params.clone(), &node, Some(account), identity_key)
                .await
            {
                Ok(body) => return Ok((node, body)),
                Err(e) if e.is_retryable() => attempts.fail(e),
                Err(e) => return Err(e),
            }
        }
        Err(attempts.exhausted(method.as_str()))
    }

    /// The account's swarm, resolved through the cache.
    pub async fn get_swarm(&self, account: &AccountId) -> SwarmResult<Swarm> {
        self.ctx.resolver.resolve_swarm(account).await
    }

    /// Retrieve messages newer than `last_hash` from one node.
    #[instrument(skip(self, auth), fields(account = %account.short(), %namespace))]
    pub async fn get_raw_messages(
        &self,
        node: &Node,
        account: &AccountId,
        namespace: Namespace,
        last_hash: Option<&str>,
        auth: RequestAuth<'_>,
    ) -> SwarmResult<Vec<StoredMessage>> {
        let timestamp = self.ctx.clock.now();
        let mut params = Map::new();
        params.insert("pubKey".into(), json!(account.to_hex()));
        params.insert("lastHash".into(), json!(last_hash.unwrap_or("")));
        if namespace != Namespace::DEFAULT {
            params.insert("namespace".into(), json!(namespace.0));
        }
        if !auth.is_none() {
            params.insert("timestamp".into(), json!(timestamp));
            auth.apply(
                &mut params,
                &namespaced_message("retrieve", namespace.0, timestamp),
            )?;
        }

        let identity_key = auth.identity_key();
        let body = self
            .invoke(
                RpcMethod::Retrieve,
                Value::Object(params),
                node,
                Some(account),
                identity_key.as_deref(),
            )
            .await?;
        Ok(parse_messages(&body))
    }

    /// Retrieve several namespaces from one node concurrently. Each
    /// namespace keeps its own cursor and its own result.
    pub async fn retrieve_many(
        &self,
        node: &Node,
        account: &AccountId,
        requests: &[(Namespace, Option<String>)],
        auth: RequestAuth<'_>,
    ) -> Vec<(Namespace, SwarmResult<Vec<StoredMessage>>)> {
        let calls = requests.iter().map(|(namespace, last_hash)| async move {
            let result = self
                .get_raw_messages(node, account, *namespace, last_hash.as_deref(), auth)
                .await;
            (*namespace, result)
        });
        join_all(calls).await
    }

    /// Store a message in the recipient's swarm.
    #[instrument(skip(self, message, auth), fields(account = %message.recipient.short(), %namespace))]
    pub async fn send_message(
        &self,
        message: &SnodeMessage,
        namespace: Namespace,
        auth: RequestAuth<'_>,
    ) -> SwarmResult<StoreResult> {
        let timestamp = self.ctx.clock.now();
        let mut params = Map::new();
        params.insert("pubKey".into(), json!(message.recipient.to_hex()));
        params.insert("data".into(), json!(message.data));
        params.insert("ttl".into(), json!(message.ttl_ms));
        params.insert("timestamp".into(), json!(message.timestamp));
        if namespace != Namespace::DEFAULT {
            params.insert("namespace".into(), json!(namespace.0));
        }
        auth.apply(&mut params, &namespaced_message("store", namespace.0, timestamp))?;
        if !auth.is_none() {
            params.insert("sig_timestamp".into(), json!(timestamp));
        }

        let identity_key = auth.identity_key();
        let (node, body) = self
            .invoke_on_swarm(
                RpcMethod::Store,
                &message.recipient,
                Value::Object(params),
                identity_key.as_deref(),
            )
            .await?;
        let hash = body
            .get("hash")
            .and_then(Value::as_str)
            .ok_or_else(|| SwarmError::Generic("store response has no hash".into()))?
            .to_string();
        debug!(%hash, %node, "Stored message");
        Ok(StoreResult { hash, node })
    }

    /// Delete messages by hash. Returns, per responding node (ed25519 key),
    /// whether it verifiably deleted what was asked.
    pub async fn delete_messages(
        &self,
        account: &AccountId,
        hashes: &[String],
        auth: RequestAuth<'_>,
    ) -> SwarmResult<HashMap<String, bool>> {
        if hashes.is_empty() {
            return Ok(HashMap::new());
        }
        let mut params = Map::new();
        params.insert("pubkey".into(), json!(account.to_hex()));
        params.insert("messages".into(), json!(hashes));
        let mut signed = b"delete".to_vec();
        for hash in hashes {
            signed.extend_from_slice(hash.as_bytes());
        }
        auth.apply(&mut params, &signed)?;

        let identity_key = auth.identity_key();
        let (_, body) = self
            .invoke_on_swarm(
                RpcMethod::Delete,
                account,
                Value::Object(params),
                identity_key.as_deref(),
            )
            .await?;

        let requested = hashes.concat();
        verify_swarm_results(&body, |deleted| {
            format!("{}{}{}", account.to_hex(), requested, deleted.concat()).into_bytes()
        })
    }

    /// Delete everything stored for the account, signed at `timestamp`
    /// (network time).
    pub async fn delete_all(
        &self,
        account: &AccountId,
        timestamp: u64,
        auth: RequestAuth<'_>,
    ) -> SwarmResult<HashMap<String, bool>> {
        let mut params = Map::new();
        params.insert("pubkey".into(), json!(account.to_hex()));
        params.insert("timestamp".into(), json!(timestamp));
        auth.apply(&mut params, format!("delete_all{}", timestamp).as_bytes())?;

        let identity_key = auth.identity_key();
        let (_, body) = self
            .invoke_on_swarm(
                RpcMethod::DeleteAll,
                account,
                Value::Object(params),
                identity_key.as_deref(),
            )
            .await?;

        verify_swarm_results(&body, |deleted| {
            format!("{}{}{}", account.to_hex(), timestamp, deleted.concat()).into_bytes()
        })
    }

    /// [`delete_all`](Self::delete_all) at the swarm's current network time.
    pub async fn delete_all_now(
        &self,
        account: &AccountId,
        auth: RequestAuth<'_>,
    ) -> SwarmResult<HashMap<String, bool>> {
        let timestamp = self.network_time(account).await?;
        self.delete_all(account, timestamp, auth).await
    }

    /// Change the expiry of stored messages. With `extend`, nodes only ever
    /// lengthen the TTL. Returns the hashes any node reported as updated.
    pub async fn alter_ttl(
        &self,
        account: &AccountId,
        hashes: &[String],
        new_expiry: u64,
        extend: bool,
        auth: RequestAuth<'_>,
    ) -> SwarmResult<Vec<String>> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let mut params = Map::new();
        params.insert("pubkey".into(), json!(account.to_hex()));
        params.insert("messages".into(), json!(hashes));
        params.insert("expiry".into(), json!(new_expiry));
        if extend {
            params.insert("extend".into(), json!(true));
        }
        let mut signed = b"expire".to_vec();
        if extend {
            signed.extend_from_slice(b"extend");
        }
        signed.extend_from_slice(new_expiry.to_string().as_bytes());
        for hash in hashes {
            signed.extend_from_slice(hash.as_bytes());
        }
        auth.apply(&mut params, &signed)?;

        let identity_key = auth.identity_key();
        let (_, body) = self
            .invoke_on_swarm(
                RpcMethod::Expire,
                account,
                Value::Object(params),
                identity_key.as_deref(),
            )
            .await?;

        let mut updated: Vec<String> = body
            .get("swarm")
            .and_then(Value::as_object)
            .into_iter()
            .flat_map(|swarm| swarm.values())
            .filter_map(|result| result.get("updated").and_then(Value::as_array))
            .flatten()
            .filter_map(|h| h.as_str().map(str::to_string))
            .collect();
        updated.sort();
        updated.dedup();
        Ok(updated)
    }

    /// Network time reported by `node`.
    pub async fn info(&self, node: &Node) -> SwarmResult<u64> {
        let body = self
            .invoke(RpcMethod::Info, json!({}), node, None, None)
            .await?;
        body.get("timestamp")
            .and_then(Value::as_u64)
            .ok_or_else(|| SwarmError::Generic("info response has no timestamp".into()))
    }

    /// Network time from a node of the account's swarm, with retry.
    pub async fn network_time(&self, account: &AccountId) -> SwarmResult<u64> {
        let (_, body) = self
            .invoke_on_swarm(RpcMethod::Info, account, json!({}), None)
            .await?;
        let timestamp = body
            .get("timestamp")
            .and_then(Value::as_u64)
            .ok_or_else(|| SwarmError::Generic("info response has no timestamp".into()))?;
        self.ctx.clock.calibrate(timestamp);
        Ok(timestamp)
    }

    /// Resolve a registered name to an account id. Three random nodes must
    /// return the same encrypted record.
    pub async fn ons_resolve(&self, name: &str) -> SwarmResult<AccountId> {
        let name = validate_ons_name(name)?;
        let name_hash = blake3::hash(name.as_bytes());
        let params = json!({
            "type": 0,
            "name_hash": STANDARD.encode(name_hash.as_bytes()),
        });

        self.ctx
            .pool
            .refresh_if_needed(self.ctx.onion.transport().as_ref())
            .await?;
        let nodes = self.ctx.pool.random_nodes(ONS_VALIDATION_COUNT, &[]);
        if nodes.len() < ONS_VALIDATION_COUNT {
            return Err(SwarmError::Generic(format!(
                "ons lookup needs {} nodes, pool has {}",
                ONS_VALIDATION_COUNT,
                nodes.len()
            )));
        }

        let lookups = nodes
            .iter()
            .map(|node| self.invoke(RpcMethod::OnsResolve, params.clone(), node, None, None));
        let mut values = Vec::with_capacity(nodes.len());
        for result in join_all(lookups).await {
            let body = result?;
            let value = body
                .get("encrypted_value")
                .and_then(Value::as_str)
                .ok_or_else(|| SwarmError::ValidationFailed("missing encrypted_value".into()))?
                .to_string();
            values.push(value);
        }
        if values.windows(2).any(|w| w[0] != w[1]) {
            warn!(name, "ONS nodes disagree");
            return Err(SwarmError::ValidationFailed("ons results disagree".into()));
        }

        let ciphertext = hex::decode(&values[0])
            .map_err(|e| SwarmError::DecryptionFailed(format!("bad ons hex: {}", e)))?;
        let key = ons_value_key(&name);
        let plaintext = SymmetricCipher::new(&key).decrypt(&ciphertext)?;
        let account = parse_ons_account(&plaintext)?;
        info!(name, account = %account.short(), "Resolved ONS name");
        Ok(account)
    }
}

/// Lower-cased name, or `HashingFailed` when it cannot be a registered name.
fn validate_ons_name(name: &str) -> SwarmResult<String> {
    let name = name.trim().to_lowercase();
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(name)
    } else {
        Err(SwarmError::HashingFailed(format!("invalid ons name {:?}", name)))
    }
}

/// Key sealing an ONS record for `name`
pub fn ons_value_key(name: &str) -> [u8; 32] {
    blake3::derive_key(ONS_VALUE_CONTEXT, name.to_lowercase().as_bytes())
}

fn parse_ons_account(plaintext: &[u8]) -> SwarmResult<AccountId> {
    if plaintext.len() != 33 || plaintext[0] != 0x05 {
        return Err(SwarmError::ValidationFailed("ons value is not an account id".into()));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&plaintext[1..]);
    Ok(AccountId::new(IdPrefix::Standard, key))
}

/// Parse a `retrieve` body, skipping entries without data or hash.
pub fn parse_messages(body: &Value) -> Vec<StoredMessage> {
    let Some(messages) = body.get("messages").and_then(Value::as_array) else {
        return Vec::new();
    };
    messages
        .iter()
        .filter_map(|m| {
            let hash = m.get("hash").and_then(Value::as_str);
            let data = m.get("data").and_then(Value::as_str);
            match (hash, data) {
                (Some(hash), Some(data)) => Some(StoredMessage {
                    data: data.to_string(),
                    hash: hash.to_string(),
                    timestamp: m.get("timestamp").and_then(Value::as_u64).unwrap_or(0),
                    expiry: m.get("expiration").and_then(Value::as_u64).unwrap_or(0),
                }),
                _ => {
                    debug!("Skipping retrieved message without hash or data");
                    None
                }
            }
        })
        .collect()
}

/// Check each node's `{deleted, signature}` entry in a `swarm` map.
fn verify_swarm_results(
    body: &Value,
    signed_message: impl Fn(&[String]) -> Vec<u8>,
) -> SwarmResult<HashMap<String, bool>> {
    let swarm = body
        .get("swarm")
        .and_then(Value::as_object)
        .ok_or_else(|| SwarmError::ValidationFailed("response has no swarm results".into()))?;

    let mut results = HashMap::new();
    for (node_key, result) in swarm {
        if result.get("failed").and_then(Value::as_bool).unwrap_or(false) {
            warn!(
                node = %node_key,
                code = ?result.get("code"),
                reason = ?result.get("reason"),
                "Node failed to apply request"
            );
            results.insert(node_key.clone(), false);
            continue;
        }
        let deleted: Vec<String> = result
            .get("deleted")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|h| h.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let verified = (|| -> SwarmResult<()> {
            let key_bytes = hex::decode(node_key)
                .map_err(|e| SwarmError::ValidationFailed(e.to_string()))?;
            let key: [u8; 32] = key_bytes
                .try_into()
                .map_err(|_| SwarmError::ValidationFailed("node key length".into()))?;
            let signature = result
                .get("signature")
                .and_then(Value::as_str)
                .ok_or_else(|| SwarmError::ValidationFailed("missing signature".into()))?;
            let signature = STANDARD
                .decode(signature)
                .map_err(|e| SwarmError::ValidationFailed(e.to_string()))?;
            verify_signature(&key, &signed_message(&deleted), &signature)
        })();
        if let Err(e) = &verified {
            warn!(node = %node_key, error = %e, "Unverifiable node result");
        }
        results.insert(node_key.clone(), verified.is_ok());
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_messages_skips_incomplete() {
        let body = json!({
            "messages": [
                {"hash": "h1", "data": "ZGF0YQ==", "timestamp": 5, "expiration": 10},
                {"data": "bm8gaGFzaA=="},
                {"hash": "h3"},
            ]
        });
        let messages = parse_messages(&body);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].hash, "h1");
        assert_eq!(messages[0].expiry, 10);
        assert!(parse_messages(&json!({})).is_empty());
    }

    #[test]
    fn test_ons_name_validation() {
        assert_eq!(validate_ons_name(" Alice_1 ").unwrap(), "alice_1");
        assert!(matches!(validate_ons_name(""), Err(SwarmError::HashingFailed(_))));
        assert!(validate_ons_name("bad name").is_err());
        assert!(validate_ons_name("-dash").is_err());
        assert!(validate_ons_name(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_parse_ons_account_requires_standard_id() {
        let mut plaintext = vec![0x05];
        plaintext.extend_from_slice(&[7u8; 32]);
        assert_eq!(parse_ons_account(&plaintext).unwrap().key(), &[7u8; 32]);
        plaintext[0] = 0x03;
        assert!(matches!(
            parse_ons_account(&plaintext),
            Err(SwarmError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_verify_swarm_results() {
        use crate::identity::Identity;
        let node = Identity::generate();
        let account = "05".to_string() + &"11".repeat(32);
        let deleted = vec!["h1".to_string()];
        let message = format!("{}h1h2h1", account);
        let signature = STANDARD.encode(node.sign(message.as_bytes()));
        let body = json!({
            "swarm": {
                hex::encode(node.ed25519_public()): {"deleted": deleted, "signature": signature},
                "00".repeat(32): {"failed": true, "code": 503},
            }
        });
        let results = verify_swarm_results(&body, |deleted| {
            format!("{}h1h2{}", account, deleted.concat()).into_bytes()
        })
        .unwrap();
        assert_eq!(results[&hex::encode(node.ed25519_public())], true);
        assert_eq!(results[&"00".repeat(32)], false);
    }
}
