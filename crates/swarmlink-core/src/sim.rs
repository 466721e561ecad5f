//! In-memory storage network.
//!
//! Answers the storage RPC surface behind [`OnionTransport`] so the client
//! runs end to end without sockets. Compiled for unit tests and behind the
//! `sim` feature, which the integration tests and the CLI `simulate` command
//! enable.
//!
//! ```text
//!   SimNetwork
//!   ├── nodes: N deterministic nodes with real ed25519 keys
//!   ├── swarms: account → `swarm_size` consecutive nodes (overridable)
//!   ├── messages: (account, namespace) → stored messages, shared by the swarm
//!   └── faults: node → forced status, unreachable, forged signatures, slow stores
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::{debug, trace};

use crate::community::{
    CommunityApi, CommunityMessage, CommunityPoll, CommunityServer, DirectMessage, PollRequest,
    RoomInfo, RoomPoll,
};
use crate::config::ClientConfig;
use crate::context::SwarmContext;
use crate::crypto::{standard_id_from_ed25519, SymmetricCipher};
use crate::error::{SwarmError, SwarmResult};
use crate::identity::{verify_signature, Identity};
use crate::onion::{OnionRequest, OnionResponse, OnionTransport, RpcMethod, RpcRequest};
use crate::rpc::{namespaced_message, ons_value_key};
use crate::storage::MemoryStore;
use crate::types::{now_ms, AccountId, IdPrefix, Namespace, Node, StoredMessage};

/// Seed URL answered by the simulator
pub const SIM_SEED_URL: &str = "https://seed.swarmlink.invalid:4433";

/// Largest accepted distance between a signed timestamp and network time
const CLOCK_TOLERANCE_MS: u64 = 60_000;

/// Forced misbehaviour of one node
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Answer every request with this status and body
    Status(u16, Value),
    /// The transport cannot reach the node
    Unreachable,
    /// Deletion results carry a signature for this node that does not verify
    ForgeSignatures,
    /// Deletion results answered by this node carry no valid signature at all
    ForgeAllSignatures,
    /// Delay every store into the namespace before handling it
    SlowStore(Namespace, Duration),
    /// ONS lookups answer this hex value
    OnsValue(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Forgery {
    None,
    Own,
    All,
}

struct SimNode {
    node: Node,
    identity: Identity,
}

#[derive(Default)]
struct SimState {
    swarms: HashMap<AccountId, Vec<usize>>,
    messages: HashMap<(AccountId, Namespace), Vec<StoredMessage>>,
    faults: HashMap<Node, Fault>,
    ons: HashMap<String, String>,
    requests: Vec<(RpcMethod, Node)>,
    clock_skew_ms: i64,
}

pub struct SimNetwork {
    nodes: Vec<SimNode>,
    swarm_size: usize,
    state: Mutex<SimState>,
}

impl SimNetwork {
    /// A network of `node_count` nodes where every account is stored on
    /// `swarm_size` of them.
    pub fn new(node_count: usize, swarm_size: usize) -> Arc<Self> {
        let nodes = (0..node_count)
            .map(|i| {
                let seed = blake3::derive_key("swarmlink sim node", &(i as u64).to_le_bytes());
                let identity = Identity::from_seed(seed);
                let node = Node::new(
                    format!("10.7.{}.{}", i / 256, i % 256),
                    22021,
                    hex::encode(identity.ed25519_public()),
                    hex::encode(identity.x25519_public().as_bytes()),
                );
                SimNode { node, identity }
            })
            .collect();
        Arc::new(Self {
            nodes,
            swarm_size: swarm_size.clamp(1, node_count.max(1)),
            state: Mutex::new(SimState::default()),
        })
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.nodes.iter().map(|n| n.node.clone()).collect()
    }

    /// Client configuration bootstrapping from this network.
    pub fn config(&self) -> ClientConfig {
        ClientConfig {
            seed_nodes: vec![SIM_SEED_URL.to_string()],
            min_pool_size: self.nodes.len().min(12),
            ..ClientConfig::default()
        }
    }

    /// A fresh client context on this network with an in-memory store.
    pub fn context(self: &Arc<Self>, identity: Option<Identity>) -> SwarmResult<Arc<SwarmContext>> {
        self.context_with(self.config(), identity)
    }

    pub fn context_with(
        self: &Arc<Self>,
        config: ClientConfig,
        identity: Option<Identity>,
    ) -> SwarmResult<Arc<SwarmContext>> {
        let transport: Arc<dyn OnionTransport> = self.clone();
        SwarmContext::new(config, Arc::new(MemoryStore::new()), transport, identity)
    }

    /// Nodes currently storing `account`
    pub fn swarm_of(&self, account: &AccountId) -> Vec<Node> {
        let mut state = self.state.lock();
        self.swarm_indices(&mut state, account)
            .into_iter()
            .map(|i| self.nodes[i].node.clone())
            .collect()
    }

    /// Pin the swarm of `account` to `nodes`. Unknown nodes are ignored.
    pub fn set_swarm(&self, account: &AccountId, nodes: &[Node]) {
        let indices = nodes.iter().filter_map(|n| self.index_of(n)).collect();
        self.state.lock().swarms.insert(account.clone(), indices);
    }

    /// Move `account` to the next disjoint block of nodes. Stored messages
    /// move with it.
    pub fn move_swarm(&self, account: &AccountId) {
        let mut state = self.state.lock();
        let current = self.swarm_indices(&mut state, account);
        let n = self.nodes.len();
        let start = current.first().copied().unwrap_or(0) + self.swarm_size;
        let moved = (0..self.swarm_size).map(|k| (start + k) % n).collect();
        debug!(account = %account.short(), "Simulated swarm move");
        state.swarms.insert(account.clone(), moved);
    }

    pub fn set_fault(&self, node: &Node, fault: Fault) {
        self.state.lock().faults.insert(node.clone(), fault);
    }

    pub fn clear_fault(&self, node: &Node) {
        self.state.lock().faults.remove(node);
    }

    /// Shift network time relative to the local clock.
    pub fn set_clock_skew(&self, skew_ms: i64) {
        self.state.lock().clock_skew_ms = skew_ms;
    }

    /// Register an ONS name for `account`.
    pub fn register_ons(&self, name: &str, account: &AccountId) -> SwarmResult<()> {
        let mut plain = vec![0x05];
        plain.extend_from_slice(account.key());
        let sealed = SymmetricCipher::new(&ons_value_key(name)).encrypt(&plain)?;
        let name_hash = blake3::hash(name.to_lowercase().as_bytes());
        self.state
            .lock()
            .ons
            .insert(STANDARD.encode(name_hash.as_bytes()), hex::encode(sealed));
        Ok(())
    }

    /// Messages stored for `account` in `namespace`
    pub fn stored(&self, account: &AccountId, namespace: Namespace) -> Vec<StoredMessage> {
        self.state
            .lock()
            .messages
            .get(&(account.clone(), namespace))
            .cloned()
            .unwrap_or_default()
    }

    /// Requests of `method` seen so far
    pub fn request_count(&self, method: RpcMethod) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(m, _)| *m == method)
            .count()
    }

    /// Requests of `method` that reached `node`
    pub fn requests_to(&self, method: RpcMethod, node: &Node) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(m, n)| *m == method && n == node)
            .count()
    }

    pub fn reset_requests(&self) {
        self.state.lock().requests.clear();
    }

    fn index_of(&self, node: &Node) -> Option<usize> {
        self.nodes.iter().position(|n| &n.node == node)
    }

    fn swarm_indices(&self, state: &mut SimState, account: &AccountId) -> Vec<usize> {
        let n = self.nodes.len().max(1);
        let size = self.swarm_size;
        state
            .swarms
            .entry(account.clone())
            .or_insert_with(|| {
                let digest = blake3::hash(account.to_hex().as_bytes());
                let mut head = [0u8; 8];
                head.copy_from_slice(&digest.as_bytes()[..8]);
                let start = (u64::from_le_bytes(head) % n as u64) as usize;
                (0..size).map(|k| (start + k) % n).collect()
            })
            .clone()
    }

    fn store_delay(&self, target: &Node, request: &RpcRequest) -> Option<Duration> {
        if request.method != RpcMethod::Store {
            return None;
        }
        let namespace = request.params.get("namespace").and_then(Value::as_i64).unwrap_or(0);
        match self.state.lock().faults.get(target) {
            Some(Fault::SlowStore(slow, delay)) if i64::from(slow.0) == namespace => Some(*delay),
            _ => None,
        }
    }

    fn network_now(&self) -> u64 {
        let skew = self.state.lock().clock_skew_ms;
        (now_ms() as i64 + skew).max(0) as u64
    }

    fn node_json(node: &Node) -> Value {
        json!({
            "ip": node.address,
            "port": node.port.to_string(),
            "pubkey_ed25519": node.ed25519_key,
            "pubkey_x25519": node.x25519_key,
        })
    }

    fn service_nodes(&self) -> OnionResponse {
        let states: Vec<Value> = self
            .nodes
            .iter()
            .map(|n| {
                json!({
                    "public_ip": n.node.address,
                    "storage_port": n.node.port,
                    "pubkey_ed25519": n.node.ed25519_key,
                    "pubkey_x25519": n.node.x25519_key,
                })
            })
            .collect();
        OnionResponse::ok(json!({ "result": { "service_node_states": states } }))
    }

    fn swarm_body(&self, account: &AccountId) -> Value {
        let swarm: Vec<Value> = self.swarm_of(account).iter().map(Self::node_json).collect();
        json!({ "snodes": swarm })
    }

    fn handle(&self, target: &Node, request: &RpcRequest) -> SwarmResult<OnionResponse> {
        let index = self
            .index_of(target)
            .ok_or_else(|| SwarmError::Transport(format!("unknown node {}", target)))?;
        let fault = {
            let mut state = self.state.lock();
            state.requests.push((request.method, target.clone()));
            state.faults.get(target).cloned()
        };
        trace!(method = %request.method, %target, "Simulated request");
        match &fault {
            Some(Fault::Status(status, body)) => {
                return Ok(OnionResponse {
                    status: *status,
                    body: body.clone(),
                })
            }
            Some(Fault::Unreachable) => {
                return Err(SwarmError::Transport(format!("{} unreachable", target)))
            }
            _ => {}
        }

        let params = request.params.as_object().cloned().unwrap_or_default();
        match request.method {
            RpcMethod::GetServiceNodes => Ok(self.service_nodes()),
            RpcMethod::Info => Ok(OnionResponse::ok(json!({ "timestamp": self.network_now() }))),
            RpcMethod::GetSwarm => {
                let account = param_account(&params, "pubKey")?;
                Ok(OnionResponse::ok(self.swarm_body(&account)))
            }
            RpcMethod::OnsResolve => {
                if let Some(Fault::OnsValue(value)) = &fault {
                    return Ok(OnionResponse::ok(json!({ "encrypted_value": value })));
                }
                let name_hash = params.get("name_hash").and_then(Value::as_str).unwrap_or("");
                match self.state.lock().ons.get(name_hash) {
                    Some(value) => Ok(OnionResponse::ok(json!({ "encrypted_value": value }))),
                    None => Ok(status(404, "name not found")),
                }
            }
            method => {
                let key = if method == RpcMethod::Retrieve || method == RpcMethod::Store {
                    "pubKey"
                } else {
                    "pubkey"
                };
                let account = param_account(&params, key)?;
                if !self.swarm_of(&account).contains(target) {
                    return Ok(OnionResponse {
                        status: 421,
                        body: self.swarm_body(&account),
                    });
                }
                let forge = match &fault {
                    Some(Fault::ForgeSignatures) => Forgery::Own,
                    Some(Fault::ForgeAllSignatures) => Forgery::All,
                    _ => Forgery::None,
                };
                self.handle_account(index, method, &account, &params, forge)
            }
        }
    }

    fn handle_account(
        &self,
        index: usize,
        method: RpcMethod,
        account: &AccountId,
        params: &Map<String, Value>,
        forge: Forgery,
    ) -> SwarmResult<OnionResponse> {
        let namespace = Namespace(
            params
                .get("namespace")
                .and_then(Value::as_i64)
                .and_then(|n| i16::try_from(n).ok())
                .unwrap_or(0),
        );
        let now = self.network_now();

        match method {
            RpcMethod::Retrieve => {
                if namespace.requires_auth(false) {
                    let timestamp = params.get("timestamp").and_then(Value::as_u64).unwrap_or(0);
                    if now.abs_diff(timestamp) > CLOCK_TOLERANCE_MS {
                        return Ok(status(406, "timestamp out of range"));
                    }
                    if !authorized(params, account, &namespaced_message("retrieve", namespace.0, timestamp)) {
                        return Ok(status(401, "unauthorized"));
                    }
                }
                let last_hash = params.get("lastHash").and_then(Value::as_str).unwrap_or("");
                let state = self.state.lock();
                let stored = state
                    .messages
                    .get(&(account.clone(), namespace))
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                let start = stored
                    .iter()
                    .position(|m| m.hash == last_hash)
                    .map_or(0, |i| i + 1);
                let messages: Vec<Value> = stored[start..]
                    .iter()
                    .map(|m| {
                        json!({
                            "hash": m.hash,
                            "data": m.data,
                            "timestamp": m.timestamp,
                            "expiration": m.expiry,
                        })
                    })
                    .collect();
                Ok(OnionResponse::ok(json!({ "messages": messages, "more": false })))
            }
            RpcMethod::Store => {
                if namespace.requires_auth(false) {
                    let timestamp = params.get("sig_timestamp").and_then(Value::as_u64).unwrap_or(0);
                    if now.abs_diff(timestamp) > CLOCK_TOLERANCE_MS {
                        return Ok(status(406, "timestamp out of range"));
                    }
                    if !authorized(params, account, &namespaced_message("store", namespace.0, timestamp)) {
                        return Ok(status(401, "unauthorized"));
                    }
                }
                let data = params.get("data").and_then(Value::as_str).unwrap_or("").to_string();
                let timestamp = params.get("timestamp").and_then(Value::as_u64).unwrap_or(now);
                let ttl = params.get("ttl").and_then(Value::as_u64).unwrap_or(0);
                let mut hasher = blake3::Hasher::new();
                hasher.update(account.to_hex().as_bytes());
                hasher.update(&namespace.0.to_le_bytes());
                hasher.update(&timestamp.to_le_bytes());
                hasher.update(data.as_bytes());
                let hash = STANDARD.encode(&hasher.finalize().as_bytes()[..24]);

                let mut state = self.state.lock();
                let stored = state.messages.entry((account.clone(), namespace)).or_default();
                if !stored.iter().any(|m| m.hash == hash) {
                    stored.push(StoredMessage {
                        data,
                        hash: hash.clone(),
                        timestamp,
                        expiry: timestamp + ttl,
                    });
                }
                Ok(OnionResponse::ok(json!({ "hash": hash })))
            }
            RpcMethod::Delete => {
                let hashes = string_list(params, "messages");
                let mut signed = b"delete".to_vec();
                for hash in &hashes {
                    signed.extend_from_slice(hash.as_bytes());
                }
                if !authorized(params, account, &signed) {
                    return Ok(status(401, "unauthorized"));
                }
                let mut deleted = Vec::new();
                {
                    let mut state = self.state.lock();
                    for ((owner, _), stored) in state.messages.iter_mut() {
                        if owner != account {
                            continue;
                        }
                        stored.retain(|m| {
                            let hit = hashes.contains(&m.hash);
                            if hit {
                                deleted.push(m.hash.clone());
                            }
                            !hit
                        });
                    }
                }
                deleted.sort();
                let requested = hashes.concat();
                Ok(OnionResponse::ok(self.signed_swarm_results(
                    index,
                    account,
                    &deleted,
                    forge,
                    |deleted| format!("{}{}{}", account.to_hex(), requested, deleted.concat()),
                )))
            }
            RpcMethod::DeleteAll => {
                let timestamp = params.get("timestamp").and_then(Value::as_u64).unwrap_or(0);
                if now.abs_diff(timestamp) > CLOCK_TOLERANCE_MS {
                    return Ok(status(406, "timestamp out of range"));
                }
                if !authorized(params, account, format!("delete_all{}", timestamp).as_bytes()) {
                    return Ok(status(401, "unauthorized"));
                }
                let mut deleted = Vec::new();
                {
                    let mut state = self.state.lock();
                    for ((owner, _), stored) in state.messages.iter_mut() {
                        if owner == account {
                            deleted.extend(stored.drain(..).map(|m| m.hash));
                        }
                    }
                }
                deleted.sort();
                Ok(OnionResponse::ok(self.signed_swarm_results(
                    index,
                    account,
                    &deleted,
                    forge,
                    |deleted| format!("{}{}{}", account.to_hex(), timestamp, deleted.concat()),
                )))
            }
            RpcMethod::Expire => {
                let hashes = string_list(params, "messages");
                let expiry = params.get("expiry").and_then(Value::as_u64).unwrap_or(0);
                let extend = params.get("extend").and_then(Value::as_bool).unwrap_or(false);
                let mut signed = b"expire".to_vec();
                if extend {
                    signed.extend_from_slice(b"extend");
                }
                signed.extend_from_slice(expiry.to_string().as_bytes());
                for hash in &hashes {
                    signed.extend_from_slice(hash.as_bytes());
                }
                if !authorized(params, account, &signed) {
                    return Ok(status(401, "unauthorized"));
                }
                let mut updated = Vec::new();
                {
                    let mut state = self.state.lock();
                    for ((owner, _), stored) in state.messages.iter_mut() {
                        if owner != account {
                            continue;
                        }
                        for message in stored.iter_mut().filter(|m| hashes.contains(&m.hash)) {
                            if !extend || expiry > message.expiry {
                                message.expiry = expiry;
                                updated.push(message.hash.clone());
                            }
                        }
                    }
                }
                let swarm: Map<String, Value> = self
                    .swarm_of(account)
                    .iter()
                    .map(|n| (n.ed25519_key.clone(), json!({ "updated": updated })))
                    .collect();
                Ok(OnionResponse::ok(json!({ "swarm": swarm })))
            }
            other => Ok(status(400, &format!("unsupported method {}", other))),
        }
    }

    /// Per-node `{deleted, signature}` map. Forged entries sign garbage.
    fn signed_swarm_results(
        &self,
        forged: usize,
        account: &AccountId,
        deleted: &[String],
        forge: Forgery,
        message: impl Fn(&[String]) -> String,
    ) -> Value {
        let signed = message(deleted);
        let swarm: Map<String, Value> = self
            .swarm_of(account)
            .iter()
            .filter_map(|node| self.index_of(node))
            .map(|i| {
                let sim = &self.nodes[i];
                let forged = match forge {
                    Forgery::None => false,
                    Forgery::Own => i == forged,
                    Forgery::All => true,
                };
                let payload = if forged {
                    b"forged".to_vec()
                } else {
                    signed.as_bytes().to_vec()
                };
                let signature = sim.identity.sign(&payload);
                (
                    sim.node.ed25519_key.clone(),
                    json!({ "deleted": deleted, "signature": STANDARD.encode(signature) }),
                )
            })
            .collect();
        json!({ "swarm": swarm })
    }
}

#[async_trait]
impl OnionTransport for SimNetwork {
    async fn send_onion(&self, request: OnionRequest) -> SwarmResult<OnionResponse> {
        if request.path.contains(&request.target) {
            return Err(SwarmError::Transport("target is part of its own path".into()));
        }
        if let Some(delay) = self.store_delay(&request.target, &request.body) {
            tokio::time::sleep(delay).await;
        }
        self.handle(&request.target, &request.body)
    }

    async fn send_direct(&self, seed_url: &str, request: RpcRequest) -> SwarmResult<OnionResponse> {
        if seed_url != SIM_SEED_URL {
            return Err(SwarmError::Transport(format!("unknown seed {}", seed_url)));
        }
        self.state.lock().requests.push((
            request.method,
            Node::new("seed", 4433, "", ""),
        ));
        match request.method {
            RpcMethod::GetServiceNodes => Ok(self.service_nodes()),
            other => Ok(status(400, &format!("seed does not serve {}", other))),
        }
    }
}

fn status(code: u16, reason: &str) -> OnionResponse {
    OnionResponse {
        status: code,
        body: json!({ "reason": reason }),
    }
}

fn param_account(params: &Map<String, Value>, key: &str) -> SwarmResult<AccountId> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| SwarmError::InvalidMessage(format!("missing {}", key)))?
        .parse()
}

fn string_list(params: &Map<String, Value>, key: &str) -> Vec<String> {
    params
        .get(key)
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

/// Signature check for an authenticated request. Sub-account tokens are
/// trusted for any group namespace without checking the admin signature.
fn authorized(params: &Map<String, Value>, account: &AccountId, message: &[u8]) -> bool {
    let Some(ed25519) = params
        .get("pubkey_ed25519")
        .and_then(Value::as_str)
        .and_then(|s| hex::decode(s).ok())
        .and_then(|b| <[u8; 32]>::try_from(b).ok())
    else {
        return false;
    };
    let Some(signature) = params
        .get("signature")
        .and_then(Value::as_str)
        .and_then(|s| STANDARD.decode(s).ok())
    else {
        return false;
    };
    if verify_signature(&ed25519, message, &signature).is_err() {
        return false;
    }
    if params.contains_key("subaccount") {
        return account.prefix() == IdPrefix::Group;
    }
    match account.prefix() {
        IdPrefix::Group => &ed25519 == account.key(),
        _ => standard_id_from_ed25519(&ed25519).is_ok_and(|id| &id == account),
    }
}

#[derive(Default)]
struct HubState {
    servers: HashMap<String, [u8; 32]>,
    rooms: HashMap<(String, String), Vec<CommunityMessage>>,
    seqnos: HashMap<(String, String), i64>,
    direct: Vec<(String, DirectMessage)>,
    next_id: i64,
}

/// In-memory community servers shared by several simulated clients.
#[derive(Default)]
pub struct CommunityHub {
    state: Mutex<HubState>,
}

impl CommunityHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_server(&self, server: &CommunityServer) -> SwarmResult<()> {
        let key = server.key_bytes()?;
        self.state.lock().servers.insert(server.url.clone(), key);
        Ok(())
    }

    /// A client posting as `identity`
    pub fn client(self: &Arc<Self>, identity: Arc<Identity>) -> SimCommunityClient {
        SimCommunityClient {
            hub: self.clone(),
            identity,
        }
    }

    /// Moderator deletion: the message stays with no data and a new seqno.
    pub fn delete_message(&self, server: &str, room: &str, id: i64) {
        let mut state = self.state.lock();
        let key = (server.to_string(), room.to_string());
        let seqno = {
            let next = state.seqnos.entry(key.clone()).or_insert(0);
            *next += 1;
            *next
        };
        if let Some(message) = state
            .rooms
            .get_mut(&key)
            .and_then(|messages| messages.iter_mut().find(|m| m.id == id))
        {
            message.data = None;
            message.seqno = seqno;
        }
    }
}

pub struct SimCommunityClient {
    hub: Arc<CommunityHub>,
    identity: Arc<Identity>,
}

impl SimCommunityClient {
    fn blinded(&self, server: &str) -> SwarmResult<String> {
        let key = self
            .hub
            .state
            .lock()
            .servers
            .get(server)
            .copied()
            .ok_or_else(|| SwarmError::Generic(format!("unknown community server {}", server)))?;
        Ok(self.identity.blinded_id(&key).to_hex())
    }
}

#[async_trait]
impl CommunityApi for SimCommunityClient {
    async fn poll(&self, server: &str, request: PollRequest) -> SwarmResult<CommunityPoll> {
        let me = self.blinded(server)?;
        let state = self.hub.state.lock();
        let rooms = request
            .rooms
            .iter()
            .map(|(room, since)| {
                let messages: Vec<CommunityMessage> = state
                    .rooms
                    .get(&(server.to_string(), room.clone()))
                    .into_iter()
                    .flatten()
                    .filter(|m| m.seqno > *since)
                    .filter(|m| m.whisper_to.as_ref().is_none_or(|to| *to == me || m.sender == me))
                    .cloned()
                    .collect();
                RoomPoll {
                    room: room.clone(),
                    info: Some(RoomInfo {
                        token: room.clone(),
                        name: room.clone(),
                        active_users: 1,
                        info_updates: 0,
                    }),
                    messages,
                }
            })
            .collect();
        let direct = |outgoing: bool, since: i64| -> Vec<DirectMessage> {
            state
                .direct
                .iter()
                .filter(|(url, _)| url == server)
                .map(|(_, m)| m)
                .filter(|m| m.id > since)
                .filter(|m| if outgoing { m.sender == me } else { m.recipient == me })
                .cloned()
                .collect()
        };
        Ok(CommunityPoll {
            capabilities: vec!["sogs".into(), "blind".into()],
            rooms,
            inbox: direct(false, request.inbox_since),
            outbox: direct(true, request.outbox_since),
        })
    }

    async fn send_message(
        &self,
        server: &str,
        room: &str,
        data: Vec<u8>,
        whisper_to: Option<&AccountId>,
    ) -> SwarmResult<i64> {
        let me = self.blinded(server)?;
        let mut state = self.hub.state.lock();
        let key = (server.to_string(), room.to_string());
        state.next_id += 1;
        let id = state.next_id;
        let seqno = {
            let next = state.seqnos.entry(key.clone()).or_insert(0);
            *next += 1;
            *next
        };
        state.rooms.entry(key).or_default().push(CommunityMessage {
            id,
            seqno,
            sender: me,
            posted_ms: now_ms(),
            data: Some(STANDARD.encode(data)),
            whisper_to: whisper_to.map(AccountId::to_hex),
        });
        Ok(id)
    }

    async fn send_inbox(&self, server: &str, recipient: &AccountId, data: Vec<u8>) -> SwarmResult<i64> {
        let me = self.blinded(server)?;
        let mut state = self.hub.state.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.direct.push((
            server.to_string(),
            DirectMessage {
                id,
                sender: me,
                recipient: recipient.to_hex(),
                posted_ms: now_ms(),
                message: STANDARD.encode(data),
            },
        ));
        Ok(id)
    }
}
