//! Onion request client.
//!
//! The cipher construction is owned by an [`OnionTransport`] implementation;
//! this module only decides the path and shapes the JSON-RPC body.
//!
//! ```text
//! caller ──► OnionClient::send(method, params, target)
//!               │  path = N random pool nodes ≠ target
//!               ▼
//!            OnionTransport::send_onion(OnionRequest)
//!               │  guard ─► relay ─► ... ─► target
//!               ▼
//!            OnionResponse { status, body }
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::SwarmResult;
use crate::snode::NodePool;
use crate::types::Node;

/// Storage RPC method names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RpcMethod {
    GetServiceNodes,
    GetSwarm,
    Retrieve,
    Store,
    Delete,
    DeleteAll,
    Expire,
    Info,
    OnsResolve,
}

impl RpcMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            RpcMethod::GetServiceNodes => "get_n_service_nodes",
            RpcMethod::GetSwarm => "get_swarm",
            RpcMethod::Retrieve => "retrieve",
            RpcMethod::Store => "store",
            RpcMethod::Delete => "delete",
            RpcMethod::DeleteAll => "delete_all",
            RpcMethod::Expire => "expire",
            RpcMethod::Info => "info",
            RpcMethod::OnsResolve => "ons_resolve",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "get_n_service_nodes" => RpcMethod::GetServiceNodes,
            "get_swarm" => RpcMethod::GetSwarm,
            "retrieve" => RpcMethod::Retrieve,
            "store" => RpcMethod::Store,
            "delete" => RpcMethod::Delete,
            "delete_all" => RpcMethod::DeleteAll,
            "expire" => RpcMethod::Expire,
            "info" => RpcMethod::Info,
            "ons_resolve" => RpcMethod::OnsResolve,
            _ => return None,
        })
    }
}

impl fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A JSON-RPC call with flat string-keyed params
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: RpcMethod,
    pub params: Value,
}

/// Everything the transport needs to build one onion request.
#[derive(Debug, Clone)]
pub struct OnionRequest {
    /// Relays in order, guard first
    pub path: Vec<Node>,
    pub target: Node,
    /// ed25519 key the destination may learn for authenticated calls
    pub identity_key: Option<String>,
    pub body: RpcRequest,
}

/// The unwrapped response of the destination node.
#[derive(Debug, Clone, PartialEq)]
pub struct OnionResponse {
    pub status: u16,
    pub body: Value,
}

impl OnionResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Opaque onion routing capability.
///
/// Errors returned here are transport failures and always treated as
/// transient by callers.
#[async_trait]
pub trait OnionTransport: Send + Sync {
    /// Deliver a request through `request.path` to `request.target`.
    async fn send_onion(&self, request: OnionRequest) -> SwarmResult<OnionResponse>;

    /// Direct HTTPS call to a bootstrap seed (used only to fill the pool).
    async fn send_direct(&self, seed_url: &str, request: RpcRequest) -> SwarmResult<OnionResponse>;
}

/// Builds paths from the node pool and forwards through the transport.
pub struct OnionClient {
    transport: Arc<dyn OnionTransport>,
    pool: Arc<NodePool>,
    path_len: usize,
}

impl OnionClient {
    pub fn new(transport: Arc<dyn OnionTransport>, pool: Arc<NodePool>, path_len: usize) -> Self {
        Self {
            transport,
            pool,
            path_len,
        }
    }

    pub fn transport(&self) -> &Arc<dyn OnionTransport> {
        &self.transport
    }

    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    /// Send `method(params)` to `target`. Non-2xx statuses are returned, not
    /// raised; the caller classifies them.
    pub async fn send(
        &self,
        method: RpcMethod,
        params: Value,
        target: &Node,
        identity_key: Option<&str>,
    ) -> SwarmResult<OnionResponse> {
        let path = self
            .pool
            .random_nodes(self.path_len, std::slice::from_ref(target));
        if path.len() < self.path_len {
            debug!(
                wanted = self.path_len,
                got = path.len(),
                "Short onion path, pool too small"
            );
        }
        trace!(%method, %target, hops = path.len(), "Sending onion request");

        let request = OnionRequest {
            path,
            target: target.clone(),
            identity_key: identity_key.map(str::to_string),
            body: RpcRequest { method, params },
        };
        self.transport.send_onion(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_names_roundtrip() {
        for method in [
            RpcMethod::GetServiceNodes,
            RpcMethod::GetSwarm,
            RpcMethod::Retrieve,
            RpcMethod::Store,
            RpcMethod::Delete,
            RpcMethod::DeleteAll,
            RpcMethod::Expire,
            RpcMethod::Info,
            RpcMethod::OnsResolve,
        ] {
            assert_eq!(RpcMethod::parse(method.as_str()), Some(method));
        }
        assert_eq!(RpcMethod::parse("bogus"), None);
    }

    #[test]
    fn test_response_success_range() {
        assert!(OnionResponse::ok(Value::Null).is_success());
        assert!(!OnionResponse {
            status: 421,
            body: Value::Null
        }
        .is_success());
    }
}
