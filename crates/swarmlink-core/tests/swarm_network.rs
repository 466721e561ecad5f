//! Snode pool, swarm resolution and storage RPC against the simulated network
//!
//! ## What These Tests Verify
//!
//! - Retry budget: a store against a fully faulty swarm makes exactly
//!   `max_retry_count` attempts, each on a different node
//! - Eviction: a node failing `failure_threshold` times leaves the pool and
//!   every cached swarm
//! - Undersized cached swarms are re-queried
//! - 421 responses replace the cached swarm and the call succeeds on the new one
//! - Clock skew (406) recalibrates the network offset
//! - Deletion results are checked per node signature
//! - ONS lookups require agreement

use std::sync::Arc;

use serde_json::json;
use swarmlink_core::onion::RpcMethod;
use swarmlink_core::rpc::SnodeMessage;
use swarmlink_core::sim::Fault;
use swarmlink_core::{
    AccountId, Identity, Namespace, NetworkEvent, RequestAuth, SimNetwork, SnodeApi, SwarmError,
};

fn message_to(recipient: &AccountId, data: &str) -> SnodeMessage {
    SnodeMessage {
        recipient: recipient.clone(),
        data: data.to_string(),
        ttl_ms: 60_000,
        timestamp: swarmlink_core::now_ms(),
    }
}

fn api_for(network: &Arc<SimNetwork>, identity: Option<Identity>) -> Arc<SnodeApi> {
    Arc::new(SnodeApi::new(network.context(identity).unwrap()))
}

// ============================================================================
// Retry and eviction
// ============================================================================

#[tokio::test]
async fn test_store_retries_are_bounded() {
    let network = SimNetwork::new(20, 8);
    let api = api_for(&network, None);
    let account = Identity::generate().account_id();

    let swarm = api.get_swarm(&account).await.unwrap();
    assert_eq!(swarm.len(), 8);
    for node in &swarm {
        network.set_fault(node, Fault::Status(503, json!({ "reason": "overloaded" })));
    }
    network.reset_requests();

    let result = api
        .send_message(&message_to(&account, "aGVsbG8="), Namespace::DEFAULT, RequestAuth::None)
        .await;

    match result {
        Err(SwarmError::Generic(msg)) => assert!(msg.contains("6 attempt(s)"), "{}", msg),
        other => panic!("expected exhausted retries, got {:?}", other),
    }
    assert_eq!(network.request_count(RpcMethod::Store), 6);
    for node in &swarm {
        assert!(network.requests_to(RpcMethod::Store, node) <= 1, "node {} retried", node);
    }
}

#[tokio::test]
async fn test_store_retries_stop_when_swarm_is_exhausted() {
    let network = SimNetwork::new(12, 3);
    let api = api_for(&network, None);
    let account = Identity::generate().account_id();

    let swarm = api.get_swarm(&account).await.unwrap();
    for node in &swarm {
        network.set_fault(node, Fault::Unreachable);
    }
    network.reset_requests();

    let result = api
        .send_message(&message_to(&account, "aGk="), Namespace::DEFAULT, RequestAuth::None)
        .await;
    assert!(result.is_err());
    assert_eq!(network.request_count(RpcMethod::Store), 3);
    for node in &swarm {
        assert_eq!(api.context().pool.failure_count(node), 1);
    }
}

#[tokio::test]
async fn test_repeated_failures_evict_from_pool_and_every_swarm() {
    let network = SimNetwork::new(20, 3);
    let api = api_for(&network, None);
    let ctx = api.context().clone();
    let mut events = ctx.subscribe();

    let nodes = network.nodes();
    let shared = nodes[4].clone();
    let first = Identity::generate().account_id();
    let second = Identity::generate().account_id();
    network.set_swarm(&first, &[shared.clone(), nodes[5].clone(), nodes[6].clone()]);
    network.set_swarm(&second, &[nodes[7].clone(), shared.clone(), nodes[8].clone()]);

    assert!(api.get_swarm(&first).await.unwrap().contains(&shared));
    assert!(api.get_swarm(&second).await.unwrap().contains(&shared));
    assert!(ctx.pool.contains(&shared));

    network.set_fault(&shared, Fault::Status(502, json!({})));
    for _ in 0..3 {
        assert!(api.info(&shared).await.is_err());
    }

    assert!(!ctx.pool.contains(&shared));
    assert!(!ctx.resolver.cached(&first).unwrap().contains(&shared));
    assert!(!ctx.resolver.cached(&second).unwrap().contains(&shared));
    assert_eq!(ctx.pool.failure_count(&shared), 0);

    let mut evicted = false;
    while let Ok(event) = events.try_recv() {
        evicted |= event == NetworkEvent::NodeEvicted { node: shared.clone() };
    }
    assert!(evicted, "NodeEvicted should be emitted");
}

#[tokio::test]
async fn test_two_failures_keep_node() {
    let network = SimNetwork::new(12, 3);
    let api = api_for(&network, None);
    let ctx = api.context().clone();
    let account = Identity::generate().account_id();
    let node = api.get_swarm(&account).await.unwrap()[0].clone();

    network.set_fault(&node, Fault::Status(500, json!({})));
    api.info(&node).await.unwrap_err();
    api.info(&node).await.unwrap_err();

    assert!(ctx.pool.contains(&node));
    assert_eq!(ctx.pool.failure_count(&node), 2);
    network.clear_fault(&node);
    assert!(api.info(&node).await.is_ok());
}

// ============================================================================
// Swarm resolution
// ============================================================================

#[tokio::test]
async fn test_undersized_swarm_is_requeried() {
    let network = SimNetwork::new(12, 3);
    let api = api_for(&network, None);
    let account = Identity::generate().account_id();
    let nodes = network.nodes();
    network.set_swarm(&account, &nodes[..2]);

    let swarm = api.get_swarm(&account).await.unwrap();
    assert_eq!(swarm.len(), 2);
    let lookups = network.request_count(RpcMethod::GetSwarm);
    assert_eq!(lookups, 1);

    // Two nodes are below the minimum of three, so the cache is not trusted.
    api.get_swarm(&account).await.unwrap();
    assert_eq!(network.request_count(RpcMethod::GetSwarm), lookups + 1);
}

#[tokio::test]
async fn test_full_swarm_served_from_cache() {
    let network = SimNetwork::new(12, 3);
    let api = api_for(&network, None);
    let account = Identity::generate().account_id();

    let swarm = api.get_swarm(&account).await.unwrap();
    assert_eq!(swarm, network.swarm_of(&account));
    api.get_swarm(&account).await.unwrap();
    assert_eq!(network.request_count(RpcMethod::GetSwarm), 1);
}

#[tokio::test]
async fn test_swarm_move_replaces_cache() {
    let network = SimNetwork::new(20, 4);
    let api = api_for(&network, None);
    let ctx = api.context().clone();
    let mut events = ctx.subscribe();
    let account = Identity::generate().account_id();

    let old = api.get_swarm(&account).await.unwrap();
    network.move_swarm(&account);
    let new = network.swarm_of(&account);
    assert!(old.iter().all(|n| !new.contains(n)));

    let stored = api
        .send_message(&message_to(&account, "bW92ZWQ="), Namespace::DEFAULT, RequestAuth::None)
        .await
        .unwrap();

    assert!(new.contains(&stored.node));
    assert_eq!(ctx.resolver.cached(&account).unwrap(), new);
    assert_eq!(network.stored(&account, Namespace::DEFAULT).len(), 1);

    let mut moved = false;
    while let Ok(event) = events.try_recv() {
        moved |= event == NetworkEvent::SwarmMoved { account: account.clone() };
    }
    assert!(moved);
    // A moved swarm is not a node fault.
    for node in &old {
        assert_eq!(ctx.pool.failure_count(node), 0);
    }
}

// ============================================================================
// Authenticated storage RPCs
// ============================================================================

#[tokio::test]
async fn test_clock_skew_recalibrates() {
    let network = SimNetwork::new(12, 3);
    let alice = Identity::generate();
    let account = alice.account_id();
    let api = api_for(&network, Some(alice.clone()));
    let ctx = api.context().clone();
    let node = api.get_swarm(&account).await.unwrap()[0].clone();

    network.set_clock_skew(10 * 60 * 1000);
    let result = api
        .get_raw_messages(&node, &account, Namespace::CONTACTS, None, RequestAuth::Owner(&alice))
        .await;
    assert!(matches!(result, Err(SwarmError::ClockOutOfSync)));
    assert!((ctx.clock.offset() - 600_000).abs() < 5_000, "offset {}", ctx.clock.offset());
    assert_eq!(ctx.pool.failure_count(&node), 0);

    let messages = api
        .get_raw_messages(&node, &account, Namespace::CONTACTS, None, RequestAuth::Owner(&alice))
        .await
        .unwrap();
    assert!(messages.is_empty());
}

#[tokio::test]
async fn test_auth_namespace_rejects_foreign_key() {
    let network = SimNetwork::new(12, 3);
    let alice = Identity::generate();
    let mallory = Identity::generate();
    let api = api_for(&network, Some(mallory.clone()));
    let account = alice.account_id();

    let result = api
        .send_message(
            &message_to(&account, "eA=="),
            Namespace::CONTACTS,
            RequestAuth::Owner(&mallory),
        )
        .await;
    assert!(result.is_err());
    assert!(network.stored(&account, Namespace::CONTACTS).is_empty());
}

#[tokio::test]
async fn test_delete_verifies_each_node() {
    let network = SimNetwork::new(20, 5);
    let alice = Identity::generate();
    let account = alice.account_id();
    let api = api_for(&network, Some(alice.clone()));

    let mut hashes = Vec::new();
    for data in ["b25l", "dHdv"] {
        let stored = api
            .send_message(&message_to(&account, data), Namespace::DEFAULT, RequestAuth::None)
            .await
            .unwrap();
        hashes.push(stored.hash);
    }

    let results = api
        .delete_messages(&account, &hashes[..1], RequestAuth::Owner(&alice))
        .await
        .unwrap();
    assert_eq!(results.len(), 5);
    assert!(results.values().all(|ok| *ok));
    let remaining = network.stored(&account, Namespace::DEFAULT);
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].hash, hashes[1]);

    // Whichever node answers signs its own entry with garbage.
    for node in network.swarm_of(&account) {
        network.set_fault(&node, Fault::ForgeSignatures);
    }
    let results = api
        .delete_messages(&account, &hashes[1..], RequestAuth::Owner(&alice))
        .await
        .unwrap();
    assert_eq!(results.values().filter(|ok| !**ok).count(), 1);
    assert_eq!(results.values().filter(|ok| **ok).count(), 4);
}

#[tokio::test]
async fn test_delete_all_and_alter_ttl() {
    let network = SimNetwork::new(12, 3);
    let alice = Identity::generate();
    let account = alice.account_id();
    let api = api_for(&network, Some(alice.clone()));

    let stored = api
        .send_message(&message_to(&account, "dHRs"), Namespace::DEFAULT, RequestAuth::None)
        .await
        .unwrap();
    let before = network.stored(&account, Namespace::DEFAULT)[0].expiry;

    let expiry = before + 3_600_000;
    let updated = api
        .alter_ttl(&account, &[stored.hash.clone()], expiry, true, RequestAuth::Owner(&alice))
        .await
        .unwrap();
    assert_eq!(updated, vec![stored.hash.clone()]);
    assert_eq!(network.stored(&account, Namespace::DEFAULT)[0].expiry, expiry);

    // Extending never shortens.
    let updated = api
        .alter_ttl(&account, &[stored.hash.clone()], before, true, RequestAuth::Owner(&alice))
        .await
        .unwrap();
    assert!(updated.is_empty());

    let results = api
        .delete_all_now(&account, RequestAuth::Owner(&alice))
        .await
        .unwrap();
    assert_eq!(results.len(), 3);
    assert!(results.values().all(|ok| *ok));
    assert!(network.stored(&account, Namespace::DEFAULT).is_empty());
}

// ============================================================================
// ONS
// ============================================================================

#[tokio::test]
async fn test_ons_resolves_registered_name() {
    let network = SimNetwork::new(12, 3);
    let api = api_for(&network, None);
    let alice = Identity::generate().account_id();
    network.register_ons("alice", &alice).unwrap();

    assert_eq!(api.ons_resolve("Alice").await.unwrap(), alice);
    assert_eq!(network.request_count(RpcMethod::OnsResolve), 3);
}

#[tokio::test]
async fn test_ons_disagreement_is_rejected() {
    let network = SimNetwork::new(3, 3);
    let api = api_for(&network, None);
    let alice = Identity::generate().account_id();
    network.register_ons("alice", &alice).unwrap();
    network.set_fault(&network.nodes()[1], Fault::OnsValue("00ff".into()));

    assert!(matches!(
        api.ons_resolve("alice").await,
        Err(SwarmError::ValidationFailed(_))
    ));
}

#[tokio::test]
async fn test_ons_invalid_and_unknown_names() {
    let network = SimNetwork::new(12, 3);
    let api = api_for(&network, None);

    assert!(matches!(
        api.ons_resolve("not a name").await,
        Err(SwarmError::HashingFailed(_))
    ));
    assert!(api.ons_resolve("nobody").await.is_err());
}
