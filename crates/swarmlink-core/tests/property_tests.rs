//! Property-based tests for the receive pipeline and config merging
//!
//! Uses proptest to check invariants that must hold for any input order.

use std::sync::Arc;

use proptest::prelude::*;
use swarmlink_core::config_sync::{ConfigKind, ConfigMessage, ConfigObject, ConfigValue};
use swarmlink_core::poller::legacy_interval;
use swarmlink_core::{AccountId, IdPrefix, MemoryStore, PollConfig, ReceivePipeline, StoredMessage};

// ============================================================================
// Strategy Generators
// ============================================================================

/// Message hashes drawn from a small alphabet so duplicates are common
fn hashes_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[a-f]{1,2}", 0..60)
}

/// Field edits made by one device before its push
fn edits_strategy() -> impl Strategy<Value = Vec<(String, i64)>> {
    prop::collection::vec(("[a-d]", any::<i64>()), 1..6)
}

fn stored(hash: &str) -> StoredMessage {
    StoredMessage {
        data: String::new(),
        hash: hash.to_string(),
        timestamp: 0,
        expiry: 0,
    }
}

fn account() -> AccountId {
    AccountId::new(IdPrefix::Standard, [7u8; 32])
}

const KEY: [u8; 32] = [3u8; 32];

/// A device that applied `edits` and pushed once, confirmed under `hash`.
fn pushed_device(edits: &[(String, i64)], hash: &str) -> (ConfigObject, ConfigMessage) {
    let mut device = ConfigObject::new(ConfigKind::Contacts, vec![KEY]);
    for (field, value) in edits {
        device.set(field.clone(), ConfigValue::Int(*value));
    }
    let push = device.push().unwrap();
    device.confirm_pushed(push.seqno, hash);
    let message = ConfigMessage {
        hash: hash.to_string(),
        data: push.ciphertext,
    };
    (device, message)
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// Dedup yields each new hash once, in first-seen order, and nothing on replay
    #[test]
    fn dedup_is_idempotent(hashes in hashes_strategy()) {
        let pipeline = ReceivePipeline::new(Arc::new(MemoryStore::new()), 512);
        let raw: Vec<StoredMessage> = hashes.iter().map(|h| stored(h)).collect();

        let first = pipeline.dedup(&account(), &raw).unwrap();
        let mut expected: Vec<String> = Vec::new();
        for hash in &hashes {
            if !expected.contains(hash) {
                expected.push(hash.clone());
            }
        }
        let got: Vec<String> = first.iter().map(|m| m.hash.clone()).collect();
        prop_assert_eq!(got, expected);

        let replay = pipeline.dedup(&account(), &raw).unwrap();
        prop_assert!(replay.is_empty());
    }

    /// Batching keeps order, loses nothing and respects the size bound
    #[test]
    fn batches_preserve_order(count in 0usize..2000, batch_size in 1usize..600) {
        let pipeline = ReceivePipeline::new(Arc::new(MemoryStore::new()), batch_size);
        let envelopes: Vec<_> = (0..count)
            .map(|i| swarmlink_core::Envelope {
                kind: swarmlink_core::receive::EnvelopeKind::Visible,
                sender: None,
                timestamp: i as u64,
                payload: Vec::new(),
                sync_target: None,
                source_hash: i.to_string(),
            })
            .collect();

        let batches = pipeline.batches(envelopes);
        prop_assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= batch_size));
        let flat: Vec<u64> = batches.into_iter().flatten().map(|e| e.timestamp).collect();
        prop_assert_eq!(flat, (0..count as u64).collect::<Vec<_>>());
    }

    /// Merging the same pushes in any order gives the same state
    #[test]
    fn merge_is_order_independent(
        edits in prop::collection::vec(edits_strategy(), 2..5),
        seed in any::<u64>(),
    ) {
        let messages: Vec<ConfigMessage> = edits
            .iter()
            .enumerate()
            .map(|(i, e)| pushed_device(e, &format!("h{}", i)).1)
            .collect();

        let mut shuffled = messages.clone();
        let mut state = seed;
        for i in (1..shuffled.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            shuffled.swap(i, (state >> 33) as usize % (i + 1));
        }

        let mut forward = ConfigObject::new(ConfigKind::Contacts, vec![KEY]);
        forward.merge(&messages);
        let mut one_by_one = ConfigObject::new(ConfigKind::Contacts, vec![KEY]);
        for message in &shuffled {
            one_by_one.merge(std::slice::from_ref(message));
        }
        prop_assert_eq!(forward.snapshot().unwrap(), one_by_one.snapshot().unwrap());

        // Replaying is a no-op.
        prop_assert_eq!(forward.merge(&messages), 0);
    }

    /// Devices that exchange every push converge
    #[test]
    fn devices_converge(edits in prop::collection::vec(edits_strategy(), 2..4)) {
        let mut devices = Vec::new();
        let mut messages = Vec::new();
        for (i, e) in edits.iter().enumerate() {
            let (device, message) = pushed_device(e, &format!("h{}", i));
            devices.push(device);
            messages.push(message);
        }
        for device in &mut devices {
            device.merge(&messages);
        }
        let first = devices[0].snapshot().unwrap();
        for device in &devices[1..] {
            prop_assert_eq!(&device.snapshot().unwrap(), &first);
        }
    }

    /// Legacy poll interval grows with inactivity and stays in bounds
    #[test]
    fn legacy_interval_is_monotone(a in 0u64..100_000_000, b in 0u64..100_000_000) {
        let poll = PollConfig::default();
        let (low, high) = (a.min(b), a.max(b));
        let short = legacy_interval(&poll, Some(low));
        let long = legacy_interval(&poll, Some(high));
        prop_assert!(short <= long);
        prop_assert!(short.as_millis() as u64 >= poll.legacy_min_interval_ms);
        prop_assert!(long.as_millis() as u64 <= poll.legacy_max_interval_ms);
    }
}
