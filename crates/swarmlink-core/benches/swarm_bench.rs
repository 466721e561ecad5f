//! Benchmarks for the receive and config paths
//!
//! Run with: cargo bench -p swarmlink-core
//!
//! These benchmarks establish baselines for:
//! - Dedup and batching of a full retrieval
//! - Unwrapping one-to-one ciphertext
//! - Config push and merge

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use swarmlink_core::config_sync::{ConfigKind, ConfigMessage, ConfigObject, ConfigValue};
use swarmlink_core::crypto::encrypt_for_recipient;
use swarmlink_core::receive::{DirectOpener, EnvelopeKind, WireEnvelope};
use swarmlink_core::{Identity, MemoryStore, Namespace, Node, ReceivePipeline, StoredMessage};

fn raw_messages(count: usize) -> Vec<StoredMessage> {
    (0..count)
        .map(|i| StoredMessage {
            data: String::new(),
            hash: format!("hash-{}", i),
            timestamp: i as u64,
            expiry: 0,
        })
        .collect()
}

fn encrypted_messages(sender: &Identity, recipient: &Identity, count: usize) -> Vec<StoredMessage> {
    (0..count)
        .map(|i| {
            let body = WireEnvelope {
                kind: EnvelopeKind::Visible,
                timestamp: i as u64,
                payload: format!("message {}", i).into_bytes(),
                sync_target: None,
            }
            .encode()
            .unwrap();
            let ciphertext = encrypt_for_recipient(sender, &recipient.account_id(), &body).unwrap();
            StoredMessage {
                data: STANDARD.encode(ciphertext),
                hash: format!("hash-{}", i),
                timestamp: i as u64,
                expiry: 0,
            }
        })
        .collect()
}

// ============================================================================
// Receive Pipeline Benchmarks
// ============================================================================

fn bench_dedup(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedup");
    let account = Identity::from_seed([1u8; 32]).account_id();

    for count in [64, 512, 2048] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("fresh", count), &count, |b, &count| {
            b.iter_batched(
                || {
                    (
                        ReceivePipeline::new(Arc::new(MemoryStore::new()), 512),
                        raw_messages(count),
                    )
                },
                |(pipeline, raw)| black_box(pipeline.dedup(&account, &raw).unwrap()),
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.bench_function("replay_512", |b| {
        let pipeline = ReceivePipeline::new(Arc::new(MemoryStore::new()), 512);
        let raw = raw_messages(512);
        pipeline.dedup(&account, &raw).unwrap();
        b.iter(|| black_box(pipeline.dedup(&account, &raw).unwrap()))
    });

    group.finish();
}

fn bench_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest");
    let alice = Identity::from_seed([1u8; 32]);
    let bob = Identity::from_seed([2u8; 32]);
    let node = Node::new("10.7.0.1", 22021, "ed", "x");

    for count in [16, 128] {
        let raw = encrypted_messages(&alice, &bob, count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("one_to_one", count), &raw, |b, raw| {
            b.iter_batched(
                || ReceivePipeline::new(Arc::new(MemoryStore::new()), 512),
                |pipeline| {
                    black_box(
                        pipeline
                            .ingest(raw, &node, &bob.account_id(), Namespace::DEFAULT, &DirectOpener(&bob))
                            .unwrap(),
                    )
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

// ============================================================================
// Config Benchmarks
// ============================================================================

fn config_with_fields(fields: usize) -> ConfigObject {
    let mut config = ConfigObject::new(ConfigKind::Contacts, vec![[5u8; 32]]);
    for i in 0..fields {
        config.set(format!("contact.{}", i), ConfigValue::Text(format!("name {}", i)));
    }
    config
}

fn bench_config_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("config_push");

    for fields in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(fields), &fields, |b, &fields| {
            b.iter_batched(
                || config_with_fields(fields),
                |mut config| black_box(config.push().unwrap()),
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_config_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("config_merge");

    for devices in [2, 8] {
        let messages: Vec<ConfigMessage> = (0..devices)
            .map(|d| {
                let mut config = config_with_fields(100);
                config.set(format!("device.{}", d), ConfigValue::Int(d as i64));
                ConfigMessage {
                    hash: format!("push-{}", d),
                    data: config.push().unwrap().ciphertext,
                }
            })
            .collect();

        group.bench_with_input(BenchmarkId::new("devices", devices), &messages, |b, messages| {
            b.iter_batched(
                || ConfigObject::new(ConfigKind::Contacts, vec![[5u8; 32]]),
                |mut config| black_box(config.merge(messages)),
                criterion::BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(receive_benches, bench_dedup, bench_ingest,);

criterion_group!(config_benches, bench_config_push, bench_config_merge,);

criterion_main!(receive_benches, config_benches);
