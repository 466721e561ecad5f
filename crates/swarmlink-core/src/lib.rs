//! swarmlink core library
//!
//! Client for a replicated message-storage network: each account's messages
//! live on a small set of storage nodes (its swarm), reached only through
//! onion-routed requests.
//!
//! ## Overview
//!
//! ```text
//!   MessageSender ──► SnodeApi ──► OnionClient ──► OnionTransport ──► swarm
//!                        ▲              │
//!   Pollers ─────────────┘              └── NodePool / SwarmResolver
//!      │
//!      ├── ReceivePipeline: cursor, dedup, decrypt, batches of 512
//!      └── ConfigObject merge ◄──► ConfigSyncJob push
//! ```
//!
//! ## Quick Start
//!
//! With the `sim` feature the whole client runs against an in-memory network:
//!
//! ```ignore
//! use std::sync::Arc;
//! use swarmlink_core::{ChannelSink, Identity, PollerManager, SimNetwork, SnodeApi, UserConfigs, UserPoller};
//!
//! let network = SimNetwork::new(20, 5);
//! let ctx = network.context(Some(Identity::generate()))?;
//! let api = Arc::new(SnodeApi::new(ctx.clone()));
//! let configs = Arc::new(parking_lot::Mutex::new(UserConfigs::new(ctx.identity()?)));
//! let (sink, mut batches) = ChannelSink::new();
//!
//! let manager = PollerManager::new(ctx.clone());
//! manager.start(Box::new(UserPoller::new(api, Arc::new(sink), configs)?)).await;
//! while let Some(batch) = batches.recv().await {
//!     println!("{} envelopes", batch.envelopes.len());
//! }
//! ```

pub mod clock;
pub mod community;
pub mod config;
pub mod config_sync;
pub mod context;
pub mod crypto;
pub mod error;
pub mod events;
pub mod groups;
pub mod identity;
pub mod logging;
pub mod onion;
pub mod poller;
pub mod receive;
pub mod rpc;
pub mod sender;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod snode;
pub mod storage;
pub mod types;

// Re-exports
pub use clock::NetworkClock;
pub use community::{CommunityApi, CommunityHandler, CommunityServer};
pub use config::{ClientConfig, PollConfig, StatusClass, StatusPolicy};
pub use config_sync::{ConfigKind, ConfigObject, ConfigSyncJob, GroupConfigs, UserConfigs};
pub use context::SwarmContext;
pub use error::{SwarmError, SwarmResult};
pub use events::{NetworkEvent, PollerState};
pub use groups::{GroupAdmin, SubAccountToken};
pub use identity::Identity;
pub use onion::{OnionClient, OnionTransport};
pub use poller::{
    CommunityPoller, GroupPoller, LegacyGroupPoller, Poller, PollerManager, UserPoller,
};
pub use receive::{ChannelSink, Envelope, ReceiveBatch, ReceivePipeline};
pub use rpc::{RequestAuth, SnodeApi};
pub use sender::{MessageSender, OutgoingMessage, SendOutcome};
#[cfg(any(test, feature = "sim"))]
pub use sim::SimNetwork;
pub use snode::{NodePool, SwarmResolver};
pub use storage::{MemoryStore, Storage, SwarmStore};
pub use types::*;
