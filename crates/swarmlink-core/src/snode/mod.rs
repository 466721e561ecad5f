//! Snode pool and swarm resolver.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  NodePool (shared by all pollers, mutex-guarded)                │
//! │  ├── nodes: Vec<Node>            refreshed from seeds           │
//! │  └── failures: HashMap<Node,u32> evict at threshold, reset to 0 │
//! │                                                                 │
//! │  SwarmResolver (per-account state lives in the store)           │
//! │  ├── resolve_swarm(account)      cache hit only if ≥ minimum    │
//! │  ├── invalidate(account, node)   "moved" signal                 │
//! │  └── replace_swarm(account, ..)  421 carrying a new swarm       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod pool;
mod swarm;

pub use pool::{parse_service_nodes, NodePool};
pub use swarm::{parse_swarm, SwarmResolver};
