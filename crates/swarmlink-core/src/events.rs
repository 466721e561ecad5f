//! Event and status types broadcast by the client.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  PollerState: per-poller loop state                             │
//! │  ├── Idle → ResolvingSwarm → Polling(node)                      │
//! │  ├── Polling ──fault──► ResolvingSwarm                          │
//! │  ├── RemovedFromGroup: kicked, loop ended                       │
//! │  └── Stopped                                                    │
//! │                                                                 │
//! │  NetworkEvent: notifications for the host application          │
//! │  ├── ClockOutOfSync      406 seen, offset recalibrated          │
//! │  ├── NodeEvicted         failure threshold crossed              │
//! │  ├── SwarmMoved          421 seen for an account                │
//! │  ├── MessagesReceived    new envelopes handed to the batch sink │
//! │  ├── PollerStateChanged                                         │
//! │  └── RemovedFromGroup    valid kicked message observed          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use crate::types::{AccountId, Namespace, Node};

/// Capacity of the event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// State of one poll loop
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PollerState {
    /// Created but not started
    #[default]
    Idle,
    /// Looking up the swarm or choosing a node
    ResolvingSwarm,
    /// Polling a specific node
    Polling(Node),
    /// The local user was removed from the polled group
    RemovedFromGroup,
    /// Stopped by request
    Stopped,
}

impl fmt::Display for PollerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollerState::Idle => write!(f, "Idle"),
            PollerState::ResolvingSwarm => write!(f, "Resolving swarm"),
            PollerState::Polling(node) => write!(f, "Polling {}", node),
            PollerState::RemovedFromGroup => write!(f, "Removed from group"),
            PollerState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Events emitted to subscribers of [`crate::SwarmContext::subscribe`]
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    ClockOutOfSync { offset_ms: i64 },
    NodeEvicted { node: Node },
    SwarmMoved { account: AccountId },
    MessagesReceived {
        account: AccountId,
        namespace: Namespace,
        count: usize,
    },
    PollerStateChanged { key: String, state: PollerState },
    RemovedFromGroup { group: AccountId, generation: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poller_state_default_and_display() {
        assert_eq!(PollerState::default(), PollerState::Idle);
        let node = Node::new("1.2.3.4", 443, "e", "x");
        assert_eq!(PollerState::Polling(node).to_string(), "Polling 1.2.3.4:443");
        assert_eq!(PollerState::RemovedFromGroup.to_string(), "Removed from group");
    }
}
