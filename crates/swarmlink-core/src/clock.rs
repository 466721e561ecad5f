//! Network-adjusted clock.
//!
//! Storage nodes reject requests whose signed timestamp strays too far from
//! network time (status 406). The offset learned from `info` is applied to
//! every timestamp we sign.

use std::sync::atomic::{AtomicI64, Ordering};

use tracing::info;

use crate::types::now_ms;

#[derive(Debug, Default)]
pub struct NetworkClock {
    offset_ms: AtomicI64,
}

impl NetworkClock {
    pub fn new(offset_ms: i64) -> Self {
        Self {
            offset_ms: AtomicI64::new(offset_ms),
        }
    }

    /// Current network time in milliseconds
    pub fn now(&self) -> u64 {
        let local = now_ms() as i64;
        (local + self.offset_ms.load(Ordering::Relaxed)).max(0) as u64
    }

    pub fn offset(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    /// Recalibrate from a timestamp reported by a storage node.
    pub fn calibrate(&self, network_time_ms: u64) -> i64 {
        let offset = network_time_ms as i64 - now_ms() as i64;
        let previous = self.offset_ms.swap(offset, Ordering::Relaxed);
        if (offset - previous).abs() > 1_000 {
            info!(previous, offset, "Clock offset recalibrated");
        }
        offset
    }
}
