//! Request-ID allocation.

use alink_proto::RequestId;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wait-free, process-wide request-ID counter.
///
/// The platform accepts ids in `0..=u32::MAX`; the counter wraps only after
/// exhausting that range. The starting value is derived from the wall clock
/// so a restarted process is unlikely to reuse ids a stale reply may still
/// carry.
#[derive(Debug)]
pub struct RequestIds {
    next: AtomicU32,
}

impl RequestIds {
    /// Counter seeded from the current time.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(seed())
    }

    /// Counter with an explicit first value.
    #[must_use]
    pub fn starting_at(first: u32) -> Self {
        Self {
            next: AtomicU32::new(first),
        }
    }

    /// Allocate the next id.
    pub fn next_id(&self) -> RequestId {
        RequestId(u64::from(self.next.fetch_add(1, Ordering::Relaxed)))
    }
}

impl Default for RequestIds {
    fn default() -> Self {
        Self::new()
    }
}

fn seed() -> u32 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    // Fold the high bits in so consecutive starts differ in every position.
    let folded = nanos ^ (nanos >> 32) ^ (nanos >> 64);
    u32::try_from(folded & u128::from(u32::MAX)).unwrap_or_default()
}
