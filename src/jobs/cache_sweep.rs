//! Background job: evict expired resolved-permission cache entries.
//!
//! Expired entries are already ignored on read; the sweep bounds memory held
//! by tokens that are never presented again.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;

use crate::cache::TieredCache;

/// Spawn the background sweep task. Call this once at startup.
pub fn spawn(cache: TieredCache, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every.max(Duration::from_secs(1)));
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            sweep(&cache);
        }
    })
}

fn sweep(cache: &TieredCache) -> usize {
    let evicted = cache.evict_expired();
    if evicted > 0 {
        tracing::debug!(
            evicted,
            remaining = cache.local_len(),
            "evicted expired permission cache entries"
        );
    }
    evicted
}

// ── Tests ───────────────────────────────────────────────────────
