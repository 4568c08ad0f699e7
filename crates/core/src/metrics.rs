//! Cache metrics for monitoring and debugging.
//!
//! Tracks allocation, eviction, promotion, and prefix hit rates.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters for cache activity, shared via `Arc`.
#[derive(Default)]
pub struct CacheMetrics {
    /// Total allocation requests
    allocations: AtomicU64,
    /// Total blocks allocated
    blocks_allocated: AtomicU64,
    /// Total blocks freed
    blocks_freed: AtomicU64,
    /// Total blocks evicted from the prefix index
    blocks_evicted: AtomicU64,
    /// Prefix lookups
    prefix_queries: AtomicU64,
    /// Lookups that matched an entry
    prefix_hits: AtomicU64,
    /// Lookups that matched nothing
    prefix_misses: AtomicU64,
    /// Prefixes promoted into the index on free
    promotions: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_allocation(&self, num_blocks: usize) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.blocks_allocated
            .fetch_add(num_blocks as u64, Ordering::Relaxed);
    }

    pub fn record_free(&self, num_blocks: usize) {
        self.blocks_freed
            .fetch_add(num_blocks as u64, Ordering::Relaxed);
    }

    pub fn record_eviction(&self, num_blocks: usize) {
        self.blocks_evicted
            .fetch_add(num_blocks as u64, Ordering::Relaxed);
    }

    pub fn record_prefix_query(&self, hit: bool) {
        self.prefix_queries.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.prefix_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.prefix_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn blocks_allocated(&self) -> u64 {
        self.blocks_allocated.load(Ordering::Relaxed)
    }

    pub fn blocks_freed(&self) -> u64 {
        self.blocks_freed.load(Ordering::Relaxed)
    }

    pub fn blocks_evicted(&self) -> u64 {
        self.blocks_evicted.load(Ordering::Relaxed)
    }

    pub fn prefix_queries(&self) -> u64 {
        self.prefix_queries.load(Ordering::Relaxed)
    }

    pub fn prefix_hits(&self) -> u64 {
        self.prefix_hits.load(Ordering::Relaxed)
    }

    pub fn prefix_misses(&self) -> u64 {
        self.prefix_misses.load(Ordering::Relaxed)
    }

    pub fn promotions(&self) -> u64 {
        self.promotions.load(Ordering::Relaxed)
    }

    /// Prefix hit rate (0.0 to 1.0). `None` before the first lookup.
    pub fn prefix_hit_rate(&self) -> Option<f64> {
        let hits = self.prefix_hits();
        let total = hits + self.prefix_misses();
        if total == 0 {
            None
        } else {
            Some(hits as f64 / total as f64)
        }
    }

    pub fn reset(&self) {
        self.allocations.store(0, Ordering::Relaxed);
        self.blocks_allocated.store(0, Ordering::Relaxed);
        self.blocks_freed.store(0, Ordering::Relaxed);
        self.blocks_evicted.store(0, Ordering::Relaxed);
        self.prefix_queries.store(0, Ordering::Relaxed);
        self.prefix_hits.store(0, Ordering::Relaxed);
        self.prefix_misses.store(0, Ordering::Relaxed);
        self.promotions.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allocations: self.allocations(),
            blocks_allocated: self.blocks_allocated(),
            blocks_freed: self.blocks_freed(),
            blocks_evicted: self.blocks_evicted(),
            prefix_queries: self.prefix_queries(),
            prefix_hits: self.prefix_hits(),
            prefix_misses: self.prefix_misses(),
            promotions: self.promotions(),
            prefix_hit_rate: self.prefix_hit_rate(),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub allocations: u64,
    pub blocks_allocated: u64,
    pub blocks_freed: u64,
    pub blocks_evicted: u64,
    pub prefix_queries: u64,
    pub prefix_hits: u64,
    pub prefix_misses: u64,
    pub promotions: u64,
    pub prefix_hit_rate: Option<f64>,
}
