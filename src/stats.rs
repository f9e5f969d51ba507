//! Process-wide statistics observer.
//!
//! Replaces what would otherwise be a global mutable singleton (the
//! C++ original keeps one) with a value constructed once and passed to
//! every component that wants to publish counters. Lifetime = program
//! lifetime, but ownership is explicit.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Stats {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    evictions: AtomicU64,
    tasks_flushed: AtomicU64,
    rays_paused: AtomicU64,
    rays_resumed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub evictions: u64,
    pub tasks_flushed: u64,
    pub rays_paused: u64,
    pub rays_resumed: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_flush(&self, items: usize) {
        self.tasks_flushed.fetch_add(items as u64, Ordering::Relaxed);
    }

    pub fn record_ray_paused(&self) {
        self.rays_paused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ray_resumed(&self) {
        self.rays_resumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            tasks_flushed: self.tasks_flushed.load(Ordering::Relaxed),
            rays_paused: self.rays_paused.load(Ordering::Relaxed),
            rays_resumed: self.rays_resumed.load(Ordering::Relaxed),
        }
    }

    pub fn publish(&self) {
        let s = self.snapshot();
        tracing::info!(
            cache_hits = s.cache_hits,
            cache_misses = s.cache_misses,
            evictions = s.evictions,
            tasks_flushed = s.tasks_flushed,
            rays_paused = s.rays_paused,
            rays_resumed = s.rays_resumed,
            "stats"
        );
    }
}
