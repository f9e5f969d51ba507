//! Configuration surface recognized by the core (spec.md §6 / SPEC_FULL.md §10).

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Mmap access-pattern hint for the split-file serializer's backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    Sequential,
    RandomAccess,
}

impl Default for CacheMode {
    fn default() -> Self {
        CacheMode::Sequential
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Target leaf size for the subscene partitioner (C5).
    pub primitives_per_subscene: usize,
    /// `max_bytes` for the shape residency cache (C3 instance 1).
    pub geometry_cache_bytes: u64,
    /// `max_bytes` for the per-subscene BVH residency cache (C3 instance 2).
    pub bvh_cache_bytes: u64,
    /// Voxel grid resolution for the SVDAG culler (C7); 0 disables culling.
    pub svdag_resolution: u32,
    /// Number of initial in-flight rays spawned by the integrator.
    pub concurrency: usize,
    /// Size of the task-graph worker pool.
    pub worker_threads: usize,
    /// Mmap hint used by the split-file serializer.
    pub cache_mode: CacheMode,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            primitives_per_subscene: 5_000,
            geometry_cache_bytes: 256 * 1024 * 1024,
            bvh_cache_bytes: 128 * 1024 * 1024,
            svdag_resolution: 64,
            concurrency: 4_096,
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            cache_mode: CacheMode::Sequential,
        }
    }
}

impl Config {
    pub fn validate(&self) -> CoreResult<()> {
        if self.primitives_per_subscene == 0 {
            return Err(CoreError::InvalidConfig(
                "primitives_per_subscene must be > 0".into(),
            ));
        }
        if self.geometry_cache_bytes == 0 {
            return Err(CoreError::InvalidConfig(
                "geometry_cache_bytes must be > 0".into(),
            ));
        }
        if self.bvh_cache_bytes == 0 {
            return Err(CoreError::InvalidConfig(
                "bvh_cache_bytes must be > 0".into(),
            ));
        }
        if self.worker_threads == 0 {
            return Err(CoreError::InvalidConfig(
                "worker_threads must be > 0".into(),
            ));
        }
        Ok(())
    }
}
