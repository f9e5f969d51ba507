//! An out-of-core offline path tracer core: memory-bounded, batched ray
//! traversal over scenes whose geometry does not fit in RAM.
//!
//! The pipeline, front to back:
//!
//! - [`cache`] — the evictable protocol (C2) and residency cache (C3) that
//!   page serialized objects in and out under a hard byte budget, plus the
//!   [`cache::serializer`] backends (C1) that own where bytes actually live.
//! - [`task_graph`] — the batched scheduler (C4) that turns "defer rays
//!   until a subscene is worth loading" into an execution model.
//! - [`scene`] — the in-memory scene graph and [`scene::partition`]
//!   subscene partitioner (C5).
//! - [`bvh`] — the shared SAH builder plus the per-subscene bottom-level
//!   cache (C6, [`bvh::cached`]) and the top-level pauseable tree over
//!   batching points (C8, [`bvh::pauseable`]).
//! - [`svdag`] — the sparse voxel DAG occupancy culler (C7).
//! - [`accel`] — [`accel::BatchingAccelerator`] (C9), which wires all of the
//!   above behind the two calls an integrator actually makes.
//! - [`integrator`] — a minimal reference integrator exercising the core
//!   end-to-end; not part of the core's contract.

pub mod accel;
pub mod bvh;
pub mod cache;
pub mod config;
pub mod error;
pub mod integrator;
pub mod math;
pub mod scene;
pub mod stats;
pub mod svdag;
pub mod task_graph;

pub use config::Config;
pub use error::{CoreError, CoreResult};
