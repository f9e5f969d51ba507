//! Bounding volume hierarchies: a shared SAH builder (`sah`), the evictable
//! per-subscene bottom-level BVH (`cached`, C6), and the always-resident
//! top-level pauseable BVH over batching points (`pauseable`, C8).

pub mod cached;
pub mod pauseable;
pub mod sah;

pub use cached::{CachedBvh, CachedBvhHit, ShapeRegistry};
pub use pauseable::{PauseableBvh, PauseableInsertHandle, TraversalOutcome};
