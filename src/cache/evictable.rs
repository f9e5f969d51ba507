//! The evictable protocol (C2): the per-object contract for becoming
//! resident / being released that the residency cache (C3) drives.

use crate::cache::serializer::{Deserializer, Serializer};

/// An object whose in-memory content can be released and reconstructed
/// from a serialized image.
///
/// Implementors are responsible for their own interior mutability: the
/// cache calls these through `&self` so that readers can hold a live
/// [`crate::cache::CachedPtr`] concurrently with the loader populating the
/// object the first time.
pub trait Evictable: Send + Sync {
    /// Writes a self-contained byte image into `serializer` and stores the
    /// returned allocation internally. Called exactly once, at
    /// registration; the object is evicted (never resident) afterwards.
    fn serialize(&self, serializer: &dyn Serializer);

    /// Reconstructs the in-memory representation from the allocation
    /// stored by [`Evictable::serialize`].
    fn make_resident(&self, deserializer: &dyn Deserializer);

    /// Releases all memory reconstructible from the allocation.
    fn evict(&self);

    /// Current footprint in bytes. Resident size must be `>=` non-resident
    /// size (the cache's accounting assumes the delta is non-negative; see
    /// the memory-accounting edge case in the residency cache contract).
    fn size_bytes(&self) -> usize;

    /// Whether the object is currently reconstructed in memory.
    fn is_resident(&self) -> bool;
}
