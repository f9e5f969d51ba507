//! Serializer / Deserializer (C1): bytes in, opaque allocation tokens out.
//!
//! Two backing stores are provided: [`InMemorySerializer`] (a single
//! growable byte vector) and [`SplitFileSerializer`] (fixed-size mmap'd
//! files under a scratch directory). Both are driven through the same
//! `Serializer`/`Deserializer` traits so the residency cache is agnostic
//! to which one backs a given evictable.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::{Advice, Mmap, MmapMut};
use parking_lot::{Mutex, RwLock};

use crate::config::CacheMode;
use crate::error::{CoreError, CoreResult};

/// Opaque handle returned by a serializer. Interpretation is private to the
/// serializer/deserializer pair that produced it: the in-memory backend
/// only ever uses `offset` (within its single buffer); the split-file
/// backend uses both fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub(crate) file_id: u32,
    pub(crate) offset: u64,
}

pub trait Serializer: Send + Sync {
    /// Reserves `n` bytes and returns a token plus a writable pointer valid
    /// until the next call to `unmap_previous_allocations`.
    fn allocate_and_map(&self, n: usize) -> (Allocation, *mut u8);

    /// Invalidates every pointer handed out by `allocate_and_map` since the
    /// last call. The allocations themselves remain valid.
    fn unmap_previous_allocations(&self);

    /// Finalizes the write side and returns a reader.
    fn create_deserializer(self: Box<Self>) -> CoreResult<Box<dyn Deserializer>>;
}

pub trait Deserializer: Send + Sync {
    /// Returns a pointer valid until the matching `unmap`. Safe to call
    /// concurrently from many threads for distinct allocations; callers
    /// guarantee they never map an allocation that is concurrently being
    /// written.
    fn map(&self, alloc: Allocation) -> *const u8;

    fn unmap(&self, alloc: Allocation);
}

// ---------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------

pub struct InMemorySerializer {
    buffer: Mutex<Vec<u8>>,
}

impl InMemorySerializer {
    pub fn new() -> Self {
        InMemorySerializer {
            buffer: Mutex::new(Vec::new()),
        }
    }
}

impl Default for InMemorySerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer for InMemorySerializer {
    fn allocate_and_map(&self, n: usize) -> (Allocation, *mut u8) {
        let mut buffer = self.buffer.lock();
        let offset = buffer.len();
        buffer.resize(offset + n, 0);
        // SAFETY: `buffer` outlives the pointer we hand back for as long as
        // no other allocation resizes it; `unmap_previous_allocations` is
        // the caller's cue that such a resize may have invalidated it.
        let ptr = unsafe { buffer.as_mut_ptr().add(offset) };
        (
            Allocation {
                file_id: 0,
                offset: offset as u64,
            },
            ptr,
        )
    }

    fn unmap_previous_allocations(&self) {
        // A `Vec` reallocation on the next `allocate_and_map` is the only
        // thing that can invalidate previously returned pointers; nothing
        // to release here, this just documents the cutover point.
    }

    fn create_deserializer(self: Box<Self>) -> CoreResult<Box<dyn Deserializer>> {
        let buffer = self.buffer.into_inner();
        Ok(Box::new(InMemoryDeserializer { buffer }))
    }
}

pub struct InMemoryDeserializer {
    buffer: Vec<u8>,
}

impl Deserializer for InMemoryDeserializer {
    fn map(&self, alloc: Allocation) -> *const u8 {
        debug_assert_eq!(alloc.file_id, 0);
        // SAFETY: offsets handed out by `InMemorySerializer` are always in
        // bounds of the finalized buffer.
        unsafe { self.buffer.as_ptr().add(alloc.offset as usize) }
    }

    fn unmap(&self, _alloc: Allocation) {}
}

// ---------------------------------------------------------------------
// Split-file mmap backend
// ---------------------------------------------------------------------

/// Default batch size for each backing file (§6: "default 512 MiB").
pub const DEFAULT_BATCH_SIZE: u64 = 512 * 1024 * 1024;

struct WriteFile {
    id: u32,
    file: File,
    mmap: MmapMut,
    cursor: u64,
    capacity: u64,
}

pub struct SplitFileSerializer {
    scratch_dir: PathBuf,
    batch_size: u64,
    next_file_id: AtomicU32,
    current: Mutex<Option<WriteFile>>,
    sealed: Mutex<Vec<(u32, PathBuf, u64)>>,
    // Keeps the scratch directory alive (and removed on Drop) when the
    // caller didn't hand us one of their own.
    _owned_tempdir: Option<tempfile::TempDir>,
}

impl SplitFileSerializer {
    /// Creates a scratch serializer backed by a fresh, process-lifetime
    /// temporary directory that is deleted on drop.
    pub fn new_in_tempdir(batch_size: u64) -> CoreResult<Self> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().to_path_buf();
        let mut serializer = Self::new(path, batch_size)?;
        serializer._owned_tempdir = Some(dir);
        Ok(serializer)
    }

    pub fn new(scratch_dir: impl Into<PathBuf>, batch_size: u64) -> CoreResult<Self> {
        let scratch_dir = scratch_dir.into();
        std::fs::create_dir_all(&scratch_dir)
            .map_err(|_| CoreError::ScratchDir(scratch_dir.clone()))?;
        Ok(SplitFileSerializer {
            scratch_dir,
            batch_size,
            next_file_id: AtomicU32::new(0),
            current: Mutex::new(None),
            sealed: Mutex::new(Vec::new()),
            _owned_tempdir: None,
        })
    }

    fn file_path(&self, id: u32) -> PathBuf {
        self.scratch_dir.join(format!("{id}.bin"))
    }

    fn open_new_file(&self, min_size: u64) -> CoreResult<WriteFile> {
        let id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        let capacity = min_size.max(self.batch_size);
        let path = self.file_path(id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(capacity)?;
        // SAFETY: the file is exclusively owned by this serializer until
        // sealed, and no other process maps it concurrently.
        let mmap = unsafe { MmapMut::map_mut(&file) }?;
        Ok(WriteFile {
            id,
            file,
            mmap,
            cursor: 0,
            capacity,
        })
    }
}

impl Serializer for SplitFileSerializer {
    fn allocate_and_map(&self, n: usize) -> (Allocation, *mut u8) {
        let n = n as u64;
        let mut slot = self.current.lock();

        let needs_new_file = match &*slot {
            Some(wf) => wf.cursor + n > wf.capacity,
            None => true,
        };

        if needs_new_file {
            if let Some(old) = slot.take() {
                let _ = old.file.sync_data();
                self.sealed
                    .lock()
                    .push((old.id, self.file_path(old.id), old.capacity));
            }
            // Allocation larger than the batch size: grow that file to fit
            // (§4.1 failure modes).
            let new_file = self
                .open_new_file(n)
                .unwrap_or_else(|e| crate::fatal!("failed to open scratch file: {e}"));
            *slot = Some(new_file);
        }

        let wf = slot.as_mut().expect("just ensured a current file exists");
        let offset = wf.cursor;
        wf.cursor += n;
        // SAFETY: `offset..offset+n` is within `wf.capacity`, checked above.
        let ptr = unsafe { wf.mmap.as_mut_ptr().add(offset as usize) };
        (
            Allocation {
                file_id: wf.id,
                offset,
            },
            ptr,
        )
    }

    fn unmap_previous_allocations(&self) {
        // The mmap stays resident for the lifetime of the write file; there
        // is nothing to explicitly unmap on the writer side. Kept as a
        // distinct call (rather than folded away) to mirror the contract
        // 1:1 with the in-memory backend and the deserializer side.
    }

    fn create_deserializer(self: Box<Self>) -> CoreResult<Box<dyn Deserializer>> {
        let mut files: Vec<(u32, PathBuf, u64)> = self.sealed.into_inner();
        if let Some(current) = self.current.into_inner() {
            let _ = current.file.sync_data();
            files.push((current.id, self.file_path(current.id), current.capacity));
        }
        files.sort_by_key(|(id, _, _)| *id);

        let mut mmaps = Vec::with_capacity(files.len());
        for (id, path, _capacity) in &files {
            let file = File::open(path)?;
            // SAFETY: the writer side has sealed this file; no further
            // writes occur.
            let mmap = unsafe { Mmap::map(&file) }?;
            debug_assert_eq!(mmaps.len() as u32, *id);
            mmaps.push(mmap);
        }

        Ok(Box::new(SplitFileDeserializer { mmaps }))
    }
}

pub struct SplitFileDeserializer {
    mmaps: Vec<Mmap>,
}

impl SplitFileDeserializer {
    /// Applies the mmap cache-mode hint to every backing file. Advisory
    /// only; failures are logged, not fatal.
    pub fn advise(&self, mode: CacheMode) {
        let advice = match mode {
            CacheMode::Sequential => Advice::Sequential,
            CacheMode::RandomAccess => Advice::Random,
        };
        for mmap in &self.mmaps {
            if let Err(e) = mmap.advise(advice) {
                tracing::warn!("mmap advise failed: {e}");
            }
        }
    }
}

impl Deserializer for SplitFileDeserializer {
    fn map(&self, alloc: Allocation) -> *const u8 {
        let mmap = &self.mmaps[alloc.file_id as usize];
        // SAFETY: offsets handed out by `SplitFileSerializer` are always in
        // bounds of the sealed file they were allocated from.
        unsafe { mmap.as_ptr().add(alloc.offset as usize) }
    }

    fn unmap(&self, _alloc: Allocation) {
        // Files stay mmapped for the process lifetime (§4.1); per-allocation
        // unmap is a deliberate no-op.
    }
}

impl Drop for SplitFileSerializer {
    fn drop(&mut self) {
        let mut paths: Vec<PathBuf> = self
            .sealed
            .get_mut()
            .iter()
            .map(|(_, path, _)| path.clone())
            .collect();
        if let Some(current) = self.current.get_mut() {
            paths.push(self.file_path(current.id));
        }
        for path in paths {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_round_trip() {
        let serializer: Box<dyn Serializer> = Box::new(InMemorySerializer::new());
        let values: [u32; 4] = [11, 22, 33, 44];
        let mut allocations = Vec::new();
        for v in values {
            let (alloc, ptr) = serializer.allocate_and_map(4);
            unsafe { std::ptr::write_unaligned(ptr as *mut u32, v) };
            allocations.push(alloc);
        }
        serializer.unmap_previous_allocations();

        let deserializer = serializer.create_deserializer().unwrap();
        for (alloc, expected) in allocations.into_iter().zip(values) {
            let ptr = deserializer.map(alloc);
            let got = unsafe { std::ptr::read_unaligned(ptr as *const u32) };
            assert_eq!(got, expected);
            deserializer.unmap(alloc);
        }
    }

    #[test]
    fn split_file_round_trip_small_batch() {
        // Scenario 4 in spec.md §8: batch size smaller than each write,
        // forcing a new file per integer.
        let dir = tempfile::tempdir().unwrap();
        let serializer: Box<dyn Serializer> =
            Box::new(SplitFileSerializer::new(dir.path(), 8).unwrap());

        let values: [i64; 8] = [1, -2, 3, -4, 5, -6, 7, -8];
        let mut allocations = Vec::new();
        for v in values {
            let (alloc, ptr) = serializer.allocate_and_map(8);
            unsafe { std::ptr::write_unaligned(ptr as *mut i64, v) };
            serializer.unmap_previous_allocations();
            allocations.push(alloc);
        }

        let deserializer = serializer.create_deserializer().unwrap();
        for (alloc, expected) in allocations.into_iter().zip(values) {
            let ptr = deserializer.map(alloc);
            let got = unsafe { std::ptr::read_unaligned(ptr as *const i64) };
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn allocation_larger_than_batch_size_grows_file() {
        let dir = tempfile::tempdir().unwrap();
        let serializer: Box<dyn Serializer> =
            Box::new(SplitFileSerializer::new(dir.path(), 16).unwrap());

        let big = vec![7u8; 1024];
        let (alloc, ptr) = serializer.allocate_and_map(big.len());
        unsafe { std::ptr::copy_nonoverlapping(big.as_ptr(), ptr, big.len()) };

        let deserializer = serializer.create_deserializer().unwrap();
        let mapped = deserializer.map(alloc);
        let read = unsafe { std::slice::from_raw_parts(mapped, big.len()) };
        assert_eq!(read, &big[..]);
    }

    #[test]
    fn scratch_files_are_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        {
            let serializer = SplitFileSerializer::new(dir.path(), 64).unwrap();
            serializer.allocate_and_map(8);
        }
        let remaining: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(remaining.is_empty(), "scratch files must not outlive the serializer");
    }
}
