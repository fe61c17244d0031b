//! # Table-Id Allocator
//!
//! A persistent monotonic 64-bit counter backed by `_tab_index.d` under the
//! data root. The file is one page; its first eight bytes hold the last id
//! handed out, little-endian. The file is mapped read-write and shared, and
//! every access to the counter goes through an atomic view of the mapped
//! word, so allocation is lock-free and totally ordered.
//!
//! The counter is never explicitly flushed; the OS writes the page back on
//! its own schedule. A crash can therefore re-issue the last few ids that
//! never reached disk. Ids are only ever compared for equality, so this is
//! an accepted trade for a zero-syscall hot path.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use eyre::Result;
use memmap2::MmapMut;

use crate::error::EngineError;

pub const TAB_INDEX_FILE_NAME: &str = "_tab_index.d";
const TAB_INDEX_FILE_SIZE: u64 = 4096;

pub struct TableIdAllocator {
    // Field order matters: the mapping must unmap before the file closes.
    mmap: MmapMut,
    _file: File,
    path: PathBuf,
}

impl TableIdAllocator {
    /// Opens (creating and zero-filling if needed) the index file and maps
    /// it read-write.
    pub fn open(root: &Path) -> Result<Self> {
        let path = root.join(TAB_INDEX_FILE_NAME);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| EngineError::storage_io(&e, "could not open", &path))?;

        let len = file
            .metadata()
            .map_err(|e| EngineError::storage_io(&e, "could not stat", &path))?
            .len();
        if len < TAB_INDEX_FILE_SIZE {
            file.set_len(TAB_INDEX_FILE_SIZE)
                .map_err(|e| EngineError::storage_io(&e, "could not allocate", &path))?;
        }

        // SAFETY: MmapMut::map_mut is unsafe because the file could be
        // modified externally. This is safe because:
        // 1. The index file belongs to this data root and is only touched
        //    through this allocator while the engine is alive.
        // 2. The mapping's lifetime is tied to TableIdAllocator and is
        //    dropped before the file descriptor.
        // 3. All access goes through an 8-byte atomic at offset 0, within
        //    the page-sized mapping established above.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .map_err(|e| EngineError::storage_io(&e, "could not mmap", &path))?
        };

        Ok(Self {
            mmap,
            _file: file,
            path,
        })
    }

    fn counter(&self) -> &AtomicU64 {
        // SAFETY: the mapping is page-aligned, at least a page long, and
        // lives as long as &self; an atomic view of its first word is
        // always in bounds and properly aligned. Atomics mutate through
        // shared references by design.
        unsafe { &*(self.mmap.as_ptr() as *const AtomicU64) }
    }

    /// Returns a value strictly greater than every id previously returned
    /// for this data directory, across restarts included.
    pub fn next_id(&self) -> u64 {
        self.counter().fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The last id handed out, or 0 when none was.
    pub fn current(&self) -> u64 {
        self.counter().load(Ordering::SeqCst)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewinds the counter to 0. Only sound when no other thread is
    /// allocating, which is why it exists solely for tests.
    #[cfg(any(test, feature = "testing"))]
    pub fn reset_for_tests(&self) {
        self.counter().store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn fresh_counter_starts_at_one() {
        let dir = tempdir().unwrap();
        let allocator = TableIdAllocator::open(dir.path()).unwrap();

        assert_eq!(allocator.current(), 0);
        assert_eq!(allocator.next_id(), 1);
        assert_eq!(allocator.next_id(), 2);
        assert_eq!(allocator.next_id(), 3);
    }

    #[test]
    fn counter_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let allocator = TableIdAllocator::open(dir.path()).unwrap();
            for _ in 0..5 {
                allocator.next_id();
            }
        }
        let allocator = TableIdAllocator::open(dir.path()).unwrap();
        assert_eq!(allocator.current(), 5);
        assert_eq!(allocator.next_id(), 6);
    }

    #[test]
    fn short_existing_file_is_grown() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(TAB_INDEX_FILE_NAME), [0u8; 3]).unwrap();

        let allocator = TableIdAllocator::open(dir.path()).unwrap();
        assert_eq!(allocator.next_id(), 1);
        let len = std::fs::metadata(dir.path().join(TAB_INDEX_FILE_NAME))
            .unwrap()
            .len();
        assert_eq!(len, TAB_INDEX_FILE_SIZE);
    }

    #[test]
    fn concurrent_allocation_yields_a_dense_distinct_range() {
        let dir = tempdir().unwrap();
        let allocator = Arc::new(TableIdAllocator::open(dir.path()).unwrap());

        const THREADS: usize = 8;
        const PER_THREAD: usize = 10_000;

        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let allocator = Arc::clone(&allocator);
            handles.push(std::thread::spawn(move || {
                let mut ids = Vec::with_capacity(PER_THREAD);
                let mut prev = 0u64;
                for _ in 0..PER_THREAD {
                    let id = allocator.next_id();
                    assert!(id > prev, "each caller observes strict increase");
                    prev = id;
                    ids.push(id);
                }
                ids
            }));
        }

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), THREADS * PER_THREAD);
        assert_eq!(all[0], 1);
        assert_eq!(*all.last().unwrap(), (THREADS * PER_THREAD) as u64);
    }

    #[test]
    fn reset_rewinds_to_zero() {
        let dir = tempdir().unwrap();
        let allocator = TableIdAllocator::open(dir.path()).unwrap();
        allocator.next_id();
        allocator.next_id();

        allocator.reset_for_tests();
        assert_eq!(allocator.next_id(), 1);
    }
}
