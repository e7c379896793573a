use std::fs::File;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{CacheError, Result};

/// Owns the memory map backing a block cache and the optional file behind
/// it. Mirrors the role of `crab-db-alloc`'s `StorageInner`, but for a
/// single fixed-size device rather than a set of growable allocator
/// arenas: the metadata device's size is fixed at `create`/`open` time.
pub(crate) struct Storage {
    map: MmapMut,
    file: Option<File>,
}

impl Storage {
    pub fn open<P: AsRef<Path>>(path: P, nr_bytes: u64) -> Result<Self> {
        use fs4::fs_std::FileExt;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(CacheError::Open)?;
        file.try_lock_exclusive().map_err(CacheError::Lock)?;

        let current_len = file.metadata().map_err(CacheError::Open)?.len();
        if current_len < nr_bytes {
            file.set_len(nr_bytes).map_err(CacheError::Open)?;
        }

        // mmap maps in whole pages; round the file up so the tail of the
        // last block never straddles an unmapped page.
        let page = page_size::get() as u64;
        let nr_bytes = nr_bytes.div_ceil(page) * page;
        if file.metadata().map_err(CacheError::Open)?.len() < nr_bytes {
            file.set_len(nr_bytes).map_err(CacheError::Open)?;
        }

        let map = unsafe {
            MmapOptions::new()
                .len(nr_bytes as usize)
                .map_mut(&file)
                .map_err(CacheError::Map)?
        };

        Ok(Self { map, file: Some(file) })
    }

    pub fn anon(nr_bytes: u64) -> Result<Self> {
        let map = MmapMut::map_anon(nr_bytes as usize).map_err(CacheError::Map)?;
        Ok(Self { map, file: None })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn flush(&self) -> Result<()> {
        if self.file.is_some() {
            self.map.flush().map_err(CacheError::Sync)?;
        }
        Ok(())
    }

    pub fn flush_range(&self, offset: usize, len: usize) -> Result<()> {
        if self.file.is_some() {
            self.map.flush_range(offset, len).map_err(CacheError::Sync)?;
        }
        Ok(())
    }

    /// Swap the mapping for a new backing file of the same logical size.
    /// Used by [`crate::BlockCache::rebind`].
    pub fn rebind<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let replacement = Self::open(path, self.len() as u64)?;
        *self = replacement;
        Ok(())
    }
}
