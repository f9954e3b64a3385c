//! Write-back block cache.
//!
//! All mutation of the output device funnels through here. Random
//! block-aligned writes are coalesced in memory and written back in
//! ascending offset order, so that firmware layouts assembled out of order
//! still produce mostly-sequential device I/O.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex};

use super::device::OutputSink;
use super::BLOCK_SIZE;
use crate::error::Result;

/// Handle shared between the apply driver and the FAT/U-Boot adapters.
pub type SharedCache = Arc<Mutex<BlockCache>>;

struct CacheEntry {
    data: Vec<u8>,
    dirty: bool,
}

pub struct BlockCache {
    sink: Box<dyn OutputSink>,
    /// Block index → cached contents. BTreeMap keeps write-back ordered.
    entries: BTreeMap<u64, CacheEntry>,
    dirty_count: usize,
    max_blocks: usize,
}

impl BlockCache {
    /// Default cache capacity: 8 MiB of blocks.
    pub const DEFAULT_MAX_BLOCKS: usize = 16 * 1024;

    pub fn new(sink: Box<dyn OutputSink>, max_blocks: usize) -> Self {
        BlockCache {
            sink,
            entries: BTreeMap::new(),
            dirty_count: 0,
            max_blocks: max_blocks.max(16),
        }
    }

    pub fn shared(sink: Box<dyn OutputSink>, max_blocks: usize) -> SharedCache {
        Arc::new(Mutex::new(BlockCache::new(sink, max_blocks)))
    }

    /// Size of the underlying sink in bytes.
    pub fn sink_len(&self) -> u64 {
        self.sink.len()
    }

    /// Read `buf.len()` bytes at `offset`, serving from cached entries where
    /// they cover the range and falling back to device I/O elsewhere.
    pub fn pread(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        let bs = BLOCK_SIZE as u64;
        let mut pos = 0usize;
        while pos < buf.len() {
            let abs = offset + pos as u64;
            let block = abs / bs;
            let in_block = (abs % bs) as usize;
            let take = (BLOCK_SIZE - in_block).min(buf.len() - pos);

            if let Some(entry) = self.entries.get(&block) {
                buf[pos..pos + take].copy_from_slice(&entry.data[in_block..in_block + take]);
            } else {
                self.sink.pread(&mut buf[pos..pos + take], abs)?;
            }
            pos += take;
        }
        Ok(())
    }

    /// Write `buf` at `offset`. Partial-block updates read-modify-write;
    /// full-block updates overwrite. `streamed` marks bulk resource data,
    /// which may be spilled eagerly to bound memory; metadata writes
    /// (`streamed == false`) are held until flush where possible.
    pub fn pwrite(&mut self, buf: &[u8], offset: u64, streamed: bool) -> Result<()> {
        let bs = BLOCK_SIZE as u64;
        let mut pos = 0usize;
        while pos < buf.len() {
            let abs = offset + pos as u64;
            let block = abs / bs;
            let in_block = (abs % bs) as usize;
            let take = (BLOCK_SIZE - in_block).min(buf.len() - pos);

            match self.entries.get_mut(&block) {
                Some(entry) => {
                    entry.data[in_block..in_block + take].copy_from_slice(&buf[pos..pos + take]);
                    if !entry.dirty {
                        entry.dirty = true;
                        self.dirty_count += 1;
                    }
                }
                None => {
                    let mut data = vec![0u8; BLOCK_SIZE];
                    if take < BLOCK_SIZE {
                        // Partial update of an uncached block: merge with the
                        // device contents.
                        self.sink.pread(&mut data, block * bs)?;
                    }
                    data[in_block..in_block + take].copy_from_slice(&buf[pos..pos + take]);
                    self.entries.insert(block, CacheEntry { data, dirty: true });
                    self.dirty_count += 1;
                }
            }
            pos += take;
        }

        if streamed && self.entries.len() >= self.max_blocks {
            self.spill()?;
        }
        Ok(())
    }

    /// Invalidate cached entries fully covered by the range and forward the
    /// discard to the device when `hard` is set.
    pub fn trim(&mut self, offset: u64, len: u64, hard: bool) -> Result<()> {
        let bs = BLOCK_SIZE as u64;
        let first = offset.div_ceil(bs);
        let end = (offset + len) / bs;
        if first < end {
            let covered: Vec<u64> = self.entries.range(first..end).map(|(&b, _)| b).collect();
            for block in covered {
                if let Some(entry) = self.entries.remove(&block) {
                    if entry.dirty {
                        self.dirty_count -= 1;
                    }
                }
            }
        }
        if hard {
            self.sink.trim(offset, len)?;
        }
        Ok(())
    }

    /// Write back all dirty entries in ascending offset order and sync the
    /// sink. The first error aborts the run.
    pub fn flush(&mut self) -> Result<()> {
        self.write_back()?;
        self.sink.sync()?;
        Ok(())
    }

    fn write_back(&mut self) -> Result<()> {
        let bs = BLOCK_SIZE as u64;
        for (&block, entry) in self.entries.iter_mut() {
            if entry.dirty {
                self.sink.pwrite(&entry.data, block * bs)?;
                entry.dirty = false;
            }
        }
        self.dirty_count = 0;
        Ok(())
    }

    /// Bound memory during bulk streams: write everything back and drop the
    /// now-clean entries.
    fn spill(&mut self) -> Result<()> {
        log::debug!(
            "block cache spilling {} entries ({} dirty)",
            self.entries.len(),
            self.dirty_count
        );
        self.write_back()?;
        self.entries.clear();
        Ok(())
    }
}

/// A `Read + Write + Seek` window over the cache, starting at a byte offset
/// on the output device. This is what the FAT layer mounts: it sees a block
/// device, not a file handle.
pub struct BlockIo {
    cache: SharedCache,
    base: u64,
    len: u64,
    pos: u64,
}

impl BlockIo {
    pub fn new(cache: SharedCache, base: u64, len: u64) -> Self {
        BlockIo {
            cache,
            base,
            len,
            pos: 0,
        }
    }
}

impl io::Read for BlockIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len {
            return Ok(0);
        }
        let take = buf.len().min((self.len - self.pos) as usize);
        self.cache
            .lock()
            .unwrap()
            .pread(&mut buf[..take], self.base + self.pos)
            .map_err(io::Error::other)?;
        self.pos += take as u64;
        Ok(take)
    }
}

impl io::Write for BlockIo {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.pos >= self.len {
            return Ok(0);
        }
        let take = buf.len().min((self.len - self.pos) as usize);
        self.cache
            .lock()
            .unwrap()
            .pwrite(&buf[..take], self.base + self.pos, false)
            .map_err(io::Error::other)?;
        self.pos += take as u64;
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        // Write-back happens when the driver flushes the cache.
        Ok(())
    }
}

impl io::Seek for BlockIo {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            io::SeekFrom::Start(offset) => offset as i64,
            io::SeekFrom::End(offset) => self.len as i64 + offset,
            io::SeekFrom::Current(offset) => self.pos as i64 + offset,
        };
        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to negative position",
            ));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }
}
