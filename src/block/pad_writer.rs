//! Adapter that buffers resource-stream writes into block-aligned units.
//!
//! Resource streams deliver arbitrarily sized chunks at arbitrary offsets;
//! the cache performs best when bulk data arrives as whole blocks. This
//! adapter holds at most one partial block, emitting full blocks as soon as
//! they complete and zero-padding the remainder on flush.

use super::cache::SharedCache;
use super::BLOCK_SIZE;
use crate::error::Result;

pub struct PadToBlockWriter {
    cache: SharedCache,
    /// Pending bytes of a partial block, starting at `buffer_offset`.
    buffer: Vec<u8>,
    buffer_offset: u64,
}

impl PadToBlockWriter {
    pub fn new(cache: SharedCache) -> Self {
        PadToBlockWriter {
            cache,
            buffer: Vec::with_capacity(BLOCK_SIZE),
            buffer_offset: 0,
        }
    }

    /// Write `buf` at the absolute byte `offset`.
    ///
    /// Sequential writes accumulate; a discontinuity (a sparse hole in the
    /// stream) flushes the pending partial block first, since holes are
    /// zeros anyway.
    pub fn pwrite(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        let mut buf = buf;
        let mut offset = offset;

        if !self.buffer.is_empty() && offset != self.buffer_offset + self.buffer.len() as u64 {
            self.flush()?;
        }

        if self.buffer.is_empty() {
            // Writes starting mid-block go straight through the cache, which
            // read-modify-writes the surrounding bytes.
            let misalign = (offset % BLOCK_SIZE as u64) as usize;
            if misalign != 0 {
                let head = (BLOCK_SIZE - misalign).min(buf.len());
                self.cache
                    .lock()
                    .unwrap()
                    .pwrite(&buf[..head], offset, true)?;
                offset += head as u64;
                buf = &buf[head..];
                if buf.is_empty() {
                    return Ok(());
                }
            }
            self.buffer_offset = offset;
        }

        self.buffer.extend_from_slice(buf);

        let full = self.buffer.len() / BLOCK_SIZE * BLOCK_SIZE;
        if full > 0 {
            self.cache
                .lock()
                .unwrap()
                .pwrite(&self.buffer[..full], self.buffer_offset, true)?;
            self.buffer.drain(..full);
            self.buffer_offset += full as u64;
        }
        Ok(())
    }

    /// Write out any remaining partial block, zero-padded to a full block.
    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.buffer.resize(BLOCK_SIZE, 0);
        self.cache
            .lock()
            .unwrap()
            .pwrite(&self.buffer, self.buffer_offset, true)?;
        self.buffer.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::cache::BlockCache;
    use crate::block::device::MemSink;
    use std::sync::Arc;

    fn cache_pair() -> SharedCache {
        BlockCache::shared(Box::new(MemSink::new()), 64)
    }

    fn read_back(cache: &SharedCache, offset: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        cache.lock().unwrap().pread(&mut buf, offset).unwrap();
        buf
    }

    #[test]
    fn test_small_writes_coalesce_into_blocks() {
        let cache = cache_pair();
        let mut w = PadToBlockWriter::new(Arc::clone(&cache));

        for i in 0..8u8 {
            w.pwrite(&[i; 100], i as u64 * 100).unwrap();
        }
        w.flush().unwrap();
        cache.lock().unwrap().flush().unwrap();

        let expected: Vec<u8> = (0..8u8).flat_map(|i| vec![i; 100]).collect();
        assert_eq!(read_back(&cache, 0, 800), expected);
    }

    #[test]
    fn test_flush_pads_partial_block_with_zeros() {
        let cache = cache_pair();
        let mut w = PadToBlockWriter::new(Arc::clone(&cache));

        w.pwrite(&[0xEE; 10], 0).unwrap();
        w.flush().unwrap();

        let block = read_back(&cache, 0, BLOCK_SIZE);
        assert_eq!(&block[..10], &[0xEE; 10][..]);
        assert_eq!(&block[10..], &[0u8; BLOCK_SIZE - 10][..]);
    }

    #[test]
    fn test_discontinuity_flushes_pending() {
        let cache = cache_pair();
        let mut w = PadToBlockWriter::new(Arc::clone(&cache));

        w.pwrite(&[0x11; 100], 0).unwrap();
        // Jump over a hole; pending partial block lands zero-padded.
        w.pwrite(&[0x22; 512], 4096).unwrap();
        w.flush().unwrap();

        assert_eq!(&read_back(&cache, 0, 100), &vec![0x11; 100]);
        assert_eq!(&read_back(&cache, 100, 412), &vec![0u8; 412]);
        assert_eq!(&read_back(&cache, 4096, 512), &vec![0x22; 512]);
    }

    #[test]
    fn test_unaligned_start_preserves_neighbors() {
        let cache = cache_pair();
        cache
            .lock()
            .unwrap()
            .pwrite(&[0x77; BLOCK_SIZE], 0, false)
            .unwrap();

        let mut w = PadToBlockWriter::new(Arc::clone(&cache));
        w.pwrite(&[0x88; 16], 256).unwrap();
        w.flush().unwrap();

        let block = read_back(&cache, 0, BLOCK_SIZE);
        assert_eq!(&block[..256], &[0x77; 256][..]);
        assert_eq!(&block[256..272], &[0x88; 16][..]);
        assert_eq!(&block[272..], &[0x77; BLOCK_SIZE - 272][..]);
    }

    #[test]
    fn test_large_write_passes_through() {
        let cache = cache_pair();
        let mut w = PadToBlockWriter::new(Arc::clone(&cache));

        let data: Vec<u8> = (0..2000u32).map(|i| (i % 199) as u8).collect();
        w.pwrite(&data, 512).unwrap();
        w.flush().unwrap();

        assert_eq!(read_back(&cache, 512, 2000), data);
    }
}
