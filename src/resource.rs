//! Single-pass reader over a resource's data bytes.
//!
//! The archive stores only the data runs of a sparse resource; the stream
//! reattaches destination offsets by walking the sparse map. Chunks come
//! back in ascending offset order and never overlap. An empty read is the
//! sole end-of-stream signal.

use std::io::Read;

use crate::error::{FwForgeError, Result};
use crate::sparse::SparseMap;

/// Upper bound on bytes buffered per chunk; resources are never held in
/// memory whole.
pub const STREAM_CHUNK_SIZE: usize = 256 * 1024;

pub struct ResourceStream<'a> {
    source: &'a mut dyn Read,
    /// `(dest_offset, len)` for each data run.
    runs: Vec<(u64, u64)>,
    run_index: usize,
    run_pos: u64,
    yielded: u64,
    chunk: Vec<u8>,
}

impl<'a> ResourceStream<'a> {
    pub fn new(source: &'a mut dyn Read, map: &SparseMap) -> Self {
        ResourceStream {
            source,
            runs: map.data_runs().collect(),
            run_index: 0,
            run_pos: 0,
            yielded: 0,
            chunk: vec![0u8; STREAM_CHUNK_SIZE],
        }
    }

    /// Next `(dest_offset, data)` chunk, or `None` at end of stream.
    pub fn read(&mut self) -> Result<Option<(u64, &[u8])>> {
        loop {
            let (run_offset, run_len) = match self.runs.get(self.run_index) {
                Some(&run) => run,
                None => return Ok(None),
            };
            if self.run_pos == run_len {
                self.run_index += 1;
                self.run_pos = 0;
                continue;
            }

            let want = STREAM_CHUNK_SIZE.min((run_len - self.run_pos) as usize);
            let mut filled = 0usize;
            while filled < want {
                let n = self.source.read(&mut self.chunk[filled..want])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled < want {
                return Err(FwForgeError::resource(format!(
                    "resource stream ended early: needed {want} more bytes at data offset {}",
                    self.yielded + filled as u64
                )));
            }

            let offset = run_offset + self.run_pos;
            self.run_pos += filled as u64;
            self.yielded += filled as u64;
            return Ok(Some((offset, &self.chunk[..filled])));
        }
    }

    /// Total data bytes handed out so far.
    pub fn bytes_yielded(&self) -> u64 {
        self.yielded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn collect(stream: &mut ResourceStream) -> Vec<(u64, Vec<u8>)> {
        let mut out = Vec::new();
        while let Some((offset, buf)) = stream.read().unwrap() {
            out.push((offset, buf.to_vec()));
        }
        out
    }

    #[test]
    fn test_dense_stream() {
        let data = vec![7u8; 1000];
        let mut source = Cursor::new(data.clone());
        let map = SparseMap::dense(1000);
        let mut stream = ResourceStream::new(&mut source, &map);

        let chunks = collect(&mut stream);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], (0, data));
        assert_eq!(stream.bytes_yielded(), 1000);

        // EOF is sticky.
        assert!(stream.read().unwrap().is_none());
    }

    #[test]
    fn test_offsets_skip_holes() {
        let mut source = Cursor::new([vec![1u8; 512], vec![2u8; 256]].concat());
        let map = SparseMap::from_runs(&[512, 4096, 256]).unwrap();
        let mut stream = ResourceStream::new(&mut source, &map);

        let chunks = collect(&mut stream);
        assert_eq!(chunks[0].0, 0);
        assert_eq!(chunks[0].1, vec![1u8; 512]);
        assert_eq!(chunks[1].0, 4608);
        assert_eq!(chunks[1].1, vec![2u8; 256]);
        assert_eq!(stream.bytes_yielded(), 768);
    }

    #[test]
    fn test_large_run_split_into_chunks() {
        let total = STREAM_CHUNK_SIZE + 100;
        let mut source = Cursor::new(vec![9u8; total]);
        let map = SparseMap::dense(total as u64);
        let mut stream = ResourceStream::new(&mut source, &map);

        let chunks = collect(&mut stream);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].1.len(), STREAM_CHUNK_SIZE);
        assert_eq!(chunks[1].0, STREAM_CHUNK_SIZE as u64);
        assert_eq!(chunks[1].1.len(), 100);
    }

    #[test]
    fn test_underrun_is_an_error() {
        let mut source = Cursor::new(vec![0u8; 100]);
        let map = SparseMap::dense(500);
        let mut stream = ResourceStream::new(&mut source, &map);

        let err = stream.read().unwrap_err();
        assert!(err.to_string().contains("ended early"));
    }

    #[test]
    fn test_zero_length_resource() {
        let mut source = Cursor::new(Vec::new());
        let map = SparseMap::dense(0);
        let mut stream = ResourceStream::new(&mut source, &map);
        assert!(stream.read().unwrap().is_none());
    }
}
