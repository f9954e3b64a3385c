//! Block-layer state: the output sink, the write-back cache that coalesces
//! all device I/O, and the pad-to-block adapter used by resource streams.

pub mod cache;
pub mod device;
pub mod pad_writer;

pub use cache::{BlockCache, BlockIo, SharedCache};
pub use device::{FileSink, OutputSink};
pub use pad_writer::PadToBlockWriter;

/// Unit of addressing on the output device.
pub const BLOCK_SIZE: usize = 512;
