//! Output sink abstraction: a pread/pwrite-addressable block device or
//! regular file.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::Path;

/// The interfaces the block cache needs from the output.
///
/// Reads past end-of-data yield zeros for regular files (the unwritten tail
/// of a growing image); block devices never read past their fixed size.
pub trait OutputSink: Send {
    fn pread(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()>;
    fn pwrite(&mut self, buf: &[u8], offset: u64) -> io::Result<()>;
    /// Best-effort discard of a byte range. No-op when unsupported.
    fn trim(&mut self, offset: u64, len: u64) -> io::Result<()>;
    fn len(&self) -> u64;
    fn sync(&mut self) -> io::Result<()>;
}

/// A regular file or block device opened for random-access writes.
pub struct FileSink {
    file: File,
    size: u64,
    is_block_device: bool,
}

impl FileSink {
    /// Open `path` read-write, creating it when it is a regular file path.
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let metadata = file.metadata()?;
        let is_block_device = is_block_device(&metadata);
        // Regular file length comes from metadata; a block device reports
        // zero there, so ask the kernel via a seek to the end.
        let size = if is_block_device {
            file.seek(SeekFrom::End(0))?
        } else {
            metadata.len()
        };

        Ok(FileSink {
            file,
            size,
            is_block_device,
        })
    }
}

#[cfg(unix)]
fn is_block_device(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    metadata.file_type().is_block_device()
}

#[cfg(not(unix))]
fn is_block_device(_metadata: &std::fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn pread_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(unix)]
fn pwrite_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn pread_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(windows)]
fn pwrite_at(file: &File, buf: &[u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_write(buf, offset)
}

impl OutputSink for FileSink {
    fn pread(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = pread_at(&self.file, &mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                if self.is_block_device {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("short read at offset {}", offset + filled as u64),
                    ));
                }
                // Unwritten tail of a regular file reads as zeros.
                buf[filled..].fill(0);
                break;
            }
            filled += n;
        }
        Ok(())
    }

    fn pwrite(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        if self.is_block_device && offset + buf.len() as u64 > self.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "write of {} bytes at offset {offset} runs past end of device ({} bytes)",
                    buf.len(),
                    self.size
                ),
            ));
        }
        let mut written = 0;
        while written < buf.len() {
            let n = pwrite_at(&self.file, &buf[written..], offset + written as u64)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short write at offset {}", offset + written as u64),
                ));
            }
            written += n;
        }
        if !self.is_block_device {
            self.size = self.size.max(offset + buf.len() as u64);
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn trim(&mut self, offset: u64, len: u64) -> io::Result<()> {
        if !self.is_block_device {
            return Ok(());
        }
        use std::os::unix::io::AsRawFd;
        // BLKDISCARD = _IO(0x12, 119)
        const BLKDISCARD: libc::c_ulong = 0x1277;
        let range: [u64; 2] = [offset, len];
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), BLKDISCARD, range.as_ptr()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // Devices without discard support are fine to skip.
            if err.raw_os_error() == Some(libc::EOPNOTSUPP) {
                log::debug!("discard not supported by device, skipping");
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn trim(&mut self, _offset: u64, _len: u64) -> io::Result<()> {
        Ok(())
    }

    fn len(&self) -> u64 {
        self.size
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}

/// In-memory sink used by unit tests. The trim log is shared so tests can
/// observe discards after the sink is boxed into a cache.
#[cfg(test)]
pub struct MemSink {
    pub data: Vec<u8>,
    pub trims: std::sync::Arc<std::sync::Mutex<Vec<(u64, u64)>>>,
}

#[cfg(test)]
impl MemSink {
    pub fn new() -> Self {
        MemSink {
            data: Vec::new(),
            trims: Default::default(),
        }
    }

    pub fn trim_log(&self) -> std::sync::Arc<std::sync::Mutex<Vec<(u64, u64)>>> {
        std::sync::Arc::clone(&self.trims)
    }
}

#[cfg(test)]
impl OutputSink for MemSink {
    fn pread(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let offset = offset as usize;
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.data.get(offset + i).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn pwrite(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        let end = offset as usize + buf.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn trim(&mut self, offset: u64, len: u64) -> io::Result<()> {
        self.trims.lock().unwrap().push((offset, len));
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}
