//! FAT volume adapter.
//!
//! All addresses are "block offset within the output device"; the FAT
//! library sees a block device window (`BlockIo`), not a file handle, so
//! every filesystem write flows through the block cache. Volumes open
//! lazily on first touch and stay cached until a different block offset is
//! touched or the context tears down.

pub mod dirent;

use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{ByteOrder, LittleEndian};
use fatfs::{FileSystem, FormatVolumeOptions, FsOptions};

use crate::block::{BlockIo, SharedCache, BLOCK_SIZE};
use crate::error::{FwForgeError, Result};

const COPY_CHUNK: usize = 64 * 1024;

fn io_ctx(what: String, e: io::Error) -> FwForgeError {
    FwForgeError::Io(io::Error::new(e.kind(), format!("{what}: {e}")))
}

/// Funlists spell paths with a leading slash; the FAT library wants them
/// relative to the root directory.
fn norm(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// Byte length of the volume starting at `base`, from its boot sector.
fn volume_len(cache: &SharedCache, base: u64) -> Result<u64> {
    let mut bpb = [0u8; 512];
    cache.lock().unwrap().pread(&mut bpb, base)?;

    let bytes_per_sector = LittleEndian::read_u16(&bpb[11..13]) as u64;
    if bytes_per_sector == 0 {
        return Err(FwForgeError::format(format!(
            "no FAT filesystem at block offset {}",
            base / BLOCK_SIZE as u64
        )));
    }
    let total_16 = LittleEndian::read_u16(&bpb[19..21]) as u64;
    let total_32 = LittleEndian::read_u32(&bpb[32..36]) as u64;
    let total_sectors = if total_16 != 0 { total_16 } else { total_32 };
    Ok(total_sectors * bytes_per_sector)
}

struct OpenVolume {
    block_offset: u64,
    fs: FileSystem<BlockIo>,
}

/// Lazily opened FAT volume, cached between actions that share a block
/// offset during a single run.
#[derive(Default)]
pub struct FatCache {
    open: Option<OpenVolume>,
}

impl FatCache {
    pub fn new() -> Self {
        FatCache::default()
    }

    /// Flush and drop the open volume, if any.
    pub fn close(&mut self) -> Result<()> {
        if let Some(volume) = self.open.take() {
            volume
                .fs
                .unmount()
                .map_err(|e| io_ctx("cannot flush FAT volume".to_string(), e))?;
        }
        Ok(())
    }

    fn with_fs<T>(
        &mut self,
        cache: &SharedCache,
        block_offset: u64,
        f: impl FnOnce(&FileSystem<BlockIo>) -> Result<T>,
    ) -> Result<T> {
        let stale = matches!(&self.open, Some(volume) if volume.block_offset != block_offset);
        if stale {
            self.close()?;
        }
        if self.open.is_none() {
            let base = block_offset * BLOCK_SIZE as u64;
            let len = volume_len(cache, base)?;
            let io = BlockIo::new(cache.clone(), base, len);
            let fs = FileSystem::new(io, FsOptions::new()).map_err(|e| {
                io_ctx(format!("cannot open FAT at block offset {block_offset}"), e)
            })?;
            self.open = Some(OpenVolume { block_offset, fs });
        }
        f(&self.open.as_ref().unwrap().fs)
    }
}

/// Format a FAT filesystem covering `block_count` blocks at `block_offset`.
pub fn mkfs(
    fat: &mut FatCache,
    cache: &SharedCache,
    block_offset: u64,
    block_count: u64,
) -> Result<()> {
    fat.close()?;
    let base = block_offset * BLOCK_SIZE as u64;
    let len = block_count * BLOCK_SIZE as u64;
    let mut io = BlockIo::new(cache.clone(), base, len);
    let options = FormatVolumeOptions::new()
        .bytes_per_sector(BLOCK_SIZE as u16)
        .total_sectors(block_count as u32);
    fatfs::format_volume(&mut io, options).map_err(|e| {
        io_ctx(
            format!("cannot format FAT at block offset {block_offset}"),
            e,
        )
    })
}

/// Write `buf` into `path` at `file_offset`, creating the file on demand
/// and zero-filling any gap when the write starts past the current end.
pub fn pwrite(
    fat: &mut FatCache,
    cache: &SharedCache,
    block_offset: u64,
    path: &str,
    file_offset: u64,
    buf: &[u8],
) -> Result<()> {
    let path = norm(path);
    fat.with_fs(cache, block_offset, |fs| {
        let mut file = fs
            .root_dir()
            .create_file(path)
            .map_err(|e| io_ctx(format!("cannot open FAT file '{path}'"), e))?;

        let size = file
            .seek(SeekFrom::End(0))
            .map_err(|e| io_ctx(format!("cannot seek FAT file '{path}'"), e))?;
        if file_offset > size {
            let zeros = [0u8; 4096];
            let mut gap = file_offset - size;
            while gap > 0 {
                let n = (gap as usize).min(zeros.len());
                file.write_all(&zeros[..n])
                    .map_err(|e| io_ctx(format!("cannot grow FAT file '{path}'"), e))?;
                gap -= n as u64;
            }
        } else {
            file.seek(SeekFrom::Start(file_offset))
                .map_err(|e| io_ctx(format!("cannot seek FAT file '{path}'"), e))?;
        }

        file.write_all(buf)
            .map_err(|e| io_ctx(format!("cannot write FAT file '{path}'"), e))?;
        file.flush()
            .map_err(|e| io_ctx(format!("cannot write FAT file '{path}'"), e))
    })
}

/// Grow `path` with zeros out to `len` bytes (used for trailing holes).
pub fn grow(
    fat: &mut FatCache,
    cache: &SharedCache,
    block_offset: u64,
    path: &str,
    len: u64,
) -> Result<()> {
    pwrite(fat, cache, block_offset, path, len, &[])
}

/// Rename `old` to `new`. The force variant overwrites an existing
/// destination; the plain variant fails on one.
pub fn mv(
    fat: &mut FatCache,
    cache: &SharedCache,
    block_offset: u64,
    action: &str,
    old: &str,
    new: &str,
    force: bool,
) -> Result<()> {
    let old = norm(old);
    let new = norm(new);
    fat.with_fs(cache, block_offset, |fs| {
        let root = fs.root_dir();
        if force {
            match root.remove(new) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_ctx(format!("{action} cannot replace '{new}'"), e)),
            }
        }
        root.rename(old, &root, new)
            .map_err(|e| io_ctx(format!("{action} cannot rename '{old}' to '{new}'"), e))
    })
}

/// Delete `path`. The plain variant tolerates a missing file; the force
/// variant requires it to exist.
pub fn rm(
    fat: &mut FatCache,
    cache: &SharedCache,
    block_offset: u64,
    action: &str,
    path: &str,
    must_exist: bool,
) -> Result<()> {
    let path = norm(path);
    fat.with_fs(cache, block_offset, |fs| {
        match fs.root_dir().remove(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound && !must_exist => Ok(()),
            Err(e) => Err(io_ctx(format!("{action} cannot remove '{path}'"), e)),
        }
    })
}

pub fn cp(
    fat: &mut FatCache,
    cache: &SharedCache,
    block_offset: u64,
    from: &str,
    to: &str,
) -> Result<()> {
    let from = norm(from);
    let to = norm(to);
    fat.with_fs(cache, block_offset, |fs| {
        let root = fs.root_dir();
        let mut src = root
            .open_file(from)
            .map_err(|e| io_ctx(format!("fat_cp cannot open '{from}'"), e))?;
        let mut dst = root
            .create_file(to)
            .map_err(|e| io_ctx(format!("fat_cp cannot create '{to}'"), e))?;
        dst.truncate()
            .map_err(|e| io_ctx(format!("fat_cp cannot truncate '{to}'"), e))?;

        let mut buf = vec![0u8; COPY_CHUNK];
        loop {
            let n = src
                .read(&mut buf)
                .map_err(|e| io_ctx(format!("fat_cp cannot read '{from}'"), e))?;
            if n == 0 {
                break;
            }
            dst.write_all(&buf[..n])
                .map_err(|e| io_ctx(format!("fat_cp cannot write '{to}'"), e))?;
        }
        dst.flush()
            .map_err(|e| io_ctx(format!("fat_cp cannot write '{to}'"), e))
    })
}

pub fn mkdir(fat: &mut FatCache, cache: &SharedCache, block_offset: u64, path: &str) -> Result<()> {
    let path = norm(path);
    fat.with_fs(cache, block_offset, |fs| {
        fs.root_dir()
            .create_dir(path)
            .map(|_| ())
            .map_err(|e| io_ctx(format!("fat_mkdir cannot create '{path}'"), e))
    })
}

/// Create `path` as an empty file when absent; leave it alone otherwise.
pub fn touch(fat: &mut FatCache, cache: &SharedCache, block_offset: u64, path: &str) -> Result<()> {
    let path = norm(path);
    fat.with_fs(cache, block_offset, |fs| {
        let root = fs.root_dir();
        match root.open_file(path) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => root
                .create_file(path)
                .map(|_| ())
                .map_err(|e| io_ctx(format!("fat_touch cannot create '{path}'"), e)),
            Err(e) => Err(io_ctx(format!("fat_touch cannot open '{path}'"), e)),
        }
    })
}

/// Whether `path` names an existing file or directory.
pub fn exists(
    fat: &mut FatCache,
    cache: &SharedCache,
    block_offset: u64,
    path: &str,
) -> Result<bool> {
    let path = norm(path);
    fat.with_fs(cache, block_offset, |fs| {
        let root = fs.root_dir();
        Ok(root.open_file(path).is_ok() || root.open_dir(path).is_ok())
    })
}

/// Set S/H/R attributes on `path` by rewriting its directory entry.
pub fn attrib(
    fat: &mut FatCache,
    cache: &SharedCache,
    block_offset: u64,
    path: &str,
    attributes: &str,
) -> Result<()> {
    // Flush library state first; the entry is patched underneath it.
    fat.close()?;
    dirent::set_attributes(cache, block_offset * BLOCK_SIZE as u64, path, attributes)
}

/// Set the volume label in the boot sector and the root directory.
pub fn setlabel(
    fat: &mut FatCache,
    cache: &SharedCache,
    block_offset: u64,
    label: &str,
) -> Result<()> {
    fat.close()?;
    dirent::set_label(cache, block_offset * BLOCK_SIZE as u64, label)
}
