//! FAT filesystem actions.

use super::sink::ResourceSink;
use super::{arg_uint, check_argc, check_file_context, resource_progress, FunContext};
use crate::block::SharedCache;
use crate::error::Result;
use crate::fat::{self, dirent, FatCache};
use crate::sparse::SparseMap;

/// Streams a resource into a file on a FAT volume.
struct FatFileSink<'a> {
    fat: &'a mut FatCache,
    cache: &'a SharedCache,
    block_offset: u64,
    path: &'a str,
}

impl ResourceSink for FatFileSink<'_> {
    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        fat::pwrite(self.fat, self.cache, self.block_offset, self.path, offset, buf)
    }

    fn fill_ending_hole(&mut self, map: &SparseMap) -> Result<()> {
        if map.ending_hole() > 0 {
            // Trailing holes grow the file; FAT has no sparse representation.
            fat::grow(self.fat, self.cache, self.block_offset, self.path, map.total_size())?;
        }
        Ok(())
    }
}

pub(super) fn fat_mkfs_validate(fctx: &mut FunContext) -> Result<()> {
    check_argc(fctx, 3, "fat_mkfs requires a block offset and block count")?;
    arg_uint(
        fctx.arg(1),
        "fat_mkfs requires a non-negative integer block offset",
    )?;
    arg_uint(
        fctx.arg(2),
        "fat_mkfs requires a non-negative integer block count",
    )?;
    Ok(())
}

pub(super) fn fat_mkfs_compute_progress(fctx: &mut FunContext) -> Result<()> {
    fctx.progress.total_units += 1;
    Ok(())
}

pub(super) fn fat_mkfs_run(fctx: &mut FunContext) -> Result<()> {
    let block_offset = arg_uint(fctx.arg(1), "bad block offset")?;
    let block_count = arg_uint(fctx.arg(2), "bad block count")?;
    let cache = fctx.output()?.clone();

    fat::mkfs(fctx.fat, &cache, block_offset, block_count)?;
    fctx.progress.report(1);
    Ok(())
}

pub(super) fn fat_attrib_validate(fctx: &mut FunContext) -> Result<()> {
    check_argc(
        fctx,
        4,
        "fat_attrib requires a block offset, filename, and attributes (SHR)",
    )?;
    arg_uint(
        fctx.arg(1),
        "fat_attrib requires a non-negative integer block offset",
    )?;
    dirent::parse_attributes(fctx.arg(3))?;
    Ok(())
}

pub(super) fn fat_attrib_compute_progress(fctx: &mut FunContext) -> Result<()> {
    fctx.progress.total_units += 1;
    Ok(())
}

pub(super) fn fat_attrib_run(fctx: &mut FunContext) -> Result<()> {
    let block_offset = arg_uint(fctx.arg(1), "bad block offset")?;
    let path = fctx.arg(2).to_string();
    let attributes = fctx.arg(3).to_string();
    let cache = fctx.output()?.clone();

    fat::attrib(fctx.fat, &cache, block_offset, &path, &attributes)?;
    fctx.progress.report(1);
    Ok(())
}

pub(super) fn fat_write_validate(fctx: &mut FunContext) -> Result<()> {
    check_file_context(fctx, "fat_write")?;
    check_argc(fctx, 3, "fat_write requires a block offset and destination filename")?;
    arg_uint(
        fctx.arg(1),
        "fat_write requires a non-negative integer block offset",
    )?;
    Ok(())
}

pub(super) fn fat_write_compute_progress(fctx: &mut FunContext) -> Result<()> {
    // Zero-length files still do something.
    resource_progress(fctx, true)
}

pub(super) fn fat_write_run(fctx: &mut FunContext) -> Result<()> {
    let title = fctx.event()?.title.clone();
    let resource = fctx.resource()?;
    let expected_hash = resource.expected_hash()?.to_string();
    let map = resource.sparse_map()?;

    let block_offset = arg_uint(fctx.arg(1), "bad block offset")?;
    let path = fctx.arg(2).to_string();
    let cache = fctx.output()?.clone();

    // Truncation semantics: any existing file is replaced wholesale.
    fat::rm(fctx.fat, &cache, block_offset, "fat_write", &path, false)?;

    if map.total_size() == 0 {
        fat::touch(fctx.fat, &cache, block_offset, &path)?;
        fctx.progress.report(1);
        return Ok(());
    }

    let (stream, progress, fat_cache) = fctx.split_streaming()?;
    let mut sink = FatFileSink {
        fat: fat_cache,
        cache: &cache,
        block_offset,
        path: &path,
    };
    super::pump(
        "fat_write",
        &title,
        &expected_hash,
        &map,
        stream,
        progress,
        &mut sink,
    )
}

pub(super) fn fat_mv_validate(fctx: &mut FunContext) -> Result<()> {
    check_argc(fctx, 4, "fat_mv requires a block offset, old filename, new filename")?;
    arg_uint(
        fctx.arg(1),
        "fat_mv requires a non-negative integer block offset",
    )?;
    Ok(())
}

pub(super) fn fat_mv_compute_progress(fctx: &mut FunContext) -> Result<()> {
    fctx.progress.total_units += 1;
    Ok(())
}

pub(super) fn fat_mv_run(fctx: &mut FunContext) -> Result<()> {
    let action = fctx.arg(0).to_string();
    let block_offset = arg_uint(fctx.arg(1), "bad block offset")?;
    let old = fctx.arg(2).to_string();
    let new = fctx.arg(3).to_string();
    let cache = fctx.output()?.clone();

    // The `!` variant forces an overwrite of the destination.
    let force = action.ends_with('!');
    fat::mv(fctx.fat, &cache, block_offset, &action, &old, &new, force)?;
    fctx.progress.report(1);
    Ok(())
}

pub(super) fn fat_rm_validate(fctx: &mut FunContext) -> Result<()> {
    check_argc(fctx, 3, "fat_rm requires a block offset and filename")?;
    arg_uint(
        fctx.arg(1),
        "fat_rm requires a non-negative integer block offset",
    )?;
    Ok(())
}

pub(super) fn fat_rm_compute_progress(fctx: &mut FunContext) -> Result<()> {
    fctx.progress.total_units += 1;
    Ok(())
}

pub(super) fn fat_rm_run(fctx: &mut FunContext) -> Result<()> {
    let action = fctx.arg(0).to_string();
    let block_offset = arg_uint(fctx.arg(1), "bad block offset")?;
    let path = fctx.arg(2).to_string();
    let cache = fctx.output()?.clone();

    // The `!` variant requires the file to exist.
    let must_exist = action.ends_with('!');
    fat::rm(fctx.fat, &cache, block_offset, &action, &path, must_exist)?;
    fctx.progress.report(1);
    Ok(())
}

pub(super) fn fat_cp_validate(fctx: &mut FunContext) -> Result<()> {
    check_argc(
        fctx,
        4,
        "fat_cp requires a block offset, from filename, and to filename",
    )?;
    arg_uint(
        fctx.arg(1),
        "fat_cp requires a non-negative integer block offset",
    )?;
    Ok(())
}

pub(super) fn fat_cp_compute_progress(fctx: &mut FunContext) -> Result<()> {
    fctx.progress.total_units += 1;
    Ok(())
}

pub(super) fn fat_cp_run(fctx: &mut FunContext) -> Result<()> {
    let block_offset = arg_uint(fctx.arg(1), "bad block offset")?;
    let from = fctx.arg(2).to_string();
    let to = fctx.arg(3).to_string();
    let cache = fctx.output()?.clone();

    fat::cp(fctx.fat, &cache, block_offset, &from, &to)?;
    fctx.progress.report(1);
    Ok(())
}

pub(super) fn fat_mkdir_validate(fctx: &mut FunContext) -> Result<()> {
    check_argc(fctx, 3, "fat_mkdir requires a block offset and directory name")?;
    arg_uint(
        fctx.arg(1),
        "fat_mkdir requires a non-negative integer block offset",
    )?;
    Ok(())
}

pub(super) fn fat_mkdir_compute_progress(fctx: &mut FunContext) -> Result<()> {
    fctx.progress.total_units += 1;
    Ok(())
}

pub(super) fn fat_mkdir_run(fctx: &mut FunContext) -> Result<()> {
    let block_offset = arg_uint(fctx.arg(1), "bad block offset")?;
    let path = fctx.arg(2).to_string();
    let cache = fctx.output()?.clone();

    fat::mkdir(fctx.fat, &cache, block_offset, &path)?;
    fctx.progress.report(1);
    Ok(())
}

pub(super) fn fat_setlabel_validate(fctx: &mut FunContext) -> Result<()> {
    check_argc(fctx, 3, "fat_setlabel requires a block offset and name")?;
    arg_uint(
        fctx.arg(1),
        "fat_setlabel requires a non-negative integer block offset",
    )?;
    Ok(())
}

pub(super) fn fat_setlabel_compute_progress(fctx: &mut FunContext) -> Result<()> {
    fctx.progress.total_units += 1;
    Ok(())
}

pub(super) fn fat_setlabel_run(fctx: &mut FunContext) -> Result<()> {
    let block_offset = arg_uint(fctx.arg(1), "bad block offset")?;
    let label = fctx.arg(2).to_string();
    let cache = fctx.output()?.clone();

    fat::setlabel(fctx.fat, &cache, block_offset, &label)?;
    fctx.progress.report(1);
    Ok(())
}

pub(super) fn fat_touch_validate(fctx: &mut FunContext) -> Result<()> {
    check_argc(fctx, 3, "fat_touch requires a block offset and filename")?;
    arg_uint(
        fctx.arg(1),
        "fat_touch requires a non-negative integer block offset",
    )?;
    Ok(())
}

pub(super) fn fat_touch_compute_progress(fctx: &mut FunContext) -> Result<()> {
    fctx.progress.total_units += 1;
    Ok(())
}

pub(super) fn fat_touch_run(fctx: &mut FunContext) -> Result<()> {
    let block_offset = arg_uint(fctx.arg(1), "bad block offset")?;
    let path = fctx.arg(2).to_string();
    let cache = fctx.output()?.clone();

    fat::touch(fctx.fat, &cache, block_offset, &path)?;
    fctx.progress.report(1);
    Ok(())
}
