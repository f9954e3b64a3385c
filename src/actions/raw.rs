//! Raw block-level actions: `raw_write`, `raw_memset`, `mbr_write`, `trim`.

use super::sink::ResourceSink;
use super::{
    arg_uint, arg_uint_max, check_argc, check_file_context, resource_progress, FunContext,
    MAX_BLOCK_COUNT,
};
use crate::block::{PadToBlockWriter, SharedCache, BLOCK_SIZE};
use crate::error::{FwForgeError, Result};
use crate::mbr;
use crate::sparse::SparseMap;

/// Pad-to-block destination at a fixed block offset on the output device.
struct RawSink {
    writer: PadToBlockWriter,
    dest_offset: u64,
}

impl RawSink {
    fn new(cache: SharedCache, dest_offset: u64) -> Self {
        RawSink {
            writer: PadToBlockWriter::new(cache),
            dest_offset,
        }
    }
}

impl ResourceSink for RawSink {
    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.writer.pwrite(buf, self.dest_offset + offset)
    }

    fn fill_ending_hole(&mut self, map: &SparseMap) -> Result<()> {
        let ending_hole = map.ending_hole();
        if ending_hole > 0 {
            // A regular-file sink cannot be extended by seeking alone, so a
            // zero block within the hole forces the correct length.
            let zeros = [0u8; BLOCK_SIZE];
            let to_write = (BLOCK_SIZE as u64).min(ending_hole);
            let offset = map.total_size() - to_write;
            self.writer
                .pwrite(&zeros[..to_write as usize], self.dest_offset + offset)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush()
    }
}

pub(super) fn raw_write_validate(fctx: &mut FunContext) -> Result<()> {
    check_file_context(fctx, "raw_write")?;
    check_argc(fctx, 2, "raw_write requires a block offset")?;
    arg_uint(
        fctx.arg(1),
        "raw_write requires a non-negative integer block offset",
    )?;
    Ok(())
}

pub(super) fn raw_write_compute_progress(fctx: &mut FunContext) -> Result<()> {
    resource_progress(fctx, false)
}

pub(super) fn raw_write_run(fctx: &mut FunContext) -> Result<()> {
    let title = fctx.event()?.title.clone();
    let resource = fctx.resource()?;
    let expected_hash = resource.expected_hash()?.to_string();
    let map = resource.sparse_map()?;

    let dest_offset = arg_uint(
        fctx.arg(1),
        "raw_write requires a non-negative integer block offset",
    )? * BLOCK_SIZE as u64;
    let cache = fctx.output()?.clone();

    let mut sink = RawSink::new(cache, dest_offset);
    let (stream, progress, _) = fctx.split_streaming()?;
    super::pump(
        "raw_write",
        &title,
        &expected_hash,
        &map,
        stream,
        progress,
        &mut sink,
    )
}

pub(super) fn raw_memset_validate(fctx: &mut FunContext) -> Result<()> {
    check_argc(fctx, 4, "raw_memset requires a block offset, count, and value")?;
    arg_uint(
        fctx.arg(1),
        "raw_memset requires a non-negative integer block offset",
    )?;
    arg_uint_max(
        fctx.arg(2),
        MAX_BLOCK_COUNT,
        "raw_memset requires a non-negative integer block count",
    )?;
    arg_uint_max(
        fctx.arg(3),
        255,
        "raw_memset requires value to be between 0 and 255",
    )?;
    Ok(())
}

pub(super) fn raw_memset_compute_progress(fctx: &mut FunContext) -> Result<()> {
    let count = arg_uint(fctx.arg(2), "raw_memset requires a block count")?;
    fctx.progress.total_units += count * BLOCK_SIZE as u64;
    Ok(())
}

pub(super) fn raw_memset_run(fctx: &mut FunContext) -> Result<()> {
    let dest_offset = arg_uint(fctx.arg(1), "bad block offset")? * BLOCK_SIZE as u64;
    let count = arg_uint(fctx.arg(2), "bad block count")?;
    let value = arg_uint(fctx.arg(3), "bad value")? as u8;
    let cache = fctx.output()?.clone();

    let buffer = [value; BLOCK_SIZE];
    for block in 0..count {
        cache
            .lock()
            .unwrap()
            .pwrite(&buffer, dest_offset + block * BLOCK_SIZE as u64, true)
            .map_err(|e| {
                FwForgeError::resource(format!(
                    "raw_memset couldn't write {BLOCK_SIZE} bytes to offset {}: {e}",
                    dest_offset + block * BLOCK_SIZE as u64
                ))
            })?;
        fctx.progress.report(BLOCK_SIZE as u64);
    }
    Ok(())
}

pub(super) fn mbr_write_validate(fctx: &mut FunContext) -> Result<()> {
    check_argc(fctx, 2, "mbr_write requires an mbr")?;
    let spec = fctx
        .cfg
        .mbr(fctx.arg(1))
        .ok_or_else(|| FwForgeError::config("mbr_write can't find mbr reference"))?;
    mbr::validate(spec)
}

pub(super) fn mbr_write_compute_progress(fctx: &mut FunContext) -> Result<()> {
    fctx.progress.total_units += 1;
    Ok(())
}

pub(super) fn mbr_write_run(fctx: &mut FunContext) -> Result<()> {
    let spec = fctx
        .cfg
        .mbr(fctx.arg(1))
        .ok_or_else(|| FwForgeError::config("mbr_write can't find mbr reference"))?;
    let buffer = mbr::render(spec)?;

    fctx.output()?.lock().unwrap().pwrite(&buffer, 0, false)?;
    fctx.progress.report(1);
    Ok(())
}

pub(super) fn trim_validate(fctx: &mut FunContext) -> Result<()> {
    check_argc(fctx, 3, "trim requires a block offset and count")?;
    arg_uint(
        fctx.arg(1),
        "trim requires a non-negative integer block offset",
    )?;
    arg_uint_max(
        fctx.arg(2),
        MAX_BLOCK_COUNT,
        "trim requires a non-negative integer block count",
    )?;
    Ok(())
}

/// One progress unit per 128 KiB trimmed.
fn trim_units(block_count: u64) -> u64 {
    block_count / 256
}

pub(super) fn trim_compute_progress(fctx: &mut FunContext) -> Result<()> {
    let block_count = arg_uint(fctx.arg(2), "trim requires a block count")?;
    fctx.progress.total_units += trim_units(block_count);
    Ok(())
}

pub(super) fn trim_run(fctx: &mut FunContext) -> Result<()> {
    let block_offset = arg_uint(fctx.arg(1), "bad block offset")?;
    let block_count = arg_uint(fctx.arg(2), "bad block count")?;

    let offset = block_offset * BLOCK_SIZE as u64;
    let count = block_count * BLOCK_SIZE as u64;
    fctx.output()?.lock().unwrap().trim(offset, count, true)?;

    fctx.progress.report(trim_units(block_count));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::cache::BlockCache;
    use crate::block::device::MemSink;
    use crate::config::FwConfig;
    use crate::fat::FatCache;
    use crate::progress::{Progress, Reporter};

    fn run_action(
        cfg: &FwConfig,
        cache: &SharedCache,
        argv: &[&str],
        phase: super::super::Phase,
    ) -> Result<()> {
        let mut progress = Progress::new(Reporter::sink());
        progress.total_units = u64::MAX / 2;
        let mut fat = FatCache::new();
        let mut fctx = FunContext::global(cfg, Some(cache), &mut progress, &mut fat, false);
        fctx.argv = argv.iter().map(|s| s.to_string()).collect();
        super::super::dispatch(&mut fctx, phase)
    }

    #[test]
    fn test_raw_memset_fills_blocks() {
        let cfg = FwConfig::default();
        let cache = BlockCache::shared(Box::new(MemSink::new()), 64);
        run_action(
            &cfg,
            &cache,
            &["raw_memset", "2", "3", "0xFF"],
            super::super::Phase::Run,
        )
        .unwrap();
        cache.lock().unwrap().flush().unwrap();

        let mut buf = vec![0u8; 5 * BLOCK_SIZE];
        cache.lock().unwrap().pread(&mut buf, 0).unwrap();
        assert!(buf[..2 * BLOCK_SIZE].iter().all(|&b| b == 0));
        assert!(buf[2 * BLOCK_SIZE..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_raw_memset_validation() {
        let cfg = FwConfig::default();
        let cache = BlockCache::shared(Box::new(MemSink::new()), 64);
        let phase = super::super::Phase::Validate;

        assert!(run_action(&cfg, &cache, &["raw_memset", "0", "1", "0"], phase).is_ok());
        assert!(run_action(&cfg, &cache, &["raw_memset", "0", "1"], phase).is_err());
        assert!(run_action(&cfg, &cache, &["raw_memset", "0", "1", "256"], phase).is_err());
        // Count too large: byte size must stay under i32::MAX.
        assert!(run_action(&cfg, &cache, &["raw_memset", "0", "4194304", "0"], phase).is_err());
    }

    #[test]
    fn test_raw_write_rejected_outside_on_resource() {
        let cfg = FwConfig::default();
        let cache = BlockCache::shared(Box::new(MemSink::new()), 64);
        let err = run_action(
            &cfg,
            &cache,
            &["raw_write", "0"],
            super::super::Phase::Validate,
        )
        .unwrap_err();
        assert!(err.to_string().contains("on-resource"));
    }

    #[test]
    fn test_trim_uses_block_count_for_byte_count() {
        // Regression test: the byte count comes from the block count
        // argument, not a second copy of the offset.
        let cfg = FwConfig::default();
        let sink = MemSink::new();
        let log = sink.trim_log();
        let cache = BlockCache::shared(Box::new(sink), 64);

        run_action(
            &cfg,
            &cache,
            &["trim", "16", "2048"],
            super::super::Phase::Run,
        )
        .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![(16 * BLOCK_SIZE as u64, 2048 * BLOCK_SIZE as u64)]
        );
    }

    #[test]
    fn test_trim_progress_units() {
        assert_eq!(trim_units(2048), 8); // 1 MiB → 8 × 128 KiB
        assert_eq!(trim_units(255), 0);
    }

    #[test]
    fn test_mbr_write_renders_section() {
        let cfg = FwConfig::from_json(
            r#"{
                "mbr": [{
                    "name": "main",
                    "partition": [
                        {"block-offset": 2048, "block-count": 1024, "type": 12, "boot": true}
                    ]
                }]
            }"#,
        )
        .unwrap();
        let cache = BlockCache::shared(Box::new(MemSink::new()), 64);

        run_action(&cfg, &cache, &["mbr_write", "main"], super::super::Phase::Run).unwrap();
        cache.lock().unwrap().flush().unwrap();

        let mut buf = [0u8; 512];
        cache.lock().unwrap().pread(&mut buf, 0).unwrap();
        assert_eq!(&buf[510..], &[0x55, 0xAA]);
        assert_eq!(buf[446], 0x80);

        // Unknown section fails validation.
        let err = run_action(
            &cfg,
            &cache,
            &["mbr_write", "other"],
            super::super::Phase::Validate,
        )
        .unwrap_err();
        assert!(err.to_string().contains("can't find mbr"));
    }
}
