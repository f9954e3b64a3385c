//! Apply driver: run a task from a firmware archive against an output
//! device, plus the read-only archive modes (verify, list, metadata).
//!
//! The driver owns the whole pipeline for one task execution: select the
//! task, pre-compute progress, run `on-init`, stream each bound archive
//! entry through its `on-resource` funlist, run `on-finish`, and flush the
//! block cache. A task aborts on the first failing action; partial writes
//! stay on the device.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

use log::{debug, info};

use crate::actions::{run_funlist, FunContext, Phase};
use crate::archive::ArchiveReader;
use crate::block::{BlockCache, FileSink, SharedCache};
use crate::config::{FwConfig, TaskSpec, MANIFEST_ENTRY};
use crate::error::{FwForgeError, Result};
use crate::fat::FatCache;
use crate::progress::{Progress, Reporter};
use crate::resource::ResourceStream;
use crate::task::select_task;

pub struct ApplyOptions<'a> {
    pub archive: &'a Path,
    pub output: &'a Path,
    pub task: &'a str,
    pub framed: bool,
    pub unsafe_mode: bool,
    /// Block cache capacity in 512-byte blocks.
    pub cache_blocks: usize,
}

impl<'a> ApplyOptions<'a> {
    pub fn new(archive: &'a Path, output: &'a Path, task: &'a str) -> Self {
        ApplyOptions {
            archive,
            output,
            task,
            framed: false,
            unsafe_mode: false,
            cache_blocks: BlockCache::DEFAULT_MAX_BLOCKS,
        }
    }
}

/// Walk every funlist of the task once with the given phase.
fn walk_task(
    cfg: &FwConfig,
    task: &TaskSpec,
    cache: &SharedCache,
    progress: &mut Progress,
    fat: &mut FatCache,
    unsafe_mode: bool,
    phase: Phase,
) -> Result<()> {
    {
        let mut fctx = FunContext::global(cfg, Some(cache), progress, fat, unsafe_mode);
        run_funlist(&mut fctx, &task.on_init, phase)?;
    }
    for on_resource in &task.on_resource {
        let mut fctx = FunContext::for_resource(
            cfg,
            Some(cache),
            progress,
            fat,
            unsafe_mode,
            on_resource.name.clone(),
            None,
        );
        run_funlist(&mut fctx, &on_resource.funlist, phase)?;
    }
    {
        let mut fctx = FunContext::global(cfg, Some(cache), progress, fat, unsafe_mode);
        run_funlist(&mut fctx, &task.on_finish, phase)?;
    }
    Ok(())
}

pub fn apply(options: &ApplyOptions) -> Result<()> {
    let mut archive = ArchiveReader::open(options.archive)?;
    let cfg = archive.manifest()?;

    let sink = FileSink::open(options.output)?;
    let cache = BlockCache::shared(Box::new(sink), options.cache_blocks);
    let mut fat = FatCache::new();

    let task = select_task(&cfg, options.task, &cache, &mut fat)?
        .ok_or_else(|| FwForgeError::TaskNotApplicable(options.task.to_string()))?
        .clone();
    info!("applying task '{}' to {}", task.name, options.output.display());

    let mut progress = Progress::new(Reporter::new(options.framed));

    // A malformed manifest must surface before anything runs.
    walk_task(
        &cfg,
        &task,
        &cache,
        &mut progress,
        &mut fat,
        options.unsafe_mode,
        Phase::Validate,
    )?;

    // Pass one: total progress units across every funlist.
    walk_task(
        &cfg,
        &task,
        &cache,
        &mut progress,
        &mut fat,
        options.unsafe_mode,
        Phase::ComputeProgress,
    )?;
    debug!("task '{}' totals {} progress units", task.name, progress.total_units);
    progress.start();

    // Pass two: run. on-init first.
    {
        let mut fctx = FunContext::global(
            &cfg,
            Some(&cache),
            &mut progress,
            &mut fat,
            options.unsafe_mode,
        );
        run_funlist(&mut fctx, &task.on_init, Phase::Run)?;
    }

    // Resource phase: archive entries in stored order. Unbound data
    // entries are skipped; each bound entry consumes its stream exactly
    // once.
    let mut fired: HashSet<String> = HashSet::new();
    for index in 0..archive.entry_count() {
        let mut entry = archive.entry(index)?;
        let name = entry.name().to_string();
        if name == MANIFEST_ENTRY {
            continue;
        }
        let Some(on_resource) = task.on_resource.iter().find(|r| r.name == name) else {
            debug!("skipping unbound archive entry '{name}'");
            continue;
        };

        let resource = cfg.resource(&name).ok_or_else(|| {
            FwForgeError::config(format!(
                "archive entry '{name}' has no file-resource section"
            ))
        })?;
        let map = resource.sparse_map()?;
        let stream = ResourceStream::new(&mut entry, &map);

        let mut fctx = FunContext::for_resource(
            &cfg,
            Some(&cache),
            &mut progress,
            &mut fat,
            options.unsafe_mode,
            name.clone(),
            Some(stream),
        );
        run_funlist(&mut fctx, &on_resource.funlist, Phase::Run)?;
        fired.insert(name);
    }

    // Resources the task references but the archive never delivered.
    for on_resource in &task.on_resource {
        if !fired.contains(&on_resource.name) && !on_resource.optional {
            return Err(FwForgeError::resource(format!(
                "file-resource '{}' not found in archive",
                on_resource.name
            )));
        }
    }

    {
        let mut fctx = FunContext::global(
            &cfg,
            Some(&cache),
            &mut progress,
            &mut fat,
            options.unsafe_mode,
        );
        run_funlist(&mut fctx, &task.on_finish, Phase::Run)?;
    }

    fat.close()?;
    cache.lock().unwrap().flush()?;
    progress.finish();
    Ok(())
}

/// Re-hash every resource payload against the manifest digests.
pub fn verify(archive_path: &Path, framed: bool) -> Result<()> {
    let mut archive = ArchiveReader::open(archive_path)?;
    let cfg = archive.manifest()?;
    let mut reporter = Reporter::new(framed);

    for resource in &cfg.file_resources {
        let expected_hash = resource.expected_hash()?.to_string();
        let map = resource.sparse_map()?;

        let mut entry = archive.entry_by_name(&resource.name)?;
        let digest = resource_digest(&mut entry, &map)?;
        if !digest.eq_ignore_ascii_case(&expected_hash) {
            return Err(FwForgeError::resource(format!(
                "'{}' failed verification: BLAKE2b-256 digest mismatch",
                resource.name
            )));
        }
        reporter.info(&format!("'{}' verified ({} bytes)", resource.name, map.data_size()));
    }

    reporter.success();
    Ok(())
}

/// Print the task names and what each requires.
pub fn list(archive_path: &Path) -> Result<()> {
    let mut archive = ArchiveReader::open(archive_path)?;
    let cfg = archive.manifest()?;

    for task in &cfg.tasks {
        let requirements = task.require_partition_offset.len()
            + task.require_fat_file_exists.len()
            + task.require_uboot_variable.len();
        if requirements == 0 {
            println!("{}", task.name);
        } else {
            println!("{} ({requirements} requirements)", task.name);
        }
    }
    Ok(())
}

/// Print the configuration document carried by the archive.
pub fn metadata(archive_path: &Path) -> Result<()> {
    let mut archive = ArchiveReader::open(archive_path)?;
    let cfg = archive.manifest()?;
    println!("{}", cfg.to_json()?);
    Ok(())
}

/// Hash an archive entry's payload the same way the apply path does.
fn resource_digest(source: &mut dyn Read, map: &crate::sparse::SparseMap) -> Result<String> {
    use blake2::digest::consts::U32;
    use blake2::{Blake2b, Digest};

    let mut stream = ResourceStream::new(source, map);
    let mut hasher = Blake2b::<U32>::new();
    while let Some((_, buf)) = stream.read()? {
        hasher.update(buf);
    }
    Ok(hex::encode(hasher.finalize()))
}
