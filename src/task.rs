//! Task selection.
//!
//! The requested task name matches by prefix (`upgrade` selects
//! `upgrade.a`, `upgrade.b`, …); the first candidate whose `require-*`
//! predicates all hold against the output device is the one that runs.
//! A predicate that cannot be evaluated simply fails, so a blank device
//! falls through to the unconditional variant of a task.

use log::debug;

use crate::block::{SharedCache, BLOCK_SIZE};
use crate::config::{FwConfig, TaskSpec};
use crate::error::Result;
use crate::fat::{self, FatCache};
use crate::mbr;
use crate::uboot::UBootEnv;

/// Pick the first matching task whose requirements pass.
pub fn select_task<'a>(
    cfg: &'a FwConfig,
    requested: &'a str,
    cache: &SharedCache,
    fat: &mut FatCache,
) -> Result<Option<&'a TaskSpec>> {
    for task in cfg.tasks_matching(requested) {
        if requirements_met(cfg, task, cache, fat) {
            debug!("selected task '{}'", task.name);
            return Ok(Some(task));
        }
        debug!("task '{}' requirements not met, skipping", task.name);
    }
    Ok(None)
}

fn requirements_met(cfg: &FwConfig, task: &TaskSpec, cache: &SharedCache, fat: &mut FatCache) -> bool {
    for requirement in &task.require_partition_offset {
        let mut sector = [0u8; 512];
        if cache.lock().unwrap().pread(&mut sector, 0).is_err() {
            return false;
        }
        if mbr::partition_lba(&sector, requirement.partition) != Some(requirement.block_offset) {
            return false;
        }
    }

    for requirement in &task.require_fat_file_exists {
        match fat::exists(fat, cache, requirement.block_offset, &requirement.path) {
            Ok(true) => {}
            // No volume there at all counts as "does not exist".
            Ok(false) | Err(_) => return false,
        }
    }

    for requirement in &task.require_uboot_variable {
        let Some(spec) = cfg.uboot_environment(&requirement.environment) else {
            return false;
        };
        let Ok(mut env) = UBootEnv::from_spec(spec) else {
            return false;
        };
        let mut buffer = vec![0u8; env.env_size];
        if cache
            .lock()
            .unwrap()
            .pread(&mut buffer, env.block_offset * BLOCK_SIZE as u64)
            .is_err()
        {
            return false;
        }
        if env.read(&buffer).is_err() {
            return false;
        }
        if env.getenv(&requirement.name) != Some(requirement.value.as_str()) {
            return false;
        }
    }

    true
}
