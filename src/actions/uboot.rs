//! U-Boot environment actions. All four are read-modify-write cycles
//! through the block cache against a `uboot-environment` config section.

use super::{check_argc, FunContext};
use crate::config::UBootEnvSpec;
use crate::error::{FwForgeError, Result};
use crate::sparse::BLOCK_SIZE;
use crate::uboot::UBootEnv;

fn env_section<'a>(fctx: &'a FunContext, action: &str) -> Result<&'a UBootEnvSpec> {
    fctx.cfg.uboot_environment(fctx.arg(1)).ok_or_else(|| {
        FwForgeError::config(format!("{action} can't find uboot-environment reference"))
    })
}

fn validate_section(fctx: &mut FunContext, argc: usize, action: &str, usage: &str) -> Result<()> {
    check_argc(fctx, argc, usage)?;
    let spec = env_section(fctx, action)?;
    // Catch absurd sizes at creation time rather than mid-apply.
    if spec.block_count == 0 || spec.block_count > i32::MAX as u64 / BLOCK_SIZE {
        return Err(FwForgeError::validation(format!(
            "uboot-environment '{}' block-count is out of range",
            spec.name
        )));
    }
    Ok(())
}

fn read_env(fctx: &FunContext, spec: &UBootEnvSpec) -> Result<(UBootEnv, Vec<u8>)> {
    let mut env = UBootEnv::from_spec(spec)?;
    let mut buffer = vec![0u8; env.env_size];
    fctx.output()?
        .lock()
        .unwrap()
        .pread(&mut buffer, env.block_offset * BLOCK_SIZE)?;
    env.read(&buffer)?;
    Ok((env, buffer))
}

fn write_env(fctx: &FunContext, env: &UBootEnv, buffer: &mut [u8]) -> Result<()> {
    env.write(buffer)?;
    fctx.output()?
        .lock()
        .unwrap()
        .pwrite(buffer, env.block_offset * BLOCK_SIZE, false)?;
    Ok(())
}

pub(super) fn uboot_clearenv_validate(fctx: &mut FunContext) -> Result<()> {
    validate_section(
        fctx,
        2,
        "uboot_clearenv",
        "uboot_clearenv requires a uboot-environment reference",
    )
}

pub(super) fn uboot_clearenv_compute_progress(fctx: &mut FunContext) -> Result<()> {
    fctx.progress.total_units += 1;
    Ok(())
}

pub(super) fn uboot_clearenv_run(fctx: &mut FunContext) -> Result<()> {
    let spec = env_section(fctx, "uboot_clearenv")?;
    let env = UBootEnv::from_spec(spec)?;
    let mut buffer = vec![0u8; env.env_size];

    write_env(fctx, &env, &mut buffer)?;
    fctx.progress.report(1);
    Ok(())
}

pub(super) fn uboot_setenv_validate(fctx: &mut FunContext) -> Result<()> {
    validate_section(
        fctx,
        4,
        "uboot_setenv",
        "uboot_setenv requires a uboot-environment reference, variable name and value",
    )
}

pub(super) fn uboot_setenv_compute_progress(fctx: &mut FunContext) -> Result<()> {
    fctx.progress.total_units += 1;
    Ok(())
}

pub(super) fn uboot_setenv_run(fctx: &mut FunContext) -> Result<()> {
    let spec = env_section(fctx, "uboot_setenv")?;
    let (mut env, mut buffer) = read_env(fctx, spec)?;

    env.setenv(fctx.arg(2), fctx.arg(3));
    write_env(fctx, &env, &mut buffer)?;
    fctx.progress.report(1);
    Ok(())
}

pub(super) fn uboot_unsetenv_validate(fctx: &mut FunContext) -> Result<()> {
    validate_section(
        fctx,
        3,
        "uboot_unsetenv",
        "uboot_unsetenv requires a uboot-environment reference and a variable name",
    )
}

pub(super) fn uboot_unsetenv_compute_progress(fctx: &mut FunContext) -> Result<()> {
    fctx.progress.total_units += 1;
    Ok(())
}

pub(super) fn uboot_unsetenv_run(fctx: &mut FunContext) -> Result<()> {
    let spec = env_section(fctx, "uboot_unsetenv")?;
    let (mut env, mut buffer) = read_env(fctx, spec)?;

    env.unsetenv(fctx.arg(2));
    write_env(fctx, &env, &mut buffer)?;
    fctx.progress.report(1);
    Ok(())
}

pub(super) fn uboot_recover_validate(fctx: &mut FunContext) -> Result<()> {
    validate_section(
        fctx,
        2,
        "uboot_recover",
        "uboot_recover requires a uboot-environment reference",
    )
}

pub(super) fn uboot_recover_compute_progress(fctx: &mut FunContext) -> Result<()> {
    fctx.progress.total_units += 1;
    Ok(())
}

/// The only reader that tolerates a corrupt environment: on CRC or parse
/// failure, write a clean empty one; otherwise leave the block untouched.
pub(super) fn uboot_recover_run(fctx: &mut FunContext) -> Result<()> {
    let spec = env_section(fctx, "uboot_recover")?;
    if read_env(fctx, spec).is_err() {
        let clean = UBootEnv::from_spec(spec)?;
        let mut buffer = vec![0u8; clean.env_size];
        write_env(fctx, &clean, &mut buffer)?;
    }
    fctx.progress.report(1);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::{dispatch, FunContext, Phase};
    use crate::block::cache::BlockCache;
    use crate::block::device::MemSink;
    use crate::block::SharedCache;
    use crate::config::FwConfig;
    use crate::error::Result;
    use crate::fat::FatCache;
    use crate::progress::{Progress, Reporter};
    use crate::uboot::UBootEnv;

    fn config() -> FwConfig {
        FwConfig::from_json(
            r#"{
                "uboot-environment": [
                    {"name": "env", "block-offset": 4, "block-count": 1}
                ]
            }"#,
        )
        .unwrap()
    }

    fn run(cfg: &FwConfig, cache: &SharedCache, argv: &[&str], phase: Phase) -> Result<()> {
        let mut progress = Progress::new(Reporter::sink());
        progress.total_units = 100;
        let mut fat = FatCache::new();
        let mut fctx = FunContext::global(cfg, Some(cache), &mut progress, &mut fat, false);
        fctx.argv = argv.iter().map(|s| s.to_string()).collect();
        dispatch(&mut fctx, phase)
    }

    fn read_back(cfg: &FwConfig, cache: &SharedCache) -> UBootEnv {
        let spec = cfg.uboot_environment("env").unwrap();
        let mut env = UBootEnv::from_spec(spec).unwrap();
        let mut buf = vec![0u8; env.env_size];
        cache.lock().unwrap().pread(&mut buf, 4 * 512).unwrap();
        env.read(&buf).unwrap();
        env
    }

    #[test]
    fn test_recover_over_erased_flash() {
        let cfg = config();
        let cache = BlockCache::shared(Box::new(MemSink::new()), 64);

        // Erased flash reads back 0xFF; recover writes a clean env.
        run(&cfg, &cache, &["raw_memset", "4", "1", "0xFF"], Phase::Run).unwrap();
        run(&cfg, &cache, &["uboot_recover", "env"], Phase::Run).unwrap();

        let env = read_back(&cfg, &cache);
        assert!(env.is_empty());
    }

    #[test]
    fn test_recover_leaves_valid_env_alone() {
        let cfg = config();
        let cache = BlockCache::shared(Box::new(MemSink::new()), 64);

        run(&cfg, &cache, &["uboot_clearenv", "env"], Phase::Run).unwrap();
        run(&cfg, &cache, &["uboot_setenv", "env", "bootcount", "3"], Phase::Run).unwrap();
        run(&cfg, &cache, &["uboot_recover", "env"], Phase::Run).unwrap();

        let env = read_back(&cfg, &cache);
        assert_eq!(env.getenv("bootcount"), Some("3"));
    }

    #[test]
    fn test_setenv_and_unsetenv() {
        let cfg = config();
        let cache = BlockCache::shared(Box::new(MemSink::new()), 64);

        run(&cfg, &cache, &["uboot_clearenv", "env"], Phase::Run).unwrap();
        run(&cfg, &cache, &["uboot_setenv", "env", "var1", "2000"], Phase::Run).unwrap();

        let env = read_back(&cfg, &cache);
        assert_eq!(env.getenv("var1"), Some("2000"));
        assert_eq!(env.len(), 1);

        run(&cfg, &cache, &["uboot_unsetenv", "env", "var1"], Phase::Run).unwrap();
        assert!(read_back(&cfg, &cache).is_empty());
    }

    #[test]
    fn test_setenv_on_corrupt_env_fails() {
        let cfg = config();
        let cache = BlockCache::shared(Box::new(MemSink::new()), 64);

        run(&cfg, &cache, &["raw_memset", "4", "1", "0xFF"], Phase::Run).unwrap();
        let err = run(&cfg, &cache, &["uboot_setenv", "env", "a", "b"], Phase::Run).unwrap_err();
        assert!(err.to_string().contains("corrupt"));
    }

    #[test]
    fn test_validate_checks_section_reference() {
        let cfg = config();
        let cache = BlockCache::shared(Box::new(MemSink::new()), 64);

        assert!(run(&cfg, &cache, &["uboot_setenv", "env", "a", "b"], Phase::Validate).is_ok());
        let err =
            run(&cfg, &cache, &["uboot_setenv", "nope", "a", "b"], Phase::Validate).unwrap_err();
        assert!(err.to_string().contains("can't find uboot-environment"));
    }
}
