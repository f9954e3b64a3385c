//! Action registry and the funlist interpreter.
//!
//! Actions are first-class values: a name plus `validate`,
//! `compute_progress`, and `run` phase functions in one fixed table. The
//! interpreter walks a task's flattened argv stream — an arity integer
//! followed by that many operands, repeated — and dispatches the chosen
//! phase for each tuple.

mod fat;
mod host;
mod raw;
mod sink;
mod uboot;

pub(crate) use sink::{pump, ResourceSink};

use crate::block::SharedCache;
use crate::config::{parse_uint, FileResource, FwConfig};
use crate::error::{FwForgeError, Result};
use crate::fat::FatCache;
use crate::progress::Progress;
use crate::resource::ResourceStream;

/// Upper bound on operands per invocation, including the action name.
pub const FUN_MAX_ARGS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ContextKind {
    Global,
    /// Inside an on-resource event.
    File,
}

/// The event a FILE context is bound to.
#[derive(Debug, Clone)]
pub struct Event {
    pub title: String,
}

/// Everything an action phase can touch.
pub struct FunContext<'a> {
    pub kind: ContextKind,
    pub cfg: &'a FwConfig,
    pub on_event: Option<Event>,
    pub output: Option<&'a SharedCache>,
    pub stream: Option<ResourceStream<'a>>,
    pub progress: &'a mut Progress,
    pub fat: &'a mut FatCache,
    pub unsafe_mode: bool,
    pub argv: Vec<String>,
}

impl<'a> FunContext<'a> {
    pub fn global(
        cfg: &'a FwConfig,
        output: Option<&'a SharedCache>,
        progress: &'a mut Progress,
        fat: &'a mut FatCache,
        unsafe_mode: bool,
    ) -> Self {
        FunContext {
            kind: ContextKind::Global,
            cfg,
            on_event: None,
            output,
            stream: None,
            progress,
            fat,
            unsafe_mode,
            argv: Vec::new(),
        }
    }

    pub fn for_resource(
        cfg: &'a FwConfig,
        output: Option<&'a SharedCache>,
        progress: &'a mut Progress,
        fat: &'a mut FatCache,
        unsafe_mode: bool,
        title: String,
        stream: Option<ResourceStream<'a>>,
    ) -> Self {
        FunContext {
            kind: ContextKind::File,
            cfg,
            on_event: Some(Event { title }),
            output,
            stream,
            progress,
            fat,
            unsafe_mode,
            argv: Vec::new(),
        }
    }

    pub fn arg(&self, index: usize) -> &str {
        &self.argv[index]
    }

    pub(crate) fn event(&self) -> Result<&Event> {
        self.on_event
            .as_ref()
            .ok_or_else(|| FwForgeError::resource("action ran outside an on-resource event"))
    }

    pub(crate) fn output(&self) -> Result<&SharedCache> {
        self.output
            .ok_or_else(|| FwForgeError::resource("action ran without an output device"))
    }

    /// The file-resource section bound to the current event.
    pub(crate) fn resource(&self) -> Result<&FileResource> {
        let title = &self.event()?.title;
        self.cfg.resource(title).ok_or_else(|| {
            FwForgeError::config(format!(
                "{} can't find file-resource '{title}'",
                self.argv[0]
            ))
        })
    }

    /// Disjoint mutable views needed while pumping a resource stream.
    pub(crate) fn split_streaming(
        &mut self,
    ) -> Result<(&mut ResourceStream<'a>, &mut Progress, &mut FatCache)> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            FwForgeError::resource("no resource stream bound to this on-resource event")
        })?;
        Ok((stream, &mut *self.progress, &mut *self.fat))
    }
}

type ActionFn = fn(&mut FunContext) -> Result<()>;

#[derive(Debug)]
pub struct ActionInfo {
    pub name: &'static str,
    validate: ActionFn,
    compute_progress: ActionFn,
    run: ActionFn,
}

static ACTION_TABLE: &[ActionInfo] = &[
    ActionInfo {
        name: "raw_write",
        validate: raw::raw_write_validate,
        compute_progress: raw::raw_write_compute_progress,
        run: raw::raw_write_run,
    },
    ActionInfo {
        name: "raw_memset",
        validate: raw::raw_memset_validate,
        compute_progress: raw::raw_memset_compute_progress,
        run: raw::raw_memset_run,
    },
    ActionInfo {
        name: "fat_attrib",
        validate: fat::fat_attrib_validate,
        compute_progress: fat::fat_attrib_compute_progress,
        run: fat::fat_attrib_run,
    },
    ActionInfo {
        name: "fat_mkfs",
        validate: fat::fat_mkfs_validate,
        compute_progress: fat::fat_mkfs_compute_progress,
        run: fat::fat_mkfs_run,
    },
    ActionInfo {
        name: "fat_write",
        validate: fat::fat_write_validate,
        compute_progress: fat::fat_write_compute_progress,
        run: fat::fat_write_run,
    },
    ActionInfo {
        name: "fat_mv",
        validate: fat::fat_mv_validate,
        compute_progress: fat::fat_mv_compute_progress,
        run: fat::fat_mv_run,
    },
    ActionInfo {
        name: "fat_mv!",
        validate: fat::fat_mv_validate,
        compute_progress: fat::fat_mv_compute_progress,
        run: fat::fat_mv_run,
    },
    ActionInfo {
        name: "fat_rm",
        validate: fat::fat_rm_validate,
        compute_progress: fat::fat_rm_compute_progress,
        run: fat::fat_rm_run,
    },
    ActionInfo {
        name: "fat_rm!",
        validate: fat::fat_rm_validate,
        compute_progress: fat::fat_rm_compute_progress,
        run: fat::fat_rm_run,
    },
    ActionInfo {
        name: "fat_cp",
        validate: fat::fat_cp_validate,
        compute_progress: fat::fat_cp_compute_progress,
        run: fat::fat_cp_run,
    },
    ActionInfo {
        name: "fat_mkdir",
        validate: fat::fat_mkdir_validate,
        compute_progress: fat::fat_mkdir_compute_progress,
        run: fat::fat_mkdir_run,
    },
    ActionInfo {
        name: "fat_setlabel",
        validate: fat::fat_setlabel_validate,
        compute_progress: fat::fat_setlabel_compute_progress,
        run: fat::fat_setlabel_run,
    },
    ActionInfo {
        name: "fat_touch",
        validate: fat::fat_touch_validate,
        compute_progress: fat::fat_touch_compute_progress,
        run: fat::fat_touch_run,
    },
    ActionInfo {
        name: "mbr_write",
        validate: raw::mbr_write_validate,
        compute_progress: raw::mbr_write_compute_progress,
        run: raw::mbr_write_run,
    },
    ActionInfo {
        name: "trim",
        validate: raw::trim_validate,
        compute_progress: raw::trim_compute_progress,
        run: raw::trim_run,
    },
    ActionInfo {
        name: "uboot_clearenv",
        validate: uboot::uboot_clearenv_validate,
        compute_progress: uboot::uboot_clearenv_compute_progress,
        run: uboot::uboot_clearenv_run,
    },
    ActionInfo {
        name: "uboot_setenv",
        validate: uboot::uboot_setenv_validate,
        compute_progress: uboot::uboot_setenv_compute_progress,
        run: uboot::uboot_setenv_run,
    },
    ActionInfo {
        name: "uboot_unsetenv",
        validate: uboot::uboot_unsetenv_validate,
        compute_progress: uboot::uboot_unsetenv_compute_progress,
        run: uboot::uboot_unsetenv_run,
    },
    ActionInfo {
        name: "uboot_recover",
        validate: uboot::uboot_recover_validate,
        compute_progress: uboot::uboot_recover_compute_progress,
        run: uboot::uboot_recover_run,
    },
    ActionInfo {
        name: "error",
        validate: host::error_validate,
        compute_progress: host::error_compute_progress,
        run: host::error_run,
    },
    ActionInfo {
        name: "info",
        validate: host::info_validate,
        compute_progress: host::info_compute_progress,
        run: host::info_run,
    },
    ActionInfo {
        name: "path_write",
        validate: host::path_write_validate,
        compute_progress: host::path_write_compute_progress,
        run: host::path_write_run,
    },
    ActionInfo {
        name: "pipe_write",
        validate: host::pipe_write_validate,
        compute_progress: host::pipe_write_compute_progress,
        run: host::pipe_write_run,
    },
    ActionInfo {
        name: "execute",
        validate: host::execute_validate,
        compute_progress: host::execute_compute_progress,
        run: host::execute_run,
    },
];

fn lookup(name: &str) -> Result<&'static ActionInfo> {
    ACTION_TABLE
        .iter()
        .find(|action| action.name == name)
        .ok_or_else(|| FwForgeError::validation(format!("Unknown function '{name}'")))
}

/// Interpreter phase selecting which of the triple to invoke.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Phase {
    Validate,
    ComputeProgress,
    Run,
}

/// Dispatch one invocation already loaded into `fctx.argv`.
pub fn dispatch(fctx: &mut FunContext, phase: Phase) -> Result<()> {
    let action = lookup(&fctx.argv[0])?;
    match phase {
        Phase::Validate => (action.validate)(fctx),
        Phase::ComputeProgress => (action.compute_progress)(fctx),
        Phase::Run => (action.run)(fctx),
    }
}

/// Walk a funlist, invoking the chosen phase for each tuple. The stream is
/// re-walkable: the progress pass and the run pass both start from index 0.
pub fn run_funlist(fctx: &mut FunContext, funlist: &[String], phase: Phase) -> Result<()> {
    let mut ix = 0usize;
    while ix < funlist.len() {
        let argc = parse_uint(&funlist[ix])
            .map_err(|_| FwForgeError::validation("Unexpected argc value in funlist"))?
            as usize;
        ix += 1;
        if argc == 0 || argc > FUN_MAX_ARGS {
            return Err(FwForgeError::validation("Unexpected argc value in funlist"));
        }
        if ix + argc > funlist.len() {
            return Err(FwForgeError::validation("Unexpected end of funlist"));
        }
        // A fresh argv each tuple; stale operands never leak into the next
        // invocation's diagnostics.
        fctx.argv = funlist[ix..ix + argc].to_vec();
        ix += argc;

        dispatch(fctx, phase)?;
    }
    Ok(())
}

// --------------------------------------------------------------------------
// Shared argument validation helpers
// --------------------------------------------------------------------------

pub(crate) fn check_argc(fctx: &FunContext, argc: usize, message: &str) -> Result<()> {
    if fctx.argv.len() != argc {
        return Err(FwForgeError::validation(message));
    }
    Ok(())
}

pub(crate) fn check_file_context(fctx: &FunContext, name: &str) -> Result<()> {
    if fctx.kind != ContextKind::File {
        return Err(FwForgeError::validation(format!(
            "{name} only usable in on-resource"
        )));
    }
    Ok(())
}

pub(crate) fn arg_uint(text: &str, message: &str) -> Result<u64> {
    parse_uint(text).map_err(|_| FwForgeError::validation(message))
}

pub(crate) fn arg_uint_max(text: &str, max: u64, message: &str) -> Result<u64> {
    let value = arg_uint(text, message)?;
    if value > max {
        return Err(FwForgeError::validation(message));
    }
    Ok(value)
}

/// Largest block count whose byte size still fits in an i32.
pub(crate) const MAX_BLOCK_COUNT: u64 = i32::MAX as u64 / crate::sparse::BLOCK_SIZE;

/// Progress units for a write-shaped action: one per data byte, with
/// zero-length resources optionally counting as a single unit.
pub(crate) fn resource_progress(fctx: &mut FunContext, min_one: bool) -> Result<()> {
    let mut units = fctx.resource()?.sparse_map()?.data_size();
    if min_one && units == 0 {
        units = 1;
    }
    fctx.progress.total_units += units;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{Progress, Reporter};

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn with_context<T>(f: impl FnOnce(&mut FunContext) -> T) -> T {
        let cfg = FwConfig::default();
        let mut progress = Progress::new(Reporter::sink());
        let mut fat = FatCache::new();
        let mut fctx = FunContext::global(&cfg, None, &mut progress, &mut fat, false);
        f(&mut fctx)
    }

    #[test]
    fn test_lookup_base_and_bang_variants() {
        assert!(lookup("raw_write").is_ok());
        assert!(lookup("fat_mv").is_ok());
        assert!(lookup("fat_mv!").is_ok());
        assert!(lookup("fat_rm!").is_ok());
        assert!(lookup("raw_write!").is_err());
        assert!(lookup("bogus").is_err());
    }

    #[test]
    fn test_unknown_function_message() {
        let err = lookup("frobnicate").unwrap_err();
        assert_eq!(err.to_string(), "Unknown function 'frobnicate'");
    }

    #[test]
    fn test_funlist_walks_tuples() {
        with_context(|fctx| {
            // Two bookkeeping invocations: progress totals accumulate.
            let funlist = strings(&["3", "fat_mkfs", "63", "1000", "3", "fat_mkdir", "63", "SYS"]);
            run_funlist(fctx, &funlist, Phase::ComputeProgress).unwrap();
            assert_eq!(fctx.progress.total_units, 2);
        });
    }

    #[test]
    fn test_funlist_rejects_bad_argc() {
        with_context(|fctx| {
            let err = run_funlist(fctx, &strings(&["0", "info"]), Phase::Validate).unwrap_err();
            assert!(err.to_string().contains("argc"));

            let err = run_funlist(fctx, &strings(&["9", "info"]), Phase::Validate).unwrap_err();
            assert!(err.to_string().contains("argc"));

            let err = run_funlist(fctx, &strings(&["x", "info"]), Phase::Validate).unwrap_err();
            assert!(err.to_string().contains("argc"));
        });
    }

    #[test]
    fn test_funlist_rejects_truncated_stream() {
        with_context(|fctx| {
            let err =
                run_funlist(fctx, &strings(&["3", "fat_mkdir", "63"]), Phase::Validate).unwrap_err();
            assert!(err.to_string().contains("end of funlist"));
        });
    }

    #[test]
    fn test_funlist_rewalkable() {
        with_context(|fctx| {
            let funlist = strings(&["2", "info", "hello"]);
            run_funlist(fctx, &funlist, Phase::Validate).unwrap();
            run_funlist(fctx, &funlist, Phase::ComputeProgress).unwrap();
            run_funlist(fctx, &funlist, Phase::Run).unwrap();
        });
    }

    #[test]
    fn test_argv_replaced_between_tuples() {
        with_context(|fctx| {
            let funlist = strings(&["4", "fat_rm", "63", "A.TXT", "B", "2", "info", "x"]);
            // fat_rm validation fails on argc 4, proving argv was loaded per
            // tuple; run the info tuple alone to check replacement.
            assert!(run_funlist(fctx, &funlist, Phase::Validate).is_err());

            run_funlist(fctx, &strings(&["2", "info", "x"]), Phase::Validate).unwrap();
            assert_eq!(fctx.argv, vec!["info", "x"]);
        });
    }
}
