//! Actions that touch the host: diagnostics, host-path writes, and
//! subprocess plumbing. The host-affecting ones are gated behind unsafe
//! mode, checked before any side effect.

use std::fs::OpenOptions;
use std::io::Write;
use std::process::{Command, Stdio};

use super::sink::ResourceSink;
use super::{check_argc, check_file_context, resource_progress, FunContext};
use crate::error::{FwForgeError, Result};
use crate::sparse::SparseMap;

const ZERO_CHUNK: usize = 64 * 1024;

/// Sequential byte sink over a host file descriptor or pipe. Interior and
/// trailing holes are materialized as zeros, since neither destination can
/// seek meaningfully.
struct FdSink {
    out: Box<dyn Write>,
    position: u64,
}

impl FdSink {
    fn new(out: Box<dyn Write>) -> Self {
        FdSink { out, position: 0 }
    }

    fn write_zeros(&mut self, mut count: u64) -> Result<()> {
        let zeros = [0u8; ZERO_CHUNK];
        while count > 0 {
            let n = (count as usize).min(ZERO_CHUNK);
            self.out.write_all(&zeros[..n])?;
            count -= n as u64;
        }
        Ok(())
    }
}

impl ResourceSink for FdSink {
    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if offset > self.position {
            self.write_zeros(offset - self.position)?;
            self.position = offset;
        }
        self.out.write_all(buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    fn fill_ending_hole(&mut self, map: &SparseMap) -> Result<()> {
        let total = map.total_size();
        if total > self.position {
            self.write_zeros(total - self.position)?;
            self.position = total;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

fn require_unsafe(fctx: &FunContext, action: &'static str) -> Result<()> {
    if !fctx.unsafe_mode {
        return Err(FwForgeError::Safety(action));
    }
    Ok(())
}

pub(super) fn error_validate(fctx: &mut FunContext) -> Result<()> {
    check_argc(fctx, 2, "error() requires a message parameter")
}

pub(super) fn error_compute_progress(_fctx: &mut FunContext) -> Result<()> {
    Ok(())
}

pub(super) fn error_run(fctx: &mut FunContext) -> Result<()> {
    Err(FwForgeError::UserAbort(fctx.arg(1).to_string()))
}

pub(super) fn info_validate(fctx: &mut FunContext) -> Result<()> {
    check_argc(fctx, 2, "info() requires a message parameter")
}

pub(super) fn info_compute_progress(_fctx: &mut FunContext) -> Result<()> {
    Ok(())
}

pub(super) fn info_run(fctx: &mut FunContext) -> Result<()> {
    let message = fctx.arg(1).to_string();
    fctx.progress.reporter().info(&message);
    Ok(())
}

pub(super) fn path_write_validate(fctx: &mut FunContext) -> Result<()> {
    check_file_context(fctx, "path_write")?;
    check_argc(fctx, 2, "path_write requires a file path")
}

pub(super) fn path_write_compute_progress(fctx: &mut FunContext) -> Result<()> {
    resource_progress(fctx, false)
}

pub(super) fn path_write_run(fctx: &mut FunContext) -> Result<()> {
    require_unsafe(fctx, "path_write")?;

    let title = fctx.event()?.title.clone();
    let resource = fctx.resource()?;
    let expected_hash = resource.expected_hash()?.to_string();
    let map = resource.sparse_map()?;
    let path = fctx.arg(1).to_string();

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .map_err(|e| {
            FwForgeError::Io(std::io::Error::new(
                e.kind(),
                format!("path_write can't open '{path}': {e}"),
            ))
        })?;

    let mut sink = FdSink::new(Box::new(file));
    let (stream, progress, _) = fctx.split_streaming()?;
    super::pump(
        "path_write",
        &title,
        &expected_hash,
        &map,
        stream,
        progress,
        &mut sink,
    )
}

pub(super) fn pipe_write_validate(fctx: &mut FunContext) -> Result<()> {
    check_file_context(fctx, "pipe_write")?;
    check_argc(fctx, 2, "pipe_write requires a command to execute")
}

pub(super) fn pipe_write_compute_progress(fctx: &mut FunContext) -> Result<()> {
    resource_progress(fctx, false)
}

pub(super) fn pipe_write_run(fctx: &mut FunContext) -> Result<()> {
    require_unsafe(fctx, "pipe_write")?;

    let title = fctx.event()?.title.clone();
    let resource = fctx.resource()?;
    let expected_hash = resource.expected_hash()?.to_string();
    let map = resource.sparse_map()?;
    let command = fctx.arg(1).to_string();

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(&command)
        .stdin(Stdio::piped())
        .spawn()
        .map_err(|e| {
            FwForgeError::Io(std::io::Error::new(
                e.kind(),
                format!("pipe_write can't run command '{command}': {e}"),
            ))
        })?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| FwForgeError::resource("pipe_write couldn't open the command's stdin"))?;

    let result = {
        let mut sink = FdSink::new(Box::new(stdin));
        let (stream, progress, _) = fctx.split_streaming()?;
        super::pump(
            "pipe_write",
            &title,
            &expected_hash,
            &map,
            stream,
            progress,
            &mut sink,
        )
    };
    // The sink (and the child's stdin) is closed here, letting it exit.

    let status = child.wait()?;
    result?;
    if !status.success() {
        return Err(FwForgeError::resource(format!(
            "pipe_write command '{command}' exited with {status}"
        )));
    }
    Ok(())
}

pub(super) fn execute_validate(fctx: &mut FunContext) -> Result<()> {
    check_argc(fctx, 2, "execute requires a command to execute")
}

pub(super) fn execute_compute_progress(_fctx: &mut FunContext) -> Result<()> {
    Ok(())
}

pub(super) fn execute_run(fctx: &mut FunContext) -> Result<()> {
    require_unsafe(fctx, "execute")?;

    let command = fctx.arg(1).to_string();
    let output = Command::new("sh")
        .arg("-c")
        .arg(&command)
        .stderr(Stdio::inherit())
        .output()
        .map_err(|e| {
            FwForgeError::Io(std::io::Error::new(
                e.kind(),
                format!("execute can't run command '{command}': {e}"),
            ))
        })?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        fctx.progress.reporter().info(line);
    }
    if !output.status.success() {
        return Err(FwForgeError::resource(format!(
            "execute command '{command}' exited with {}",
            output.status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::{dispatch, FunContext, Phase};
    use crate::config::FwConfig;
    use crate::error::FwForgeError;
    use crate::fat::FatCache;
    use crate::progress::{Progress, Reporter};

    fn run(argv: &[&str], unsafe_mode: bool) -> Result<(), FwForgeError> {
        let cfg = FwConfig::default();
        let mut progress = Progress::new(Reporter::sink());
        let mut fat = FatCache::new();
        let mut fctx = FunContext::global(&cfg, None, &mut progress, &mut fat, unsafe_mode);
        fctx.argv = argv.iter().map(|s| s.to_string()).collect();
        dispatch(&mut fctx, Phase::Run)
    }

    #[test]
    fn test_error_aborts_with_message() {
        let err = run(&["error", "update not supported on this board"], false).unwrap_err();
        assert!(matches!(err, FwForgeError::UserAbort(_)));
        assert_eq!(err.to_string(), "update not supported on this board");
    }

    #[test]
    fn test_unsafe_actions_gated() {
        for argv in [
            &["execute", "true"][..],
            &["path_write", "/tmp/out.bin"][..],
            &["pipe_write", "cat > /dev/null"][..],
        ] {
            let err = run(argv, false).unwrap_err();
            assert!(
                matches!(err, FwForgeError::Safety(_)),
                "{argv:?} should be gated"
            );
            assert!(err.to_string().contains("--unsafe"));
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_execute_runs_and_checks_status() {
        run(&["execute", "true"], true).unwrap();
        let err = run(&["execute", "false"], true).unwrap_err();
        assert!(err.to_string().contains("exited with"));
    }

    #[test]
    fn test_info_emits() {
        run(&["info", "hello"], false).unwrap();
    }
}
