//! Progress accounting and the diagnostic channel.
//!
//! Actions accumulate `total_units` in a first pass, then report units as
//! they run; the reporter turns that into at-most-once-per-percent output.
//! With framing on, every record is length-prefixed so a supervising
//! process can parse the streams; progress goes to stdout, diagnostics to
//! stderr.

use std::io::{self, Write};

use byteorder::{BigEndian, WriteBytesExt};

/// Record sink for one output stream, framed or plain.
struct Channel {
    framed: bool,
    out: Box<dyn Write + Send>,
}

impl Channel {
    fn emit(&mut self, payload: &str) -> io::Result<()> {
        if self.framed {
            self.out.write_u32::<BigEndian>(payload.len() as u32)?;
            self.out.write_all(payload.as_bytes())?;
        } else {
            self.out.write_all(payload.as_bytes())?;
            self.out.write_all(b"\n")?;
        }
        self.out.flush()
    }
}

pub struct Reporter {
    progress_channel: Channel,
    diagnostic_channel: Channel,
}

impl Reporter {
    pub fn new(framed: bool) -> Self {
        Reporter {
            progress_channel: Channel {
                framed,
                out: Box::new(io::stdout()),
            },
            diagnostic_channel: Channel {
                framed,
                out: Box::new(io::stderr()),
            },
        }
    }

    /// Route output into arbitrary writers; used by tests.
    pub fn with_outputs(
        framed: bool,
        progress: Box<dyn Write + Send>,
        diagnostics: Box<dyn Write + Send>,
    ) -> Self {
        Reporter {
            progress_channel: Channel {
                framed,
                out: progress,
            },
            diagnostic_channel: Channel {
                framed,
                out: diagnostics,
            },
        }
    }

    /// Swallow all output; used for progress pre-scans and validation runs.
    pub fn sink() -> Self {
        Self::with_outputs(false, Box::new(io::sink()), Box::new(io::sink()))
    }

    pub fn progress(&mut self, percent: u8) {
        let payload = if self.progress_channel.framed {
            format!("PR {percent}")
        } else {
            format!("{percent:3}%")
        };
        let _ = self.progress_channel.emit(&payload);
    }

    pub fn success(&mut self) {
        let payload = if self.progress_channel.framed {
            "OK".to_string()
        } else {
            "Success!".to_string()
        };
        let _ = self.progress_channel.emit(&payload);
    }

    pub fn info(&mut self, message: &str) {
        log::info!("{message}");
        let payload = if self.diagnostic_channel.framed {
            format!("WN {message}")
        } else {
            message.to_string()
        };
        let _ = self.diagnostic_channel.emit(&payload);
    }

    pub fn error(&mut self, message: &str) {
        log::error!("{message}");
        let payload = if self.diagnostic_channel.framed {
            format!("ER {message}")
        } else {
            format!("Error: {message}")
        };
        let _ = self.diagnostic_channel.emit(&payload);
    }
}

pub struct Progress {
    /// Units expected across the whole task; fixed before any action runs.
    pub total_units: u64,
    current_units: u64,
    last_percent: Option<u8>,
    reporter: Reporter,
}

impl Progress {
    pub fn new(reporter: Reporter) -> Self {
        Progress {
            total_units: 0,
            current_units: 0,
            last_percent: None,
            reporter,
        }
    }

    pub fn reporter(&mut self) -> &mut Reporter {
        &mut self.reporter
    }

    pub fn start(&mut self) {
        self.emit();
    }

    /// Record `units` of completed work, emitting when the percentage moves.
    pub fn report(&mut self, units: u64) {
        self.current_units = (self.current_units + units).min(self.total_units);
        self.emit();
    }

    /// Completion: clamp to 100% and announce success.
    pub fn finish(&mut self) {
        self.current_units = self.total_units;
        self.emit();
        self.reporter.success();
    }

    pub fn current_units(&self) -> u64 {
        self.current_units
    }

    fn percent(&self) -> u8 {
        if self.total_units == 0 {
            return 100;
        }
        ((self.current_units * 100) / self.total_units) as u8
    }

    fn emit(&mut self) {
        let percent = self.percent();
        if self.last_percent != Some(percent) {
            self.last_percent = Some(percent);
            self.reporter.progress(percent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Shared buffer so tests can inspect what a channel wrote.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture(framed: bool) -> (Progress, Captured, Captured) {
        let progress_buf = Captured::default();
        let diag_buf = Captured::default();
        let reporter = Reporter::with_outputs(
            framed,
            Box::new(progress_buf.clone()),
            Box::new(diag_buf.clone()),
        );
        (Progress::new(reporter), progress_buf, diag_buf)
    }

    #[test]
    fn test_percent_only_emitted_on_change() {
        let (mut progress, out, _) = capture(false);
        progress.total_units = 1000;
        progress.start();
        for _ in 0..10 {
            progress.report(1); // still 0% or 1%
        }
        progress.report(990);
        progress.finish();

        let text = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["  0%", "  1%", "100%", "Success!"]);
    }

    #[test]
    fn test_report_never_exceeds_total() {
        let (mut progress, _, _) = capture(false);
        progress.total_units = 10;
        progress.report(50);
        assert_eq!(progress.current_units(), 10);
    }

    #[test]
    fn test_framed_records_are_length_prefixed() {
        let (mut progress, out, diag) = capture(true);
        progress.total_units = 2;
        progress.report(1);
        progress.reporter().info("hello");

        let bytes = out.0.lock().unwrap().clone();
        assert_eq!(&bytes[..4], &[0, 0, 0, 5]);
        assert_eq!(&bytes[4..9], b"PR 50");

        let bytes = diag.0.lock().unwrap().clone();
        assert_eq!(&bytes[..4], &[0, 0, 0, 8]);
        assert_eq!(&bytes[4..12], b"WN hello");
    }

    #[test]
    fn test_zero_total_reports_complete() {
        let (mut progress, out, _) = capture(false);
        progress.finish();
        let text = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
        assert!(text.starts_with("100%"));
    }
}
