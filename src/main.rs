use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use fwforge::apply::{self, ApplyOptions};
use fwforge::create;
use fwforge::progress::Reporter;
use fwforge::FwForgeError;

#[derive(Parser)]
#[command(name = "fwforge", version, about = "Firmware image assembly and apply engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a firmware archive from a configuration document.
    Create {
        /// Configuration document (JSON).
        #[arg(short, long)]
        config: PathBuf,
        /// Output archive path.
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Apply a task from an archive to an output device or image file.
    Apply {
        /// Firmware archive.
        #[arg(short, long)]
        input: PathBuf,
        /// Output block device or image file.
        #[arg(short, long)]
        device: PathBuf,
        /// Task to run.
        #[arg(short, long)]
        task: String,
        /// Emit length-prefixed progress and diagnostic records.
        #[arg(long)]
        framing: bool,
        /// Allow actions that touch the host (path_write, pipe_write,
        /// execute).
        #[arg(long = "unsafe")]
        unsafe_mode: bool,
        /// Block cache size in MiB.
        #[arg(long, default_value_t = 8)]
        cache_size: usize,
    },
    /// Check every resource in an archive against its manifest digest.
    Verify {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(long)]
        framing: bool,
    },
    /// List the tasks an archive provides.
    List {
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Print the archive's configuration document.
    Metadata {
        #[arg(short, long)]
        input: PathBuf,
    },
}

fn run(cli: Cli) -> Result<(), FwForgeError> {
    match cli.command {
        Command::Create { config, output } => create::create(&config, &output),
        Command::Apply {
            input,
            device,
            task,
            framing,
            unsafe_mode,
            cache_size,
        } => {
            let mut options = ApplyOptions::new(&input, &device, &task);
            options.framed = framing;
            options.unsafe_mode = unsafe_mode;
            options.cache_blocks = (cache_size * 1024 * 1024 / 512).max(16);
            apply::apply(&options)
        }
        Command::Verify { input, framing } => apply::verify(&input, framing),
        Command::List { input } => apply::list(&input),
        Command::Metadata { input } => apply::metadata(&input),
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let framed = match &cli.command {
        Command::Apply { framing, .. } | Command::Verify { framing, .. } => *framing,
        _ => false,
    };

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(FwForgeError::TaskNotApplicable(task)) => {
            Reporter::new(framed).error(&format!("no task matches '{task}' on this device"));
            ExitCode::from(2)
        }
        Err(e) => {
            Reporter::new(framed).error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}
