use thiserror::Error;

/// Error taxonomy for the assembly/apply engine.
///
/// Every action returns one of these through the call chain; the task
/// interpreter surfaces the first failure verbatim and aborts the task.
#[derive(Error, Debug)]
pub enum FwForgeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Argument shape or count wrong, unknown action, out-of-range integer.
    #[error("{0}")]
    Validation(String),

    /// Referenced config section missing, hash missing or wrong length.
    #[error("{0}")]
    Config(String),

    /// Stream underrun, hash mismatch, double-write.
    #[error("{0}")]
    Resource(String),

    /// Corrupt U-Boot environment, malformed MBR config.
    #[error("{0}")]
    Format(String),

    /// Unsafe action invoked without the unsafe flag.
    #[error("{0} requires --unsafe")]
    Safety(&'static str),

    /// The error() action.
    #[error("{0}")]
    UserAbort(String),

    #[error("archive error: {0}")]
    Archive(String),

    /// No matching task had its preconditions satisfied; maps to exit
    /// code 2.
    #[error("no task matches '{0}' on this device")]
    TaskNotApplicable(String),
}

impl FwForgeError {
    pub fn validation(msg: impl Into<String>) -> Self {
        FwForgeError::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        FwForgeError::Config(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        FwForgeError::Resource(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        FwForgeError::Format(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, FwForgeError>;
