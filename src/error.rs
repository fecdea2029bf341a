use std::process::ExitCode;

/// Errors that cause osoba to exit with a specific code.
#[derive(Debug, thiserror::Error)]
pub enum ExitError {
    #[error("config error: {0}")]
    Config(String),

    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("{tool} failed (exit {code}): {message}")]
    ToolFailed {
        tool: String,
        code: i32,
        message: String,
    },

    #[error("{tool} timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("osoba is already running for this repository (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("osoba is not running for this repository")]
    NotRunning,

    #[error("preflight failed: {0}")]
    Preflight(String),

    #[error("{0}")]
    Other(String),
}

impl ExitError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ExitError::Config(_) => ExitCode::from(2),
            ExitError::ToolNotFound { .. } => ExitCode::from(3),
            ExitError::ToolFailed { .. } => ExitCode::from(4),
            ExitError::Timeout { .. } => ExitCode::from(5),
            ExitError::AlreadyRunning { .. } => ExitCode::from(6),
            ExitError::NotRunning => ExitCode::from(7),
            ExitError::Preflight(_) => ExitCode::from(8),
            ExitError::Other(_) => ExitCode::from(1),
        }
    }
}
