use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ToolError>;

/// Failure of a single command run through the host runner.
///
/// Every variant renders starting with `Error`, so text-only consumers such as
/// prompt history and chat replies can still tell failures apart.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Error: Host '{0}' not found in configuration.")]
    HostNotFound(String),

    #[error("Error (Status {status}): {stderr}")]
    CommandFailed { status: i32, stderr: String },

    #[error("Error: SSH connection to {host} failed: {reason}")]
    ConnectionFailed { host: String, reason: String },

    #[error("Error: command timed out after {0}s")]
    TimedOut(u64),

    #[error("Error: {0}")]
    Io(String),
}

#[derive(Debug, Error)]
pub enum HostConfigError {
    #[error("read hosts file {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("parse hosts file: {0}")]
    Parse(String),

    #[error("invalid host {name:?}: {reason}")]
    Invalid { name: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ToolError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
