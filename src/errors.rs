//! Error types for recording sessions

use std::io;
use thiserror::Error;

/// Result type for recordshell operations
pub type Result<T> = std::result::Result<T, RecordError>;

/// Errors that can occur while setting up or running a recording session
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("{0}")]
    Usage(String),

    #[error("no free private subnet after {probes} probes starting at octet {start}")]
    AllocationExhausted { start: u16, probes: u16 },

    #[error("{0}")]
    Device(String),

    #[error("rule already installed: {0}")]
    RuleConflict(String),

    #[error("{0}")]
    Privilege(String),

    #[error("child process {pid} exited with status {status}")]
    ChildProcessFailure { pid: i32, status: i32 },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Syscall(String),

    #[error("{0}")]
    Storage(String),

    #[error("{0}")]
    Proxy(String),

    #[error("{0}")]
    Requirement(String),

    #[error("{0}")]
    InvalidConfig(String),

    #[error("{0}")]
    SetupOrder(String),
}

impl RecordError {
    /// Short category printed at the program boundary
    pub fn category(&self) -> &'static str {
        match self {
            RecordError::Usage(_) => "Usage",
            RecordError::AllocationExhausted { .. } => "AllocationExhausted",
            RecordError::Device(_) => "DeviceError",
            RecordError::RuleConflict(_) => "RuleConflict",
            RecordError::Privilege(_) => "PrivilegeError",
            RecordError::ChildProcessFailure { .. } => "ChildProcessFailure",
            RecordError::Io(_) => "IO",
            RecordError::Syscall(_) => "Syscall",
            RecordError::Storage(_) => "Storage",
            RecordError::Proxy(_) => "Proxy",
            RecordError::Requirement(_) => "Requirement",
            RecordError::InvalidConfig(_) => "InvalidConfig",
            RecordError::SetupOrder(_) => "SetupOrder",
        }
    }
}

/// Map a nix errno into a `Syscall` error with context
pub(crate) fn syscall(context: &str) -> impl FnOnce(nix::errno::Errno) -> RecordError + '_ {
    move |errno| RecordError::Syscall(format!("{} failed: {}", context, errno))
}
