//! Seam between kernel-state manipulation and the host tools that perform it
//!
//! Device, address, route and netfilter changes go through `ip` and `iptables`.
//! Everything that issues such a command takes a [`CommandRunner`] so the exact
//! command sequence can be observed without touching the host.

use log::debug;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

const SYSTEM_DIRS: &[&str] = &["/usr/sbin", "/sbin", "/usr/bin", "/bin"];
const SYSTEM_PATH: &str = "/usr/sbin:/usr/bin:/sbin:/bin";

/// Outcome of a host command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok() -> Self {
        Self {
            success: true,
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stderr: stderr.into(),
        }
    }
}

/// Executes host networking commands
pub trait CommandRunner {
    /// Run `argv[0]` with the remaining arguments
    fn execute(&self, argv: &[String]) -> io::Result<CommandOutput>;

    /// Run a command that must succeed; failures carry the command line and stderr
    fn run(&self, argv: &[String]) -> std::result::Result<(), String> {
        let output = self
            .execute(argv)
            .map_err(|e| format!("`{}` could not be started: {}", argv.join(" "), e))?;
        if output.success {
            Ok(())
        } else {
            Err(format!(
                "`{}` failed: {}",
                argv.join(" "),
                output.stderr.trim()
            ))
        }
    }
}

/// Runs commands on the host with a fixed, minimal environment
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }

    /// Resolve a tool name against the system directories
    ///
    /// The caller's environment is cleared before setup, so `PATH` cannot be trusted
    /// to exist.
    pub fn locate(tool: &str) -> PathBuf {
        SYSTEM_DIRS
            .iter()
            .map(|dir| Path::new(dir).join(tool))
            .find(|candidate| candidate.is_file())
            .unwrap_or_else(|| PathBuf::from(tool))
    }
}

impl CommandRunner for SystemRunner {
    fn execute(&self, argv: &[String]) -> io::Result<CommandOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;

        debug!("exec: {}", argv.join(" "));

        let output = Command::new(Self::locate(program))
            .args(args)
            .env_clear()
            .env("PATH", SYSTEM_PATH)
            .output()?;

        Ok(CommandOutput {
            success: output.status.success(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Build an argv from string slices
pub fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}
