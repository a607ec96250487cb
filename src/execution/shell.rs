//! The interactive shell at the bottom of the sandbox

use crate::errors::{RecordError, Result};
use log::info;
use nix::unistd::execve;
use std::convert::Infallible;
use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;

/// Variable accumulating prompt prefixes across nested sessions
pub const PREFIX_VAR: &str = "RECORDSHELL_PREFIX";
const PROMPT_COMMAND_VAR: &str = "PROMPT_COMMAND";

/// The invoking user's environment, held aside while privileged setup runs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserEnvironment {
    vars: Vec<(OsString, OsString)>,
}

impl UserEnvironment {
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Snapshot the current environment and remove every variable from the process
    ///
    /// Must run before any other thread exists.
    pub fn capture_and_clear() -> Self {
        let captured = Self::from_vars(std::env::vars_os());
        for (key, _) in &captured.vars {
            // SAFETY: called at the top of main while the process is single-threaded.
            unsafe { std::env::remove_var(key) };
        }
        captured
    }

    pub fn get(&self, key: &str) -> Option<&OsStr> {
        self.vars
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_os_str())
    }

    pub fn set(&mut self, key: impl Into<OsString>, value: impl Into<OsString>) {
        let key = key.into();
        let value = value.into();
        match self.vars.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.vars.push((key, value)),
        }
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Arrange for the shell prompt to start with `prefix`
    ///
    /// Startup files usually reset `PS1`, so the prefix is applied by a one-shot
    /// `PROMPT_COMMAND` that then restores the user's own `PROMPT_COMMAND`.
    pub fn with_prompt_prefix(mut self, prefix: &str) -> Self {
        let mut accumulated = self
            .get(PREFIX_VAR)
            .map(OsStr::to_os_string)
            .unwrap_or_default();
        accumulated.push(prefix);

        let previous_command = self
            .get(PROMPT_COMMAND_VAR)
            .map(|v| v.to_string_lossy().into_owned())
            .unwrap_or_default();
        let command = format!(
            "PS1=\"${}$PS1\"; {}={}",
            PREFIX_VAR,
            PROMPT_COMMAND_VAR,
            shell_quote(&previous_command)
        );

        self.set(PREFIX_VAR, accumulated);
        self.set(PROMPT_COMMAND_VAR, command);
        self
    }

    /// `KEY=VALUE` strings for `execve`
    pub fn to_envp(&self) -> Result<Vec<CString>> {
        self.vars
            .iter()
            .map(|(k, v)| {
                let mut entry = k.as_bytes().to_vec();
                entry.push(b'=');
                entry.extend_from_slice(v.as_bytes());
                CString::new(entry).map_err(|_| {
                    RecordError::InvalidConfig(format!(
                        "environment variable {:?} contains a nul byte",
                        k
                    ))
                })
            })
            .collect()
    }
}

/// Quote a string for POSIX shells
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Replace the current process with `shell`, running with `env`
pub fn exec_shell(shell: &str, env: &UserEnvironment) -> Result<Infallible> {
    let program = CString::new(shell)
        .map_err(|_| RecordError::InvalidConfig("shell path contains a nul byte".to_string()))?;
    let envp = env.to_envp()?;

    info!("Starting shell {}", shell);
    execve(&program, &[&program], &envp)
        .map_err(|e| RecordError::Syscall(format!("execve {} failed: {}", shell, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_returns_latest_value() {
        let env = UserEnvironment::from_vars([("HOME", "/root"), ("HOME", "/home/user")]);
        assert_eq!(env.get("HOME"), Some(OsStr::new("/home/user")));
        assert_eq!(env.get("MISSING"), None);
    }

    #[test]
    fn test_set_replaces_existing() {
        let mut env = UserEnvironment::from_vars([("TERM", "xterm")]);
        env.set("TERM", "vt100");
        env.set("LANG", "C");
        assert_eq!(env.len(), 2);
        assert_eq!(env.get("TERM"), Some(OsStr::new("vt100")));
    }

    #[test]
    fn test_prompt_prefix_sets_prefix_and_command() {
        let env = UserEnvironment::from_vars([("PS1", "$ ")]).with_prompt_prefix("[record] ");

        assert_eq!(env.get(PREFIX_VAR), Some(OsStr::new("[record] ")));
        let command = env.get("PROMPT_COMMAND").unwrap().to_str().unwrap();
        assert_eq!(
            command,
            "PS1=\"$RECORDSHELL_PREFIX$PS1\"; PROMPT_COMMAND=''"
        );
        assert_eq!(env.get("PS1"), Some(OsStr::new("$ ")));
    }

    #[test]
    fn test_prompt_prefix_stacks_for_nested_sessions() {
        let env = UserEnvironment::default()
            .with_prompt_prefix("[record] ")
            .with_prompt_prefix("[record] ");
        assert_eq!(env.get(PREFIX_VAR), Some(OsStr::new("[record] [record] ")));
    }

    #[test]
    fn test_prompt_prefix_restores_user_prompt_command() {
        let env = UserEnvironment::from_vars([("PROMPT_COMMAND", "history -a; echo 'hi'")])
            .with_prompt_prefix("> ");
        let command = env.get("PROMPT_COMMAND").unwrap().to_str().unwrap();
        assert!(command.ends_with("PROMPT_COMMAND='history -a; echo '\\''hi'\\'''"));
    }

    #[test]
    fn test_envp_format() {
        let env = UserEnvironment::from_vars([("A", "1"), ("B", "x=y")]);
        let envp = env.to_envp().unwrap();
        assert_eq!(envp[0].to_str().unwrap(), "A=1");
        assert_eq!(envp[1].to_str().unwrap(), "B=x=y");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
