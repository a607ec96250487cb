//! One-shot privilege drop for processes that handle untrusted input
//!
//! The privilege tag is per process. A forked child starts with a copy of its
//! parent's tag, so the orchestrator (which never drops) hands every child an
//! elevated tag, and each child may drop exactly once.

use crate::errors::{RecordError, Result, syscall};
use crate::execution::UserEnvironment;
use log::{debug, info};
use nix::unistd::{Gid, Uid, User, setgroups, setresgid, setresuid};
use std::sync::atomic::{AtomicU8, Ordering};

const UNKNOWN: u8 = 0;
const ELEVATED: u8 = 1;
const DROPPED: u8 = 2;
const NEVER_ELEVATED: u8 = 3;
const DROPPING: u8 = 4;
const FAILED: u8 = 5;

const NOBODY: u32 = 65534;

static STATE: AtomicU8 = AtomicU8::new(UNKNOWN);

/// Privilege tag of the calling process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeState {
    Elevated,
    Restricted,
    /// A drop was attempted and did not complete; the identity is unknown
    Failed,
}

fn raw_state() -> u8 {
    let current = STATE.load(Ordering::SeqCst);
    if current != UNKNOWN {
        return current;
    }

    let initial = if nix::unistd::geteuid().is_root() {
        ELEVATED
    } else {
        NEVER_ELEVATED
    };
    match STATE.compare_exchange(UNKNOWN, initial, Ordering::SeqCst, Ordering::SeqCst) {
        Ok(_) => initial,
        Err(actual) => actual,
    }
}

/// Identity a process switches to when it drops privileges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// The user who invoked the program
    ///
    /// A setuid-root invocation keeps the caller's real ids. When the real uid
    /// is root, the ids `sudo` recorded in the captured environment are used,
    /// and `nobody` otherwise.
    pub fn for_invoker(env: &UserEnvironment) -> Self {
        let uid = nix::unistd::getuid().as_raw();
        let gid = nix::unistd::getgid().as_raw();
        if uid != 0 {
            return Self { uid, gid };
        }

        let sudo_id = |key: &str| {
            env.get(key)
                .and_then(|value| value.to_str())
                .and_then(|value| value.parse::<u32>().ok())
        };
        if let (Some(uid), Some(gid)) = (sudo_id("SUDO_UID"), sudo_id("SUDO_GID")) {
            return Self { uid, gid };
        }

        match User::from_name("nobody") {
            Ok(Some(user)) => Self {
                uid: user.uid.as_raw(),
                gid: user.gid.as_raw(),
            },
            _ => Self {
                uid: NOBODY,
                gid: NOBODY,
            },
        }
    }
}

/// Claim the one drop this process gets, run `switch`, and tag the outcome
///
/// The tag only reads `Restricted` once `switch` has succeeded; a failed
/// switch leaves `Failed`, which refuses any further attempt.
fn apply_once<F>(switch: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    match raw_state() {
        ELEVATED => {}
        DROPPED => {
            return Err(RecordError::Privilege(
                "privileges were already dropped in this process".to_string(),
            ));
        }
        DROPPING | FAILED => {
            return Err(RecordError::Privilege(
                "an earlier privilege drop did not complete".to_string(),
            ));
        }
        _ => {
            return Err(RecordError::Privilege(
                "process never held elevated privileges".to_string(),
            ));
        }
    }

    if STATE
        .compare_exchange(ELEVATED, DROPPING, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Err(RecordError::Privilege(
            "privileges were already dropped in this process".to_string(),
        ));
    }

    match switch() {
        Ok(()) => {
            STATE.store(DROPPED, Ordering::SeqCst);
            Ok(())
        }
        Err(e) => {
            STATE.store(FAILED, Ordering::SeqCst);
            Err(e)
        }
    }
}

/// Transition from elevated to restricted for the calling process
#[derive(Debug, Clone, Copy)]
pub struct PrivilegeBoundary {
    target: Credentials,
}

impl PrivilegeBoundary {
    pub fn new(target: Credentials) -> Self {
        Self { target }
    }

    pub fn target(&self) -> Credentials {
        self.target
    }

    /// Privilege tag of the calling process
    pub fn state() -> PrivilegeState {
        match raw_state() {
            ELEVATED => PrivilegeState::Elevated,
            DROPPED | NEVER_ELEVATED => PrivilegeState::Restricted,
            _ => PrivilegeState::Failed,
        }
    }

    /// Switch the calling process to the target identity, irreversibly
    pub fn drop_privileges(&self) -> Result<()> {
        if self.target.uid == 0 {
            return Err(RecordError::Privilege(
                "refusing to drop privileges to uid 0".to_string(),
            ));
        }

        let uid = Uid::from_raw(self.target.uid);
        let gid = Gid::from_raw(self.target.gid);
        apply_once(|| {
            setgroups(&[gid]).map_err(syscall("setgroups"))?;
            setresgid(gid, gid, gid).map_err(syscall("setresgid"))?;
            setresuid(uid, uid, uid).map_err(syscall("setresuid"))?;

            if setresuid(Uid::from_raw(0), Uid::from_raw(0), Uid::from_raw(0)).is_ok() {
                return Err(RecordError::Privilege(
                    "root privileges could be regained after dropping them".to_string(),
                ));
            }
            Ok(())
        })?;

        info!(
            "Dropped privileges to uid {} gid {}",
            self.target.uid, self.target.gid
        );
        debug!("pid {} is now restricted", std::process::id());
        Ok(())
    }
}
