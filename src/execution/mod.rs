//! Execution layer: supervised processes and the user's shell
//!
//! Every process in a recording session runs one [`Supervisor`], which forks
//! children, waits for them, handles termination signals and dispatches I/O
//! readiness to registered handlers.
//!
//! # Features
//!
//! - **Supervision**: fork-based children with fail-fast exit propagation
//! - **Event loop**: signalfd plus poll over registered [`IoSource`]s
//! - **Shell launch**: prompt prefixing and exec with the saved environment
//!
//! # Examples
//!
//! ```ignore
//! use recordshell::execution::Supervisor;
//!
//! let mut supervisor = Supervisor::new()?;
//! supervisor.add_child_process("worker", || Ok(0))?;
//! let status = supervisor.run()?;
//! ```

pub mod process;
pub mod shell;
pub mod supervisor;
pub use process::{ChildProcess, exit_code, run_child_body};
pub use shell::{UserEnvironment, exec_shell};
pub use supervisor::{Flow, IoSource, Registrar, Supervisor};
