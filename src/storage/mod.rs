//! Storage layer: the directory recorded traffic is written to
//!
//! # Examples
//!
//! ```ignore
//! use recordshell::storage::StorageDirectory;
//!
//! let storage = StorageDirectory::new("out")?;
//! assert_eq!(storage.path(), "out/");
//! storage.ensure_exists()?;
//! ```

pub mod directory;
pub mod records;
pub use directory::StorageDirectory;
pub use records::TrafficRecord;
