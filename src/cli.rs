//! Command line interface of the `recordshell` binary

use crate::errors::{RecordError, Result};
use clap::Parser;
use std::ffi::OsString;

const PROGRAM: &str = "recordshell";

#[derive(Parser, Debug)]
#[command(name = "recordshell")]
#[command(version, about = "Run a shell whose DNS and TCP traffic is recorded", long_about = None)]
#[command(after_help = "EXAMPLES:
    sudo recordshell ./recording
    sudo recordshell -v /tmp/session/
")]
pub struct Cli {
    /// Folder for recorded content (created if missing)
    #[arg(value_name = "FOLDER", num_args = 0..)]
    pub folders: Vec<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    /// Parse `args` (including the program name) into a validated invocation
    ///
    /// Exactly one folder must be given; anything else is a usage error.
    /// Help and version requests surface as clap errors for the caller to print.
    pub fn parse_args<I, T>(args: I) -> std::result::Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Self::try_parse_from(args)
    }

    /// The single storage folder, or a usage error naming the expected form
    pub fn folder(&self) -> Result<&str> {
        match self.folders.as_slice() {
            [folder] => Ok(folder),
            _ => Err(usage_error()),
        }
    }
}

pub fn usage_error() -> RecordError {
    RecordError::Usage(format!("{} folder_for_recorded_content", PROGRAM))
}
