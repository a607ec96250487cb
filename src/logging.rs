//! Terminal logging and fatal error reporting

use crate::errors::RecordError;
use console::style;
use env_logger::{Builder, Env};
use log::{Level, LevelFilter};
use std::io::Write;

/// Initialize logger based on verbose flag
///
/// `RUST_LOG` still overrides the default filter. Must be called before the
/// environment is cleared.
pub fn init_logger(verbose: bool) {
    let env = Env::default().filter_or("RUST_LOG", if verbose { "debug" } else { "warn" });

    let _ = Builder::from_env(env)
        .format(|buf, record| {
            let level = match record.level() {
                Level::Error => format!("{}", style("ERROR").red().bold()),
                Level::Warn => format!("{}", style("WARN ").yellow().bold()),
                Level::Info => format!("{}", style("INFO ").green()),
                Level::Debug => format!("{}", style("DEBUG").cyan()),
                Level::Trace => format!("{}", style("TRACE").dim()),
            };
            writeln!(
                buf,
                "{} [{}] {}",
                level,
                std::process::id(),
                record.args()
            )
        })
        .filter_level(if verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        })
        .try_init();
}

/// Render a fatal error the way it is printed on stderr
pub fn format_error(err: &RecordError) -> String {
    match err {
        RecordError::Usage(usage) => format!("Usage: {}", usage),
        other => format!("{}: {}", other.category(), other),
    }
}

/// Print a fatal error on stderr
pub fn report_error(err: &RecordError) {
    eprintln!("{} {}", style("error:").red().bold(), format_error(err));
}
