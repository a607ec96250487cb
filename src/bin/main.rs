//! recordshell: run a shell whose network traffic is recorded

use clap::error::ErrorKind;
use log::{debug, warn};
use recordshell::cli::{Cli, usage_error};
use recordshell::logging::{init_logger, report_error};
use recordshell::{RecordShellBuilder, Result, UserEnvironment};

fn main() {
    let cli = match Cli::parse_args(std::env::args_os()) {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return;
        }
        Err(_) => {
            report_error(&usage_error());
            std::process::exit(1);
        }
    };

    init_logger(cli.verbose);

    match run(&cli) {
        Ok(0) => {}
        Ok(status) => std::process::exit(status),
        Err(e) => {
            report_error(&e);
            std::process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> Result<i32> {
    let folder = cli.folder()?;
    let environment = UserEnvironment::capture_and_clear();
    if environment.is_empty() {
        warn!("Started with an empty environment; the shell gets no HOME or PATH");
    } else {
        debug!("Captured {} environment variables", environment.len());
    }

    let mut session = RecordShellBuilder::new(folder).build(environment)?;
    session.run()
}
