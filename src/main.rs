use clap::Parser;
use std::process::ExitCode;
use trapsort::cli::{self, Cli};
use trapsort::logging;
use trapsort::output::OutputFormatter;

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli::run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            OutputFormatter::error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}
