use std::process::ExitCode;

use clap::Parser;
use log::error;

use workflow::{cli::Cli, job};

fn main() -> ExitCode {
    env_logger::init();

    let cli = Cli::parse();
    let result = match job::run_with_cmdline_args(cli) {
        Ok(result) => result,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match serde_json::to_string_pretty(&result) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("failed to render the result: {e}");
            ExitCode::FAILURE
        }
    }
}
