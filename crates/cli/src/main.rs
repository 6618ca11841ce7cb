mod app;
mod args;
mod encoder;
mod logging;
mod prompt;

use crate::args::{Cli, Commands};
use anyhow::Result;
use clap::Parser;
use tracing::error;

fn main() {
    let cli = Cli::parse();
    let quiet = match &cli.command {
        Commands::Inspect(args) => args.quiet,
    };
    logging::init(quiet);
    if let Err(err) = try_run(cli) {
        error!(error = %err, "CLI failed");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn try_run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Inspect(args) => app::run_inspect(args),
    }
}
