//! agent-mail - SQLite-backed mailbox for coordinating agents.

use std::process::ExitCode;

use clap::Parser;

use agent_mail::{logging, Commands, Config};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Commands::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Flushes the log file on drop.
    let _guard = match logging::init(&config.log_dir()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match args.run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
