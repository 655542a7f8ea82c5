use clap::Parser;

use watchmux::cli::commands::watch::WatchArgs;
use watchmux::cli::commands::{init, serve, watch};
use watchmux::cli::{Cli, Commands};
use watchmux::{Settings, logging};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .unwrap_or_else(|e| {
        eprintln!("Configuration error: {e}");
        eprintln!("Using default configuration.");
        Settings::default()
    });

    logging::init_with_config(&config.logging);

    match cli.command {
        Commands::Init { force } => init::run_init(force),
        Commands::Config => init::run_config(&config),
        Commands::Serve => serve::run(&config).await,
        Commands::Watch {
            paths,
            ignore,
            json,
        } => watch::run(WatchArgs { paths, ignore, json }, &config).await,
    }
}
