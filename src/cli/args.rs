//! CLI argument parsing using clap.

use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use std::path::PathBuf;

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Multiplexing file watcher
#[derive(Parser)]
#[command(
    name = "watchmux",
    version = env!("CARGO_PKG_VERSION"),
    about = "Multiplexing file watcher",
    long_about = "Serve many watch clients from one native file watcher.",
    next_line_help = true,
    styles = clap_cargo_style(),
    after_help = "Examples:\n  watchmux serve\n  watchmux watch src --ignore '**/target'\n  watchmux watch . --json\n  WATCHMUX_WATCHER__COALESCE_MS=0 watchmux watch ."
)]
pub struct Cli {
    /// Path to custom settings.toml file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Speak the watcher protocol as newline-delimited JSON on stdin/stdout
    #[command(about = "Serve watch requests over stdio")]
    Serve,

    /// Watch paths and print changes until interrupted
    #[command(about = "Watch paths and print changes")]
    Watch {
        /// Files or directories to watch
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,

        /// Glob pattern to ignore (repeatable)
        #[arg(short, long = "ignore", value_name = "GLOB")]
        ignore: Vec<String>,

        /// Print each batch as a JSON line
        #[arg(long)]
        json: bool,
    },

    /// Show the effective configuration
    #[command(about = "Display active settings")]
    Config,

    /// Write a default configuration file
    #[command(about = "Create .watchmux/settings.toml with default values")]
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },
}
