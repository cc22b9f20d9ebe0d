//! Uplink CLI
//!
//! Command-line tools for the uplink engine.
//!
//! # Commands
//!
//! - `config` - Validate a configuration file and show the effective settings
//! - `simulate` - Run an uplink against the reference service
//! - `classify` - Show how transport failures are classified

mod commands;

use clap::{Parser, Subcommand};
use commands::simulate::SimulateArgs;
use commands::Format;
use std::path::PathBuf;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;
use uplink_engine::RemoteLog;
use uplink_testkit::Channel;

/// Uplink engine command-line tools.
#[derive(Parser)]
#[command(name = "uplink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(global = true, short, long, default_value = "text")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and show the effective settings
    Config {
        /// Path to the JSON configuration
        file: PathBuf,
    },

    /// Run an uplink against the reference service
    Simulate {
        /// Channel (http, pubsub, store-forward)
        #[arg(short, long, default_value = "http")]
        channel: Channel,

        /// JSON simulation plan
        #[arg(short, long)]
        plan: Option<PathBuf>,

        /// JSON uplink configuration
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of ticks to run
        #[arg(short, long)]
        ticks: Option<u32>,

        /// Number of feeds to publish
        #[arg(long)]
        feeds: Option<usize>,

        /// Inject a fault before a tick, as TICK:FAULT (repeatable)
        #[arg(long = "fault")]
        faults: Vec<String>,

        /// Take the service offline, as START:LENGTH in ticks
        #[arg(long)]
        outage: Option<String>,

        /// Service write budget per minute
        #[arg(long)]
        write_limit: Option<u32>,

        /// Forward engine warnings to this feed
        #[arg(long)]
        log_feed: Option<String>,
    },

    /// Show how transport failures are classified
    Classify,

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging; stdout carries command output
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    let remote_log = RemoteLog::for_target("uplink_engine");
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .with(remote_log.layer())
        .init();

    let format = Format::parse(&cli.format)?;
    match cli.command {
        Commands::Config { file } => commands::config::run(&file, format)?,
        Commands::Simulate {
            channel,
            plan,
            config,
            ticks,
            feeds,
            faults,
            outage,
            write_limit,
            log_feed,
        } => {
            let args = SimulateArgs {
                channel,
                plan,
                config,
                ticks,
                feeds,
                faults,
                outage,
                write_limit,
                log_feed,
                log: Some(remote_log),
            };
            commands::simulate::run(&args, format)?;
        }
        Commands::Classify => commands::classify::run(format)?,
        Commands::Version => {
            println!("Uplink CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Uplink engine v{}", uplink_engine::VERSION);
        }
    }

    Ok(())
}
