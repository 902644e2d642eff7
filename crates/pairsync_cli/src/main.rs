//! pairsync CLI
//!
//! Developer tools around the pairsync engine.
//!
//! # Commands
//!
//! - `simulate` - Run a randomized producer/consumer session over lossy lanes
//! - `dump-spool` - List the envelopes waiting in a durable spool
//! - `decode` - Print a CBOR envelope file as JSON

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// pairsync developer tools.
#[derive(Parser)]
#[command(name = "pairsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a randomized two-device session and report convergence
    Simulate {
        /// RNG seed (random if omitted)
        #[arg(short, long)]
        seed: Option<u64>,

        /// Number of distinct records
        #[arg(short, long, default_value = "20")]
        records: usize,

        /// Number of local edits on the producer
        #[arg(short, long, default_value = "100")]
        edits: usize,

        /// Probability that a lane loses a message (0.0 - 1.0)
        #[arg(short, long, default_value = "0.3")]
        loss: f64,

        /// Drain rounds allowed after the last edit
        #[arg(long, default_value = "200")]
        max_rounds: usize,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List the envelopes waiting in a durable spool
    DumpSpool {
        /// Spool directory
        dir: PathBuf,

        /// Maximum number of entries to show
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print a CBOR envelope file as JSON
    Decode {
        /// Envelope file
        file: PathBuf,

        /// Also validate the envelope as a sync message
        #[arg(long)]
        check: bool,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Simulate {
            seed,
            records,
            edits,
            loss,
            max_rounds,
            format,
        } => {
            if !(0.0..1.0).contains(&loss) {
                return Err("loss must be at least 0.0 and below 1.0".into());
            }
            let options = commands::simulate::Options {
                seed,
                records: records.max(1),
                edits,
                loss,
                max_rounds,
            };
            let converged = commands::simulate::run(options, &format)?;
            if !converged {
                return Err("devices did not converge".into());
            }
        }
        Commands::DumpSpool { dir, limit, format } => {
            commands::dump_spool::run(&dir, limit, &format)?;
        }
        Commands::Decode { file, check } => {
            commands::decode::run(&file, check)?;
        }
        Commands::Version => {
            println!("pairsync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("pairsync engine v{}", pairsync_engine::VERSION);
            println!("protocol schema v{}", pairsync_protocol::PROTOCOL_VERSION);
        }
    }

    Ok(())
}
