//! parley CLI, the main entry point.
//!
//! Commands:
//! - `init`: write a default config and sample flows
//! - `validate`: load and check flow files
//! - `inspect`: list flows, vocabulary, and compiled programs
//! - `chat`: talk to the flows interactively
//! - `replay`: run a scripted conversation and print the transcript

use clap::{Args, Parser, Subcommand};
use parley_config::LoggingConfig;
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(
    name = "parley",
    about = "parley: a conversational-flow runtime",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ~/.parley/config.toml)
    #[arg(short, long, global = true, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct FlowArgs {
    /// Flow files to load instead of `[flows].paths`
    #[arg(short, long = "flows", value_name = "FILE")]
    flows: Vec<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config.toml and a sample flows.toml
    Init {
        /// Target directory (defaults to ~/.parley)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Overwrite existing files
        #[arg(long)]
        force: bool,
    },

    /// Load and validate flow definitions
    Validate {
        #[command(flatten)]
        flows: FlowArgs,
    },

    /// List flows, their parameters, and the event vocabulary
    Inspect {
        #[command(flatten)]
        flows: FlowArgs,

        /// Also print each flow's compiled program
        #[arg(long)]
        program: bool,
    },

    /// Chat with the flows on stdin
    Chat {
        #[command(flatten)]
        flows: FlowArgs,

        /// Root flows to activate (defaults to `[flows].main`)
        #[arg(short, long)]
        main: Vec<String>,
    },

    /// Replay a scripted conversation
    Replay {
        /// Script: one user utterance, JSON event, or `{"wait": secs}` per line
        script: PathBuf,

        #[command(flatten)]
        flows: FlowArgs,

        /// Root flows to activate (defaults to `[flows].main`)
        #[arg(short, long)]
        main: Vec<String>,

        /// Print emitted events as JSON lines
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Commands::Init { dir, force } = &cli.command {
        init_logging(&LoggingConfig::default(), cli.verbose);
        return commands::init::run(dir.clone(), *force);
    }

    let config = commands::load_config(cli.config.as_deref())?;
    init_logging(&config.logging, cli.verbose);

    match cli.command {
        Commands::Init { .. } => {}
        Commands::Validate { flows } => commands::validate::run(&config, &flows.flows)?,
        Commands::Inspect { flows, program } => {
            commands::inspect::run(&config, &flows.flows, program)?
        }
        Commands::Chat { flows, main } => commands::chat::run(&config, &flows.flows, main).await?,
        Commands::Replay {
            script,
            flows,
            main,
            json,
        } => commands::replay::run(&config, &flows.flows, main, &script, json).await?,
    }

    Ok(())
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
