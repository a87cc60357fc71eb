//! VoltStream CLI
//!
//! One entry point for an analytics environment:
//! - `deploy` provisions stores, lands demo feeds, builds projections and the
//!   knowledge index, and writes the agent spec
//! - `run` drives the deployed pipeline (`main`, `test`, `status`, `dashboard-url`)
//! - `clean` tears the environment down
//! - `landing`, `transform`, `project`, `index`, `ask`, `verify` expose each
//!   component on its own

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use voltstream_storage::Operation;

mod commands;
mod config;
mod deploy;
mod environment;
mod steps;

use commands::AppendArgs;
use config::{Component, DeployConfig, EnvArgs};

#[derive(Parser)]
#[command(name = "voltstream")]
#[command(author, version, about = "VoltStream: manufacturing analytics pipeline")]
struct Cli {
    #[command(flatten)]
    env: EnvArgs,
    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the environment step by step.
    ///
    /// Steps: connectivity, infrastructure, data, notebook, dashboard,
    /// search, agent. A connectivity failure stops the run; any other
    /// failing step is reported and the rest still run.
    Deploy {
        /// Do not land the demo feeds
        #[arg(long)]
        skip_data: bool,
        /// Run only one component
        #[arg(long, value_enum)]
        only: Option<Component>,
        /// Directory of `*.jsonl` landing feeds
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Directory of `.md` / `.txt` documents
        #[arg(long)]
        docs_dir: Option<PathBuf>,
    },

    /// Operate a deployed environment.
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },

    /// Remove every resource of the environment.
    Clean {
        /// Skip the confirmation prompt
        #[arg(long, short = 'y', alias = "yes")]
        force: bool,
    },

    /// Landing store commands.
    Landing {
        #[command(subcommand)]
        command: LandingCommands,
    },

    /// Apply landed changes to history (one incremental run).
    Transform {
        /// Process at most this many keys; the next run resumes after the last one
        #[arg(long)]
        max_keys: Option<usize>,
        /// Worker threads (overrides the config)
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Print one projection as JSON, or refresh all of them.
    Project {
        #[arg(long)]
        name: Option<String>,
    },

    /// Knowledge index commands.
    Index {
        #[command(subcommand)]
        command: IndexCommands,
    },

    /// Ask the operations agent a question.
    Ask {
        question: String,
        /// Print the full reply with sub-queries as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check history invariants for every key.
    Verify,
}

#[derive(Subcommand)]
enum RunCommands {
    /// Transform then refresh projections
    Main,
    /// Run every registered query with a row-count check
    Test,
    /// Show stores, watermark, index and agent state
    Status,
    /// Print the local URL of the projections
    DashboardUrl,
}

#[derive(Subcommand)]
enum LandingCommands {
    /// Append one record
    Append {
        #[arg(long)]
        entity: String,
        #[arg(long)]
        key: String,
        #[arg(long, value_enum, default_value = "insert")]
        op: OpArg,
        #[arg(long)]
        sequence: u64,
        #[arg(long, default_value = "cli")]
        source: String,
        /// Attribute payload as a JSON object
        #[arg(long)]
        payload: Option<String>,
        /// RFC 3339 load time (default: now)
        #[arg(long)]
        load_time: Option<String>,
    },
    /// Append every record of a JSON-lines file
    Load { file: PathBuf },
    /// Print landing statistics as JSON
    Stats,
}

#[derive(Subcommand)]
enum IndexCommands {
    /// Index every document under a directory
    Load { dir: PathBuf },
    /// Ranked passages for free text
    Search {
        text: String,
        /// Attribute equality filter, `name=value` (repeatable)
        #[arg(long = "filter", value_parser = commands::parse_filter)]
        filters: Vec<(String, String)>,
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OpArg {
    Insert,
    Update,
    Delete,
}

impl From<OpArg> for Operation {
    fn from(op: OpArg) -> Self {
        match op {
            OpArg::Insert => Operation::Insert,
            OpArg::Update => Operation::Update,
            OpArg::Delete => Operation::Delete,
        }
    }
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let mut config = DeployConfig::resolve(&cli.env)?;

    match cli.command {
        Commands::Deploy {
            skip_data,
            only,
            data_dir,
            docs_dir,
        } => {
            config.skip_data |= skip_data;
            if let Some(only) = only {
                config.only = only;
            }
            if let Some(dir) = data_dir {
                config.data_dir = dir;
            }
            if let Some(dir) = docs_dir {
                config.docs_dir = dir;
            }
            deploy::deploy(&config)?;
            eprintln!("{} deployed {}", "ok".green().bold(), config.prefix);
        }
        Commands::Run { command } => match command {
            RunCommands::Main => commands::run_main(&config)?,
            RunCommands::Test => commands::run_test(&config)?,
            RunCommands::Status => commands::run_status(&config)?,
            RunCommands::DashboardUrl => commands::run_dashboard_url(&config)?,
        },
        Commands::Clean { force } => {
            let force = force || config.force;
            commands::clean(&config, force, &mut io::stdin().lock())?;
        }
        Commands::Landing { command } => match command {
            LandingCommands::Append {
                entity,
                key,
                op,
                sequence,
                source,
                payload,
                load_time,
            } => commands::landing_append(
                &config,
                AppendArgs {
                    source: &source,
                    entity: &entity,
                    key: &key,
                    operation: op.into(),
                    sequence,
                    payload: payload.as_deref(),
                    load_time: load_time.as_deref(),
                },
            )?,
            LandingCommands::Load { file } => commands::landing_load(&config, &file)?,
            LandingCommands::Stats => commands::landing_stats(&config)?,
        },
        Commands::Transform { max_keys, workers } => {
            if let Some(workers) = workers {
                config.pipeline.workers = workers;
            }
            commands::transform(&config, max_keys)?;
        }
        Commands::Project { name } => commands::project(&config, name.as_deref())?,
        Commands::Index { command } => match command {
            IndexCommands::Load { dir } => commands::index_load(&config, &dir)?,
            IndexCommands::Search {
                text,
                filters,
                limit,
            } => commands::index_search(&config, &text, &filters, limit)?,
        },
        Commands::Ask { question, json } => commands::ask(&config, &question, json)?,
        Commands::Verify => commands::verify(&config)?,
    }
    Ok(())
}
