//! `flowreg-session`: launch flowreg session runs locally or on a Slurm
//! cluster over SSH.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use flowreg_session_controller::ControllerError;
use flowreg_session_core::TransportError;
use flowreg_session_slurm::PipelineStage;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod settings;

#[derive(Parser, Debug)]
#[command(name = "flowreg-session")]
#[command(version)]
#[command(about = "Configure and launch flowreg session runs locally or on a Slurm cluster.", long_about = None)]
struct Cli {
    /// Settings file (default: <config dir>/flowreg-session/settings.toml)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// SSH host alias, overriding settings
    #[arg(long, global = true)]
    host: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Test the SSH connection to the cluster
    Check,

    /// Prepare a run bundle for a session config and upload it
    Upload {
        /// Session config (.yaml, .yml or .toml)
        config: PathBuf,
    },

    /// Submit the uploaded run (stage 1 array, then dependent stage 2+3)
    Submit,

    /// Show scheduler status of the submitted jobs
    Status,

    /// Poll until the submitted jobs finish
    Watch {
        /// Seconds between polls (default from settings)
        #[arg(long)]
        interval: Option<u64>,
        /// Give up after this many seconds (default from settings)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Show the tail of the newest Slurm log in the run directory
    Logs {
        #[arg(short = 'n', long, default_value_t = 200)]
        lines: u32,
    },

    /// Cancel jobs (default: the submitted run's jobs)
    Cancel {
        job_ids: Vec<String>,
    },

    /// Check, upload, submit, and watch in one go
    Run {
        config: PathBuf,
        #[arg(long)]
        interval: Option<u64>,
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Forget the remembered run (remote files and jobs are kept)
    Forget,

    /// List remote directories (default: below the remote base directory)
    Browse {
        /// List the immediate children of this directory instead
        dir: Option<String>,
        #[arg(long, default_value_t = 2)]
        depth: u32,
        #[arg(long, default_value_t = 200)]
        limit: u32,
    },

    /// Run pipeline stages on this machine
    Local {
        config: PathBuf,
        #[arg(long, value_enum, default_value_t = StageArg::All)]
        stage: StageArg,
    },

    /// Session config utilities
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Load and validate a session config
    Validate { config: PathBuf },
    /// Print a session config as YAML
    Show {
        config: PathBuf,
        /// Print as uploaded: paths translated through the settings' mappings
        #[arg(long)]
        mapped: bool,
    },
    /// Convert a session config to YAML
    Save {
        input: PathBuf,
        output: PathBuf,
        /// Keep absolute paths instead of paths relative to `root`
        #[arg(long)]
        absolute: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StageArg {
    All,
    Stage1,
    Stage2,
    Stage3,
}

impl From<StageArg> for PipelineStage {
    fn from(stage: StageArg) -> Self {
        match stage {
            StageArg::All => Self::All,
            StageArg::Stage1 => Self::Stage1,
            StageArg::Stage2 => Self::Stage2,
            StageArg::Stage3 => Self::Stage3,
        }
    }
}

/// Hint for errors the user can fix from a terminal.
fn hint(err: &anyhow::Error) -> Option<String> {
    err.chain().find_map(|cause| {
        cause
            .downcast_ref::<ControllerError>()
            .and_then(ControllerError::hint)
            .or_else(|| cause.downcast_ref::<TransportError>().and_then(TransportError::hint))
    })
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = dispatch(cli).await {
        eprintln!("Error: {err:#}");
        if let Some(hint) = hint(&err) {
            eprintln!("\n{hint}");
        }
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let mut settings = settings::Settings::load(cli.settings.as_deref())?;
    if let Some(host) = cli.host {
        settings.remote.host_alias = host;
    }

    match cli.command {
        Command::Check => commands::check(&settings).await,
        Command::Upload { config } => commands::upload(&settings, &config).await,
        Command::Submit => commands::submit(&settings).await,
        Command::Status => commands::status(&settings).await,
        Command::Watch { interval, timeout } => {
            commands::watch(&settings, interval, timeout).await
        }
        Command::Logs { lines } => commands::logs(&settings, lines).await,
        Command::Cancel { job_ids } => commands::cancel(&settings, &job_ids).await,
        Command::Run {
            config,
            interval,
            timeout,
        } => commands::run(&settings, &config, interval, timeout).await,
        Command::Forget => commands::forget(&settings).await,
        Command::Browse { dir, depth, limit } => {
            commands::browse(&settings, dir.as_deref(), depth, limit).await
        }
        Command::Local { config, stage } => {
            commands::local(&settings, &config, stage.into()).await
        }
        Command::Config { command } => match command {
            ConfigCommand::Validate { config } => commands::config_validate(&config).await,
            ConfigCommand::Show { config, mapped } => {
                commands::config_show(&settings, &config, mapped).await
            }
            ConfigCommand::Save {
                input,
                output,
                absolute,
            } => commands::config_save(&input, &output, !absolute).await,
        },
    }
}
