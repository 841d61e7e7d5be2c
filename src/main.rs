//! cloud-init-core - instance bring-up from merged cloud-config
//!
//! One stage per invocation at boot (`local`, `network`, `config`,
//! `final`), or `init` to run them all in order.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cloud_init_core::config::cmdline::read_cmdline;
use cloud_init_core::stages::ModuleOutcome;
use cloud_init_core::state::paths::{CLOUD_DIR, CONFIG_DIR, RUN_DIR};
use cloud_init_core::state::{CloudPaths, Frequency};
use cloud_init_core::{Boot, Stage};

#[derive(Parser)]
#[command(name = "cloud-init-core")]
#[command(author, version, about = "Instance bring-up: config merging, module scheduling and first-boot detection", long_about = None)]
struct Cli {
    /// Enable verbose output (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// State directory
    #[arg(long, env = "CLOUD_INIT_DIR", default_value = CLOUD_DIR, global = true)]
    cloud_dir: PathBuf,

    /// System configuration directory
    #[arg(long, env = "CLOUD_INIT_CONFIG_DIR", default_value = CONFIG_DIR, global = true)]
    config_dir: PathBuf,

    /// Runtime directory for status and result files
    #[arg(long, env = "CLOUD_INIT_RUN_DIR", default_value = RUN_DIR, global = true)]
    run_dir: PathBuf,

    /// Kernel command line to read `cc:` and `cloud-config-url` from
    #[arg(long, default_value = "/proc/cmdline", global = true)]
    cmdline: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage in order
    Init,
    /// Run the local stage (datasource discovery, identity)
    Local,
    /// Run the network stage (`cloud_init_modules`)
    Network,
    /// Run the config stage (`cloud_config_modules`)
    Config,
    /// Run the final stage (`cloud_final_modules`)
    Final,
    /// Run one module outside any stage list
    Single {
        /// Module name
        #[arg(long)]
        name: String,
        /// Override the module's frequency for this run
        #[arg(long)]
        frequency: Option<Frequency>,
    },
    /// Print a dotted key of the merged configuration
    Query {
        /// Key to query (e.g. runcmd, users.0.name)
        key: String,
    },
    /// Remove instance state
    Clean {
        /// Remove logs as well
        #[arg(long)]
        logs: bool,
    },
    /// Print the status of this boot
    Status {
        /// Include the semaphores recorded for the current instance
        #[arg(long)]
        semaphores: bool,
    },
}

fn init_logging(verbosity: u8) {
    let default = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

async fn run_stages(boot: &Boot, stages: &[Stage]) -> Result<ExitCode> {
    let mut failed = false;
    for stage in stages {
        let run = boot
            .run_stage(*stage)
            .await
            .with_context(|| format!("stage {stage} failed"))?;
        if run.status.fatal {
            error!("Stage {} crashed: {:?}", stage, run.status.fatal_error);
            return Ok(ExitCode::FAILURE);
        }
        failed |= run.failed();
    }
    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let paths = CloudPaths::with_dirs(&cli.cloud_dir, &cli.config_dir).with_run_dir(&cli.run_dir);
    let cmdline = read_cmdline(&cli.cmdline)
        .await
        .with_context(|| format!("reading {}", cli.cmdline.display()))?;
    let boot = Boot::new(paths).with_cmdline(cmdline);

    match cli.command.unwrap_or(Commands::Init) {
        Commands::Init => {
            info!("Running all stages");
            run_stages(&boot, &Stage::ALL).await
        }
        Commands::Local => run_stages(&boot, &[Stage::Local]).await,
        Commands::Network => run_stages(&boot, &[Stage::Network]).await,
        Commands::Config => run_stages(&boot, &[Stage::Config]).await,
        Commands::Final => run_stages(&boot, &[Stage::Final]).await,
        Commands::Single { name, frequency } => {
            let result = boot
                .run_single(&name, frequency)
                .await
                .with_context(|| format!("running module {name}"))?;
            println!("{}: {}", result.name, result.outcome);
            Ok(match result.outcome {
                ModuleOutcome::Ran | ModuleOutcome::Skipped => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            })
        }
        Commands::Query { key } => match boot.query(&key).await? {
            Some(value) => {
                print!("{}", serde_yaml::to_string(&value)?);
                Ok(ExitCode::SUCCESS)
            }
            None => {
                warn!("Key '{}' is not set", key);
                Ok(ExitCode::FAILURE)
            }
        },
        Commands::Clean { logs } => {
            boot.clean(logs).await.context("cleaning state")?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status { semaphores } => {
            let status = boot.state().read_status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            if semaphores {
                let records = boot.semaphores().await.context("listing semaphores")?;
                println!("{}", serde_json::to_string_pretty(&records)?);
            }
            Ok(if status.degraded || status.crashed() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
    }
}
