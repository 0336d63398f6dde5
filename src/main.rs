use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

use vsforge::builder::Builder;
use vsforge::config::BuildConfig;
use vsforge::error::{BuildError, BuildResult};
use vsforge::logging;
use vsforge_vsphere::ErrorCategory;

#[derive(Parser)]
#[command(name = "vsforge")]
#[command(about = "Build vSphere VM templates from a JSON build config", long_about = None)]
struct Cli {
    /// Log as JSON lines
    #[arg(long, global = true, env = "VSFORGE_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a build
    Build {
        /// Build config (JSON)
        config: PathBuf,

        /// Replace an existing VM with the same name
        #[arg(short, long)]
        force: bool,
    },
    /// Check a build config without contacting vCenter
    Validate {
        /// Build config (JSON)
        config: PathBuf,
    },
}

fn exit_code(err: &BuildError) -> u8 {
    match err.category() {
        ErrorCategory::Configuration => 2,
        ErrorCategory::AmbiguousResolution | ErrorCategory::Precondition => 3,
        ErrorCategory::PlatformTask => 4,
        ErrorCategory::Timeout => 5,
        ErrorCategory::Transport => 6,
        ErrorCategory::Cancelled => 130,
    }
}

async fn build(path: PathBuf, force: bool) -> BuildResult<()> {
    let mut config = BuildConfig::load(&path)?;
    config.force |= force;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; cancelling build");
            on_signal.cancel();
        }
    });

    match Builder::new().run(config, cancel).await? {
        Some(artifact) => {
            println!("{artifact}");
            artifact.close().await?;
        }
        None => println!("build finished; VM was destroyed"),
    }
    Ok(())
}

fn validate(path: PathBuf) -> BuildResult<()> {
    let mut config = BuildConfig::load(&path)?;
    config.prepare()?;
    println!("{} is valid", path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.log_json);

    let result = match cli.command {
        Commands::Build { config, force } => build(config, force).await,
        Commands::Validate { config } => validate(config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(exit_code(&e))
        }
    }
}
