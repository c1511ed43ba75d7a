use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use glob::Pattern;
use tracing_subscriber::EnvFilter;

use dcontrol::config::Config;
use dcontrol::daemon::Daemon;
use dcontrol::protocol::Status;
use dcontrol::{client, DeployError};

const DEFAULT_ADDRESS: &str = "0.0.0.0:20384";

#[derive(Parser)]
#[command(name = "dcontrol", version, about = "Rollback-capable remote deployment controller")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the deployment daemon.
    Daemon {
        /// Path to the TOML configuration file.
        #[arg(short, long, default_value = "/etc/dcontrol/dcontrol.toml")]
        config: PathBuf,
        /// Address to listen on.
        #[arg(short, long, default_value = DEFAULT_ADDRESS)]
        listen: String,
    },
    /// Deploy a file or directory to a target on a remote daemon.
    Deploy {
        /// Daemon address to connect to.
        #[arg(long)]
        to: String,
        /// Principal name to deploy as.
        #[arg(long)]
        name: String,
        /// Shared secret for the principal.
        #[arg(long, env = "DCONTROL_PASSWORD", hide_env_values = true)]
        password: String,
        /// Glob patterns of paths to leave out of the payload.
        #[arg(short = 'i', long = "ignore")]
        ignore: Vec<String>,
        /// Target name configured on the daemon.
        target: String,
        /// Local file or directory to deploy.
        path: PathBuf,
    },
    /// Check that a daemon is alive.
    Ping {
        /// Daemon address to connect to.
        #[arg(long)]
        to: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Daemon { config, listen } => {
            let config = Arc::new(Config::load(&config)?);
            let daemon = Daemon::bind(config, &listen).await?;
            daemon.run().await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Deploy {
            to,
            name,
            password,
            ignore,
            target,
            path,
        } => {
            let patterns = ignore
                .iter()
                .map(|raw| Pattern::new(raw).with_context(|| format!("bad ignore pattern: {raw}")))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let status = client::deploy(&to, &target, &name, &password, &path, &patterns).await?;
            Ok(report(status))
        }
        Commands::Ping { to } => match client::ping(&to).await {
            Ok(status) => Ok(report(status)),
            Err(DeployError::Io(err)) => {
                eprintln!("{to}: {err}");
                Ok(ExitCode::FAILURE)
            }
            Err(err) => Err(err.into()),
        },
    }
}

fn report(status: Status) -> ExitCode {
    if status.is_ok() {
        println!("ok");
        ExitCode::SUCCESS
    } else {
        eprintln!("{}", status.message());
        ExitCode::FAILURE
    }
}
