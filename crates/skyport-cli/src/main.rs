//! Skyport CLI - deploy, release and tear down applications.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use skyport_control::{ControlConfig, PersistedState, Platform};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use commands::deploy::DeployArgs;
use commands::Context;

#[derive(Parser)]
#[command(name = "skyport")]
#[command(about = "Deploy applications to container platforms")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./skyport.toml)
    #[arg(short, long, global = true, env = "SKYPORT_CONFIG")]
    config: Option<PathBuf>,

    /// Backend platform (overrides configuration)
    #[arg(short, long, global = true)]
    platform: Option<Platform>,

    /// Print records as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a new version of an application
    Deploy {
        /// Application name
        app: String,

        /// Container image
        #[arg(short, long)]
        image: String,

        /// Port the container listens on
        #[arg(long, default_value_t = 80)]
        port: u16,

        /// Environment variable, as KEY=VALUE
        #[arg(short, long = "env", value_parser = parse_env)]
        env: Vec<(String, String)>,

        /// CPU units
        #[arg(long)]
        cpu: Option<u32>,

        /// Memory in MB
        #[arg(long)]
        memory: Option<u32>,

        /// Number of replicas
        #[arg(long)]
        replicas: Option<u32>,

        /// Release the deployment once it is healthy
        #[arg(long)]
        release: bool,
    },

    /// Send all traffic to a deployment
    Release {
        /// Deployment ID
        id: String,
    },

    /// Tear down a deployment
    Destroy {
        /// Deployment ID
        id: String,
    },

    /// Show a deployment and its live service
    Status {
        /// Deployment ID
        id: String,
    },

    /// List deployments
    List {
        /// Only this application
        #[arg(short, long)]
        app: Option<String>,

        /// Only deployments in this state
        #[arg(short, long)]
        state: Option<PersistedState>,

        /// Maximum number of deployments
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Destroy all but the newest deployments of an application
    Prune {
        /// Application name
        app: String,

        /// Deployments to keep (overrides release.retain)
        #[arg(short, long)]
        keep: Option<usize>,
    },

    /// Install the Skyport server on the platform
    Install,

    /// Upgrade an installed Skyport server
    Upgrade,

    /// Remove the Skyport server and its resources
    Uninstall,

    /// List platforms the server can be installed on
    Platforms,
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{s}`"))?;
    if key.is_empty() {
        return Err(format!("empty variable name in `{s}`"));
    }
    Ok((key.to_owned(), value.to_owned()))
}

fn load_config(cli: &Cli) -> anyhow::Result<ControlConfig> {
    let mut config = match &cli.config {
        Some(path) => ControlConfig::from_file(path)?,
        None => ControlConfig::load()?,
    };
    if let Some(platform) = cli.platform {
        config.platform = platform;
    }
    Ok(config)
}

/// Cancel in-flight waits on Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping");
            token.cancel();
        }
    });
    cancel
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    let ctx = Context::new(config, cancel_on_interrupt(), cli.json);

    match cli.command {
        Commands::Deploy {
            app,
            image,
            port,
            env,
            cpu,
            memory,
            replicas,
            release,
        } => {
            let args = DeployArgs {
                app,
                image,
                port,
                env,
                cpu,
                memory,
                replicas,
                release,
            };
            commands::deploy::deploy(&ctx, args).await
        }
        Commands::Release { id } => commands::deploy::release(&ctx, &id).await,
        Commands::Destroy { id } => commands::deploy::destroy(&ctx, &id).await,
        Commands::Prune { app, keep } => commands::deploy::prune(&ctx, &app, keep).await,
        Commands::Status { id } => commands::inspect::status(&ctx, &id).await,
        Commands::List { app, state, limit } => {
            commands::inspect::list(&ctx, app, state, limit).await
        }
        Commands::Install => commands::install::install(&ctx).await,
        Commands::Upgrade => commands::install::upgrade(&ctx).await,
        Commands::Uninstall => commands::install::uninstall(&ctx).await,
        Commands::Platforms => {
            commands::install::platforms();
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skyport_control=info,skyport=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn env_pairs() {
        assert_eq!(
            parse_env("LOG_LEVEL=debug"),
            Ok(("LOG_LEVEL".to_owned(), "debug".to_owned()))
        );
        assert_eq!(
            parse_env("URL=http://a/?b=c"),
            Ok(("URL".to_owned(), "http://a/?b=c".to_owned()))
        );
        assert!(parse_env("NOVALUE").is_err());
        assert!(parse_env("=x").is_err());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "skyport", "list", "--state", "released", "--platform", "memory", "--json",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.platform, Some(Platform::Memory));
        assert!(matches!(
            cli.command,
            Commands::List {
                state: Some(PersistedState::Released),
                ..
            }
        ));
    }
}
