use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use foreman_core::ProjectRegistry;
use foreman_server::{serve, AppState};

#[derive(Parser, Debug)]
#[command(name = "foreman-engine")]
#[command(about = "Headless Foreman control plane")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API and event channel.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 3000)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
    },
    /// List registered projects and exit.
    Projects {
        #[arg(long)]
        state_dir: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
        } => {
            let state_dir = resolve_state_dir(state_dir);
            let logs_dir = foreman_observability::canonical_logs_dir_from_root(&state_dir);
            let (_guard, log_info) =
                foreman_observability::init_process_logging(&logs_dir, 14)?;
            info!(logs_dir = %log_info.logs_dir, "logging initialized");

            let registry = ProjectRegistry::load(&state_dir).await?;
            let state = AppState::new(Arc::new(registry));
            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            info!(state_dir = %state_dir.display(), %addr, "starting foreman engine");
            serve(addr, state).await?;
        }
        Command::Projects { state_dir } => {
            let state_dir = resolve_state_dir(state_dir);
            let registry = ProjectRegistry::load(&state_dir).await?;
            let projects = registry.list_projects().await;
            println!("{}", serde_json::to_string_pretty(&projects)?);
        }
    }

    Ok(())
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("FOREMAN_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".foreman-engine")
}
