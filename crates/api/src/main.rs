use std::net::SocketAddr;

use anyhow::Context;
use clap::{Parser, Subcommand};
use docdiff_infra::config::{AppConfig, Role};

#[derive(Parser)]
#[command(name = "docdiff")]
#[command(about = "Asynchronous PDF comparison service")]
#[command(version)]
struct Cli {
    /// HTTP listen address
    #[arg(long, global = true, env = "BIND_ADDR")]
    bind: Option<SocketAddr>,

    /// Concurrent executor loops in this process
    #[arg(long, global = true, env = "WORKER_CONCURRENCY")]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone, Copy)]
enum Commands {
    /// Serve the HTTP API only
    Serve,
    /// Run job executors only
    Worker,
    /// HTTP API and executors in one process (default)
    All,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();
    docdiff_observability::init();

    let cli = Cli::parse();
    let role = match cli.command.unwrap_or(Commands::All) {
        Commands::Serve => Role::Serve,
        Commands::Worker => Role::Worker,
        Commands::All => Role::All,
    };

    let mut config = AppConfig::from_env().context("invalid configuration")?;
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(workers) = cli.workers {
        config.worker_concurrency = workers.max(1);
    }
    config.validate(role).context("invalid configuration")?;

    docdiff_api::app::run(role, config).await
}
