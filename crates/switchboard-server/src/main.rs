use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use switchboard_server::config::ServerConfig;
use switchboard_server::store::SqliteStore;

#[derive(Parser, Debug)]
#[command(author, version, about = "switchboard presence and messaging hub")]
struct Args {
    /// TOML config file. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides `listen` from the config file.
    #[arg(long)]
    listen: Option<SocketAddr>,
    /// SQLite database path, or `:memory:`.
    #[arg(long)]
    database: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(database) = args.database {
        config.database = database;
    }

    let default_filter = config
        .log_filter
        .clone()
        .unwrap_or_else(|| "switchboard=info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let store = SqliteStore::open(&config.database)?;
    let server = switchboard_server::spawn(&config, store).await?;
    tracing::info!(
        addr = %server.local_addr,
        database = %config.database,
        "switchboard listening"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");
    server.shutdown().await
}
