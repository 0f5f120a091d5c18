mod channel;
mod config;
mod error;
mod routes;
mod uploads;

use std::net::SocketAddr;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use infergrid_core::heartbeat;
use infergrid_db::config::DbConfig;
use infergrid_db::pool;

use config::ServerConfig;
use routes::{AppState, build_router};

#[derive(Parser)]
#[command(
    name = "infergrid-server",
    about = "Distributed ONNX inference marketplace server"
)]
struct Cli {
    /// Database URL (overrides INFERGRID_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database if needed and run migrations
    DbInit,
    /// Run the intake API and device dispatch channel
    Serve {
        /// Address to bind
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port to listen on
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

fn resolve_db_config(cli_url: Option<&str>) -> DbConfig {
    match cli_url {
        Some(url) => DbConfig::new(url),
        None => DbConfig::from_env(),
    }
}

async fn cmd_db_init(db_config: &DbConfig) -> anyhow::Result<()> {
    pool::ensure_database_exists(db_config).await?;
    let db_pool = pool::create_pool(db_config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;
    db_pool.close().await;
    println!("infergrid database ready.");
    Ok(())
}

async fn cmd_serve(db_config: &DbConfig, bind: &str, port: u16) -> anyhow::Result<()> {
    let db_pool = pool::create_pool(db_config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;

    let server_config = ServerConfig::from_env();
    let state = AppState::new(db_pool.clone(), &server_config);

    // Background heartbeat monitor, stopped on shutdown.
    let cancel = CancellationToken::new();
    let monitor = tokio::spawn(heartbeat::run(
        db_pool.clone(),
        state.engine.as_ref().clone(),
        cancel.clone(),
    ));

    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {bind}:{port}"))?;
    tracing::info!("infergrid-server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    let _ = monitor.await;
    db_pool.close().await;
    tracing::info!("infergrid-server shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let db_config = resolve_db_config(cli.database_url.as_deref());

    match cli.command {
        Commands::DbInit => cmd_db_init(&db_config).await,
        Commands::Serve { bind, port } => cmd_serve(&db_config, &bind, port).await,
    }
}
