//! Demo server for the identity resolution and provider dispatch surface.
//!
//! Mounts the login, logout, simulation, local login and about endpoints on an
//! in-memory session and profile store.

use clap::Parser;
use idopt_auth::{
    config::{AuthConfig, CONFIG_FILE_ENV},
    errors::Result,
    integrations::axum::{AppState, build_router},
    session::MemorySessionStore,
    storage::MemoryProfileStore,
    server::oidc::FederatedSchemes,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "idopt-demo")]
#[command(about = "Identity resolution and provider dispatch demo server")]
#[command(version)]
struct Args {
    /// TOML configuration file; the environment is used when absent
    #[arg(short, long, env = CONFIG_FILE_ENV)]
    config: Option<String>,

    /// Overrides the configured bind address
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => AuthConfig::from_toml_file(path)?,
        None => AuthConfig::from_env()?,
    };
    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let sessions = MemorySessionStore::with_idle_timeout(config.session_idle_timeout());
    let _cleanup = sessions.spawn_cleanup(Duration::from_secs(60));

    let bind_address = config.bind_address.clone();
    let state = AppState::new(
        config,
        Arc::new(sessions),
        Arc::new(MemoryProfileStore::new()),
        FederatedSchemes::new(),
    )?;
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!(address = %bind_address, "idopt-demo listening");
    axum::serve(listener, app).await?;
    Ok(())
}
