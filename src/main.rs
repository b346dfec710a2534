use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use mural::backend::{LocalBackend, SupabaseBackend};
use mural::config::{BackendKind, Cli, Config};
use mural::db;
use mural::routes;
use mural::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse CLI args and load config
    let cli = Cli::parse();
    let data_dir = Config::data_dir(&cli)?;
    std::fs::create_dir_all(&data_dir)?;
    tracing::info!("Data directory: {}", data_dir.display());

    let config = Config::load(&cli)?;
    let state = build_state(config.clone())?;
    let app = routes::build_router(state);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_state(config: Config) -> anyhow::Result<AppState> {
    match config.backend.kind {
        BackendKind::Local => {
            let media = config.media_path();
            std::fs::create_dir_all(&media)?;

            let pool = db::create_pool(&config.db_path())?;
            db::run_migrations(&pool)?;
            tracing::info!(db = %config.db_path().display(), media = %media.display(), "Using embedded backend");

            let backend = LocalBackend::new(pool, media, config.auth.session_hours);
            Ok(AppState::local(backend, config))
        }
        BackendKind::Supabase => {
            let url = config
                .supabase
                .url
                .clone()
                .context("missing Supabase URL")?;
            let key = config
                .supabase
                .anon_key
                .clone()
                .context("missing Supabase anon key")?;
            let timeout = Duration::from_secs(config.supabase.timeout_secs);

            let backend = SupabaseBackend::new(&url, key, timeout)?;
            tracing::info!(url = %url, "Using Supabase backend");
            Ok(AppState::hosted(Arc::new(backend), config))
        }
    }
}
