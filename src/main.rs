mod auth;
mod billing;
mod calendar;
mod config;
mod middleware;
mod odontogram;
mod radiography;
mod reports;

mod db;
mod error;
mod models;
mod routes;

use std::sync::Arc;

use crate::{config::Config, models::AppState, radiography::LocalFileStore};

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use axum::http::header;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = Config::from_env()?;
    let pool = db::connect_pg(&cfg.database_url, cfg.db_max_connections).await?;

    if cfg.run_migrations {
        db::run_migrations(&pool).await?;
    }

    tokio::fs::create_dir_all(&cfg.upload_dir).await?;
    let store = LocalFileStore::new(&cfg.upload_dir);
    tracing::info!(dir = %store.root().display(), max_bytes = cfg.max_upload_bytes, "radiograph store ready");

    let state = AppState {
        db: pool,
        session_ttl_hours: cfg.session_ttl_hours,
        store: Arc::new(store),
        max_upload_bytes: cfg.max_upload_bytes,
        clinic_tz_offset_minutes: cfg.clinic_tz_offset_minutes,
    };

    // Front-end clients run on another origin (desktop shell or dev server).
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
        ]);

    let app = routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!("Listening on http://{}", cfg.bind_addr);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
