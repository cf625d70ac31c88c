mod download;
mod error;
mod fetch;
mod janitor;
mod progress;
mod routes;

use std::{path::PathBuf, sync::Arc};

use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
    download::DownloadCoordinator, error::ApiError, fetch::YtDlpFetcher, progress::ProgressStore,
    routes::AppState,
};

// Read-only secret mount; copied to a writable location at startup.
const SECRET_COOKIES_PATH: &str = "/etc/secrets/cookies.txt";
const WRITABLE_COOKIES_PATH: &str = "/tmp/cookies.txt";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "ytcomet_backend=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let downloads_dir = root.join("downloads");
    let frontend_dir = root.join("../frontend");

    tokio::fs::create_dir_all(&downloads_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!("could not create the downloads directory: {error}"))
        })?;

    let cookie_jar = prepare_cookie_jar().await;

    let progress = Arc::new(ProgressStore::new());
    progress::spawn_reaper(Arc::clone(&progress));

    let coordinator = Arc::new(DownloadCoordinator::new(
        Arc::new(YtDlpFetcher::new(cookie_jar)),
        Arc::clone(&progress),
        downloads_dir.clone(),
    ));

    let state = AppState {
        progress,
        coordinator,
        downloads_dir,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::router(state, frontend_dir)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = resolve_bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|error| ApiError::internal(format!("could not bind {addr}: {error}")))?;

    info!("backend listening on http://{addr}");

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

/// The secret mount is read-only, but yt-dlp rewrites its cookie jar, so a
/// writable copy is made before any download runs.
async fn prepare_cookie_jar() -> Option<PathBuf> {
    let secret = PathBuf::from(SECRET_COOKIES_PATH);
    if !tokio::fs::try_exists(&secret).await.unwrap_or(false) {
        warn!("no cookies.txt found at {SECRET_COOKIES_PATH}; downloads run unauthenticated");
        return None;
    }

    let writable = PathBuf::from(WRITABLE_COOKIES_PATH);
    match tokio::fs::copy(&secret, &writable).await {
        Ok(_) => {
            info!("copied cookies.txt to {WRITABLE_COOKIES_PATH}");
            Some(writable)
        }
        Err(error) => {
            warn!("could not copy cookies.txt to a writable location: {error}");
            None
        }
    }
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = std::env::var("APP_ADDR")
        .ok()
        .filter(|value| !value.trim().is_empty())
    {
        return configured;
    }

    if let Some(port) = std::env::var("PORT")
        .ok()
        .and_then(|value| value.trim().parse::<u16>().ok())
    {
        return format!("0.0.0.0:{port}");
    }

    "0.0.0.0:5000".to_string()
}
