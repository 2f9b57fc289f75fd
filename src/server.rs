//! HTTP server and routes.

mod handlers;
mod state;

pub use state::AppState;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Room for multipart boundaries and headers on top of the file itself.
const MULTIPART_OVERHEAD: u64 = 1024 * 1024;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let body_limit = state
        .config
        .upload
        .max_size_bytes()
        .saturating_add(MULTIPART_OVERHEAD);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);

    let api_routes = Router::new()
        .route("/convert", post(handlers::convert))
        .route("/debug-info", get(handlers::debug_info))
        .route("/debug-html", get(handlers::debug_html))
        .route("/download-debug", get(handlers::download_debug));

    Router::new()
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health))
        .nest("/api", api_routes)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
