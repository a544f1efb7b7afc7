use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use std::sync::Arc;

pub mod client_ip;
pub mod collector;
pub mod config;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod metrics;
pub mod models;
pub mod origin;
pub mod rate_limit;
pub mod state;
pub mod worker;

pub use state::AppState;

// Routes served by the relay
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_handler))
        .route(
            "/api/analytics",
            post(handlers::analytics_handler)
                .layer(DefaultBodyLimit::max(handlers::MAX_BODY_BYTES)),
        )
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(state)
}
