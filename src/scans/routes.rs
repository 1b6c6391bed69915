//! Scan routes

use axum::{
    routing::{get, post},
    Router,
};

use super::handlers;

/// Creates and returns the scans router
///
/// # Routes
/// - `POST /api/scans` - Perform one metered scan
/// - `GET /api/usage` - Quota snapshot for the caller
pub fn scans_routes() -> Router {
    Router::new()
        .route("/api/scans", post(handlers::create_scan))
        .route("/api/usage", get(handlers::usage))
}
