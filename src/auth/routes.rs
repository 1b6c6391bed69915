//! Authentication routes

use axum::{
    routing::{get, post},
    Router,
};

use super::handlers;

/// Creates and returns the authentication router
///
/// # Routes
/// - `POST /api/auth/login` - Login with a provider ID token
/// - `GET /api/auth/oauth/start` - Begin the provider OAuth round-trip
/// - `GET /api/auth/oauth/callback` - Complete the provider OAuth round-trip
/// - `POST /api/auth/refresh` - Rotate the refresh token
/// - `POST /api/auth/logout` - Revoke the refresh token, clear cookies
/// - `GET /api/me` - Get current user information
pub fn auth_routes() -> Router {
    Router::new()
        .route("/api/auth/login", post(handlers::login))
        .route("/api/auth/oauth/start", get(handlers::oauth_start))
        .route("/api/auth/oauth/callback", get(handlers::oauth_callback))
        .route("/api/auth/refresh", post(handlers::refresh))
        .route("/api/auth/logout", post(handlers::logout))
        .route("/api/me", get(handlers::me))
}
