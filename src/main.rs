// src/main.rs
use axum::{extract::Extension, Router};
use dotenv::dotenv;
use reqwest::Client;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::env;
use std::path::PathBuf;
use std::{net::SocketAddr, str::FromStr, sync::Arc};
use tokio::{net::TcpListener, sync::RwLock};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

// ============================================================================
// MODULE IMPORTS
// ============================================================================

mod auth;
mod common;
mod scans;
mod services;

use common::dev_mode::{print_dev_mode_status, DevModeConfig};
use common::state::{Environment, OAuthConfig};
use common::AppState;
use services::{
    CookieManager, IdentityStore, InMemoryStateStore, QuotaConfig, QuotaService,
    RefreshTokenStore, RemoteKeyResolver, StateStore, TokenVerifier,
};

// ============================================================================
// MAIN APPLICATION ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    // ========================================================================
    // ENVIRONMENT CONFIGURATION
    // ========================================================================

    let environment = Environment::from_env();
    let database_url =
        env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://snapmacro.db".to_string());

    let oidc_issuer = env::var("OIDC_ISSUER")
        .unwrap_or_else(|_| "https://login.microsoftonline.com/common/v2.0".to_string());
    let oidc_audience = env::var("OIDC_AUDIENCE").unwrap_or_default();
    let oidc_jwks_url = env::var("OIDC_JWKS_URL").unwrap_or_else(|_| {
        format!("{}/discovery/v2.0/keys", oidc_issuer.trim_end_matches('/'))
    });

    let cookie_domain = env::var("COOKIE_DOMAIN").ok().filter(|s| !s.is_empty());
    let csrf_test_mode = env::var("CSRF_TEST_MODE")
        .unwrap_or_else(|_| "false".to_string())
        .to_lowercase()
        == "true";
    let refresh_ttl_days = env::var("REFRESH_TOKEN_TTL_DAYS")
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(30);

    // ========================================================================
    // DEV MODE CONFIGURATION
    // ========================================================================

    let dev_mode = DevModeConfig::from_env(environment);
    print_dev_mode_status(&dev_mode);

    // ========================================================================
    // DATABASE SETUP
    // ========================================================================

    if let Some(path_part) = database_url.strip_prefix("sqlite://") {
        let path_without_params = path_part.split('?').next().unwrap_or("");
        if !path_without_params.is_empty() && !path_without_params.starts_with(':') {
            let db_path = PathBuf::from(path_without_params);
            if let Some(parent) = db_path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }
    }

    let connect_options = SqliteConnectOptions::from_str(&database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .acquire_timeout(std::time::Duration::from_secs(5))
        .connect_with(connect_options)
        .await?;

    common::migrations::run_migrations(&pool).await?;

    // ========================================================================
    // SERVICE INITIALIZATION
    // ========================================================================

    let http_client = Client::builder().no_proxy().build()?;

    let key_resolver = Arc::new(RemoteKeyResolver::new(http_client, oidc_jwks_url.clone()));
    info!(jwks_url = %oidc_jwks_url, "KeyResolver initialized");

    let verifier = Arc::new(TokenVerifier::new(
        oidc_issuer,
        oidc_audience,
        key_resolver,
    ));
    info!("TokenVerifier initialized");

    let identity_store = Arc::new(IdentityStore::new(pool.clone()));
    info!("IdentityStore initialized");

    // Secure + apex Domain only in production; localhost cookies stay
    // unscoped in development.
    let cookie_manager = Arc::new(CookieManager::new(
        environment.is_production(),
        if environment.is_production() {
            cookie_domain
        } else {
            None
        },
        csrf_test_mode,
    ));
    info!("CookieManager initialized");

    let refresh_tokens = Arc::new(RefreshTokenStore::new(pool.clone(), refresh_ttl_days));
    info!("RefreshTokenStore initialized");

    let quota_service = Arc::new(QuotaService::new(pool.clone(), QuotaConfig::from_env()));
    info!("QuotaService initialized");

    let state_store = Arc::new(InMemoryStateStore::new());
    InMemoryStateStore::start_sweep_task(state_store.clone());
    info!("StateStore sweep task started");

    // ========================================================================
    // APPLICATION STATE
    // ========================================================================

    let state_store: Arc<dyn StateStore> = state_store;
    let app_state = AppState {
        db: pool,
        verifier,
        identity_store,
        cookie_manager,
        refresh_tokens,
        quota_service,
        state_store,
        oauth: OAuthConfig::from_env(),
        dev_mode,
        environment,
    };

    let shared = Arc::new(RwLock::new(app_state));

    // ========================================================================
    // ROUTER COMPOSITION
    // ========================================================================

    let app = Router::new()
        // ====================================================================
        // AUTHENTICATION ROUTES
        // ====================================================================
        .merge(auth::auth_routes())
        // ====================================================================
        // SCAN ROUTES (metered action + usage snapshot)
        // ====================================================================
        .merge(scans::scans_routes())
        // ====================================================================
        // MIDDLEWARE AND LAYERS
        // ====================================================================
        .layer(Extension(shared.clone()))
        .layer({
            let cors_origins = std::env::var("CORS_ORIGINS").unwrap_or_else(|_| {
                "http://localhost:3000,http://localhost:5173".to_string()
            });

            let origins: Vec<axum::http::HeaderValue> = cors_origins
                .split(',')
                .filter_map(|origin| origin.trim().parse().ok())
                .collect();

            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers([
                    axum::http::header::CONTENT_TYPE,
                    axum::http::header::AUTHORIZATION,
                    axum::http::HeaderName::from_static("x-csrf-token"),
                    axum::http::HeaderName::from_static("x-user-id"),
                ])
                .allow_credentials(true)
        })
        .layer(TraceLayer::new_for_http());

    // ========================================================================
    // SERVER STARTUP
    // ========================================================================

    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
