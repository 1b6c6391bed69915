// Application state shared across all modules

use sqlx::SqlitePool;
use std::env;
use std::sync::Arc;

use crate::common::dev_mode::DevModeConfig;
use crate::services::{
    CookieManager, IdentityStore, QuotaService, RefreshTokenStore, StateStore, TokenVerifier,
};

/// Deployment environment, read once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        match env::var("APP_ENV")
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
            .as_str()
        {
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// Identity-provider endpoints for the browser OAuth round-trip.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub authorize_url: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub frontend_url: String,
}

impl OAuthConfig {
    pub fn from_env() -> Self {
        Self {
            authorize_url: env::var("OIDC_AUTHORIZE_URL").unwrap_or_else(|_| {
                "https://login.microsoftonline.com/common/oauth2/v2.0/authorize".to_string()
            }),
            client_id: env::var("OIDC_CLIENT_ID").unwrap_or_default(),
            redirect_uri: env::var("OIDC_REDIRECT_URI")
                .unwrap_or_else(|_| "http://localhost:8080/api/auth/oauth/callback".to_string()),
            frontend_url: env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        }
    }
}

/// Application state containing database pool, services, and configuration
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub verifier: Arc<TokenVerifier>,
    pub identity_store: Arc<IdentityStore>,
    pub cookie_manager: Arc<CookieManager>,
    pub refresh_tokens: Arc<RefreshTokenStore>,
    pub quota_service: Arc<QuotaService>,
    pub state_store: Arc<dyn StateStore>,
    pub oauth: OAuthConfig,
    pub dev_mode: DevModeConfig,
    pub environment: Environment,
}
