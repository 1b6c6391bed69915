//! Tests for the auth module
//!
//! These cover the full request-side machinery: the extractor state
//! machine, login/refresh/logout handlers, and the OAuth state round-trip,
//! all against an in-memory database and a deterministic key resolver.

use axum::extract::{Extension, FromRequestParts, Query};
use axum::http::{HeaderMap, Request};
use axum::Json;
use axum_extra::extract::cookie::{Cookie, CookieJar};
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{encode, Algorithm, DecodingKey, EncodingKey, Header};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::extractors::{AuthedUser, OptionalAuthedUser};
use super::handlers;
use super::models::{LoginPayload, OAuthCallbackParams, Plan};
use crate::common::dev_mode::DevModeConfig;
use crate::common::migrations::run_migrations;
use crate::common::state::{Environment, OAuthConfig};
use crate::common::{ApiError, AppState};
use crate::services::cookies::{CSRF_COOKIE, CSRF_HEADER, REFRESH_COOKIE};
use crate::services::{
    CookieManager, IdentityStore, InMemoryStateStore, QuotaConfig, QuotaService,
    RefreshTokenStore, StateStore, StaticKeyResolver, TokenVerifier,
};

const SECRET: &[u8] = b"auth_module_test_secret";
const ISSUER: &str = "https://login.example.com/tenant/v2.0";
const AUDIENCE: &str = "snapmacro-client";
const KID: &str = "test-key";

async fn test_state(csrf_test_mode: bool) -> Arc<RwLock<AppState>> {
    test_state_with_dev_mode(csrf_test_mode, DevModeConfig::disabled()).await
}

async fn test_state_with_dev_mode(
    csrf_test_mode: bool,
    dev_mode: DevModeConfig,
) -> Arc<RwLock<AppState>> {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    run_migrations(&pool).await.unwrap();

    let resolver = StaticKeyResolver::new().with_key(
        KID,
        DecodingKey::from_secret(SECRET),
        Algorithm::HS256,
    );
    let verifier = Arc::new(
        TokenVerifier::new(ISSUER.to_string(), AUDIENCE.to_string(), Arc::new(resolver))
            .with_leeway(0),
    );

    let state = AppState {
        db: pool.clone(),
        verifier,
        identity_store: Arc::new(IdentityStore::new(pool.clone())),
        cookie_manager: Arc::new(CookieManager::new(false, None, csrf_test_mode)),
        refresh_tokens: Arc::new(RefreshTokenStore::new(pool.clone(), 30)),
        quota_service: Arc::new(QuotaService::new(pool, QuotaConfig::default())),
        state_store: Arc::new(InMemoryStateStore::new()),
        oauth: OAuthConfig {
            authorize_url: "https://login.example.com/authorize".to_string(),
            client_id: "snapmacro-client".to_string(),
            redirect_uri: "http://localhost:8080/api/auth/oauth/callback".to_string(),
            frontend_url: "http://localhost:3000".to_string(),
        },
        dev_mode,
        environment: Environment::Development,
    };
    Arc::new(RwLock::new(state))
}

fn mint_token(external_id: &str) -> String {
    let claims = serde_json::json!({
        "sub": external_id,
        "iss": ISSUER,
        "aud": AUDIENCE,
        "exp": (Utc::now() + ChronoDuration::hours(1)).timestamp(),
    });
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some(KID.to_string());
    encode(&header, &claims, &EncodingKey::from_secret(SECRET)).unwrap()
}

async fn extract_authed(
    state: &Arc<RwLock<AppState>>,
    build: impl FnOnce(axum::http::request::Builder) -> axum::http::request::Builder,
) -> Result<AuthedUser, ApiError> {
    let request = build(Request::builder().uri("/api/me"))
        .extension(state.clone())
        .body(())
        .unwrap();
    let (mut parts, _) = request.into_parts();
    AuthedUser::from_request_parts(&mut parts, &()).await
}

#[tokio::test]
async fn extractor_authenticates_valid_bearer() {
    let state = test_state(true).await;
    let token = mint_token("ext-extractor");

    let authed = extract_authed(&state, |b| b.header("authorization", format!("Bearer {}", token)))
        .await
        .unwrap();
    assert_eq!(authed.user.external_id.as_deref(), Some("ext-extractor"));
    assert_eq!(authed.user.plan, Plan::Free);
    assert_eq!(authed.raw_token.as_deref(), Some(token.as_str()));
}

#[tokio::test]
async fn extractor_rejects_missing_header_before_touching_storage() {
    let state = test_state(true).await;
    let err = extract_authed(&state, |b| b).await.unwrap_err();
    assert!(matches!(err, ApiError::TokenMissing(_)));

    // No user row was provisioned along the way.
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(&state.read().await.db)
        .await
        .unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn extractor_rejects_non_bearer_scheme() {
    let state = test_state(true).await;
    let err = extract_authed(&state, |b| b.header("authorization", "Basic dXNlcg=="))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::TokenInvalid(_)));
}

#[tokio::test]
async fn extractor_rejects_suspended_user_with_403_kind() {
    let state = test_state(true).await;
    {
        let db = state.read().await.db.clone();
        sqlx::query(
            "INSERT INTO users (id, external_id, status) VALUES ('U_SUSP0001', 'ext-susp', 'SUSPENDED')",
        )
        .execute(&db)
        .await
        .unwrap();
    }

    let token = mint_token("ext-susp");
    let err = extract_authed(&state, |b| b.header("authorization", format!("Bearer {}", token)))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::UserSuspended(_)));
}

#[tokio::test]
async fn optional_extractor_treats_absent_header_as_anonymous() {
    let state = test_state(true).await;
    let request = Request::builder()
        .uri("/api/scans")
        .extension(state.clone())
        .body(())
        .unwrap();
    let (mut parts, _) = request.into_parts();

    let optional = OptionalAuthedUser::from_request_parts(&mut parts, &())
        .await
        .unwrap();
    assert!(optional.0.is_none());
}

#[tokio::test]
async fn optional_extractor_fails_closed_on_bad_token() {
    let state = test_state(true).await;
    let request = Request::builder()
        .uri("/api/scans")
        .header("authorization", "Bearer not-a-jwt")
        .extension(state.clone())
        .body(())
        .unwrap();
    let (mut parts, _) = request.into_parts();

    let err = OptionalAuthedUser::from_request_parts(&mut parts, &())
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::TokenInvalid(_)));
}

#[tokio::test]
async fn dev_header_is_honored_only_when_dev_mode_is_on() {
    let dev_state =
        test_state_with_dev_mode(true, DevModeConfig::enabled_for_tests()).await;
    let authed = extract_authed(&dev_state, |b| b.header("x-user-id", "U_DEV00001"))
        .await
        .unwrap();
    assert_eq!(authed.user.id, "U_DEV00001");
    assert!(authed.raw_token.is_none());

    let prod_state = test_state(true).await;
    let err = extract_authed(&prod_state, |b| b.header("x-user-id", "U_DEV00001"))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::TokenMissing(_)));
}

#[tokio::test]
async fn login_provisions_user_and_sets_both_cookies() {
    let state = test_state(true).await;
    let token = mint_token("ext-login");

    let mut headers = HeaderMap::new();
    headers.insert("user-agent", "test-agent".parse().unwrap());

    let (jar, Json(body)) = handlers::login(
        Extension(state.clone()),
        CookieJar::new(),
        headers,
        None,
        Json(LoginPayload { id_token: token }),
    )
    .await
    .unwrap();

    let refresh_cookie = jar.get(REFRESH_COOKIE).unwrap();
    assert!(refresh_cookie.http_only().unwrap_or(false));
    let csrf_cookie = jar.get(CSRF_COOKIE).unwrap();
    assert!(!csrf_cookie.http_only().unwrap_or(false));

    // The body's raw token matches the cookie and validates in the store.
    let raw = body["refresh_token"].as_str().unwrap();
    assert_eq!(raw, refresh_cookie.value());
    let app = state.read().await.clone();
    let record = app.refresh_tokens.validate(raw).await.unwrap().unwrap();
    assert_eq!(record.device_info.as_deref(), Some("test-agent"));

    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE external_id = 'ext-login'")
            .fetch_one(&app.db)
            .await
            .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn login_rejects_suspended_user() {
    let state = test_state(true).await;
    {
        let db = state.read().await.db.clone();
        sqlx::query(
            "INSERT INTO users (id, external_id, status) VALUES ('U_SUSP0002', 'ext-susp2', 'SUSPENDED')",
        )
        .execute(&db)
        .await
        .unwrap();
    }

    let err = handlers::login(
        Extension(state),
        CookieJar::new(),
        HeaderMap::new(),
        None,
        Json(LoginPayload {
            id_token: mint_token("ext-susp2"),
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ApiError::UserSuspended(_)));
}

async fn login_session(state: &Arc<RwLock<AppState>>) -> (String, CookieJar) {
    let (jar, Json(body)) = handlers::login(
        Extension(state.clone()),
        CookieJar::new(),
        HeaderMap::new(),
        None,
        Json(LoginPayload {
            id_token: mint_token("ext-session"),
        }),
    )
    .await
    .unwrap();
    let raw = body["refresh_token"].as_str().unwrap().to_string();
    (raw, jar)
}

#[tokio::test]
async fn refresh_rotates_the_token_under_csrf() {
    let state = test_state(false).await;
    let (old_raw, login_jar) = login_session(&state).await;
    let csrf_value = login_jar.get(CSRF_COOKIE).unwrap().value().to_string();

    let jar = CookieJar::new()
        .add(Cookie::new(REFRESH_COOKIE, old_raw.clone()))
        .add(Cookie::new(CSRF_COOKIE, csrf_value.clone()));
    let mut headers = HeaderMap::new();
    headers.insert(CSRF_HEADER, csrf_value.parse().unwrap());

    let (_, Json(body)) = handlers::refresh(Extension(state.clone()), jar, headers, None)
        .await
        .unwrap();

    let new_raw = body["refresh_token"].as_str().unwrap();
    assert_ne!(new_raw, old_raw);

    let app = state.read().await.clone();
    assert!(app.refresh_tokens.validate(&old_raw).await.unwrap().is_none());
    assert!(app.refresh_tokens.validate(new_raw).await.unwrap().is_some());
}

#[tokio::test]
async fn refresh_rejects_csrf_mismatch() {
    let state = test_state(false).await;
    let (raw, _) = login_session(&state).await;

    let jar = CookieJar::new()
        .add(Cookie::new(REFRESH_COOKIE, raw))
        .add(Cookie::new(CSRF_COOKIE, "cookie-value"));
    let mut headers = HeaderMap::new();
    headers.insert(CSRF_HEADER, "different-value".parse().unwrap());

    let err = handlers::refresh(Extension(state), jar, headers, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::CsrfMismatch(_)));
}

#[tokio::test]
async fn refresh_rejects_unknown_refresh_token() {
    let state = test_state(true).await;
    let jar = CookieJar::new().add(Cookie::new(REFRESH_COOKIE, "forged-token"));

    let err = handlers::refresh(Extension(state), jar, HeaderMap::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::TokenInvalid(_)));
}

#[tokio::test]
async fn logout_revokes_token_and_clears_cookies() {
    let state = test_state(true).await;
    let (raw, _) = login_session(&state).await;

    let jar = CookieJar::new().add(Cookie::new(REFRESH_COOKIE, raw.clone()));
    let (jar, _) = handlers::logout(Extension(state.clone()), jar, HeaderMap::new())
        .await
        .unwrap();

    let refresh_cookie = jar.get(REFRESH_COOKIE).unwrap();
    assert_eq!(refresh_cookie.value(), "");
    assert_eq!(refresh_cookie.max_age(), Some(time::Duration::seconds(0)));
    let csrf_cookie = jar.get(CSRF_COOKIE).unwrap();
    assert_eq!(csrf_cookie.value(), "");

    // The row is revoked, not deleted.
    let app = state.read().await.clone();
    assert!(app.refresh_tokens.validate(&raw).await.unwrap().is_none());
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM refresh_tokens")
        .fetch_one(&app.db)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn oauth_state_is_single_use() {
    let state = test_state(true).await;
    {
        let app = state.read().await.clone();
        app.state_store
            .put("nonce-1".to_string(), "login".to_string(), Duration::from_secs(60))
            .await;
    }

    let params = OAuthCallbackParams {
        state: "nonce-1".to_string(),
        id_token: mint_token("ext-oauth"),
    };
    let result = handlers::oauth_callback(
        Extension(state.clone()),
        CookieJar::new(),
        HeaderMap::new(),
        None,
        Query(OAuthCallbackParams {
            state: params.state.clone(),
            id_token: params.id_token.clone(),
        }),
    )
    .await;
    assert!(result.is_ok());

    // Replaying the same state is rejected.
    let err = handlers::oauth_callback(
        Extension(state),
        CookieJar::new(),
        HeaderMap::new(),
        None,
        Query(params),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ApiError::BadRequest(_)));
}
