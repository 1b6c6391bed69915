//! Authentication handlers

use axum::{
    extract::{ConnectInfo, Extension, Query},
    http::{header::USER_AGENT, HeaderMap},
    response::Redirect,
    Json,
};
use axum_extra::extract::cookie::CookieJar;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::extractors::{extract_client_ip, resolve_bearer_user, AuthedUser};
use super::models::{LoginPayload, OAuthCallbackParams, User};
use crate::common::{safe_email_log, ApiError, AppState};
use crate::services::cookies::{generate_session_token, CSRF_COOKIE, CSRF_HEADER, REFRESH_COOKIE};
use crate::services::StateStore;

/// How long an issued OAuth state nonce stays redeemable.
const OAUTH_STATE_TTL: Duration = Duration::from_secs(600);

/// POST /api/auth/login
/// Authenticates a user via a provider ID token obtained client-side.
///
/// # Request Body
/// ```json
/// { "id_token": "<provider id token>" }
/// ```
///
/// # Response
/// Sets the refresh and CSRF cookies and returns the user plus the raw
/// refresh token. This response is the only place the raw token ever
/// appears outside the HttpOnly cookie.
pub async fn login(
    Extension(state_lock): Extension<Arc<RwLock<AppState>>>,
    jar: CookieJar,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Json(payload): Json<LoginPayload>,
) -> Result<(CookieJar, Json<serde_json::Value>), ApiError> {
    let state = state_lock.read().await.clone();

    let user = resolve_bearer_user(&state, &payload.id_token).await?;
    info!(
        user_id = %user.id,
        email = %user.email.as_deref().map(safe_email_log).unwrap_or_default(),
        "User login successful"
    );

    issue_session(&state, jar, &headers, connect_info.as_ref(), user).await
}

/// GET /api/auth/oauth/start - begin the provider round-trip
///
/// Stores a single-use state nonce and redirects to the provider's
/// authorize endpoint.
pub async fn oauth_start(
    Extension(state_lock): Extension<Arc<RwLock<AppState>>>,
) -> Result<Redirect, ApiError> {
    let state = state_lock.read().await.clone();

    let state_nonce = generate_session_token();
    state
        .state_store
        .put(state_nonce.clone(), "login".to_string(), OAUTH_STATE_TTL)
        .await;

    let authorize_url = format!(
        "{}?client_id={}&response_type=id_token&response_mode=query&scope=openid%20profile%20email&redirect_uri={}&state={}&nonce={}",
        state.oauth.authorize_url,
        urlencoding::encode(&state.oauth.client_id),
        urlencoding::encode(&state.oauth.redirect_uri),
        state_nonce,
        generate_session_token(),
    );

    info!("Starting OAuth flow");
    Ok(Redirect::temporary(&authorize_url))
}

/// GET /api/auth/oauth/callback - complete the provider round-trip
///
/// Consumes the state nonce (single use), verifies the returned ID token
/// through the same path as login, sets session cookies, and sends the
/// browser back to the frontend.
pub async fn oauth_callback(
    Extension(state_lock): Extension<Arc<RwLock<AppState>>>,
    jar: CookieJar,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Query(params): Query<OAuthCallbackParams>,
) -> Result<(CookieJar, Redirect), ApiError> {
    let state = state_lock.read().await.clone();

    if state.state_store.consume(&params.state).await.is_none() {
        warn!("OAuth callback presented unknown, expired, or reused state");
        return Err(ApiError::BadRequest(
            "invalid or expired oauth state".to_string(),
        ));
    }

    let user = resolve_bearer_user(&state, &params.id_token).await?;
    info!(user_id = %user.id, "OAuth callback login successful");

    let frontend_url = state.oauth.frontend_url.clone();
    let (jar, _) = issue_session(&state, jar, &headers, connect_info.as_ref(), user).await?;
    Ok((jar, Redirect::temporary(&frontend_url)))
}

/// POST /api/auth/refresh
/// Rotates the refresh token presented in the HttpOnly cookie. Protected
/// by the CSRF double-submit check.
pub async fn refresh(
    Extension(state_lock): Extension<Arc<RwLock<AppState>>>,
    jar: CookieJar,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Result<(CookieJar, Json<serde_json::Value>), ApiError> {
    let state = state_lock.read().await.clone();
    require_csrf(&state, &jar, &headers)?;

    let raw = jar
        .get(REFRESH_COOKIE)
        .map(|c| c.value().to_string())
        .ok_or_else(|| ApiError::TokenMissing("missing refresh cookie".to_string()))?;

    let record = state
        .refresh_tokens
        .validate(&raw)
        .await?
        .ok_or_else(|| ApiError::TokenInvalid("refresh token not recognized".to_string()))?;

    let user = fetch_user(&state, &record.user_id)
        .await?
        .ok_or_else(|| ApiError::TokenInvalid("refresh token owner not found".to_string()))?;
    if user.is_suspended() {
        return Err(ApiError::UserSuspended("account suspended".to_string()));
    }

    let device_info = device_info(&headers);
    let ip = extract_client_ip(&headers, connect_info.as_ref());
    let rotated = state
        .refresh_tokens
        .rotate(&record, device_info.as_deref(), ip.as_deref())
        .await?;
    info!(user_id = %user.id, "Refresh token rotated");

    let csrf = generate_session_token();
    let jar = jar
        .add(
            state
                .cookie_manager
                .issue_refresh_cookie(&rotated.raw, rotated.expires_at),
        )
        .add(state.cookie_manager.issue_csrf_cookie(&csrf));

    let body = serde_json::json!({
        "user": user,
        "refresh_token": rotated.raw,
        "expires_at": rotated.expires_at.to_rfc3339(),
    });
    Ok((jar, Json(body)))
}

/// POST /api/auth/logout
/// Revokes the presented refresh token row and clears both session
/// cookies. Protected by the CSRF double-submit check.
pub async fn logout(
    Extension(state_lock): Extension<Arc<RwLock<AppState>>>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Result<(CookieJar, Json<serde_json::Value>), ApiError> {
    let state = state_lock.read().await.clone();
    require_csrf(&state, &jar, &headers)?;

    if let Some(cookie) = jar.get(REFRESH_COOKIE) {
        let revoked = state.refresh_tokens.revoke(cookie.value()).await?;
        if revoked {
            info!("Refresh token revoked on logout");
        }
    }

    let jar = jar
        .add(state.cookie_manager.clear_refresh_cookie())
        .add(state.cookie_manager.clear_csrf_cookie());

    Ok((jar, Json(serde_json::json!({ "message": "Logout successful" }))))
}

/// GET /api/me
/// Returns the current authenticated user's information
pub async fn me(authed: AuthedUser) -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(serde_json::json!({ "user": authed.user })))
}

// ---- Helper Functions ----

fn device_info(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
}

fn require_csrf(state: &AppState, jar: &CookieJar, headers: &HeaderMap) -> Result<(), ApiError> {
    let cookie_value = jar.get(CSRF_COOKIE).map(|c| c.value().to_string());
    let header_value = headers
        .get(CSRF_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());

    if !state
        .cookie_manager
        .validate_csrf(cookie_value.as_deref(), header_value.as_deref())
    {
        warn!("CSRF double-submit validation failed");
        return Err(ApiError::CsrfMismatch(
            "csrf token missing or mismatched".to_string(),
        ));
    }
    Ok(())
}

async fn fetch_user(state: &AppState, user_id: &str) -> Result<Option<User>, ApiError> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&state.db)
        .await
        .map_err(ApiError::DatabaseError)
}

async fn issue_session(
    state: &AppState,
    jar: CookieJar,
    headers: &HeaderMap,
    connect_info: Option<&ConnectInfo<SocketAddr>>,
    user: User,
) -> Result<(CookieJar, Json<serde_json::Value>), ApiError> {
    let device_info = device_info(headers);
    let ip = extract_client_ip(headers, connect_info);

    let issued = state
        .refresh_tokens
        .issue(&user.id, device_info.as_deref(), ip.as_deref())
        .await?;
    let csrf = generate_session_token();

    let jar = jar
        .add(
            state
                .cookie_manager
                .issue_refresh_cookie(&issued.raw, issued.expires_at),
        )
        .add(state.cookie_manager.issue_csrf_cookie(&csrf));

    let body = serde_json::json!({
        "user": user,
        "refresh_token": issued.raw,
        "expires_at": issued.expires_at.to_rfc3339(),
    });
    Ok((jar, Json(body)))
}
