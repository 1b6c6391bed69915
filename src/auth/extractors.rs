//! Authentication extractors for Axum
//!
//! The per-request state machine: extract the bearer token, verify it,
//! provision the local user, check suspension, and hand the handler an
//! authenticated context. Failures are terminal for the request; nothing
//! here retries.

use async_trait::async_trait;
use axum::{
    extract::{ConnectInfo, Extension, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::models::User;
use crate::common::dev_mode::DEV_USER_ID_HEADER;
use crate::common::{ApiError, AppState};

/// Authenticated request context.
///
/// `raw_token` is kept because some downstream collaborators re-present it
/// to other services; it is absent on the dev-header path.
#[derive(Debug)]
pub struct AuthedUser {
    pub user: User,
    pub raw_token: Option<String>,
}

/// Like [`AuthedUser`] but an absent `Authorization` header means an
/// anonymous caller instead of a 401. A header that is present and bad
/// still fails closed.
#[derive(Debug)]
pub struct OptionalAuthedUser(pub Option<AuthedUser>);

/// Pull the bearer token out of the `Authorization` header.
///
/// Absent header and empty-after-scheme token are distinct from a
/// non-Bearer scheme: the former two are "nothing was presented", the
/// latter is a malformed credential.
pub(crate) fn extract_bearer(headers: &HeaderMap) -> Result<String, ApiError> {
    let Some(value) = headers.get(AUTHORIZATION) else {
        return Err(ApiError::TokenMissing(
            "missing Authorization header".to_string(),
        ));
    };
    let value = value
        .to_str()
        .map_err(|_| ApiError::TokenInvalid("malformed Authorization header".to_string()))?;
    let Some(rest) = value.strip_prefix("Bearer ") else {
        return Err(ApiError::TokenInvalid(
            "authorization scheme must be Bearer".to_string(),
        ));
    };
    let token = rest.trim();
    if token.is_empty() {
        return Err(ApiError::TokenMissing("empty bearer token".to_string()));
    }
    Ok(token.to_string())
}

/// Best-effort client IP for anonymous metering and session records.
/// Returns None when no address can be determined; callers treat that as
/// fail-open rather than rejecting the request.
pub(crate) fn extract_client_ip(
    headers: &HeaderMap,
    connect_info: Option<&ConnectInfo<SocketAddr>>,
) -> Option<String> {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            // First IP in the chain is the original client.
            if let Some(first_ip) = forwarded_str.split(',').next() {
                let first_ip = first_ip.trim();
                if !first_ip.is_empty() {
                    return Some(first_ip.to_string());
                }
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(ip_str) = real_ip.to_str() {
            return Some(ip_str.to_string());
        }
    }

    connect_info.map(|info| info.0.ip().to_string())
}

/// Verify a raw bearer token, provision the local user, and enforce
/// suspension. Shared between the extractor and the login handlers.
pub(crate) async fn resolve_bearer_user(
    state: &AppState,
    raw_token: &str,
) -> Result<User, ApiError> {
    let identity = state.verifier.verify(raw_token).await?;
    let user = state.identity_store.get_or_create(&identity).await?;
    if user.is_suspended() {
        // Checked after identity resolution so the caller gets a precise
        // 403 instead of being misclassified as unauthenticated.
        warn!(user_id = %user.id, "Suspended user rejected");
        return Err(ApiError::UserSuspended("account suspended".to_string()));
    }
    Ok(user)
}

async fn dev_header_user(state: &AppState, dev_id: &str) -> Result<User, ApiError> {
    let existing = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(dev_id)
        .fetch_optional(&state.db)
        .await
        .map_err(ApiError::DatabaseError)?;

    let user = match existing {
        Some(user) => user,
        None => {
            sqlx::query("INSERT INTO users (id, plan, status) VALUES (?, 'FREE', 'ACTIVE')")
                .bind(dev_id)
                .execute(&state.db)
                .await
                .map_err(ApiError::DatabaseError)?;
            sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
                .bind(dev_id)
                .fetch_one(&state.db)
                .await
                .map_err(ApiError::DatabaseError)?
        }
    };

    debug!(user_id = %user.id, "DEV MODE: identity taken from {DEV_USER_ID_HEADER} header");
    if user.is_suspended() {
        return Err(ApiError::UserSuspended("account suspended".to_string()));
    }
    Ok(user)
}

async fn authenticate(state: &AppState, parts: &Parts) -> Result<AuthedUser, ApiError> {
    // DEV MODE: the x-user-id header is an explicitly gated identity
    // source; the gate is forced off in production builds of the config.
    if state.dev_mode.is_enabled() {
        if let Some(dev_id) = parts
            .headers
            .get(DEV_USER_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .filter(|s| !s.is_empty())
        {
            let user = dev_header_user(state, dev_id).await?;
            return Ok(AuthedUser {
                user,
                raw_token: None,
            });
        }
    }

    let token = extract_bearer(&parts.headers)?;
    let user = resolve_bearer_user(state, &token).await?;
    Ok(AuthedUser {
        user,
        raw_token: Some(token),
    })
}

async fn app_state<S: Send + Sync>(parts: &mut Parts, state: &S) -> Result<AppState, ApiError> {
    let Extension(state_lock): Extension<Arc<RwLock<AppState>>> =
        Extension::from_request_parts(parts, state)
            .await
            .map_err(|_| ApiError::InternalServer("missing app state".to_string()))?;
    let app_state = state_lock.read().await.clone();
    Ok(app_state)
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthedUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = app_state(parts, state).await?;
        authenticate(&app_state, parts).await
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for OptionalAuthedUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = app_state(parts, state).await?;

        let has_dev_header =
            app_state.dev_mode.is_enabled() && parts.headers.contains_key(DEV_USER_ID_HEADER);
        if !has_dev_header && !parts.headers.contains_key(AUTHORIZATION) {
            return Ok(OptionalAuthedUser(None));
        }

        let authed = authenticate(&app_state, parts).await?;
        Ok(OptionalAuthedUser(Some(authed)))
    }
}
