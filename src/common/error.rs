// Error handling types for the API

use axum::{
    http::{HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::fmt;
use tracing::error;

/// Quota snapshot carried by a quota-exceeded failure so the client can
/// render an accurate countdown without a second lookup.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaExceededInfo {
    #[serde(rename = "scansUsed")]
    pub used: i64,
    #[serde(rename = "scansLimit")]
    pub limit: i64,
    #[serde(rename = "scansRemaining")]
    pub remaining: i64,
    /// Seconds until the oldest in-window record slides out. Only set for
    /// registered callers; anonymous denials carry no Retry-After.
    #[serde(skip)]
    pub retry_after: Option<i64>,
}

/// API error types
#[derive(Debug)]
pub enum ApiError {
    TokenMissing(String),
    TokenInvalid(String),
    TokenExpired(String),
    TokenClaimInvalid(String),
    JwksFetchFailed(String),
    UserCreateFailed(String),
    UserSuspended(String),
    QuotaExceeded(QuotaExceededInfo),
    CsrfMismatch(String),
    BadRequest(String),
    InternalServer(String),
    DatabaseError(sqlx::Error),
}

impl ApiError {
    /// Stable machine-readable code for client-side branching.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::TokenMissing(_) => "TOKEN_MISSING",
            ApiError::TokenInvalid(_) => "TOKEN_INVALID",
            ApiError::TokenExpired(_) => "TOKEN_EXPIRED",
            ApiError::TokenClaimInvalid(_) => "TOKEN_CLAIM_INVALID",
            ApiError::JwksFetchFailed(_) => "JWKS_FETCH_FAILED",
            ApiError::UserCreateFailed(_) => "USER_CREATE_FAILED",
            ApiError::UserSuspended(_) => "USER_SUSPENDED",
            ApiError::QuotaExceeded(_) => "QUOTA_EXCEEDED",
            ApiError::CsrfMismatch(_) => "CSRF_MISMATCH",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::InternalServer(_) => "INTERNAL_SERVER_ERROR",
            ApiError::DatabaseError(_) => "DATABASE_ERROR",
        }
    }

    fn is_bearer_challenge(&self) -> bool {
        matches!(
            self,
            ApiError::TokenMissing(_)
                | ApiError::TokenInvalid(_)
                | ApiError::TokenExpired(_)
                | ApiError::TokenClaimInvalid(_)
        )
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::TokenMissing(msg) => write!(f, "Token Missing: {}", msg),
            ApiError::TokenInvalid(msg) => write!(f, "Token Invalid: {}", msg),
            ApiError::TokenExpired(msg) => write!(f, "Token Expired: {}", msg),
            ApiError::TokenClaimInvalid(msg) => write!(f, "Token Claim Invalid: {}", msg),
            ApiError::JwksFetchFailed(msg) => write!(f, "Key Set Unreachable: {}", msg),
            ApiError::UserCreateFailed(msg) => write!(f, "User Provisioning Failed: {}", msg),
            ApiError::UserSuspended(msg) => write!(f, "Account Suspended: {}", msg),
            ApiError::QuotaExceeded(info) => {
                write!(f, "Quota Exceeded: {}/{} used", info.used, info.limit)
            }
            ApiError::CsrfMismatch(msg) => write!(f, "CSRF Validation Failed: {}", msg),
            ApiError::BadRequest(msg) => write!(f, "Bad Request: {}", msg),
            ApiError::InternalServer(msg) => write!(f, "Internal Server Error: {}", msg),
            ApiError::DatabaseError(e) => write!(f, "Database Error: {}", e),
        }
    }
}

/// JSON error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let code = self.code();
        let bearer_challenge = self.is_bearer_challenge();

        // Quota denials carry the snapshot in both headers and body.
        if let ApiError::QuotaExceeded(info) = &self {
            let body = serde_json::json!({
                "error": "scan quota exceeded",
                "code": code,
                "scansUsed": info.used,
                "scansLimit": info.limit,
                "scansRemaining": info.remaining,
            });
            let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
            let headers = response.headers_mut();
            if let Ok(v) = HeaderValue::from_str(&info.used.to_string()) {
                headers.insert("x-quota-used", v);
            }
            if let Ok(v) = HeaderValue::from_str(&info.limit.to_string()) {
                headers.insert("x-quota-limit", v);
            }
            if let Ok(v) = HeaderValue::from_str(&info.remaining.to_string()) {
                headers.insert("x-quota-remaining", v);
            }
            if let Some(retry_after) = info.retry_after {
                if let Ok(v) = HeaderValue::from_str(&retry_after.to_string()) {
                    headers.insert("retry-after", v);
                }
            }
            return response;
        }

        let (status, error_message) = match self {
            ApiError::TokenMissing(msg)
            | ApiError::TokenInvalid(msg)
            | ApiError::TokenExpired(msg)
            | ApiError::TokenClaimInvalid(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::JwksFetchFailed(msg) => {
                error!(detail = %msg, "Identity provider key set unreachable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "token verification temporarily unavailable".to_string(),
                )
            }
            ApiError::UserCreateFailed(msg) => {
                error!(detail = %msg, "User provisioning failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "account provisioning failed".to_string(),
                )
            }
            ApiError::UserSuspended(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::CsrfMismatch(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::InternalServer(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            ApiError::DatabaseError(e) => {
                error!(error = %e, "Database error occurred");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database operation failed".to_string(),
                )
            }
            ApiError::QuotaExceeded(_) => unreachable!("handled above"),
        };

        let error_response = ErrorResponse {
            error: error_message,
            code: code.to_string(),
        };

        let mut response = (status, Json(error_response)).into_response();
        if bearer_challenge {
            let challenge = format!("Bearer realm=\"snapmacro\", error=\"{}\"", code);
            if let Ok(v) = HeaderValue::from_str(&challenge) {
                response.headers_mut().insert("www-authenticate", v);
            }
        }
        response
    }
}
