//! Scan handlers
//!
//! The gate-then-record pair here is deliberately not atomic; see
//! `services::quota`.

use axum::{
    extract::{ConnectInfo, Extension},
    http::HeaderMap,
    Json,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::models::{ScanAccepted, ScanRequest};
use crate::auth::extractors::{extract_client_ip, OptionalAuthedUser};
use crate::common::{generate_scan_id, ApiError, AppState};
use crate::services::{MeteredKind, QuotaSubject};

/// Work out who this request is metered as. Registered callers are keyed
/// by user id and plan; anonymous callers by client IP. `None` means the
/// IP could not be determined - the request fails open (allowed,
/// unmetered) because blocking on an infrastructure ambiguity is worse
/// than under-metering.
fn quota_subject(
    authed: &OptionalAuthedUser,
    headers: &HeaderMap,
    connect_info: Option<&ConnectInfo<SocketAddr>>,
) -> Option<QuotaSubject> {
    match &authed.0 {
        Some(authed) => Some(QuotaSubject::User {
            id: authed.user.id.clone(),
            plan: authed.user.plan,
        }),
        None => extract_client_ip(headers, connect_info)
            .map(|ip| QuotaSubject::Anonymous { ip }),
    }
}

/// POST /api/scans
/// The metered action: check quota, accept the scan, append to the ledger.
///
/// Quota denial is a 429 with `X-Quota-*` headers, not an exception-style
/// failure; the vision analysis itself belongs to a collaborator service
/// behind this boundary.
pub async fn create_scan(
    Extension(state_lock): Extension<Arc<RwLock<AppState>>>,
    authed: OptionalAuthedUser,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Json(payload): Json<ScanRequest>,
) -> Result<Json<ScanAccepted>, ApiError> {
    let state = state_lock.read().await.clone();
    let subject = quota_subject(&authed, &headers, connect_info.as_ref());

    if let Some(subject) = &subject {
        let decision = state.quota_service.check(subject).await?;
        if !decision.allowed {
            return Err(ApiError::QuotaExceeded(decision.deny_info()));
        }
    } else {
        warn!("No client IP determinable; allowing scan without metering");
    }

    let scan_id = generate_scan_id();
    debug!(scan_id = %scan_id, image_url = %payload.image_url, "Scan accepted");

    let quota = match &subject {
        Some(subject) => {
            state
                .quota_service
                .record(subject, MeteredKind::Scan)
                .await?;
            Some(state.quota_service.check(subject).await?)
        }
        None => None,
    };

    Ok(Json(ScanAccepted { scan_id, quota }))
}

/// GET /api/usage
/// Non-mutating quota snapshot for the caller, registered or anonymous.
pub async fn usage(
    Extension(state_lock): Extension<Arc<RwLock<AppState>>>,
    authed: OptionalAuthedUser,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let state = state_lock.read().await.clone();

    let Some(subject) = quota_subject(&authed, &headers, connect_info.as_ref()) else {
        // Unmeterable caller: report the fail-open outcome.
        return Ok(Json(serde_json::json!({ "allowed": true })));
    };

    let decision = state.quota_service.check(&subject).await?;
    Ok(Json(serde_json::to_value(decision).map_err(|e| {
        ApiError::InternalServer(format!("failed to serialize quota decision: {}", e))
    })?))
}
