//! Scan request/response models

use serde::{Deserialize, Serialize};

use crate::services::quota::QuotaDecision;

/// POST /api/scans request body. The image itself lives with the upload
/// collaborator; this layer only carries the reference through.
#[derive(Deserialize)]
pub struct ScanRequest {
    pub image_url: String,
}

/// Successful scan acceptance. The flattened quota snapshot reflects the
/// state *after* this scan was recorded, so the client can render the
/// countdown without a second lookup. Absent entirely when the caller
/// could not be metered (fail-open).
#[derive(Debug, Serialize)]
pub struct ScanAccepted {
    pub scan_id: String,
    #[serde(flatten)]
    pub quota: Option<QuotaDecision>,
}
