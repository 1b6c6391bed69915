// src/services/refresh_tokens.rs
//! Refresh token persistence.
//!
//! The raw token exists only in the HttpOnly cookie and in the response
//! body at issuance time. At rest only its SHA-256 hash is stored, so a
//! database compromise cannot yield usable tokens. Revocation sets a flag;
//! rows are never deleted here.

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, SqlitePool};
use tracing::{error, info};

use super::cookies::generate_session_token;
use crate::common::{generate_token_id, ApiError};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn format_ts(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// SHA-256 of the raw token, lowercase hex.
pub fn hash_token(raw: &str) -> String {
    Sha256::digest(raw.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[derive(FromRow, Debug, Clone)]
pub struct RefreshTokenRecord {
    pub id: String,
    pub user_id: String,
    pub token_hash: String,
    pub device_info: Option<String>,
    pub ip_address: Option<String>,
    pub expires_at: String,
    pub revoked_at: Option<String>,
    pub created_at: Option<String>,
}

pub struct IssuedRefreshToken {
    pub raw: String,
    pub expires_at: DateTime<Utc>,
}

pub struct RefreshTokenStore {
    db: SqlitePool,
    ttl_days: i64,
}

impl RefreshTokenStore {
    pub fn new(db: SqlitePool, ttl_days: i64) -> Self {
        Self { db, ttl_days }
    }

    pub async fn issue(
        &self,
        user_id: &str,
        device_info: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<IssuedRefreshToken, ApiError> {
        let raw = generate_session_token();
        let expires_at = Utc::now() + Duration::days(self.ttl_days);
        let id = generate_token_id();

        sqlx::query(
            r#"
            INSERT INTO refresh_tokens (id, user_id, token_hash, device_info, ip_address, expires_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(hash_token(&raw))
        .bind(device_info)
        .bind(ip_address)
        .bind(format_ts(expires_at))
        .execute(&self.db)
        .await
        .map_err(|e| {
            error!(error = %e, user_id = %user_id, "Database error issuing refresh token");
            ApiError::DatabaseError(e)
        })?;

        info!(token_id = %id, user_id = %user_id, "Issued refresh token");
        Ok(IssuedRefreshToken { raw, expires_at })
    }

    /// Look up a presented raw token by hash. Revoked and expired rows do
    /// not match.
    pub async fn validate(&self, raw: &str) -> Result<Option<RefreshTokenRecord>, ApiError> {
        sqlx::query_as::<_, RefreshTokenRecord>(
            r#"
            SELECT * FROM refresh_tokens
            WHERE token_hash = ? AND revoked_at IS NULL AND expires_at > ?
            "#,
        )
        .bind(hash_token(raw))
        .bind(format_ts(Utc::now()))
        .fetch_optional(&self.db)
        .await
        .map_err(ApiError::DatabaseError)
    }

    /// Mark a presented token revoked. Returns whether a live row matched.
    pub async fn revoke(&self, raw: &str) -> Result<bool, ApiError> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = datetime('now') WHERE token_hash = ? AND revoked_at IS NULL",
        )
        .bind(hash_token(raw))
        .execute(&self.db)
        .await
        .map_err(ApiError::DatabaseError)?;
        Ok(result.rows_affected() > 0)
    }

    /// Revoke the old row and issue a replacement for the same user.
    pub async fn rotate(
        &self,
        record: &RefreshTokenRecord,
        device_info: Option<&str>,
        ip_address: Option<&str>,
    ) -> Result<IssuedRefreshToken, ApiError> {
        sqlx::query("UPDATE refresh_tokens SET revoked_at = datetime('now') WHERE id = ?")
            .bind(&record.id)
            .execute(&self.db)
            .await
            .map_err(ApiError::DatabaseError)?;
        self.issue(&record.user_id, device_info, ip_address).await
    }
}
