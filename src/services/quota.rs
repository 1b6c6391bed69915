// src/services/quota.rs
//! Scan metering: append-only usage ledger plus the quota gate over it.
//!
//! The window is sliding ("within N days of now"), recomputed from the
//! ledger on every check. There is no reset job and no stored counter that
//! could drift from the log. The check-then-record pair is intentionally
//! not one atomic transaction: two concurrent requests near the boundary
//! can both pass the check and both record, overshooting the cap by a
//! small bounded amount. That is an accepted property of metering an
//! AI-cost-bounded resource, not a bug to lock away.

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::env;
use tracing::{debug, info};

use crate::auth::models::Plan;
use crate::common::{generate_usage_record_id, ApiError, QuotaExceededInfo};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone)]
pub struct QuotaConfig {
    pub free_limit: i64,
    pub anonymous_limit: i64,
    pub window_days: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            free_limit: 10,    // scans per window for FREE users
            anonymous_limit: 3, // scans per window per anonymous IP
            window_days: 30,
        }
    }
}

impl QuotaConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(limit) = env::var("QUOTA_FREE_LIMIT") {
            if let Ok(val) = limit.parse::<i64>() {
                config.free_limit = val;
            }
        }
        if let Ok(limit) = env::var("QUOTA_ANONYMOUS_LIMIT") {
            if let Ok(val) = limit.parse::<i64>() {
                config.anonymous_limit = val;
            }
        }
        if let Ok(window) = env::var("QUOTA_WINDOW_DAYS") {
            if let Ok(val) = window.parse::<i64>() {
                config.window_days = val;
            }
        }

        config
    }
}

/// Kind of metered action appended to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeteredKind {
    Scan,
}

impl MeteredKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeteredKind::Scan => "scan",
        }
    }
}

/// Identity class a quota decision is about. Anonymous callers are keyed
/// by IP, independent of any user-keyed count on the same address.
#[derive(Debug, Clone)]
pub enum QuotaSubject {
    User { id: String, plan: Plan },
    Anonymous { ip: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaScope {
    Anonymous,
    Free,
    Pro,
}

/// Snapshot returned by `check`. `limit`/`remaining` are absent for PRO
/// (unlimited); `retry_after` is set only on a registered-user denial.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    #[serde(rename = "scansUsed")]
    pub used: i64,
    #[serde(rename = "scansLimit", skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(rename = "scansRemaining", skip_serializing_if = "Option::is_none")]
    pub remaining: Option<i64>,
    pub plan: QuotaScope,
    #[serde(skip)]
    pub retry_after: Option<i64>,
}

impl QuotaDecision {
    pub fn deny_info(&self) -> QuotaExceededInfo {
        QuotaExceededInfo {
            used: self.used,
            limit: self.limit.unwrap_or(0),
            remaining: self.remaining.unwrap_or(0),
            retry_after: self.retry_after,
        }
    }
}

pub struct QuotaService {
    db: SqlitePool,
    config: QuotaConfig,
}

impl QuotaService {
    pub fn new(db: SqlitePool, config: QuotaConfig) -> Self {
        info!(
            free_limit = config.free_limit,
            anonymous_limit = config.anonymous_limit,
            window_days = config.window_days,
            "Initializing QuotaService"
        );
        Self { db, config }
    }

    fn window_cutoff(&self) -> String {
        (Utc::now() - Duration::days(self.config.window_days))
            .format(TIME_FORMAT)
            .to_string()
    }

    /// Compute whether the subject may perform one more metered action.
    /// Never mutates state.
    pub async fn check(&self, subject: &QuotaSubject) -> Result<QuotaDecision, ApiError> {
        match subject {
            QuotaSubject::User {
                id,
                plan: Plan::Pro,
            } => {
                // PRO is unconditionally allowed; usage is still counted
                // for display purposes only.
                let used = self.count_user(id).await?;
                Ok(QuotaDecision {
                    allowed: true,
                    used,
                    limit: None,
                    remaining: None,
                    plan: QuotaScope::Pro,
                    retry_after: None,
                })
            }
            QuotaSubject::User {
                id,
                plan: Plan::Free,
            } => {
                let used = self.count_user(id).await?;
                let limit = self.config.free_limit;
                let allowed = used < limit;
                let retry_after = if allowed {
                    None
                } else {
                    self.user_retry_after(id).await?
                };
                Ok(QuotaDecision {
                    allowed,
                    used,
                    limit: Some(limit),
                    remaining: Some((limit - used).max(0)),
                    plan: QuotaScope::Free,
                    retry_after,
                })
            }
            QuotaSubject::Anonymous { ip } => {
                let used = self.count_anonymous(ip).await?;
                let limit = self.config.anonymous_limit;
                Ok(QuotaDecision {
                    allowed: used < limit,
                    used,
                    limit: Some(limit),
                    remaining: Some((limit - used).max(0)),
                    plan: QuotaScope::Anonymous,
                    retry_after: None,
                })
            }
        }
    }

    /// Append one metered event. Called only after the action succeeds.
    pub async fn record(&self, subject: &QuotaSubject, kind: MeteredKind) -> Result<(), ApiError> {
        match subject {
            QuotaSubject::User { id, .. } => {
                sqlx::query("INSERT INTO usage_records (id, user_id, type) VALUES (?, ?, ?)")
                    .bind(generate_usage_record_id())
                    .bind(id)
                    .bind(kind.as_str())
                    .execute(&self.db)
                    .await
                    .map_err(ApiError::DatabaseError)?;
                debug!(user_id = %id, kind = kind.as_str(), "Recorded usage");
            }
            QuotaSubject::Anonymous { ip } => {
                sqlx::query("INSERT INTO anonymous_usage_records (id, ip_address) VALUES (?, ?)")
                    .bind(generate_usage_record_id())
                    .bind(ip)
                    .execute(&self.db)
                    .await
                    .map_err(ApiError::DatabaseError)?;
                debug!(ip = %ip, kind = kind.as_str(), "Recorded anonymous usage");
            }
        }
        Ok(())
    }

    async fn count_user(&self, user_id: &str) -> Result<i64, ApiError> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM usage_records WHERE user_id = ? AND created_at >= ?",
        )
        .bind(user_id)
        .bind(self.window_cutoff())
        .fetch_one(&self.db)
        .await
        .map_err(ApiError::DatabaseError)
    }

    async fn count_anonymous(&self, ip: &str) -> Result<i64, ApiError> {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM anonymous_usage_records WHERE ip_address = ? AND created_at >= ?",
        )
        .bind(ip)
        .bind(self.window_cutoff())
        .fetch_one(&self.db)
        .await
        .map_err(ApiError::DatabaseError)
    }

    /// Seconds until the oldest in-window record slides out of the window,
    /// i.e. when a denied FREE user next gains a slot.
    async fn user_retry_after(&self, user_id: &str) -> Result<Option<i64>, ApiError> {
        let oldest: Option<String> = sqlx::query_scalar(
            "SELECT MIN(created_at) FROM usage_records WHERE user_id = ? AND created_at >= ?",
        )
        .bind(user_id)
        .bind(self.window_cutoff())
        .fetch_one(&self.db)
        .await
        .map_err(ApiError::DatabaseError)?;

        Ok(oldest
            .and_then(|ts| NaiveDateTime::parse_from_str(&ts, TIME_FORMAT).ok())
            .map(|oldest| {
                let rolls_out = DateTime::<Utc>::from_naive_utc_and_offset(oldest, Utc)
                    + Duration::days(self.config.window_days);
                (rolls_out - Utc::now()).num_seconds().max(0)
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::migrations::run_migrations;

    async fn service(config: QuotaConfig) -> QuotaService {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        QuotaService::new(pool, config)
    }

    fn free_user(id: &str) -> QuotaSubject {
        QuotaSubject::User {
            id: id.to_string(),
            plan: Plan::Free,
        }
    }

    fn pro_user(id: &str) -> QuotaSubject {
        QuotaSubject::User {
            id: id.to_string(),
            plan: Plan::Pro,
        }
    }

    fn anon(ip: &str) -> QuotaSubject {
        QuotaSubject::Anonymous {
            ip: ip.to_string(),
        }
    }

    async fn insert_user_usage_at(service: &QuotaService, user_id: &str, created_at: &str) {
        sqlx::query("INSERT INTO usage_records (id, user_id, type, created_at) VALUES (?, ?, 'scan', ?)")
            .bind(generate_usage_record_id())
            .bind(user_id)
            .bind(created_at)
            .execute(&service.db)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn free_user_under_limit_is_allowed() {
        let service = service(QuotaConfig {
            free_limit: 3,
            ..Default::default()
        })
        .await;
        let subject = free_user("U_A");

        service.record(&subject, MeteredKind::Scan).await.unwrap();
        service.record(&subject, MeteredKind::Scan).await.unwrap();

        let decision = service.check(&subject).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.used, 2);
        assert_eq!(decision.remaining, Some(1));
        assert_eq!(decision.limit, Some(3));
        assert_eq!(decision.plan, QuotaScope::Free);
    }

    #[tokio::test]
    async fn free_user_at_limit_is_denied_with_retry_after() {
        let service = service(QuotaConfig {
            free_limit: 3,
            ..Default::default()
        })
        .await;
        let subject = free_user("U_A");

        for _ in 0..3 {
            service.record(&subject, MeteredKind::Scan).await.unwrap();
        }

        let decision = service.check(&subject).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.used, 3);
        assert_eq!(decision.remaining, Some(0));
        let retry_after = decision.retry_after.unwrap();
        assert!(retry_after > 0);
        // No record is older than the window, so the wait is bounded by it.
        assert!(retry_after <= 30 * 24 * 60 * 60);
    }

    #[tokio::test]
    async fn pro_user_is_always_allowed_but_still_counted() {
        let service = service(QuotaConfig {
            free_limit: 1,
            ..Default::default()
        })
        .await;
        let subject = pro_user("U_P");

        for _ in 0..5 {
            service.record(&subject, MeteredKind::Scan).await.unwrap();
        }

        let decision = service.check(&subject).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.used, 5);
        assert_eq!(decision.limit, None);
        assert_eq!(decision.remaining, None);
        assert_eq!(decision.plan, QuotaScope::Pro);
    }

    #[tokio::test]
    async fn anonymous_quota_is_keyed_by_ip() {
        let service = service(QuotaConfig {
            anonymous_limit: 3,
            ..Default::default()
        })
        .await;

        for _ in 0..3 {
            service
                .record(&anon("203.0.113.1"), MeteredKind::Scan)
                .await
                .unwrap();
        }

        let denied = service.check(&anon("203.0.113.1")).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.used, 3);
        assert_eq!(denied.remaining, Some(0));
        assert_eq!(denied.limit, Some(3));
        assert!(denied.retry_after.is_none());

        let other_ip = service.check(&anon("203.0.113.2")).await.unwrap();
        assert!(other_ip.allowed);
        assert_eq!(other_ip.used, 0);
    }

    #[tokio::test]
    async fn anonymous_and_user_counts_are_independent() {
        let service = service(QuotaConfig::default()).await;

        // A registered user's records never bleed into the anonymous count
        // for an identical key, and vice versa.
        for _ in 0..4 {
            service
                .record(&free_user("203.0.113.9"), MeteredKind::Scan)
                .await
                .unwrap();
        }
        let anon_decision = service.check(&anon("203.0.113.9")).await.unwrap();
        assert_eq!(anon_decision.used, 0);
    }

    #[tokio::test]
    async fn window_is_sliding_not_calendar() {
        let service = service(QuotaConfig {
            free_limit: 1,
            window_days: 30,
            ..Default::default()
        })
        .await;
        let subject = free_user("U_A");

        // One record just inside the window, one just past it.
        let inside = (Utc::now() - Duration::days(29)).format(TIME_FORMAT).to_string();
        let outside = (Utc::now() - Duration::days(31)).format(TIME_FORMAT).to_string();
        insert_user_usage_at(&service, "U_A", &inside).await;
        insert_user_usage_at(&service, "U_A", &outside).await;

        let decision = service.check(&subject).await.unwrap();
        assert_eq!(decision.used, 1);
        assert!(!decision.allowed);

        // Nothing resets the log; old rows simply stop counting.
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM usage_records")
            .fetch_one(&service.db)
            .await
            .unwrap();
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn check_never_mutates_state() {
        let service = service(QuotaConfig::default()).await;
        let subject = free_user("U_A");

        for _ in 0..5 {
            service.check(&subject).await.unwrap();
        }
        let decision = service.check(&subject).await.unwrap();
        assert_eq!(decision.used, 0);
    }
}
