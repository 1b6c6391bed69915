// src/services/identity.rs
//! Local identity provisioning: external provider identity -> User row.

use sqlx::SqlitePool;
use tracing::{debug, error, info};

use super::verifier::VerifiedIdentity;
use crate::auth::models::User;
use crate::common::{generate_user_id, safe_email_log, ApiError};

pub struct IdentityStore {
    db: SqlitePool,
}

impl IdentityStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Look up the local user for a verified identity, creating it on first
    /// sight. Idempotent under repeated and concurrent calls: a losing
    /// concurrent insert hits the UNIQUE(external_id) constraint and
    /// re-fetches the winner's row. The provider is the source of truth for
    /// email, so a changed provider email overwrites the stored one.
    pub async fn get_or_create(&self, identity: &VerifiedIdentity) -> Result<User, ApiError> {
        if let Some(user) = self.find_by_external_id(&identity.external_id).await? {
            return self.sync_email(user, identity).await;
        }

        let id = generate_user_id();
        let insert = sqlx::query(
            r#"
            INSERT INTO users (id, external_id, email, display_name, plan, status)
            VALUES (?, ?, ?, ?, 'FREE', 'ACTIVE')
            "#,
        )
        .bind(&id)
        .bind(&identity.external_id)
        .bind(identity.email.as_deref())
        .bind(identity.display_name.as_deref())
        .execute(&self.db)
        .await;

        match insert {
            Ok(_) => {
                info!(
                    user_id = %id,
                    external_id = %identity.external_id,
                    "Created user on first sight"
                );
            }
            Err(e) if is_unique_violation(&e) => {
                // A concurrent first-time request won the insert.
                debug!(
                    external_id = %identity.external_id,
                    "Concurrent user creation detected, re-fetching"
                );
            }
            Err(e) => {
                error!(
                    error = %e,
                    external_id = %identity.external_id,
                    "Database error inserting user during provisioning"
                );
                return Err(ApiError::UserCreateFailed(
                    "storage error during provisioning".to_string(),
                ));
            }
        }

        let user = self
            .find_by_external_id(&identity.external_id)
            .await?
            .ok_or_else(|| {
                error!(
                    external_id = %identity.external_id,
                    "User row missing after insert during provisioning"
                );
                ApiError::UserCreateFailed("provisioned user not found".to_string())
            })?;

        self.sync_email(user, identity).await
    }

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<User>, ApiError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE external_id = ?")
            .bind(external_id)
            .fetch_optional(&self.db)
            .await
            .map_err(|e| {
                error!(error = %e, external_id = %external_id, "Database error during user lookup");
                ApiError::UserCreateFailed("storage error during lookup".to_string())
            })
    }

    async fn sync_email(
        &self,
        mut user: User,
        identity: &VerifiedIdentity,
    ) -> Result<User, ApiError> {
        let Some(provider_email) = identity.email.as_deref() else {
            return Ok(user);
        };
        if user.email.as_deref() == Some(provider_email) {
            return Ok(user);
        }

        sqlx::query("UPDATE users SET email = ? WHERE id = ?")
            .bind(provider_email)
            .bind(&user.id)
            .execute(&self.db)
            .await
            .map_err(|e| {
                error!(error = %e, user_id = %user.id, "Database error syncing provider email");
                ApiError::UserCreateFailed("storage error during email sync".to_string())
            })?;

        info!(
            user_id = %user.id,
            email = %safe_email_log(provider_email),
            "Synced provider email to local user"
        );
        user.email = Some(provider_email.to_string());
        Ok(user)
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}
