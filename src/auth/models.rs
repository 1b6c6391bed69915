//! Authentication data models

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Subscription plan. Closed set; the storage layer CHECK-constrains the
/// same values.
#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Plan {
    Free,
    Pro,
}

/// Account standing.
#[derive(sqlx::Type, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountStatus {
    Active,
    Suspended,
}

/// User database model
#[derive(FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct User {
    pub id: String,
    pub external_id: Option<String>,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub plan: Plan,
    pub status: AccountStatus,
    pub created_at: Option<String>,
}

impl User {
    pub fn is_suspended(&self) -> bool {
        self.status == AccountStatus::Suspended
    }
}

/// Provider ID token payload for login
#[derive(Deserialize)]
pub struct LoginPayload {
    pub id_token: String,
}

/// Query parameters for the OAuth callback
#[derive(Deserialize)]
pub struct OAuthCallbackParams {
    pub state: String,
    pub id_token: String,
}
