// src/services/verifier.rs
//! Bearer token verification and identity extraction.
//!
//! Signature, issuer, audience and expiry are all checked before any claim
//! is trusted. Verification failures are terminal for the request; nothing
//! here retries.

use jsonwebtoken::{decode, decode_header, Validation};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use super::jwks::{KeyResolver, KeyResolverError};
use crate::common::ApiError;

const DEFAULT_LEEWAY_SECS: u64 = 60;

/// Identity extracted from a verified token. Derived once per request,
/// never persisted as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub external_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

/// Claims accepted from the identity provider.
///
/// `oid` is the provider's stable object id; `emails` is the array-valued
/// form some tenant policies emit instead of `email`.
#[derive(Debug, Deserialize)]
struct ProviderClaims {
    sub: Option<String>,
    oid: Option<String>,
    email: Option<String>,
    emails: Option<Vec<String>>,
    preferred_username: Option<String>,
    name: Option<String>,
    given_name: Option<String>,
    family_name: Option<String>,
}

pub struct TokenVerifier {
    issuer: String,
    audience: String,
    leeway_secs: u64,
    resolver: Arc<dyn KeyResolver>,
}

impl TokenVerifier {
    pub fn new(issuer: String, audience: String, resolver: Arc<dyn KeyResolver>) -> Self {
        Self {
            issuer,
            audience,
            leeway_secs: DEFAULT_LEEWAY_SECS,
            resolver,
        }
    }

    pub fn with_leeway(mut self, leeway_secs: u64) -> Self {
        self.leeway_secs = leeway_secs;
        self
    }

    pub async fn verify(&self, raw_token: &str) -> Result<VerifiedIdentity, ApiError> {
        let raw_token = raw_token.trim();
        if raw_token.is_empty() {
            return Err(ApiError::TokenMissing("empty bearer token".to_string()));
        }

        let header = decode_header(raw_token).map_err(|e| {
            warn!(error = %e, "Malformed token header");
            ApiError::TokenInvalid("malformed token".to_string())
        })?;
        let kid = header.kid.unwrap_or_default();

        let resolved = self.resolver.resolve(&kid).await.map_err(|e| match e {
            KeyResolverError::Fetch(msg) => ApiError::JwksFetchFailed(msg),
            KeyResolverError::UnknownKey(kid) => {
                warn!(kid = %kid, "Token signed with unknown key");
                ApiError::TokenInvalid("unknown signing key".to_string())
            }
        })?;

        let mut validation = Validation::new(resolved.algorithm);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&[self.audience.as_str()]);
        validation.leeway = self.leeway_secs;

        let data = decode::<ProviderClaims>(raw_token, &resolved.key, &validation)
            .map_err(map_jwt_error)?;

        let identity = extract_identity(data.claims)?;
        debug!(external_id = %identity.external_id, "Token verification successful");
        Ok(identity)
    }
}

fn map_jwt_error(e: jsonwebtoken::errors::Error) -> ApiError {
    use jsonwebtoken::errors::ErrorKind;
    match e.kind() {
        ErrorKind::ExpiredSignature => ApiError::TokenExpired("token has expired".to_string()),
        ErrorKind::InvalidIssuer => ApiError::TokenClaimInvalid("issuer mismatch".to_string()),
        ErrorKind::InvalidAudience => {
            ApiError::TokenClaimInvalid("audience mismatch".to_string())
        }
        ErrorKind::MissingRequiredClaim(claim) => {
            ApiError::TokenClaimInvalid(format!("missing required claim `{}`", claim))
        }
        _ => {
            warn!(error = %e, "Token validation failed");
            ApiError::TokenInvalid("invalid token".to_string())
        }
    }
}

/// Claim precedence: `oid` over `sub` for the stable external id;
/// `emails[0]`, then `email`, then the principal-name claim for email
/// (optional, absence is fine); `name`, else given + family, for display.
fn extract_identity(claims: ProviderClaims) -> Result<VerifiedIdentity, ApiError> {
    let external_id = claims
        .oid
        .filter(|s| !s.is_empty())
        .or_else(|| claims.sub.filter(|s| !s.is_empty()))
        .ok_or_else(|| ApiError::TokenClaimInvalid("token missing subject".to_string()))?;

    let email = claims
        .emails
        .and_then(|list| list.into_iter().next())
        .or(claims.email)
        .or(claims.preferred_username)
        .filter(|e| !e.is_empty());

    let display_name = claims
        .name
        .filter(|n| !n.is_empty())
        .or_else(|| match (claims.given_name, claims.family_name) {
            (Some(given), Some(family)) if !given.is_empty() && !family.is_empty() => {
                Some(format!("{} {}", given, family))
            }
            _ => None,
        });

    Ok(VerifiedIdentity {
        external_id,
        email,
        display_name,
    })
}
