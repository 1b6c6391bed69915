// src/services/cookies.rs
//! Session cookie issuance and CSRF double-submit validation.
//!
//! The refresh token lives in an HttpOnly cookie that script can never
//! read; the CSRF token lives in a script-readable cookie the client must
//! echo in a custom header. A cross-site attacker can trigger a
//! cookie-bearing request but cannot read the CSRF cookie to reproduce it
//! in the header, so state-changing requests without a matching header are
//! rejected.

use axum_extra::extract::cookie::{Cookie, SameSite};
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::Rng;
use subtle::ConstantTimeEq;

/// Cookie and header names are fixed for interop with the browser client.
pub const REFRESH_COOKIE: &str = "refresh_token";
pub const CSRF_COOKIE: &str = "csrf_token";
pub const CSRF_HEADER: &str = "x-csrf-token";

/// CSRF cookie lifetime, independent of the refresh token's.
const CSRF_TTL_SECS: i64 = 24 * 60 * 60;

pub struct CookieManager {
    secure: bool,
    domain: Option<String>,
    csrf_test_mode: bool,
}

impl CookieManager {
    /// `domain` is the apex domain in production (cross-subdomain cookies)
    /// and None in development (localhost). `csrf_test_mode` disables the
    /// double-submit check to keep integration tests deterministic.
    pub fn new(secure: bool, domain: Option<String>, csrf_test_mode: bool) -> Self {
        Self {
            secure,
            domain,
            csrf_test_mode,
        }
    }

    fn build_cookie(
        &self,
        name: &'static str,
        value: String,
        http_only: bool,
        max_age_secs: i64,
    ) -> Cookie<'static> {
        let mut builder = Cookie::build((name, value))
            .http_only(http_only)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .path("/")
            .max_age(time::Duration::seconds(max_age_secs));

        if let Some(domain) = &self.domain {
            builder = builder.domain(domain.clone());
        }

        builder.build()
    }

    pub fn issue_refresh_cookie(&self, token: &str, expires_at: DateTime<Utc>) -> Cookie<'static> {
        // Clamp so an already-passed expiry never yields a negative Max-Age.
        let max_age = (expires_at - Utc::now()).num_seconds().max(0);
        self.build_cookie(REFRESH_COOKIE, token.to_string(), true, max_age)
    }

    pub fn issue_csrf_cookie(&self, token: &str) -> Cookie<'static> {
        // Script-readable on purpose: the client echoes it in CSRF_HEADER.
        self.build_cookie(CSRF_COOKIE, token.to_string(), false, CSRF_TTL_SECS)
    }

    pub fn clear_refresh_cookie(&self) -> Cookie<'static> {
        self.build_cookie(REFRESH_COOKIE, String::new(), true, 0)
    }

    pub fn clear_csrf_cookie(&self) -> Cookie<'static> {
        self.build_cookie(CSRF_COOKIE, String::new(), false, 0)
    }

    /// Double-submit check: both values present and equal, compared in
    /// constant time.
    pub fn validate_csrf(&self, cookie_value: Option<&str>, header_value: Option<&str>) -> bool {
        if self.csrf_test_mode {
            return true;
        }
        match (cookie_value, header_value) {
            (Some(cookie), Some(header)) if !cookie.is_empty() => {
                bool::from(cookie.as_bytes().ct_eq(header.as_bytes()))
            }
            _ => false,
        }
    }
}

/// 32 random bytes, URL-safe base64. Used for both refresh and CSRF tokens.
pub fn generate_session_token() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
