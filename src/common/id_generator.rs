// src/common/id_generator.rs
//! Crockford Base32 ID Generator
//!
//! Generates human-readable, prefixed IDs using Crockford Base32 encoding.
//! Format: PREFIX_XXXXXXXX (e.g., U_K7NP3X2M for users)
//!
//! Benefits:
//! - No ambiguous characters (excludes I, L, O, U)
//! - Case-insensitive
//! - Easy to read, type, and communicate verbally

use rand::Rng;

/// Crockford Base32 alphabet (excludes I, L, O, U to avoid confusion)
const CROCKFORD_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Entity type prefixes for ID generation
#[derive(Debug, Clone, Copy)]
pub enum EntityPrefix {
    /// User (U_)
    User,
    /// Refresh token row (K_) - K for Key
    Token,
    /// Scan (S_)
    Scan,
    /// Usage record (R_) - R for Record
    UsageRecord,
}

impl EntityPrefix {
    fn as_str(&self) -> &'static str {
        match self {
            EntityPrefix::User => "U",
            EntityPrefix::Token => "K",
            EntityPrefix::Scan => "S",
            EntityPrefix::UsageRecord => "R",
        }
    }
}

/// Generate a random Crockford Base32 string of the given length
pub fn generate_raw_id(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| {
            let idx = rng.gen_range(0..CROCKFORD_ALPHABET.len());
            CROCKFORD_ALPHABET[idx] as char
        })
        .collect()
}

/// Generate a prefixed entity ID
pub fn generate_id(prefix: EntityPrefix) -> String {
    format!("{}_{}", prefix.as_str(), generate_raw_id(8))
}

pub fn generate_user_id() -> String {
    generate_id(EntityPrefix::User)
}

pub fn generate_token_id() -> String {
    generate_id(EntityPrefix::Token)
}

pub fn generate_scan_id() -> String {
    generate_id(EntityPrefix::Scan)
}

pub fn generate_usage_record_id() -> String {
    generate_id(EntityPrefix::UsageRecord)
}
