use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString, rand_core::OsRng},
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;

use crate::error::{Error, Result};
use crate::hash::sha256_hex;

const ARGON2_MEMORY: u32 = 64 * 1024; // 64 MiB, in KiB
const ARGON2_ITERATIONS: u32 = 3;
const ARGON2_PARALLELISM: u32 = 1;
const ARGON2_OUTPUT_LEN: usize = 32;

const SECRET_BYTES: usize = 32;

pub const SESSION_TTL_DAYS: i64 = 7;
pub const RESET_TTL_HOURS: i64 = 1;

/// A freshly minted bearer. The plaintext is handed out exactly once; only
/// the SHA-256 hex digest is ever stored.
pub struct MintedToken {
    pub plaintext: String,
    pub hash: String,
}

/// Mints a session/setup/node bearer: 32 cryptographically random bytes,
/// base64url without padding.
pub fn mint_token() -> MintedToken {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let plaintext = URL_SAFE_NO_PAD.encode(bytes);
    let hash = sha256_hex(plaintext.as_bytes());
    MintedToken { plaintext, hash }
}

/// Digest of a presented bearer, for lookup against stored hashes.
#[must_use]
pub fn hash_token(plaintext: &str) -> String {
    sha256_hex(plaintext.as_bytes())
}

#[must_use]
pub fn session_expiry() -> DateTime<Utc> {
    Utc::now() + Duration::days(SESSION_TTL_DAYS)
}

#[must_use]
pub fn reset_expiry() -> DateTime<Utc> {
    Utc::now() + Duration::hours(RESET_TTL_HOURS)
}

/// Memory-hard hasher for user passwords. Bearer tokens use the fast SHA-256
/// digest instead; only passwords pay the argon2 cost.
pub struct PasswordHasher {
    argon2: Argon2<'static>,
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl PasswordHasher {
    #[must_use]
    pub fn new() -> Self {
        let params = Params::new(
            ARGON2_MEMORY,
            ARGON2_ITERATIONS,
            ARGON2_PARALLELISM,
            Some(ARGON2_OUTPUT_LEN),
        )
        .expect("invalid argon2 params");

        Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        }
    }

    pub fn hash(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| Error::Config(format!("failed to hash password: {e}")))?;
        Ok(hash.to_string())
    }

    /// Verifies a password against a stored PHC hash. A malformed stored
    /// hash is an authentication failure, not a crash.
    pub fn verify(&self, password: &str, hash: &str) -> Result<bool> {
        let parsed_hash = PasswordHash::new(hash).map_err(|_| Error::Unauthorized)?;

        match self.argon2.verify_password(password.as_bytes(), &parsed_hash) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(Error::Config(format!("failed to verify password: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minted_token_shape() {
        let minted = mint_token();
        // 32 bytes base64url without padding is 43 chars.
        assert_eq!(minted.plaintext.len(), 43);
        assert_eq!(minted.hash.len(), 64);
        assert!(minted.hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash_token(&minted.plaintext), minted.hash);
    }

    #[test]
    fn test_minted_tokens_are_unique() {
        assert_ne!(mint_token().plaintext, mint_token().plaintext);
    }

    #[test]
    fn test_single_byte_mutation_changes_hash() {
        let minted = mint_token();
        let mut mutated = minted.plaintext.clone().into_bytes();
        mutated[0] = if mutated[0] == b'A' { b'B' } else { b'A' };
        let mutated = String::from_utf8(mutated).unwrap();
        assert_ne!(hash_token(&mutated), minted.hash);
    }

    #[test]
    fn test_password_hash_round_trip() {
        let hasher = PasswordHasher::new();
        let hash = hasher.hash("correct horse").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify("correct horse", &hash).unwrap());
        assert!(!hasher.verify("wrong horse", &hash).unwrap());
    }

    #[test]
    fn test_truncated_hash_is_unauthorized() {
        let hasher = PasswordHasher::new();
        let hash = hasher.hash("secret").unwrap();
        let truncated = &hash[..hash.len() / 2];
        assert!(matches!(
            hasher.verify("secret", truncated),
            Err(Error::Unauthorized)
        ));
    }
}
