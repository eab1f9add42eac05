//! API-key secret generation and one-way hashing.
//!
//! Secrets are `tt_` plus 32 bytes of OS entropy in url-safe base64 (43
//! body characters, 46 total). Only the lookup prefix and an argon2id hash
//! survive creation; a leaked key table must not be cheap to brute-force,
//! so the hash is memory-hard.

use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand_core::RngCore;

use tunetrail_core::API_KEY_PREFIX_LEN;

/// Literal prefix carried by every API key.
pub const SECRET_PREFIX: &str = "tt_";

/// Number of entropy bytes behind each secret.
const SECRET_ENTROPY_BYTES: usize = 32;

/// Generate a fresh API-key secret.
#[must_use]
pub fn generate_secret() -> String {
    let mut entropy = [0u8; SECRET_ENTROPY_BYTES];
    OsRng.fill_bytes(&mut entropy);
    format!("{SECRET_PREFIX}{}", URL_SAFE_NO_PAD.encode(entropy))
}

/// The stored lookup prefix of a presented secret.
#[must_use]
pub fn secret_prefix(secret: &str) -> String {
    secret.chars().take(API_KEY_PREFIX_LEN).collect()
}

/// Hash a secret for storage (argon2id PHC string).
pub fn hash_secret(secret: &str) -> Result<String, String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| format!("failed to hash secret: {e}"))
}

/// Verify a candidate secret against a stored argon2id hash.
///
/// The comparison inside the verifier is constant-time.
#[must_use]
pub fn verify_secret(hash: &str, candidate: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(candidate.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_shape() {
        let secret = generate_secret();
        assert!(secret.starts_with("tt_"));
        assert_eq!(secret.len(), 46);
        assert!(
            secret[3..]
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test]
    fn prefix_is_ten_chars() {
        let secret = generate_secret();
        let prefix = secret_prefix(&secret);
        assert_eq!(prefix.len(), 10);
        assert!(secret.starts_with(&prefix));
    }

    #[test]
    fn hash_verifies_only_the_original() {
        let secret = generate_secret();
        let hash = hash_secret(&secret).unwrap();
        assert!(verify_secret(&hash, &secret));
        assert!(!verify_secret(&hash, &generate_secret()));
        assert!(!verify_secret("not-a-phc-string", &secret));
    }
}
