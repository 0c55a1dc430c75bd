//! Argon2 hashing for passwords and API credentials.
//!
//! Both secrets use the same scheme: the full presented string is hashed
//! with a per-record random salt, and verification re-derives from the
//! stored PHC string. Verification failures are indistinguishable from
//! parse failures on purpose.

use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};

use crate::error::{IdentityError, Result};

/// Hash a secret with a fresh random salt. Returns a PHC-format string.
pub fn hash_secret(secret: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map_err(|e| IdentityError::Hashing(e.to_string()))?;
    Ok(hash.to_string())
}

/// Verify a secret against a stored PHC string.
pub fn verify_secret(secret: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_the_original_secret() {
        let hash = hash_secret("correct horse battery staple").unwrap();
        assert!(verify_secret("correct horse battery staple", &hash));
    }

    #[test]
    fn verify_rejects_any_alteration() {
        let hash = hash_secret("hunter2").unwrap();
        assert!(!verify_secret("hunter3", &hash));
        assert!(!verify_secret("hunter2 ", &hash));
        assert!(!verify_secret("", &hash));
    }

    #[test]
    fn verify_rejects_garbage_hashes() {
        assert!(!verify_secret("anything", "not-a-phc-string"));
    }

    #[test]
    fn salts_differ_between_hashes() {
        let a = hash_secret("same").unwrap();
        let b = hash_secret("same").unwrap();
        assert_ne!(a, b);
    }
}
