//! Cryptographic logics.

use argon2::password_hash::{
    PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::{Argon2, Params, Version};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::config::Argon2 as ArgonConfig;

type Result<T> = std::result::Result<T, CryptoError>;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("argon2 error: {0}")]
    Argon2(String),
}

/// Password manager that uses Argon2id and PHC string format for hashing and
/// verification.
pub struct PasswordManager {
    params: Params,
    /// Hash checked when the account does not exist, so both paths cost the
    /// same.
    decoy: String,
}

impl PasswordManager {
    /// Create a new [`PasswordManager`].
    pub fn new(config: Option<ArgonConfig>) -> Result<Self> {
        let config = config.unwrap_or_default();

        let params = Params::new(
            config.memory_cost,
            config.iterations,
            config.parallelism,
            Some(config.hash_length),
        )
        .map_err(|err| CryptoError::Argon2(err.to_string()))?;

        let mut manager = Self {
            params,
            decoy: String::default(),
        };
        manager.decoy = manager.hash_password(OsRng.next_u64().to_le_bytes())?;

        Ok(manager)
    }

    fn argon2(&self) -> Argon2<'_> {
        Argon2::new(
            argon2::Algorithm::Argon2id,
            Version::V0x13,
            self.params.clone(),
        )
    }

    /// Hash password using Argon2id.
    pub fn hash_password(&self, password: impl AsRef<[u8]>) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()
            .hash_password(password.as_ref(), &salt)
            .map_err(|e| CryptoError::Argon2(e.to_string()))?;

        Ok(hash.to_string())
    }

    /// Verify password against a PHC.
    pub fn verify_password(
        &self,
        password: impl AsRef<[u8]>,
        phc_hash: &str,
    ) -> bool {
        match PasswordHash::new(phc_hash) {
            Ok(parsed) => self
                .argon2()
                .verify_password(password.as_ref(), &parsed)
                .is_ok(),
            Err(err) => {
                tracing::warn!(error = %err, "stored password hash is not a valid PHC string");
                false
            },
        }
    }

    /// Burn the same work as [`PasswordManager::verify_password`] and
    /// always fail.
    pub fn decoy(&self, password: impl AsRef<[u8]>) -> bool {
        let _ = self.verify_password(password, &self.decoy);
        false
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> ArgonConfig {
    ArgonConfig {
        memory_cost: 1024,
        iterations: 1,
        parallelism: 1,
        hash_length: 32,
    }
}
