//! TOTP generator using HMAC-SHA1 (RFC 6238).

use std::fmt;

use base32::Alphabet;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha1::Sha1;
use url::Url;

use crate::config::Totp as TotpConfig;

/// Random bytes behind a freshly generated secret.
pub const SECRET_SIZE: usize = 32;
const ALPHABET: Alphabet = Alphabet::Rfc4648 { padding: false };

#[derive(Debug, thiserror::Error)]
pub enum TotpError {
    #[error("invalid base32 encoding")]
    InvalidSecret,
    #[error("hmac error: {0}")]
    Hmac(#[from] hmac::digest::InvalidLength),
}

/// Shared TOTP secret, base32 encoded.
#[derive(Clone, PartialEq, Eq)]
pub struct TotpSecret(String);

impl TotpSecret {
    /// Wrap an already encoded secret.
    pub fn new(secret: impl Into<String>) -> Result<Self, TotpError> {
        let secret = secret.into();
        if secret.is_empty() || base32::decode(ALPHABET, &secret).is_none() {
            return Err(TotpError::InvalidSecret);
        }

        Ok(Self(secret))
    }

    /// Draw a new secret from the OS RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SECRET_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(base32::encode(ALPHABET, &bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn bytes(&self) -> Result<Vec<u8>, TotpError> {
        base32::decode(ALPHABET, &self.0).ok_or(TotpError::InvalidSecret)
    }
}

impl fmt::Debug for TotpSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TotpSecret(***)")
    }
}

/// Time-based one-time password engine.
#[derive(Debug, Clone)]
pub struct Totp {
    issuer: String,
    digits: u32,
    period: u64,
    skew: u8,
}

impl Default for Totp {
    fn default() -> Self {
        Self::new(&TotpConfig::default())
    }
}

impl Totp {
    /// Create a new [`Totp`].
    pub fn new(config: &TotpConfig) -> Self {
        Self {
            issuer: config.issuer.clone(),
            digits: config.digits,
            period: config.period.max(1),
            skew: config.skew,
        }
    }

    /// Build the `otpauth://` URI authenticator applications scan.
    pub fn provisioning_uri(&self, secret: &TotpSecret, account: &str) -> String {
        let label = format!("{}:{}", self.issuer, account);
        let mut url = match Url::parse("otpauth://totp/") {
            Ok(url) => url,
            Err(_) => return String::default(),
        };

        url.path_segments_mut()
            .map(|mut segments| {
                segments.clear().push(&label);
            })
            .ok();
        url.query_pairs_mut()
            .append_pair("secret", secret.as_str())
            .append_pair("issuer", &self.issuer)
            .append_pair("algorithm", "SHA1")
            .append_pair("digits", &self.digits.to_string())
            .append_pair("period", &self.period.to_string());

        url.to_string()
    }

    /// Generate a fresh secret and its provisioning URI.
    pub fn generate_secret(&self, account: &str) -> (TotpSecret, String) {
        let secret = TotpSecret::generate();
        let uri = self.provisioning_uri(&secret, account);
        (secret, uri)
    }

    /// Code for the time step containing `timestamp`.
    pub fn generate_at(
        &self,
        secret: &TotpSecret,
        timestamp: u64,
    ) -> Result<String, TotpError> {
        self.code(&secret.bytes()?, timestamp / self.period)
    }

    /// Code for the current time step.
    pub fn generate(&self, secret: &TotpSecret) -> Result<String, TotpError> {
        self.generate_at(secret, now())
    }

    /// Check a submitted code against the current time step.
    pub fn verify(&self, secret: &TotpSecret, code: &str) -> bool {
        self.verify_at(secret, code, now())
    }

    /// Check a submitted code, tolerating `skew` steps on both sides of
    /// `timestamp`.
    pub fn verify_at(&self, secret: &TotpSecret, code: &str, timestamp: u64) -> bool {
        let code = code.trim();
        if code.len() != self.digits as usize || !code.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }

        let key = match secret.bytes() {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(error = %err, "stored TOTP secret cannot be decoded");
                return false;
            },
        };

        let current = timestamp / self.period;
        let skew = self.skew as u64;
        let mut matched = false;

        for counter in current.saturating_sub(skew)..=current.saturating_add(skew) {
            if let Ok(expected) = self.code(&key, counter) {
                // Keep scanning so every code costs the same.
                matched |= constant_time_eq::constant_time_eq(
                    expected.as_bytes(),
                    code.as_bytes(),
                );
            }
        }

        matched
    }

    fn code(&self, key: &[u8], counter: u64) -> Result<String, TotpError> {
        let mut mac = Hmac::<Sha1>::new_from_slice(key)?;
        mac.update(&counter.to_be_bytes());
        let result = mac.finalize().into_bytes();

        // Dynamic truncation.
        let offset = (result[19] & 0x0f) as usize;
        let binary_code = ((result[offset] as u32 & 0x7f) << 24)
            | ((result[offset + 1] as u32) << 16)
            | ((result[offset + 2] as u32) << 8)
            | (result[offset + 3] as u32);

        let code = binary_code % 10u32.pow(self.digits);
        Ok(format!("{:0>width$}", code, width = self.digits as usize))
    }
}

fn now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
