//! Manage json web tokens.

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
};
use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::config::Token as TokenConfig;
use crate::error::{Result, ServerError};

/// Shortest accepted HMAC secret, in bytes.
pub const MIN_SECRET_LENGTH: usize = 32;
const JTI_LENGTH: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("signing secret must be at least {MIN_SECRET_LENGTH} bytes")]
    WeakSecret,
    #[error(transparent)]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

/// Purpose of a token, carried in the `sub` claim.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

/// Pieces of information asserted on a JWT.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: i64,
    pub role_id: i64,
    /// Either `access` or `refresh`.
    pub sub: TokenKind,
    /// Identifies the time at which the JWT was issued.
    pub iat: u64,
    /// Identifies the expiration time on or after which the JWT must not be
    /// accepted for processing.
    pub exp: u64,
    /// Makes two tokens minted during the same second distinct.
    pub jti: String,
}

/// Freshly minted access and refresh tokens.
#[derive(Clone, Debug)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
    pub refresh_expires_at: DateTime<Utc>,
}

/// Manage JWT tokens.
#[derive(Clone)]
pub struct TokenManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_lifetime: u64,
    refresh_lifetime: u64,
}

impl TokenManager {
    /// Create a new [`TokenManager`] signing with HS256.
    pub fn new(
        secret: &[u8],
        config: &TokenConfig,
    ) -> std::result::Result<Self, TokenError> {
        if secret.len() < MIN_SECRET_LENGTH {
            return Err(TokenError::WeakSecret);
        }

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            access_lifetime: config.access_lifetime,
            refresh_lifetime: config.refresh_lifetime,
        })
    }

    fn create(&self, user_id: i64, role_id: i64, kind: TokenKind) -> Result<(String, u64)> {
        let iat = Utc::now().timestamp().max(0) as u64;
        let lifetime = match kind {
            TokenKind::Access => self.access_lifetime,
            TokenKind::Refresh => self.refresh_lifetime,
        };
        let claims = Claims {
            user_id,
            role_id,
            sub: kind,
            iat,
            exp: iat + lifetime,
            jti: OsRng
                .sample_iter(&Alphanumeric)
                .take(JTI_LENGTH)
                .map(char::from)
                .collect(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(TokenError::from)?;

        Ok((token, claims.exp))
    }

    /// Mint an access and a refresh token sharing the same identity claims.
    pub fn issue_pair(&self, user_id: i64, role_id: i64) -> Result<TokenPair> {
        let (access_token, _) = self.create(user_id, role_id, TokenKind::Access)?;
        let (refresh_token, refresh_exp) =
            self.create(user_id, role_id, TokenKind::Refresh)?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_in: self.access_lifetime,
            refresh_expires_at: Utc
                .timestamp_opt(refresh_exp as i64, 0)
                .single()
                .unwrap_or_else(Utc::now),
        })
    }

    /// Check signature, expiry and purpose.
    ///
    /// Every failure maps to the same [`ServerError::InvalidToken`].
    pub fn validate(&self, token: &str, expected: TokenKind) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        let claims = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|err| {
                tracing::debug!(error = %err, "token rejected");
                ServerError::InvalidToken
            })?
            .claims;

        if claims.sub != expected {
            tracing::debug!(found = ?claims.sub, ?expected, "token used for the wrong purpose");
            return Err(ServerError::InvalidToken);
        }

        Ok(claims)
    }
}

#[cfg(test)]
pub(crate) const TEST_SECRET: &[u8] = b"a-test-secret-that-is-long-enough-for-hs256";
