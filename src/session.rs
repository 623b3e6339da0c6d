//! Refresh token lifecycle: issuance, rotation and revocation.

use crate::error::{Result, ServerError};
use crate::store::{NewRefreshToken, RoleId, Stores, UserId};
use crate::token::{Claims, TokenKind, TokenManager, TokenPair};

/// Mints token pairs and keeps the refresh token table in sync.
#[derive(Clone)]
pub struct SessionService {
    tokens: TokenManager,
    stores: Stores,
}

impl SessionService {
    /// Create a new [`SessionService`].
    pub fn new(tokens: TokenManager, stores: Stores) -> Self {
        Self { tokens, stores }
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    fn record(pair: &TokenPair, user_id: UserId, ip: Option<&str>) -> NewRefreshToken {
        NewRefreshToken {
            user_id,
            token: pair.refresh_token.clone(),
            expires_at: pair.refresh_expires_at,
            ip_address: ip.map(str::to_owned),
        }
    }

    /// Mint a pair and persist its refresh token.
    pub async fn open(
        &self,
        user_id: UserId,
        role_id: RoleId,
        ip: Option<&str>,
    ) -> Result<TokenPair> {
        let pair = self.tokens.issue_pair(user_id, role_id)?;
        self.stores
            .within(self.stores.tokens.store(Self::record(&pair, user_id, ip)))
            .await?;

        Ok(pair)
    }

    /// Exchange a live refresh token for a new pair. The presented token is
    /// revoked in the same unit that persists its replacement.
    pub async fn rotate(&self, refresh_token: &str, ip: Option<&str>) -> Result<TokenPair> {
        let claims = self.tokens.validate(refresh_token, TokenKind::Refresh)?;
        let pair = self.tokens.issue_pair(claims.user_id, claims.role_id)?;

        let rotated = self
            .stores
            .within(self.stores.tokens.rotate(
                refresh_token,
                claims.user_id,
                Self::record(&pair, claims.user_id, ip),
            ))
            .await?;

        if !rotated {
            tracing::info!(user_id = claims.user_id, "revoked or unknown refresh token presented");
            return Err(ServerError::InvalidToken);
        }

        Ok(pair)
    }

    /// Check an access token.
    pub fn validate_access(&self, token: &str) -> Result<Claims> {
        self.tokens.validate(token, TokenKind::Access)
    }

    /// Revoke every live refresh token of one account.
    pub async fn revoke_user(&self, user_id: UserId) -> Result<u64> {
        self.stores
            .within(self.stores.tokens.revoke_all_for_user(user_id))
            .await
    }

    /// Revoke every live refresh token.
    pub async fn revoke_everyone(&self) -> Result<u64> {
        self.stores.within(self.stores.tokens.revoke_all()).await
    }
}
