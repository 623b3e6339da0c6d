//! Permission gate applied in front of protected handlers.

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::AppState;
use crate::error::{Result, ServerError};
use crate::middleware::Identity;
use crate::store::Stores;

/// Read user accounts.
pub const USERS_READ: &str = "users_read";
/// Update user accounts.
pub const USERS_WRITE: &str = "users_write";
/// Delete user accounts.
pub const USERS_DELETE: &str = "users_delete";
/// Revoke every refresh token.
pub const SESSIONS_REVOKE: &str = "sessions_revoke";
/// Read the audit log.
pub const LOGS_READ: &str = "logs_read";

/// Resolve role to permission edges, denying on any doubt.
#[derive(Clone)]
pub struct PermissionGate {
    stores: Stores,
}

impl PermissionGate {
    /// Create a new [`PermissionGate`].
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }

    /// Allow only when the caller's active role holds `permission`. Lookup
    /// failures deny.
    pub async fn authorize(&self, identity: &Identity, permission: &str) -> Result<()> {
        match self
            .stores
            .within(
                self.stores
                    .permissions
                    .role_has_permission(identity.role_id, permission),
            )
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::debug!(
                    user_id = identity.user_id,
                    role = %identity.role,
                    permission,
                    "permission denied"
                );
                Err(ServerError::Forbidden)
            },
            Err(err) => {
                tracing::error!(
                    error = %err,
                    user_id = identity.user_id,
                    permission,
                    "permission lookup failed, denying"
                );
                Err(ServerError::Forbidden)
            },
        }
    }
}

/// State of one [`guard`] layer.
#[derive(Clone)]
pub struct Guard {
    gate: PermissionGate,
    permission: &'static str,
}

/// Build the state for a [`guard`] layer requiring `permission`.
pub fn require(state: &AppState, permission: &'static str) -> Guard {
    Guard {
        gate: state.gate.clone(),
        permission,
    }
}

/// Middleware rejecting callers without the guarded permission. Must run
/// after [`crate::middleware::session`].
pub async fn guard(State(guard): State<Guard>, req: Request, next: Next) -> Result<Response> {
    let identity = req
        .extensions()
        .get::<Identity>()
        .ok_or(ServerError::Unauthorized)?;

    guard.gate.authorize(identity, guard.permission).await?;

    Ok(next.run(req).await)
}
