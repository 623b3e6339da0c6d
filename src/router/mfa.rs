//! MFA management routes. Every route requires a bearer token.

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router, middleware};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use crate::error::Result;
use crate::mfa::Enrollment;
use crate::middleware::{ClientIp, Identity, session};
use crate::router::Valid;

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct SetupBody {
    #[validate(length(min = 1, max = 255))]
    pub password: String,
    /// Current TOTP or backup code, required once MFA is enabled.
    #[validate(length(min = 1, max = 16))]
    pub code: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CodeBody {
    #[validate(length(min = 1, max = 16, message = "MFA code is required."))]
    pub code: String,
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MfaStatus {
    pub mfa_enabled: bool,
}

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        // `POST /mfa/setup` goes to `setup`.
        .route("/setup", post(setup))
        // `POST /mfa/verify` goes to `verify`.
        .route("/verify", post(verify))
        // `POST /mfa/disable` goes to `disable`.
        .route("/disable", post(disable))
        .route_layer(middleware::from_fn_with_state(state, session))
}

async fn setup(
    State(state): State<AppState>,
    identity: Identity,
    ip: ClientIp,
    Valid(body): Valid<SetupBody>,
) -> Result<Json<Enrollment>> {
    let enrollment = state
        .auth
        .setup_mfa(&identity, &body.password, body.code.as_deref(), ip.as_deref())
        .await?;

    Ok(Json(enrollment))
}

async fn verify(
    State(state): State<AppState>,
    identity: Identity,
    ip: ClientIp,
    Valid(body): Valid<CodeBody>,
) -> Result<Json<MfaStatus>> {
    state.auth.verify_mfa(&identity, &body.code, ip.as_deref()).await?;
    Ok(Json(MfaStatus { mfa_enabled: true }))
}

async fn disable(
    State(state): State<AppState>,
    identity: Identity,
    ip: ClientIp,
    Valid(body): Valid<CodeBody>,
) -> Result<Json<MfaStatus>> {
    state.auth.disable_mfa(&identity, &body.code, ip.as_deref()).await?;
    Ok(Json(MfaStatus { mfa_enabled: false }))
}
