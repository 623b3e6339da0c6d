//! Registration, login and refresh token routes.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router, middleware};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use crate::auth::{LoginOutcome, LoginRequest, Registration};
use crate::error::Result;
use crate::limits::limit;
use crate::middleware::{ClientIp, Identity, session};
use crate::permission::{SESSIONS_REVOKE, guard, require};
use crate::router::{Revoked, Valid};
use crate::store::UserProfile;
use crate::token::TokenPair;

pub const TOKEN_TYPE: &str = "Bearer";

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct RegisterBody {
    #[validate(length(min = 1, max = 100, message = "Name must contain 1 to 100 characters."))]
    pub name: String,
    #[validate(length(
        min = 1,
        max = 100,
        message = "Surname must contain 1 to 100 characters."
    ))]
    pub surname: String,
    #[validate(email(message = "Email must be formatted."))]
    pub email: String,
    #[validate(length(max = 255, message = "Password must not exceed 255 characters."))]
    pub password: String,
    #[serde(default)]
    pub birth_date: Option<NaiveDate>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct LoginBody {
    #[validate(length(min = 1, max = 255))]
    pub email: String,
    #[validate(length(min = 1, max = 255))]
    pub password: String,
    #[serde(default)]
    #[validate(length(max = 16, message = "MFA code is too long."))]
    pub mfa_code: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct RefreshBody {
    #[validate(length(min = 1, max = 2048))]
    pub refresh_token: String,
}

/// Answer of `POST /auth/login`. Absent fields are not serialized.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LoginResponse {
    pub requires_mfa: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_code_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_codes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserProfile>,
}

impl From<LoginOutcome> for LoginResponse {
    fn from(outcome: LoginOutcome) -> Self {
        match outcome {
            LoginOutcome::EnrollmentRequired(enrollment) => LoginResponse {
                requires_mfa: true,
                qr_code_url: Some(enrollment.provisioning_uri),
                secret: Some(enrollment.encoded_secret),
                backup_codes: Some(enrollment.backup_codes),
                ..Default::default()
            },
            LoginOutcome::CodeRequired => LoginResponse {
                requires_mfa: true,
                ..Default::default()
            },
            LoginOutcome::Authenticated(session) => {
                let session = *session;
                LoginResponse {
                    requires_mfa: false,
                    access_token: Some(session.tokens.access_token),
                    refresh_token: Some(session.tokens.refresh_token),
                    token_type: Some(TOKEN_TYPE.to_owned()),
                    expires_in: Some(session.tokens.expires_in),
                    user: Some(session.user),
                    ..Default::default()
                }
            },
        }
    }
}

/// Answer of `POST /auth/refresh`.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: u64,
}

impl From<TokenPair> for TokenResponse {
    fn from(pair: TokenPair) -> Self {
        Self {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            token_type: TOKEN_TYPE.to_owned(),
            expires_in: pair.expires_in,
        }
    }
}

pub fn router(state: AppState) -> Router<AppState> {
    let revoke = Router::new()
        // `POST /auth/sessions/revoke` goes to `revoke_sessions`. Requires `sessions_revoke`.
        .route("/sessions/revoke", post(revoke_sessions))
        .route_layer(middleware::from_fn_with_state(
            require(&state, SESSIONS_REVOKE),
            guard,
        ));

    // Register and login share one window per client.
    let limited = Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route_layer(middleware::from_fn_with_state(state.clone(), limit));

    let protected = Router::new()
        .route("/logout", post(logout))
        .merge(revoke)
        .route_layer(middleware::from_fn_with_state(state, session));

    Router::new()
        .route("/refresh", post(refresh))
        .merge(limited)
        .merge(protected)
}

async fn register(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Valid(body): Valid<RegisterBody>,
) -> Result<(StatusCode, Json<UserProfile>)> {
    let profile = state
        .auth
        .register(Registration {
            name: body.name,
            surname: body.surname,
            email: body.email,
            password: body.password,
            birth_date: body.birth_date,
            ip,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(profile)))
}

async fn login(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Valid(body): Valid<LoginBody>,
) -> Result<Json<LoginResponse>> {
    let outcome = state
        .auth
        .login(LoginRequest {
            email: body.email,
            password: body.password,
            mfa_code: body.mfa_code,
            ip,
        })
        .await?;

    Ok(Json(outcome.into()))
}

async fn refresh(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Valid(body): Valid<RefreshBody>,
) -> Result<Json<TokenResponse>> {
    let pair = state
        .auth
        .sessions()
        .rotate(&body.refresh_token, ip.as_deref())
        .await?;

    Ok(Json(pair.into()))
}

async fn logout(
    State(state): State<AppState>,
    identity: Identity,
    ip: ClientIp,
) -> Result<Json<Revoked>> {
    let revoked = state.auth.logout(&identity, ip.as_deref()).await?;
    Ok(Json(Revoked { revoked }))
}

async fn revoke_sessions(
    State(state): State<AppState>,
    identity: Identity,
    ip: ClientIp,
) -> Result<Json<Revoked>> {
    let revoked = state.auth.revoke_all_sessions(&identity, ip.as_deref()).await?;
    Ok(Json(Revoked { revoked }))
}
