//! HTTP API.
pub mod auth;
pub mod logs;
pub mod mfa;
pub mod status;
pub mod users;

use axum::Json;
use axum::extract::{FromRequest, FromRequestParts, Query, Request};
use axum::http::request::Parts;
use serde::Serialize;
use serde::de::DeserializeOwned;
use validator::Validate;

use crate::error::ServerError;

/// JSON body checked with [`Validate`] before reaching the handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct Valid<T>(pub T);

impl<T, S> FromRequest<S> for Valid<T>
where
    T: DeserializeOwned + Validate + Send,
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        value.validate()?;
        Ok(Valid(value))
    }
}

/// Query string checked with [`Validate`] before reaching the handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidQuery<T>(pub T);

impl<T, S> FromRequestParts<S> for ValidQuery<T>
where
    T: DeserializeOwned + Validate + Send,
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|rejection| ServerError::InvalidField {
                field: "query",
                message: rejection.body_text(),
            })?;
        value.validate()?;
        Ok(ValidQuery(value))
    }
}

/// Number of refresh tokens a call revoked.
#[derive(Debug, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct Revoked {
    pub revoked: u64,
}
