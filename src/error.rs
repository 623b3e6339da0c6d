//! Error handler for the hospital API.

use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use sqlx::Error as SQLxError;
use thiserror::Error;
use validator::ValidationErrors;

use crate::password::PolicyError;

pub type Result<T> = std::result::Result<T, ServerError>;

/// Enum representing server-side errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("validation error occurred")]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Axum(#[from] JsonRejection),

    #[error("{0}")]
    Policy(#[from] PolicyError),

    #[error("Invalid email or password.")]
    InvalidCredentials,

    #[error("Invalid MFA code.")]
    InvalidMfaCode,

    #[error("invalid or expired token")]
    InvalidToken,

    #[error("invalid 'Authorization' header")]
    Unauthorized,

    #[error("insufficient permissions")]
    Forbidden,

    #[error("resource not found")]
    NotFound,

    #[error("{0}")]
    Conflict(String),

    #[error("{message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },

    #[error("Too many requests, retry in {retry_after} seconds.")]
    RateLimited { retry_after: u64 },

    #[error("SQL request failed: {0}")]
    Sql(#[from] SQLxError),

    #[error("store call exceeded its deadline")]
    StoreTimeout,

    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error(transparent)]
    Token(#[from] crate::token::TokenError),

    #[error("internal server error, {details}")]
    Internal {
        details: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ServerError {
    /// Whether the error comes from a failing dependency rather than from the
    /// caller.
    pub fn is_dependency(&self) -> bool {
        matches!(
            self,
            ServerError::Sql(_)
                | ServerError::StoreTimeout
                | ServerError::Crypto(_)
                | ServerError::Token(_)
                | ServerError::Internal { .. }
        )
    }
}

/// Structure for detailed error responses.
#[derive(Debug, Serialize)]
pub struct ResponseError {
    r#type: Option<String>,
    title: String,
    status: u16,
    detail: String,
    instance: Option<String>,
    errors: Option<Vec<FieldError>>,
}

impl ResponseError {
    /// Update error status code.
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code.as_u16();
        self
    }

    /// Update `title` field.
    pub fn title(mut self, title: &str) -> Self {
        self.title = title.into();
        self
    }

    /// Add detailed error.
    pub fn details(mut self, description: &str) -> Self {
        self.detail = description.into();
        self
    }

    /// Automatically add errors field.
    pub fn errors(mut self, errors: &ValidationErrors) -> Self {
        self.errors = Some(parse_validation_errors(errors));
        self
    }

    /// Add a single field error.
    pub fn field(mut self, field: &str, message: &str) -> Self {
        self.errors.get_or_insert_with(Vec::new).push(FieldError {
            field: field.into(),
            message: message.into(),
        });
        self
    }

    /// Transform [`ResponseError`] into axum [`Response`].
    pub fn into_response(self) -> std::result::Result<Response, axum::http::Error> {
        if let Ok(body) = serde_json::to_string(&self) {
            Response::builder()
                .status(self.status)
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.into())
        } else {
            Ok(internal_server_error())
        }
    }
}

impl Default for ResponseError {
    fn default() -> Self {
        Self {
            r#type: None,
            title: "Internal server error.".to_owned(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            detail: String::default(),
            instance: None,
            errors: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct FieldError {
    field: String,
    message: String,
}

fn parse_validation_errors(errors: &ValidationErrors) -> Vec<FieldError> {
    errors
        .field_errors()
        .iter()
        .flat_map(|(field, issues)| {
            issues.iter().map(move |issue| FieldError {
                field: field.to_string(),
                message: issue.to_string(),
            })
        })
        .collect()
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let retry_after = match &self {
            ServerError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        };

        let response = ResponseError::default()
            .title("There were validation errors with your request.")
            .details(&self.to_string())
            .status(StatusCode::BAD_REQUEST);

        let response = match &self {
            ServerError::Validation(validation_errors) => response.errors(validation_errors),

            ServerError::Axum(rejection) => {
                let status = match rejection.status() {
                    StatusCode::PAYLOAD_TOO_LARGE => StatusCode::PAYLOAD_TOO_LARGE,
                    _ => StatusCode::BAD_REQUEST,
                };
                response.details(&rejection.body_text()).status(status)
            },

            ServerError::Policy(reason) => response.field("password", &reason.to_string()),

            ServerError::InvalidCredentials | ServerError::InvalidMfaCode => response
                .title("Authentication failed.")
                .status(StatusCode::UNAUTHORIZED),

            ServerError::InvalidToken | ServerError::Unauthorized => response
                .title("Missing or invalid token.")
                .details("Missing or invalid 'Authorization' header or token.")
                .status(StatusCode::UNAUTHORIZED),

            ServerError::Forbidden => response
                .title("Access denied.")
                .details("You are not allowed to perform this action.")
                .status(StatusCode::FORBIDDEN),

            ServerError::NotFound => response
                .title("Not found.")
                .status(StatusCode::NOT_FOUND),

            ServerError::Conflict(_) => response
                .title("Resource already exists.")
                .status(StatusCode::CONFLICT),

            ServerError::InvalidField { field, message } => response.field(field, message),

            ServerError::RateLimited { .. } => response
                .title("Too many requests.")
                .status(StatusCode::TOO_MANY_REQUESTS),

            ServerError::Internal { details, source } => {
                tracing::error!(err = ?source, %details, "server returned 500 status");
                ResponseError::default()
            },

            err => {
                tracing::error!(error = %err, "server returned 500 status");
                ResponseError::default()
            },
        };

        let mut response = response
            .into_response()
            .unwrap_or_else(|_| internal_server_error());
        if let Some(seconds) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }

        response
    }
}

fn internal_server_error() -> Response {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(
            serde_json::json!({
                "type": null,
                "title": "Internal server error.",
                "status": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                "detail": null,
                "instance": null,
                "errors": null,
            })
            .to_string()
            .into(),
        )
        .unwrap_or_else(|_| Response::new("Internal server error".into()))
}
