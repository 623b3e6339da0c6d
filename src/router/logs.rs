//! Audit log reads.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router, middleware};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use crate::audit::Level;
use crate::error::Result;
use crate::middleware::session;
use crate::permission::{LOGS_READ, guard, require};
use crate::router::ValidQuery;
use crate::store::{LogFilter, LogRecord};

const DEFAULT_LIMIT: u32 = 50;

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    DEFAULT_LIMIT
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct LogQuery {
    #[serde(default = "default_page")]
    #[validate(range(min = 1, message = "Page starts at 1."))]
    pub page: u32,
    #[serde(default = "default_limit")]
    #[validate(range(min = 1, max = 200, message = "Limit must be between 1 and 200."))]
    pub limit: u32,
    pub level: Option<Level>,
    /// Case-insensitive part of the email.
    #[validate(length(min = 1, max = 255))]
    pub email: Option<String>,
    #[validate(length(min = 1, max = 64))]
    pub ip: Option<String>,
}

/// Answer of `GET /logs`.
#[derive(Debug, Serialize, Deserialize)]
pub struct LogPage {
    pub logs: Vec<LogRecord>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
}

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        // `GET /logs` goes to `list`. Requires `logs_read`.
        .route("/", get(list))
        .route_layer(middleware::from_fn_with_state(
            require(&state, LOGS_READ),
            guard,
        ))
        .route_layer(middleware::from_fn_with_state(state, session))
}

async fn list(
    State(state): State<AppState>,
    ValidQuery(query): ValidQuery<LogQuery>,
) -> Result<Json<LogPage>> {
    let filter = LogFilter {
        level: query.level,
        email: query.email,
        ip: query.ip,
        page: query.page,
        limit: query.limit,
    };
    let (logs, total) = state
        .stores
        .within(state.stores.logs.list_logs(&filter))
        .await?;

    Ok(Json(LogPage {
        logs,
        total,
        page: filter.page,
        limit: filter.limit,
    }))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};

    use super::*;
    use crate::audit::{AuditEvent, AuditSink};
    use crate::store::memory::{ADMIN_ROLE, DOCTOR_ROLE};
    use crate::tests::{TestApp, read_json};
    use crate::{app, make_request};

    fn seed(test: &TestApp) {
        for (level, email, ip) in [
            (Level::Warning, "Eve@Example.com", "10.0.0.7"),
            (Level::Success, "eve@example.com", "10.0.0.8"),
            (Level::Warning, "zoe@example.com", "10.0.0.7"),
        ] {
            test.audit.record(
                AuditEvent::new(level, "login rejected")
                    .email(email)
                    .ip(Some(ip)),
            );
        }
    }

    async fn logs(test: &TestApp, token: &str, query: &str) -> axum::http::Response<axum::body::Body> {
        make_request(
            app(test.state.clone()),
            Method::GET,
            &format!("/api/v1/logs{query}"),
            Some(token),
            String::default(),
        )
        .await
    }

    #[tokio::test]
    async fn test_logs_require_permission() {
        let test = TestApp::new();
        let (_, doctor) = test.signed_in("doc@example.com", DOCTOR_ROLE).await;

        let response = logs(&test, &doctor.access_token, "").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = make_request(
            app(test.state.clone()),
            Method::GET,
            "/api/v1/logs",
            None,
            String::default(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_logs_filters_and_pages() {
        let test = TestApp::new();
        let (_, admin) = test.signed_in("root@example.com", ADMIN_ROLE).await;
        seed(&test);

        let response = logs(&test, &admin.access_token, "").await;
        assert_eq!(response.status(), StatusCode::OK);
        let page: LogPage = read_json(response).await;
        assert_eq!(page.total, 3);
        assert_eq!((page.page, page.limit), (1, DEFAULT_LIMIT));
        // Newest first.
        assert_eq!(page.logs[0].email.as_deref(), Some("zoe@example.com"));

        let response = logs(&test, &admin.access_token, "?level=warning&email=EVE").await;
        let page: LogPage = read_json(response).await;
        assert_eq!(page.total, 1);
        assert_eq!(page.logs[0].ip_address.as_deref(), Some("10.0.0.7"));
        assert_eq!(page.logs[0].level, "warning");

        let response = logs(&test, &admin.access_token, "?ip=10.0.0.7&limit=1&page=2").await;
        let page: LogPage = read_json(response).await;
        assert_eq!(page.total, 2);
        assert_eq!(page.logs.len(), 1);
        assert_eq!(page.logs[0].email.as_deref(), Some("Eve@Example.com"));
    }

    #[tokio::test]
    async fn test_logs_reject_bad_query() {
        let test = TestApp::new();
        let (_, admin) = test.signed_in("root@example.com", ADMIN_ROLE).await;

        for query in ["?page=0", "?limit=1000", "?level=fatal", "?page=abc"] {
            let response = logs(&test, &admin.access_token, query).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{query}");
        }
    }
}
