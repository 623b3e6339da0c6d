//! Public server status.

use axum::Json;
use axum::extract::State;
use serde::{Deserialize, Serialize};

use crate::AppState;

/// Structured status.
#[derive(Debug, Serialize, Deserialize)]
pub struct Status {
    pub name: String,
    pub version: String,
    /// `false` when the store did not answer in time.
    pub healthy: bool,
}

/// Instance name, version and store health.
pub async fn status(State(state): State<AppState>) -> Json<Status> {
    let healthy = state
        .stores
        .within(state.stores.permissions.find_role_by_name(&state.config.registration.default_role))
        .await
        .is_ok();

    Json(Status {
        name: state.config.name.clone(),
        version: state.config.version().to_owned(),
        healthy,
    })
}
