//! Users-related HTTP API.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, put};
use axum::{Json, Router, middleware};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use crate::error::Result;
use crate::middleware::{ClientIp, Identity, session};
use crate::permission::{USERS_DELETE, USERS_READ, USERS_WRITE, guard, require};
use crate::router::{Revoked, Valid};
use crate::store::{RoleId, UserId, UserProfile, UserUpdate};

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct PasswordBody {
    #[validate(length(min = 1, max = 255))]
    pub current_password: String,
    #[validate(length(max = 255, message = "Password must not exceed 255 characters."))]
    pub new_password: String,
}

/// Administrative changes; absent fields are kept. Passwords are only
/// changed by their owner.
#[derive(Debug, Default, Serialize, Deserialize, Validate)]
pub struct UpdateUserBody {
    #[validate(length(min = 1, max = 100, message = "Name must contain 1 to 100 characters."))]
    pub name: Option<String>,
    #[validate(length(
        min = 1,
        max = 100,
        message = "Surname must contain 1 to 100 characters."
    ))]
    pub surname: Option<String>,
    #[validate(email(message = "Email must be formatted."))]
    pub email: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub role_id: Option<RoleId>,
}

pub fn router(state: AppState) -> Router<AppState> {
    // `GET /users/{id}` goes to `get_user`. Requires `users_read`.
    // `PUT /users/{id}` goes to `update_user`. Requires `users_write`.
    // `DELETE /users/{id}` goes to `delete_user`. Requires `users_delete`.
    let by_id = get(get_user)
        .route_layer(middleware::from_fn_with_state(
            require(&state, USERS_READ),
            guard,
        ))
        .merge(put(update_user).route_layer(middleware::from_fn_with_state(
            require(&state, USERS_WRITE),
            guard,
        )))
        .merge(delete(delete_user).route_layer(middleware::from_fn_with_state(
            require(&state, USERS_DELETE),
            guard,
        )));

    Router::new()
        // `GET /users/@me` goes to `me`.
        .route("/@me", get(me))
        // `PUT /users/@me/password` goes to `change_password`.
        .route("/@me/password", put(change_password))
        // `GET /users` goes to `list`. Requires `users_read`.
        .route(
            "/",
            get(list).route_layer(middleware::from_fn_with_state(
                require(&state, USERS_READ),
                guard,
            )),
        )
        .route("/{id}", by_id)
        .route_layer(middleware::from_fn_with_state(state, session))
}

async fn me(State(state): State<AppState>, identity: Identity) -> Result<Json<UserProfile>> {
    Ok(Json(state.auth.profile(identity.user_id).await?))
}

async fn change_password(
    State(state): State<AppState>,
    identity: Identity,
    ip: ClientIp,
    Valid(body): Valid<PasswordBody>,
) -> Result<Json<Revoked>> {
    let revoked = state
        .auth
        .change_password(
            &identity,
            &body.current_password,
            &body.new_password,
            ip.as_deref(),
        )
        .await?;

    Ok(Json(Revoked { revoked }))
}

async fn list(State(state): State<AppState>) -> Result<Json<Vec<UserProfile>>> {
    Ok(Json(state.auth.users().await?))
}

async fn get_user(
    State(state): State<AppState>,
    Path(id): Path<UserId>,
) -> Result<Json<UserProfile>> {
    Ok(Json(state.auth.profile(id).await?))
}

async fn update_user(
    State(state): State<AppState>,
    identity: Identity,
    ip: ClientIp,
    Path(id): Path<UserId>,
    Valid(body): Valid<UpdateUserBody>,
) -> Result<Json<UserProfile>> {
    let changes = UserUpdate {
        name: body.name,
        surname: body.surname,
        email: body.email,
        birth_date: body.birth_date,
        role_id: body.role_id,
    };
    let profile = state
        .auth
        .update_user(&identity, id, changes, ip.as_deref())
        .await?;

    Ok(Json(profile))
}

async fn delete_user(
    State(state): State<AppState>,
    identity: Identity,
    ip: ClientIp,
    Path(id): Path<UserId>,
) -> Result<StatusCode> {
    state.auth.delete_user(&identity, id, ip.as_deref()).await?;
    Ok(StatusCode::NO_CONTENT)
}
