//! Middlewares and extractors for routes.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, FromRef, FromRequestParts, Request, State};
use axum::http::header;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;

use crate::AppState;
use crate::config::Configuration;
use crate::error::{Result, ServerError};
use crate::store::{RoleId, UserId};

const BEARER: &str = "Bearer ";

/// Authenticated caller, attached to the request by [`session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub role_id: RoleId,
    /// Role name.
    pub role: String,
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self> {
        parts
            .extensions
            .get::<Identity>()
            .cloned()
            .ok_or(ServerError::Unauthorized)
    }
}

/// Validate the bearer access token and resolve the caller's active role.
pub async fn session(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.strip_prefix(BEARER))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(ServerError::Unauthorized)?;

    let claims = state
        .auth
        .sessions()
        .validate_access(token)
        .map_err(|_| ServerError::Unauthorized)?;

    // The role is read again so a deactivated role locks its users out
    // before their access token expires.
    let role = state
        .stores
        .within(state.stores.permissions.find_user_role(claims.user_id))
        .await?
        .ok_or(ServerError::Unauthorized)?;

    req.extensions_mut().insert(Identity {
        user_id: claims.user_id,
        role_id: role.id,
        role: role.name,
    });

    Ok(next.run(req).await)
}

/// Address of the client.
///
/// `X-Forwarded-For` and `X-Real-IP` are only read when the connecting peer
/// is one of the configured trusted proxies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIp(pub Option<String>);

impl ClientIp {
    pub fn as_deref(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl<S> FromRequestParts<S> for ClientIp
where
    Arc<Configuration>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let config = Arc::<Configuration>::from_ref(state);
        let Some(peer) = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
        else {
            return Ok(ClientIp(None));
        };

        if !config.is_trusted_proxy(peer) {
            return Ok(ClientIp(Some(peer.to_string())));
        }

        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        };

        let forwarded = header("x-forwarded-for")
            .and_then(|value| value.split(',').next().map(|ip| ip.trim().to_owned()))
            .filter(|ip| !ip.is_empty());
        let real_ip = header("x-real-ip")
            .map(|ip| ip.trim().to_owned())
            .filter(|ip| !ip.is_empty());

        Ok(ClientIp(
            forwarded.or(real_ip).or_else(|| Some(peer.to_string())),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request as HttpRequest;

    const PROXY: [u8; 4] = [10, 0, 0, 1];

    fn config() -> Arc<Configuration> {
        let mut config = Configuration::default();
        config.trusted_proxies = vec![PROXY.into()];
        Arc::new(config)
    }

    fn request(peer: Option<[u8; 4]>, headers: &[(&str, &str)]) -> HttpRequest<()> {
        let mut builder = HttpRequest::builder();
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let mut request = builder.body(()).unwrap();
        if let Some(peer) = peer {
            request
                .extensions_mut()
                .insert(ConnectInfo(SocketAddr::from((peer, 4000))));
        }
        request
    }

    async fn client_ip(request: HttpRequest<()>) -> ClientIp {
        let (mut parts, _) = request.into_parts();
        ClientIp::from_request_parts(&mut parts, &config())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_client_ip_behind_trusted_proxy() {
        let headers = [
            ("x-forwarded-for", "203.0.113.7, 10.0.0.1"),
            ("x-real-ip", "198.51.100.2"),
        ];
        assert_eq!(
            client_ip(request(Some(PROXY), &headers)).await.as_deref(),
            Some("203.0.113.7")
        );

        let headers = [("x-real-ip", "198.51.100.2")];
        assert_eq!(
            client_ip(request(Some(PROXY), &headers)).await.as_deref(),
            Some("198.51.100.2")
        );

        assert_eq!(
            client_ip(request(Some(PROXY), &[])).await.as_deref(),
            Some("10.0.0.1")
        );
    }

    #[tokio::test]
    async fn test_client_ip_ignores_headers_from_untrusted_peer() {
        let headers = [
            ("x-forwarded-for", "203.0.113.7"),
            ("x-real-ip", "198.51.100.2"),
        ];
        assert_eq!(
            client_ip(request(Some([127, 0, 0, 1]), &headers))
                .await
                .as_deref(),
            Some("127.0.0.1")
        );

        // No peer address means nothing vouches for the headers.
        assert_eq!(client_ip(request(None, &headers)).await, ClientIp(None));
    }
}
