//! Configuration manager for the hospital API.

use std::fs::File;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::FromRef;
use serde::{Deserialize, Serialize};

use crate::AppState;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const DEFAULT_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_STORE_TIMEOUT: u64 = 5_000; // 5 seconds.
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Instance name.
    #[serde(default = "default_name")]
    pub name: String,
    /// Socket address the HTTP server binds to.
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default)]
    version: String,
    #[serde(skip)]
    path: PathBuf,
    /// Related to PostgreSQL configuration.
    #[serde(skip_serializing)]
    pub postgres: Option<Postgres>,
    /// Related to Argon2 configuration.
    #[serde(skip_serializing)]
    pub argon2: Option<Argon2>,
    /// Related to JsonWebToken lifetimes.
    #[serde(default, skip_serializing)]
    pub token: Token,
    /// Related to MFA via TOTP configuration.
    #[serde(default, skip_serializing)]
    pub totp: Totp,
    #[serde(default, skip_serializing)]
    pub password: Password,
    #[serde(default, skip_serializing)]
    pub registration: Registration,
    /// Where audit events go.
    #[serde(default, skip_serializing)]
    pub audit: Audit,
    /// Deadline, in milliseconds, applied to every store call.
    #[serde(default = "default_store_timeout")]
    pub store_timeout: u64,
    /// Peers allowed to set `X-Forwarded-For` and `X-Real-IP`.
    #[serde(default, skip_serializing)]
    pub trusted_proxies: Vec<IpAddr>,
    /// Limits on `/auth/login` and `/auth/register`.
    #[serde(default, skip_serializing)]
    pub rate_limit: RateLimit,
}

fn default_name() -> String {
    "Hospital Management System".into()
}

fn default_address() -> String {
    DEFAULT_ADDRESS.into()
}

fn default_store_timeout() -> u64 {
    DEFAULT_STORE_TIMEOUT
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            name: default_name(),
            address: default_address(),
            version: VERSION.to_owned(),
            path: PathBuf::default(),
            postgres: None,
            argon2: None,
            token: Token::default(),
            totp: Totp::default(),
            password: Password::default(),
            registration: Registration::default(),
            audit: Audit::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            trusted_proxies: Vec::new(),
            rate_limit: RateLimit::default(),
        }
    }
}

/// PostgreSQL configuration.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Postgres {
    /// Hostname:(?port) for PostgreSQL instance.
    pub address: String,
    /// Database name.
    pub database: Option<String>,
    /// Username credential to connect.
    pub username: Option<String>,
    /// Password credential to connect.
    pub password: Option<String>,
    /// Maximum pool connections.
    pub pool_size: Option<u32>,
}

/// Argon2 configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Argon2 {
    /// Memory used while hashing.
    pub memory_cost: u32,
    /// Iterations of hash.
    pub iterations: u32,
    /// Parallelism degree.
    pub parallelism: u32,
    /// Output hash length.
    pub hash_length: usize,
}

impl Default for Argon2 {
    fn default() -> Self {
        Self {
            memory_cost: 1024 * 64, // 64 MiB.
            iterations: 4,
            parallelism: 2,
            hash_length: 32,
        }
    }
}

/// Json Web Token configuration.
///
/// The signing secret is read from `JWT_SECRET`, never from this file.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Token {
    /// Access token lifetime in seconds.
    pub access_lifetime: u64,
    /// Refresh token lifetime in seconds.
    pub refresh_lifetime: u64,
}

impl Default for Token {
    fn default() -> Self {
        Self {
            access_lifetime: 60 * 10,            // 10 minutes.
            refresh_lifetime: 60 * 60 * 24 * 7, // 7 days.
        }
    }
}

/// TOTP configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Totp {
    /// Issuer shown by authenticator applications.
    pub issuer: String,
    /// Number of digits for the code.
    pub digits: u32,
    /// Window for code usage, in seconds.
    pub period: u64,
    /// Accepted steps before and after the current one.
    pub skew: u8,
}

impl Default for Totp {
    fn default() -> Self {
        Self {
            issuer: "Hospital Management System".into(),
            digits: 6,
            period: 30,
            skew: 1,
        }
    }
}

/// Password policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Password {
    pub min_length: usize,
}

impl Default for Password {
    fn default() -> Self {
        Self {
            min_length: crate::password::MIN_LENGTH,
        }
    }
}

/// Registration configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    /// Role name given to self-registered accounts.
    pub default_role: String,
}

impl Default for Registration {
    fn default() -> Self {
        Self {
            default_role: "patient".into(),
        }
    }
}

/// Sliding window applied per client address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Requests allowed inside one window.
    pub max_requests: usize,
    /// Window length in seconds.
    pub window: u64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max_requests: 20,
            window: 60 * 30, // 30 minutes.
        }
    }
}

/// Audit sink selection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audit {
    /// Rows in the `logs` table.
    #[default]
    Postgres,
    /// Tracing events with the `audit` target.
    Tracing,
}

impl FromRef<AppState> for Arc<Configuration> {
    fn from_ref(state: &AppState) -> Arc<Configuration> {
        Arc::clone(&state.config)
    }
}

impl Configuration {
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// Application version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Deadline for a single store call.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout)
    }

    /// Whether forwarding headers from `peer` are believed.
    pub fn is_trusted_proxy(&self, peer: IpAddr) -> bool {
        self.trusted_proxies.contains(&peer)
    }

    /// Reads the `config.yaml` file from the specified path or the default
    /// location.
    pub fn read(self) -> Arc<Self> {
        let file_path = if self.path.is_file() {
            &self.path
        } else {
            &Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
        };

        match File::open(file_path) {
            Ok(file) => {
                let mut config: Configuration =
                    match serde_yaml::from_reader(file) {
                        Ok(config) => config,
                        Err(err) => return Arc::new(self.error(err)),
                    };

                // set app version.
                config.version = VERSION.to_owned();
                config.path = file_path.clone();

                if !(6..=8).contains(&config.totp.digits) || config.totp.period == 0 {
                    tracing::warn!(
                        digits = config.totp.digits,
                        period = config.totp.period,
                        "invalid `totp` entry, using defaults"
                    );
                    config.totp = Totp::default();
                }

                if config.rate_limit.max_requests == 0 || config.rate_limit.window == 0 {
                    tracing::warn!("invalid `rate_limit` entry, using defaults");
                    config.rate_limit = RateLimit::default();
                }

                if config.password.min_length < crate::password::MIN_LENGTH {
                    tracing::warn!(
                        min_length = config.password.min_length,
                        "`password.min_length` raised to the policy floor"
                    );
                    config.password.min_length = crate::password::MIN_LENGTH;
                }

                Arc::new(config)
            },
            Err(err) => Arc::new(self.error(err)),
        }
    }

    /// Return a default configuration as fallback.
    fn error(&self, err: impl std::error::Error) -> Self {
        tracing::error!(error = %err, "`config.yaml` file not found or invalid");
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_falls_back() {
        let config = Configuration::default()
            .path(PathBuf::from("does/not/exist.yaml"))
            .read();

        assert_eq!(config.token.access_lifetime, 600);
        assert_eq!(config.token.refresh_lifetime, 604_800);
        assert_eq!(config.totp.skew, 1);
        assert_eq!(config.registration.default_role, "patient");
        assert_eq!(config.store_timeout(), Duration::from_secs(5));
        assert!(config.trusted_proxies.is_empty());
        assert_eq!(config.rate_limit.max_requests, 20);
        assert_eq!(config.rate_limit.window, 1800);
    }

    #[test]
    fn test_partial_yaml() {
        let config: Configuration = serde_yaml::from_str(
            "name: Saint Mary\npostgres:\n  address: localhost:5432\ntotp:\n  issuer: Saint Mary\n  digits: 6\n  period: 30\n  skew: 2\n",
        )
        .unwrap();

        assert_eq!(config.name, "Saint Mary");
        assert_eq!(config.address, DEFAULT_ADDRESS);
        assert_eq!(config.totp.skew, 2);
        assert_eq!(config.password.min_length, 12);
        assert_eq!(config.audit, Audit::Postgres);
        assert_eq!(config.postgres.unwrap().address, "localhost:5432");

        let config: Configuration = serde_yaml::from_str("audit: tracing\n").unwrap();
        assert_eq!(config.audit, Audit::Tracing);

        let config: Configuration = serde_yaml::from_str(
            "trusted_proxies:\n  - 10.0.0.1\n  - ::1\nrate_limit:\n  max_requests: 5\n  window: 60\n",
        )
        .unwrap();
        assert!(config.is_trusted_proxy("10.0.0.1".parse().unwrap()));
        assert!(config.is_trusted_proxy("::1".parse().unwrap()));
        assert!(!config.is_trusted_proxy("10.0.0.2".parse().unwrap()));
        assert_eq!(config.rate_limit.max_requests, 5);
    }
}
