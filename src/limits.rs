//! Sliding window rate limiting for the unauthenticated auth routes.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use dashmap::DashMap;

use crate::AppState;
use crate::config::RateLimit;
use crate::error::{Result, ServerError};
use crate::middleware::ClientIp;

/// Bucket shared by requests without a known address.
const UNKNOWN_CLIENT: &str = "unknown";

/// Structure of a limiter.
#[derive(Debug)]
pub struct RateLimiter {
    /// The number of requests allowed inside one window.
    maximum_request: usize,
    /// Window duration.
    time: Duration,
    /// Each key has its own window.
    buckets: DashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a new rate limiter.
    pub fn new(maximum_request: usize, time: Duration) -> Self {
        RateLimiter {
            maximum_request,
            time,
            buckets: DashMap::new(),
        }
    }

    /// Build from the `rate_limit` configuration entry.
    pub fn from_config(config: &RateLimit) -> Self {
        Self::new(config.max_requests, Duration::from_secs(config.window))
    }

    /// Record a request for `key`. When the window is full, returns how long
    /// until its oldest request leaves it.
    pub fn check<T>(&self, key: T) -> std::result::Result<(), Duration>
    where
        T: ToString,
    {
        let now = Instant::now();
        let mut requests = self.buckets.entry(key.to_string()).or_default();

        // Clean old requests.
        while let Some(time) = requests.front() {
            if now.duration_since(*time) > self.time {
                requests.pop_front();
            } else {
                break;
            }
        }

        if requests.len() >= self.maximum_request {
            let oldest = requests.front().copied().unwrap_or(now);
            Err(self.time.saturating_sub(now.duration_since(oldest)))
        } else {
            requests.push_back(now);
            Ok(())
        }
    }
}

/// Reject the request with 429 once its client exhausted the window.
pub async fn limit(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    req: Request,
    next: Next,
) -> Result<Response> {
    let key = ip.as_deref().unwrap_or(UNKNOWN_CLIENT);

    if let Err(wait) = state.limiter.check(key) {
        let retry_after = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
        metrics::counter!("rate_limited_total", "path" => req.uri().path().to_owned())
            .increment(1);
        tracing::warn!(client = key, retry_after, path = %req.uri().path(), "rate limit reached");

        return Err(ServerError::RateLimited {
            retry_after: retry_after.max(1),
        });
    }

    Ok(next.run(req).await)
}
