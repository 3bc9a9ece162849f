use super::ip::extract_ip_from_headers;
use axum::{
    extract::{connect_info::ConnectInfo, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};
use tokio::sync::RwLock;

use crate::error::{AppError, AppResult};

/// A thread-safe rate limiter based on the sliding window algorithm.
#[derive(Clone)]
pub struct RateLimiter {
    requests: Arc<RwLock<HashMap<IpAddr, Vec<Instant>>>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    /// Creates a limiter allowing `max_requests` per `window_seconds` per client IP.
    pub fn new(max_requests: usize, window_seconds: u64) -> Self {
        Self {
            requests: Arc::new(RwLock::new(HashMap::new())),
            max_requests,
            window: Duration::from_secs(window_seconds),
        }
    }

    /// Records the request if allowed, otherwise fails with [`AppError::RateLimited`].
    pub async fn check_rate_limit(&self, ip: IpAddr) -> AppResult<()> {
        let now = Instant::now();
        let mut requests = self.requests.write().await;
        let timestamps = requests.entry(ip).or_default();

        // on clock skew keep the timestamp
        timestamps.retain(|&t| now.checked_duration_since(t).map(|d| d < self.window).unwrap_or(true));

        if timestamps.len() >= self.max_requests {
            let oldest = timestamps.first().copied().unwrap_or(now);
            let retry_after = match now.checked_duration_since(oldest) {
                Some(elapsed) => self.window.saturating_sub(elapsed),
                None => Duration::from_secs(1),
            };
            return Err(AppError::RateLimited { retry_after_seconds: retry_after.as_secs().max(1) });
        }

        timestamps.push(now);
        Ok(())
    }

    /// Drops timestamps outside the window and IPs with none left.
    pub async fn cleanup_old_entries(&self) {
        let now = Instant::now();
        let mut requests = self.requests.write().await;
        requests.retain(|_, timestamps| {
            timestamps.retain(|&t| now.checked_duration_since(t).map(|d| d < self.window).unwrap_or(true));
            !timestamps.is_empty()
        });
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok()).unwrap_or(default)
}

/// Global per-IP limit applied to every request.
///
/// Defaults to 1000 requests per 60 seconds; override with
/// `ADMITDESK_RATE_LIMIT_MAX_REQUESTS` and `ADMITDESK_RATE_LIMIT_WINDOW_SECONDS`.
pub async fn rate_limit_middleware(req: Request, next: Next) -> Response {
    lazy_static::lazy_static! {
        static ref GLOBAL_RATE_LIMITER: RateLimiter = RateLimiter::new(
            env_or("ADMITDESK_RATE_LIMIT_MAX_REQUESTS", 1000usize),
            env_or("ADMITDESK_RATE_LIMIT_WINDOW_SECONDS", 60u64),
        );
    }
    static GLOBAL_CLEANUP_STARTED: OnceLock<()> = OnceLock::new();

    let remote_ip = req.extensions().get::<ConnectInfo<SocketAddr>>().map(|info| info.0.ip());
    let ip = extract_ip_from_headers(req.headers(), remote_ip);
    let limiter: &RateLimiter = &GLOBAL_RATE_LIMITER;

    GLOBAL_CLEANUP_STARTED.get_or_init(|| {
        let limiter = limiter.clone();
        let cleanup_secs = env_or("ADMITDESK_GLOBAL_RATE_LIMIT_CLEANUP_INTERVAL", 600u64).clamp(60, 3600);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(cleanup_secs));
            loop {
                interval.tick().await;
                limiter.cleanup_old_entries().await;
            }
        });
    });

    match limiter.check_rate_limit(ip).await {
        Ok(()) => next.run(req).await,
        Err(e) => e.into_response(),
    }
}

/// Named limits for expensive endpoints, checked by the handlers themselves.
#[derive(Clone)]
pub struct EndpointRateLimiter {
    limiters: Arc<HashMap<String, RateLimiter>>,
}

impl Default for EndpointRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointRateLimiter {
    pub fn new() -> Self {
        Self { limiters: Arc::new(HashMap::new()) }
    }

    /// Adds or replaces limits given as `(endpoint, max_requests, window_seconds)`.
    pub fn with_limits(self, limits: Vec<(&str, usize, u64)>) -> Self {
        let mut map = Arc::try_unwrap(self.limiters).unwrap_or_else(|shared| (*shared).clone());
        for (endpoint, max_requests, window_seconds) in limits {
            map.insert(endpoint.to_string(), RateLimiter::new(max_requests, window_seconds));
        }
        Self { limiters: Arc::new(map) }
    }

    /// Endpoints without a configured limit always pass.
    pub async fn check_endpoint_limit(&self, endpoint: &str, ip: IpAddr) -> AppResult<()> {
        match self.limiters.get(endpoint) {
            Some(limiter) => limiter.check_rate_limit(ip).await,
            None => Ok(()),
        }
    }

    pub async fn cleanup_all(&self) {
        for limiter in self.limiters.values() {
            limiter.cleanup_old_entries().await;
        }
    }
}
