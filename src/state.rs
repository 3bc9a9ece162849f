use std::{sync::Arc, time::Duration};

use crate::cache::ResponseCache;
use crate::config::AppConfig;
use crate::jobs::JobRunner;
use crate::messaging::{Dispatcher, LogDispatcher};
use crate::metrics::Metrics;
use crate::middleware::EndpointRateLimiter;
use crate::store::DocumentStore;

/// The shared application state.
///
/// Cloned into every handler and the stateful middleware. All members are cheap
/// handles over shared data.
#[derive(Clone)]
pub struct AppState {
    /// Document store over the SQLite pool.
    pub store: DocumentStore,
    pub config: Arc<AppConfig>,
    pub metrics: Metrics,
    /// Per-endpoint limits on top of the global per-IP limiter.
    pub rate_limiter: EndpointRateLimiter,
    pub cache: ResponseCache,
    pub jobs: JobRunner,
    /// Outbound message provider.
    pub dispatcher: Arc<dyn Dispatcher>,
}

impl AppState {
    /// Creates the state with the logging dispatcher and the default endpoint limits:
    /// - 10 bulk uploads per minute
    /// - 20 exports per minute
    /// - 30 segment communications per minute
    pub fn new(db: sqlx::SqlitePool, config: AppConfig) -> Self {
        Self::with_dispatcher(db, config, Arc::new(LogDispatcher))
    }

    pub fn with_dispatcher(db: sqlx::SqlitePool, config: AppConfig, dispatcher: Arc<dyn Dispatcher>) -> Self {
        let rate_limiter = EndpointRateLimiter::new().with_limits(vec![
            ("/students/bulk", 10, 60),
            ("/students/export", 20, 60),
            ("/data-segments/{id}/communicate", 30, 60),
        ]);
        let metrics = Metrics::new();
        let store = DocumentStore::new(db);
        let cache = ResponseCache::new(
            config.cache.capacity,
            Duration::from_secs(config.cache.ttl_seconds),
            metrics.clone(),
        );
        let jobs = JobRunner::new(store.clone(), cache.clone(), metrics.clone(), config.jobs.max_concurrent);

        Self { store, config: Arc::new(config), metrics, rate_limiter, cache, jobs, dispatcher }
    }
}
