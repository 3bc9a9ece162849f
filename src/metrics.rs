use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Process-wide counters for monitoring
#[derive(Clone)]
pub struct Metrics {
    pub leads_created: Arc<AtomicU64>,
    pub applications_created: Arc<AtomicU64>,
    pub communications_sent: Arc<AtomicU64>,
    pub communications_failed: Arc<AtomicU64>,
    pub jobs_started: Arc<AtomicU64>,
    pub jobs_completed: Arc<AtomicU64>,
    pub jobs_failed: Arc<AtomicU64>,
    pub cache_hits: Arc<AtomicU64>,
    pub cache_misses: Arc<AtomicU64>,
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            leads_created: Arc::new(AtomicU64::new(0)),
            applications_created: Arc::new(AtomicU64::new(0)),
            communications_sent: Arc::new(AtomicU64::new(0)),
            communications_failed: Arc::new(AtomicU64::new(0)),
            jobs_started: Arc::new(AtomicU64::new(0)),
            jobs_completed: Arc::new(AtomicU64::new(0)),
            jobs_failed: Arc::new(AtomicU64::new(0)),
            cache_hits: Arc::new(AtomicU64::new(0)),
            cache_misses: Arc::new(AtomicU64::new(0)),
            start_time: Instant::now(),
        }
    }

    pub fn add_leads(&self, count: u64) {
        self.leads_created.fetch_add(count, Ordering::Relaxed);
    }

    pub fn inc_applications(&self) {
        self.applications_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_communications_sent(&self) {
        self.communications_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_communications_failed(&self) {
        self.communications_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_jobs_started(&self) {
        self.jobs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_jobs_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_jobs_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_misses(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            leads_created: self.leads_created.load(Ordering::Relaxed),
            applications_created: self.applications_created.load(Ordering::Relaxed),
            communications_sent: self.communications_sent.load(Ordering::Relaxed),
            communications_failed: self.communications_failed.load(Ordering::Relaxed),
            jobs_started: self.jobs_started.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
pub struct MetricsSnapshot {
    pub leads_created: u64,
    pub applications_created: u64,
    pub communications_sent: u64,
    pub communications_failed: u64,
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub uptime_seconds: u64,
}

impl MetricsSnapshot {
    /// Prometheus text exposition (counters plus the uptime gauge).
    pub fn to_prometheus(&self) -> String {
        let counters = [
            ("leads_created", "Leads created", self.leads_created),
            ("applications_created", "Applications created", self.applications_created),
            ("communications_sent", "Messages dispatched", self.communications_sent),
            ("communications_failed", "Messages that failed to dispatch", self.communications_failed),
            ("jobs_started", "Background jobs started", self.jobs_started),
            ("jobs_completed", "Background jobs completed", self.jobs_completed),
            ("jobs_failed", "Background jobs failed", self.jobs_failed),
            ("cache_hits", "Response cache hits", self.cache_hits),
            ("cache_misses", "Response cache misses", self.cache_misses),
        ];
        let mut body = String::new();
        for (name, help, value) in counters {
            body.push_str(&format!(
                "# HELP admitdesk_{name} {help}\n# TYPE admitdesk_{name} counter\nadmitdesk_{name} {value}\n"
            ));
        }
        body.push_str(&format!(
            "# HELP admitdesk_uptime_seconds Uptime seconds\n# TYPE admitdesk_uptime_seconds gauge\nadmitdesk_uptime_seconds {}\n",
            self.uptime_seconds
        ));
        body
    }
}
