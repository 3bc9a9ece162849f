//! Background jobs: bulk lead upload and lead export.
//!
//! Each job is a `backgroundJobs` document that moves `queued -> running` and ends in
//! `done`, `failed` or `cancelled`. The runner bounds concurrency with a semaphore and
//! keeps a cancellation token per live job.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::cache::{ResponseCache, NS_DASHBOARD, NS_SEGMENTS, NS_STUDENTS};
use crate::db::Collection;
use crate::error::{AppError, AppResult};
use crate::export::{to_csv, CsvColumn};
use crate::leads::{create_lead, BatchDedup, LeadInput};
use crate::metrics::Metrics;
use crate::query::{Filter, Pipeline};
use crate::store::{doc_id, DocumentStore};
use crate::types::{now_iso, ObjectId};

/// Per-row error messages kept on the job document.
pub const MAX_RECORDED_ERRORS: usize = 100;
const PROGRESS_EVERY: u64 = 50;
const EXPORT_BATCH: u64 = 500;
const INTERRUPTED: &str = "interrupted by restart";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    LeadUpload,
    LeadExport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Cancelled)
    }
}

/// Work carried by a job.
pub enum JobWork {
    LeadUpload { college_id: String, actor: String, default_counselor: Option<String>, rows: Vec<Value> },
    LeadExport { pipeline: Pipeline, columns: &'static [CsvColumn], max_rows: u64 },
}

impl JobWork {
    pub fn kind(&self) -> JobKind {
        match self {
            JobWork::LeadUpload { .. } => JobKind::LeadUpload,
            JobWork::LeadExport { .. } => JobKind::LeadExport,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
struct Progress {
    total: u64,
    processed: u64,
    failed: u64,
}

struct Outcome {
    progress: Progress,
    errors: Vec<String>,
    output: Option<String>,
}

#[derive(Clone)]
pub struct JobRunner {
    store: DocumentStore,
    cache: ResponseCache,
    metrics: Metrics,
    permits: Arc<Semaphore>,
    handles: Arc<RwLock<HashMap<ObjectId, CancellationToken>>>,
}

impl JobRunner {
    pub fn new(store: DocumentStore, cache: ResponseCache, metrics: Metrics, max_concurrent: usize) -> Self {
        Self::with_permits(store, cache, metrics, Arc::new(Semaphore::new(max_concurrent.max(1))))
    }

    /// Runs jobs only while a permit of `permits` is available; jobs wait `queued` otherwise.
    pub fn with_permits(store: DocumentStore, cache: ResponseCache, metrics: Metrics, permits: Arc<Semaphore>) -> Self {
        Self { store, cache, metrics, permits, handles: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Persists a queued job and spawns it. Returns the job document.
    pub async fn submit(&self, college_id: &str, created_by: &str, work: JobWork) -> AppResult<Value> {
        let total = match &work {
            JobWork::LeadUpload { rows, .. } => rows.len() as u64,
            JobWork::LeadExport { .. } => 0,
        };
        let doc = self
            .store
            .insert(
                Collection::BackgroundJobs,
                json!({
                    "kind": work.kind(),
                    "status": JobStatus::Queued,
                    "college_id": college_id,
                    "created_by": created_by,
                    "progress": Progress { total, ..Default::default() },
                    "errors": [],
                    "output": null,
                    "started_at": null,
                    "finished_at": null,
                }),
            )
            .await?;
        let id = doc_id(&doc)?;
        let cancel = CancellationToken::new();
        self.handles.write().await.insert(id.clone(), cancel.clone());
        self.metrics.inc_jobs_started();

        let runner = self.clone();
        tokio::spawn(async move {
            runner.run(id, work, cancel).await;
        });
        Ok(doc)
    }

    /// Marks jobs left `queued` or `running` by a previous process as failed. Their tasks
    /// died with that process, so nothing would ever finish or cancel them.
    pub async fn fail_interrupted(&self) -> AppResult<u64> {
        let stale = Filter::is_in("status", [JobStatus::Queued.as_str(), JobStatus::Running.as_str()]);
        let count = self
            .store
            .update_many(
                Collection::BackgroundJobs,
                stale,
                json!({
                    "status": JobStatus::Failed,
                    "errors": [INTERRUPTED],
                    "finished_at": now_iso(),
                }),
            )
            .await?;
        if count > 0 {
            tracing::warn!(count, "marked interrupted background jobs as failed");
        }
        Ok(count)
    }

    /// Cancels a live job. Returns `false` when the job is not running in this process.
    pub async fn cancel(&self, id: &ObjectId) -> bool {
        match self.handles.read().await.get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    async fn run(&self, id: ObjectId, work: JobWork, cancel: CancellationToken) {
        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => permit.ok(),
            _ = cancel.cancelled() => None,
        };
        let result = match permit {
            Some(_permit) => {
                self.set_status(&id, JobStatus::Running, json!({ "started_at": now_iso() })).await;
                self.execute(&id, work, &cancel).await
            }
            None => Err(AppError::Custom("Job cancelled".to_string())),
        };

        let (status, patch) = match result {
            Ok(outcome) if cancel.is_cancelled() => (JobStatus::Cancelled, outcome_patch(outcome)),
            Ok(outcome) => {
                self.metrics.inc_jobs_completed();
                (JobStatus::Done, outcome_patch(outcome))
            }
            Err(_) if cancel.is_cancelled() => (JobStatus::Cancelled, json!({})),
            Err(e) => {
                self.metrics.inc_jobs_failed();
                tracing::error!(job_id = %id, error = %e, "background job failed");
                (JobStatus::Failed, json!({ "errors": [e.to_string()] }))
            }
        };
        self.set_status(&id, status, patch).await;
        self.handles.write().await.remove(&id);
        tracing::info!(job_id = %id, status = status.as_str(), "background job finished");
    }

    async fn set_status(&self, id: &ObjectId, status: JobStatus, mut patch: Value) {
        patch["status"] = json!(status);
        if status.is_finished() {
            patch["finished_at"] = json!(now_iso());
        }
        if let Err(e) = self.store.update(Collection::BackgroundJobs, id, patch).await {
            tracing::warn!(job_id = %id, error = %e, "failed to record job status");
        }
    }

    async fn execute(&self, id: &ObjectId, work: JobWork, cancel: &CancellationToken) -> AppResult<Outcome> {
        match work {
            JobWork::LeadUpload { college_id, actor, default_counselor, rows } => {
                self.upload_leads(id, &college_id, &actor, default_counselor, rows, cancel).await
            }
            JobWork::LeadExport { pipeline, columns, max_rows } => {
                self.export_leads(pipeline, columns, max_rows, cancel).await
            }
        }
    }

    async fn upload_leads(
        &self,
        id: &ObjectId,
        college_id: &str,
        actor: &str,
        default_counselor: Option<String>,
        rows: Vec<Value>,
        cancel: &CancellationToken,
    ) -> AppResult<Outcome> {
        let mut progress = Progress { total: rows.len() as u64, ..Default::default() };
        let mut errors = Vec::new();
        let mut seen = BatchDedup::default();
        let mut created = 0u64;

        for (idx, row) in rows.into_iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            let result = async {
                let mut input: LeadInput = serde_json::from_value(row)
                    .map_err(|e| AppError::validation("row", format!("unreadable lead: {}", e)))?;
                if input.counselor_id.is_none() {
                    input.counselor_id = default_counselor.clone();
                }
                let lead = input.validate()?;
                seen.check(&lead)?;
                create_lead(&self.store, college_id, lead, actor).await
            }
            .await;

            progress.processed += 1;
            match result {
                Ok(_) => created += 1,
                Err(e) => {
                    progress.failed += 1;
                    if errors.len() < MAX_RECORDED_ERRORS {
                        errors.push(format!("row {}: {}", idx + 1, row_error(&e)));
                    }
                }
            }
            if progress.processed % PROGRESS_EVERY == 0 {
                if let Err(e) = self.store.update(Collection::BackgroundJobs, id, json!({ "progress": progress })).await {
                    tracing::warn!(job_id = %id, error = %e, "progress update failed");
                }
            }
        }

        if created > 0 {
            self.metrics.add_leads(created);
            self.cache.invalidate(&[NS_STUDENTS, NS_DASHBOARD, NS_SEGMENTS]);
        }
        Ok(Outcome { progress, errors, output: None })
    }

    async fn export_leads(
        &self,
        pipeline: Pipeline,
        columns: &'static [CsvColumn],
        max_rows: u64,
        cancel: &CancellationToken,
    ) -> AppResult<Outcome> {
        let mut docs = Vec::new();
        let mut offset = 0u64;
        while offset < max_rows {
            if cancel.is_cancelled() {
                return Ok(Outcome { progress: Progress::default(), errors: Vec::new(), output: None });
            }
            let batch = (max_rows - offset).min(EXPORT_BATCH);
            let rows = self.store.find(&pipeline.clone().skip(offset).limit(batch)).await?;
            let fetched = rows.len() as u64;
            docs.extend(rows);
            offset += fetched;
            if fetched < batch {
                break;
            }
        }
        let n = docs.len() as u64;
        Ok(Outcome {
            progress: Progress { total: n, processed: n, failed: 0 },
            errors: Vec::new(),
            output: Some(to_csv(columns, &docs)),
        })
    }
}

fn outcome_patch(outcome: Outcome) -> Value {
    json!({ "progress": outcome.progress, "errors": outcome.errors, "output": outcome.output })
}

/// Human readable reason for a rejected row.
fn row_error(err: &AppError) -> String {
    match err {
        AppError::ValidationError { field, message } => format!("{}: {}", field, message),
        other => other.to_string(),
    }
}

/// Job document as returned by the API (CSV output omitted).
pub fn public_view(mut job: Value) -> Value {
    if let Value::Object(map) = &mut job {
        let has_output = map.get("output").is_some_and(|o| !o.is_null());
        map.remove("output");
        map.insert("has_output".to_string(), Value::Bool(has_output));
    }
    job
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_view_hides_output() {
        let job = json!({"_id": "j", "status": "done", "output": "a,b\n"});
        let view = public_view(job);
        assert!(view.get("output").is_none());
        assert_eq!(view["has_output"], true);
    }

    #[test]
    fn row_errors_name_the_field() {
        assert_eq!(row_error(&AppError::validation("email", "Email already exists")), "email: Email already exists");
    }

    #[test]
    fn finished_states() {
        assert!(!JobStatus::Running.is_finished());
        assert!(JobStatus::Cancelled.is_finished());
        assert_eq!(serde_json::to_value(JobKind::LeadUpload).unwrap(), "lead_upload");
    }
}
