use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};

use crate::{
    db::Collection,
    error::{AppError, AppResult, OptionExt},
    export::csv_response,
    jobs::{public_view, JobKind, JobStatus},
    query::Filter,
    routes::common::{data_response, parse_id},
    state::AppState,
    store::get_str,
    types::{ObjectId, Permission, Principal, Role},
};

/// Jobs are visible to their creator and to the college's admins.
async fn find_job(state: &AppState, principal: &Principal, id: &ObjectId) -> AppResult<Value> {
    let mut scope = Filter::eq("college_id", principal.college()?);
    if principal.role != Role::CollegeAdmin {
        let own = principal.user_id.as_ref().map(|id| id.to_string()).unwrap_or_default();
        scope = scope.and(Filter::eq("created_by", own));
    }
    state.store.find_scoped(Collection::BackgroundJobs, id, scope).await?.ok_or_not_found("Job")
}

fn status_of(job: &Value) -> Option<JobStatus> {
    serde_json::from_value(job.get("status").cloned()?).ok()
}

pub async fn get_job(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> AppResult<Response> {
    principal.require(Permission::ViewLeads)?;
    let job = find_job(&state, &principal, &parse_id(&id)?).await?;
    Ok(data_response(StatusCode::OK, public_view(job), "Get data."))
}

/// CSV produced by a finished export job.
pub async fn download_job(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> AppResult<Response> {
    principal.require(Permission::ExportData)?;
    let id = parse_id(&id)?;
    let job = find_job(&state, &principal, &id).await?;
    let is_export = serde_json::from_value::<JobKind>(job["kind"].clone()).ok() == Some(JobKind::LeadExport);
    let output = get_str(&job, "output");
    match (is_export, status_of(&job), output) {
        (false, _, _) => Err(AppError::BadRequest("Job has no downloadable output".to_string())),
        (true, Some(JobStatus::Done), Some(csv)) => Ok(csv_response(csv.to_string(), &format!("leads_{}.csv", id))),
        (true, status, _) => Err(AppError::Conflict(format!(
            "Export is not ready (status: {})",
            status.map_or("unknown", |s| s.as_str())
        ))),
    }
}

pub async fn cancel_job(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    principal.require(Permission::ViewLeads)?;
    let id = parse_id(&id)?;
    let job = find_job(&state, &principal, &id).await?;
    if status_of(&job).is_some_and(|s| s.is_finished()) {
        return Err(AppError::Conflict("Job already finished".to_string()));
    }
    if !state.jobs.cancel(&id).await {
        return Err(AppError::Conflict("Job is not running".to_string()));
    }
    tracing::info!(job_id = %id, "job cancellation requested");
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": id, "message": "Cancellation requested." }))))
}
