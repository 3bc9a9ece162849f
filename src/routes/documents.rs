//! Document verification (DV): students register uploaded files, auditors accept or
//! reject them, and the student's aggregate `dv_status` follows.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{
    db::Collection,
    error::{validation::require_text, AppError, AppResult, OptionExt},
    leads::sync_applications,
    pagination::{paginate, PageParams},
    query::{Filter, Pipeline, SortKey},
    routes::common::{actor, data_response, parse_id},
    routes::students::{find_student, invalidate_lead_views},
    segments::{scope_filter, SegmentModule},
    state::AppState,
    types::{now_iso, DvStatus, JsonBody, ObjectId, Permission, Principal, QueryParams},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Accepted,
    Rejected,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Accepted => "accepted",
            DocumentStatus::Rejected => "rejected",
        }
    }
}

/// Aggregate state over a student's `documents` map: any rejection wins, then any
/// pending document, otherwise verified. No documents at all is pending.
pub fn dv_status(documents: &Map<String, Value>) -> DvStatus {
    let statuses: Vec<&str> = documents.values().filter_map(|d| d.get("status").and_then(Value::as_str)).collect();
    if statuses.contains(&DocumentStatus::Rejected.as_str()) {
        DvStatus::Rejected
    } else if statuses.is_empty() || statuses.contains(&DocumentStatus::Pending.as_str()) {
        DvStatus::Pending
    } else {
        DvStatus::Verified
    }
}

fn pending_count(documents: &Map<String, Value>) -> usize {
    documents
        .values()
        .filter(|d| d.get("status").and_then(Value::as_str) == Some(DocumentStatus::Pending.as_str()))
        .count()
}

/// Document types are used as object keys in stored paths.
fn validate_doc_type(raw: &str) -> AppResult<String> {
    let doc_type = require_text(raw, "doc_type", 50)?.to_lowercase();
    if !doc_type.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(AppError::validation("doc_type", "doc_type may only contain letters, digits and '_'"));
    }
    Ok(doc_type)
}

fn validate_file_url(raw: &str) -> AppResult<String> {
    let url = require_text(raw, "file_url", 2048)?;
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err(AppError::validation("file_url", "file_url must be an http(s) URL"));
    }
    Ok(url)
}

/// Writes the per-document change, then recomputes the aggregate fields from the
/// stored document.
async fn apply_document_change(state: &AppState, id: &ObjectId, doc_type: &str, entry: Value) -> AppResult<Value> {
    state.store.update(Collection::Students, id, json!({ "documents": { doc_type: entry } })).await?;
    let student = state.store.find_by_id(Collection::Students, id).await?.ok_or_not_found("Student")?;
    let empty = Map::new();
    let documents = student.get("documents").and_then(Value::as_object).unwrap_or(&empty);
    let status = dv_status(documents);
    state
        .store
        .update(
            Collection::Students,
            id,
            json!({
                "dv_status": status,
                "is_verified": status == DvStatus::Verified,
                "pending_documents": pending_count(documents),
            }),
        )
        .await?;

    let student = state.store.find_by_id(Collection::Students, id).await?.ok_or_not_found("Student")?;
    sync_applications(&state.store, &student).await?;
    invalidate_lead_views(state);
    Ok(student)
}

#[derive(Debug, Deserialize)]
pub struct RegisterDocumentRequest {
    pub doc_type: String,
    pub file_url: String,
}

/// Registers a file already uploaded to object storage. Replaces an earlier upload of
/// the same type and resets its review.
pub async fn register_document(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<RegisterDocumentRequest>,
) -> AppResult<Response> {
    principal.require(Permission::ManageLeads)?;
    let id = parse_id(&id)?;
    find_student(&state, &principal, &id).await?;
    let doc_type = validate_doc_type(&req.doc_type)?;
    let file_url = validate_file_url(&req.file_url)?;

    let entry = json!({
        "file_url": file_url,
        "status": DocumentStatus::Pending,
        "uploaded_at": now_iso(),
        "uploaded_by": actor(&principal),
        "comment": null,
        "verified_by": null,
        "verified_at": null,
    });
    let student = apply_document_change(&state, &id, &doc_type, entry).await?;
    tracing::info!(student_id = %id, doc_type = %doc_type, "document registered");
    Ok(data_response(StatusCode::CREATED, student, "Document registered."))
}

#[derive(Debug, Deserialize)]
pub struct VerifyDocumentRequest {
    pub status: DocumentStatus,
    pub comment: Option<String>,
}

pub async fn verify_document(
    State(state): State<AppState>,
    principal: Principal,
    Path((id, doc_type)): Path<(String, String)>,
    JsonBody(req): JsonBody<VerifyDocumentRequest>,
) -> AppResult<Response> {
    principal.require(Permission::VerifyDocuments)?;
    let id = parse_id(&id)?;
    let doc_type = validate_doc_type(&doc_type)?;
    let student = find_student(&state, &principal, &id).await?;
    if student.get("documents").and_then(|d| d.get(&doc_type)).is_none() {
        return Err(AppError::DataNotFound(format!("Document '{}' not found", doc_type)));
    }

    let comment = req.comment.as_deref().map(str::trim).filter(|c| !c.is_empty());
    let comment = match (req.status, comment) {
        (DocumentStatus::Pending, _) => {
            return Err(AppError::validation("status", "status must be accepted or rejected"))
        }
        (DocumentStatus::Rejected, None) => {
            return Err(AppError::validation("comment", "A comment is required when rejecting a document"))
        }
        (_, Some(c)) => Some(require_text(c, "comment", 1000)?),
        (_, None) => None,
    };

    let entry = json!({
        "status": req.status,
        "comment": comment,
        "verified_by": actor(&principal),
        "verified_at": now_iso(),
    });
    let student = apply_document_change(&state, &id, &doc_type, entry).await?;
    tracing::info!(student_id = %id, doc_type = %doc_type, status = req.status.as_str(), "document reviewed");
    Ok(data_response(StatusCode::OK, student, "Document verified."))
}

/// Students with at least one document awaiting review, oldest activity first.
pub async fn dv_queue(
    State(state): State<AppState>,
    principal: Principal,
    QueryParams(page): QueryParams<PageParams>,
) -> AppResult<impl IntoResponse> {
    principal.require(Permission::VerifyDocuments)?;
    let page = page.resolve(&state.config.pagination)?;
    let pipeline = Pipeline::new(Collection::Students)
        .matching(scope_filter(SegmentModule::Lead, &principal)?)
        .matching(Filter::gt("pending_documents", 0))
        .sort(vec![SortKey::asc("updated_at")])
        .skip(page.skip)
        .limit(page.page_size);
    let (docs, total) = state.store.find_with_total(&pipeline).await?;
    Ok(Json(paginate("/dv/queue", page, docs, total, &[])))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs(statuses: &[&str]) -> Map<String, Value> {
        statuses.iter().enumerate().map(|(i, s)| (format!("d{}", i), json!({ "status": s }))).collect()
    }

    #[test]
    fn aggregate_status_prefers_rejection() {
        assert_eq!(dv_status(&docs(&[])), DvStatus::Pending);
        assert_eq!(dv_status(&docs(&["accepted", "accepted"])), DvStatus::Verified);
        assert_eq!(dv_status(&docs(&["accepted", "pending"])), DvStatus::Pending);
        assert_eq!(dv_status(&docs(&["pending", "rejected"])), DvStatus::Rejected);
        assert_eq!(pending_count(&docs(&["pending", "rejected", "pending"])), 2);
    }

    #[test]
    fn doc_type_and_url_are_checked() {
        assert_eq!(validate_doc_type(" Marksheet_12 ").unwrap(), "marksheet_12");
        assert!(validate_doc_type("a.b").is_err());
        assert!(validate_file_url("ftp://x").is_err());
        assert!(validate_file_url("https://files.example.com/a.pdf").is_ok());
    }
}
