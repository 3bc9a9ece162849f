use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{
    cache::{cache_key, NS_APPLICATIONS, NS_DASHBOARD, NS_SEGMENTS, NS_STUDENTS},
    db::Collection,
    error::{
        validation::{require_text, validate_email, validate_mobile},
        AppError, AppResult, OptionExt,
    },
    export::{csv_response, to_csv, LEAD_COLUMNS},
    jobs::JobWork,
    leads::{create_lead, ensure_counselor, ensure_unique_contact, sync_applications, validate_score, LeadInput},
    middleware::ip::ClientIp,
    pagination::{paginate, PageParams},
    query::{Filter, Pipeline},
    routes::common::{actor, data_response, message_response, parse_id, patch_text, pick_fields, sort_keys, split_list},
    routes::interviews::refresh_seats_left,
    segments::{build_filter, build_pipeline, scope_filter, DateRange, SegmentCriteria, SegmentModule},
    state::AppState,
    store::doc_id,
    types::{now_iso, JsonBody, ObjectId, Permission, Principal, QueryParams},
};

const MAX_BULK_ROWS: usize = 5000;
const SORTABLE: [&str; 6] = ["created_at", "updated_at", "name", "lead_stage", "twelve_score", "city"];
const UPDATABLE: [&str; 8] = ["name", "email", "mobile", "state_code", "city", "course_name", "lead_source", "twelve_score"];

/// Filters accepted by the lead listing and export endpoints.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StudentFilterQuery {
    pub state_code: Option<String>,
    pub city: Option<String>,
    pub counselor_id: Option<String>,
    pub lead_stage: Option<String>,
    pub lead_source: Option<String>,
    pub course_name: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub search: Option<String>,
    pub sort: Option<String>,
    pub sort_type: Option<String>,
}

impl StudentFilterQuery {
    /// The listing filters are a lead segment built on the fly.
    pub fn criteria(&self) -> SegmentCriteria {
        let date_range = (self.start_date.is_some() || self.end_date.is_some())
            .then(|| DateRange { start: self.start_date.clone(), end: self.end_date.clone() });
        SegmentCriteria {
            state_codes: split_list(self.state_code.as_deref()),
            cities: split_list(self.city.as_deref()),
            counselor_ids: split_list(self.counselor_id.as_deref()),
            lead_stages: split_list(self.lead_stage.as_deref()),
            lead_sources: split_list(self.lead_source.as_deref()),
            course_names: split_list(self.course_name.as_deref()),
            date_range,
            search: self.search.clone(),
            ..Default::default()
        }
    }

    /// Present parameters, for carrying into pagination links.
    fn link_params(&self) -> Vec<(&'static str, String)> {
        [
            ("state_code", &self.state_code),
            ("city", &self.city),
            ("counselor_id", &self.counselor_id),
            ("lead_stage", &self.lead_stage),
            ("lead_source", &self.lead_source),
            ("course_name", &self.course_name),
            ("start_date", &self.start_date),
            ("end_date", &self.end_date),
            ("search", &self.search),
            ("sort", &self.sort),
            ("sort_type", &self.sort_type),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.as_ref().map(|v| (k, v.clone())))
        .collect()
    }

    fn pipeline(&self, principal: &Principal) -> AppResult<Pipeline> {
        let sort = sort_keys(self.sort.as_deref(), self.sort_type.as_deref(), &SORTABLE)?;
        build_pipeline(SegmentModule::Lead, &self.criteria(), principal, sort, None)
    }
}

/// Cache scope: counselors see a different slice of the college than admins.
pub fn cache_scope(principal: &Principal) -> AppResult<String> {
    let college = principal.college()?;
    Ok(match (&principal.user_id, principal.is_counselor()) {
        (Some(id), true) => format!("{}:{}", college, id),
        _ => college.to_string(),
    })
}

pub fn invalidate_lead_views(state: &AppState) {
    state.cache.invalidate(&[NS_STUDENTS, NS_APPLICATIONS, NS_DASHBOARD, NS_SEGMENTS]);
}

/// Loads a student visible to the principal.
pub async fn find_student(state: &AppState, principal: &Principal, id: &ObjectId) -> AppResult<Value> {
    state
        .store
        .find_scoped(Collection::Students, id, scope_filter(SegmentModule::Lead, principal)?)
        .await?
        .ok_or_not_found("Student")
}

pub async fn create_student(
    State(state): State<AppState>,
    principal: Principal,
    JsonBody(mut input): JsonBody<LeadInput>,
) -> AppResult<Response> {
    principal.require(Permission::ManageLeads)?;
    let college = principal.college()?.to_string();
    if principal.is_counselor() {
        // counselors can only create leads they own
        input.counselor_id = principal.user_id.as_ref().map(|id| id.to_string());
    }
    let lead = input.validate()?;
    let doc = create_lead(&state.store, &college, lead, &actor(&principal)).await?;
    state.metrics.add_leads(1);
    invalidate_lead_views(&state);
    tracing::info!(student_id = %doc["_id"], college_id = %college, "lead created");
    Ok(data_response(StatusCode::CREATED, doc, "Student created."))
}

pub async fn list_students(
    State(state): State<AppState>,
    principal: Principal,
    QueryParams(page): QueryParams<PageParams>,
    QueryParams(query): QueryParams<StudentFilterQuery>,
) -> AppResult<impl IntoResponse> {
    principal.require(Permission::ViewLeads)?;
    let page = page.resolve(&state.config.pagination)?;
    let key = cache_key(NS_STUDENTS, &cache_scope(&principal)?, &json!({ "q": &query, "p": [page.page_num, page.page_size] }))?;
    if let Some(hit) = state.cache.get(&key) {
        return Ok(Json(hit));
    }
    let generation = state.cache.generation(NS_STUDENTS);

    let pipeline = query.pipeline(&principal)?.skip(page.skip).limit(page.page_size);
    let (docs, total) = state.store.find_with_total(&pipeline).await?;
    let body = serde_json::to_value(paginate("/students", page, docs, total, &query.link_params()))?;
    state.cache.insert(NS_STUDENTS, generation, key, body.clone());
    Ok(Json(body))
}

pub async fn get_student(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> AppResult<Response> {
    principal.require(Permission::ViewLeads)?;
    let doc = find_student(&state, &principal, &parse_id(&id)?).await?;
    Ok(data_response(StatusCode::OK, doc, "Get data."))
}

fn validated_patch(fields: Map<String, Value>) -> AppResult<Map<String, Value>> {
    let mut patch = Map::new();
    for (key, value) in &fields {
        let clean = match key.as_str() {
            "name" => json!(require_text(value.as_str().unwrap_or_default(), "name", 200)?),
            "email" => json!(validate_email(value.as_str().unwrap_or_default())?),
            "mobile" => json!(validate_mobile(value.as_str().unwrap_or_default())?),
            "twelve_score" => match value {
                Value::Null => Value::Null,
                v => json!(validate_score(Some(
                    v.as_f64().ok_or_else(|| AppError::validation("twelve_score", "twelve_score must be a number"))?
                ))?),
            },
            other => match patch_text(&fields, other)? {
                Some(Some(text)) if !text.is_empty() => {
                    let text = require_text(&text, other, 200)?;
                    if other == "state_code" { json!(text.to_uppercase()) } else { json!(text) }
                }
                _ => Value::Null,
            },
        };
        patch.insert(key.clone(), clean);
    }
    Ok(patch)
}

pub async fn update_student(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<Value>,
) -> AppResult<Response> {
    principal.require(Permission::ManageLeads)?;
    let id = parse_id(&id)?;
    let existing = find_student(&state, &principal, &id).await?;
    let college = principal.college()?;

    let patch = validated_patch(pick_fields(&body, &UPDATABLE)?)?;
    let changed = |field: &str| patch.get(field).and_then(Value::as_str).filter(|v| Some(*v) != existing[field].as_str());
    ensure_unique_contact(&state.store, college, changed("email"), changed("mobile"), Some(&id)).await?;

    state.store.update(Collection::Students, &id, Value::Object(patch)).await?;
    let doc = state.store.find_by_id(Collection::Students, &id).await?.ok_or_not_found("Student")?;
    sync_applications(&state.store, &doc).await?;
    invalidate_lead_views(&state);
    Ok(data_response(StatusCode::OK, doc, "Student updated."))
}

pub async fn delete_student(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> AppResult<Response> {
    principal.require(Permission::ManageLeads)?;
    let id = parse_id(&id)?;
    find_student(&state, &principal, &id).await?;
    let college = principal.college()?;

    // no cross-collection transaction: references go first so none are left dangling
    let applications = state
        .store
        .find(&Pipeline::new(Collection::Applications).matching(Filter::eq("student_id", id.as_str())).project(&["_id"]))
        .await?;
    for application in &applications {
        let app_id = doc_id(application)?;
        let in_slot = Filter::eq("college_id", college).and(Filter::contains("booked", app_id.as_str()));
        let slots = state.store.find(&Pipeline::new(Collection::InterviewSlots).matching(in_slot).project(&["_id"])).await?;
        for slot in &slots {
            let slot_id = doc_id(slot)?;
            state.store.pull(Collection::InterviewSlots, Filter::id(&slot_id), "booked", app_id.as_str()).await?;
            refresh_seats_left(&state.store, &slot_id).await?;
        }
    }
    let released = state
        .store
        .pull(Collection::Scholarships, Filter::eq("college_id", college), "allocated", id.as_str())
        .await?;
    let removed = state.store.delete_many(Collection::Applications, Filter::eq("student_id", id.as_str())).await?;
    state.store.delete(Collection::Students, &id).await?;
    invalidate_lead_views(&state);
    tracing::info!(student_id = %id, applications = removed, scholarships = released, "lead deleted");
    Ok(message_response("Student deleted."))
}

#[derive(Debug, Deserialize)]
pub struct AssignCounselorRequest {
    pub counselor_id: String,
}

pub async fn assign_counselor(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<AssignCounselorRequest>,
) -> AppResult<Response> {
    principal.require(Permission::ManageLeads)?;
    if principal.is_counselor() {
        return Err(AppError::Forbidden("Not enough permissions".to_string()));
    }
    let id = parse_id(&id)?;
    let counselor = parse_id(&req.counselor_id)?;
    find_student(&state, &principal, &id).await?;
    ensure_counselor(&state.store, principal.college()?, &counselor).await?;

    state.store.update(Collection::Students, &id, json!({ "counselor_id": counselor })).await?;
    state
        .store
        .push(
            Collection::Students,
            Filter::id(&id),
            "timeline",
            json!({ "event": "counselor_assigned", "counselor_id": counselor, "by": actor(&principal), "at": now_iso() }),
        )
        .await?;
    let doc = state.store.find_by_id(Collection::Students, &id).await?.ok_or_not_found("Student")?;
    sync_applications(&state.store, &doc).await?;
    invalidate_lead_views(&state);
    Ok(data_response(StatusCode::OK, doc, "Counselor assigned."))
}

#[derive(Debug, Deserialize)]
pub struct LeadStageRequest {
    pub lead_stage: String,
    pub note: Option<String>,
}

pub async fn change_lead_stage(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<LeadStageRequest>,
) -> AppResult<Response> {
    principal.require(Permission::ManageLeads)?;
    let id = parse_id(&id)?;
    let existing = find_student(&state, &principal, &id).await?;
    let stage = require_text(&req.lead_stage, "lead_stage", 50)?.to_lowercase();
    let note = match req.note.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        Some(n) => Some(require_text(n, "note", 1000)?),
        None => None,
    };

    state.store.update(Collection::Students, &id, json!({ "lead_stage": stage })).await?;
    state
        .store
        .push(
            Collection::Students,
            Filter::id(&id),
            "timeline",
            json!({
                "event": "lead_stage_changed",
                "from": existing["lead_stage"],
                "lead_stage": stage,
                "note": note,
                "by": actor(&principal),
                "at": now_iso(),
            }),
        )
        .await?;
    let doc = state.store.find_by_id(Collection::Students, &id).await?.ok_or_not_found("Student")?;
    sync_applications(&state.store, &doc).await?;
    invalidate_lead_views(&state);
    Ok(data_response(StatusCode::OK, doc, "Lead stage updated."))
}

#[derive(Debug, Deserialize)]
pub struct BulkUploadRequest {
    pub leads: Vec<Value>,
}

pub async fn bulk_upload(
    State(state): State<AppState>,
    principal: Principal,
    ClientIp(ip): ClientIp,
    JsonBody(req): JsonBody<BulkUploadRequest>,
) -> AppResult<Response> {
    principal.require(Permission::ManageLeads)?;
    state.rate_limiter.check_endpoint_limit("/students/bulk", ip).await?;
    if req.leads.is_empty() {
        return Err(AppError::validation("leads", "leads must not be empty"));
    }
    if req.leads.len() > MAX_BULK_ROWS {
        return Err(AppError::validation("leads", format!("At most {} leads per upload", MAX_BULK_ROWS)));
    }
    let college = principal.college()?.to_string();
    let who = actor(&principal);
    let default_counselor = if principal.is_counselor() { Some(who.clone()) } else { None };
    let rows = req.leads.len();

    let job = state
        .jobs
        .submit(&college, &who, JobWork::LeadUpload { college_id: college.clone(), actor: who.clone(), default_counselor, rows: req.leads })
        .await?;
    tracing::info!(job_id = %job["_id"], rows, "lead upload queued");
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job["_id"], "status": job["status"], "message": "Upload queued." })))
        .into_response())
}

/// Synchronous CSV download, capped at `export.max_rows`.
pub async fn export_students(
    State(state): State<AppState>,
    principal: Principal,
    ClientIp(ip): ClientIp,
    QueryParams(query): QueryParams<StudentFilterQuery>,
) -> AppResult<Response> {
    principal.require(Permission::ViewLeads)?;
    principal.require(Permission::ExportData)?;
    state.rate_limiter.check_endpoint_limit("/students/export", ip).await?;

    let max_rows = state.config.export.max_rows;
    let docs = state.store.find(&query.pipeline(&principal)?.limit(max_rows)).await?;
    if docs.len() as u64 == max_rows {
        tracing::warn!(max_rows, "lead export truncated at export.max_rows");
    }
    let filename = format!("leads_{}.csv", chrono::Utc::now().format("%Y%m%d%H%M%S"));
    Ok(csv_response(to_csv(&LEAD_COLUMNS, &docs), &filename))
}

/// Queues the same export as a background job.
pub async fn export_students_job(
    State(state): State<AppState>,
    principal: Principal,
    ClientIp(ip): ClientIp,
    JsonBody(query): JsonBody<StudentFilterQuery>,
) -> AppResult<Response> {
    principal.require(Permission::ViewLeads)?;
    principal.require(Permission::ExportData)?;
    state.rate_limiter.check_endpoint_limit("/students/export", ip).await?;
    // validate criteria now rather than inside the job
    build_filter(SegmentModule::Lead, &query.criteria())?;

    let pipeline = query.pipeline(&principal)?;
    let job = state
        .jobs
        .submit(
            principal.college()?,
            &actor(&principal),
            JobWork::LeadExport { pipeline, columns: &LEAD_COLUMNS, max_rows: state.config.export.max_rows },
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": job["_id"], "status": job["status"], "message": "Export queued." })))
        .into_response())
}
