//! Saved data segments: CRUD, member listing and targeted communication.

use std::collections::HashSet;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::{stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::{
    cache::{cache_key, NS_SEGMENTS},
    db::Collection,
    error::{validation::require_text, AppError, AppResult, OptionExt},
    messaging::{deliver, message_for},
    middleware::ip::ClientIp,
    pagination::{paginate, PageParams},
    query::{Filter, Pipeline, SortKey},
    routes::common::{actor, data_response, message_response, parse_id, patch_text, pick_fields, sort_keys},
    routes::students::cache_scope,
    segments::{build_filter, member_filter, member_student_id, scope_filter, SegmentCriteria, SegmentModule, SegmentType},
    state::AppState,
    store::{doc_id, get_str},
    types::{JsonBody, ObjectId, Permission, Principal, QueryParams},
};

/// Concurrent provider calls per communication request.
const SEND_CONCURRENCY: usize = 8;

#[derive(Debug, Deserialize)]
pub struct CreateSegmentRequest {
    pub name: String,
    pub description: Option<String>,
    pub module: SegmentModule,
    #[serde(default)]
    pub criteria: SegmentCriteria,
    #[serde(default)]
    pub segment_type: SegmentType,
}

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    pub module: SegmentModule,
    #[serde(default)]
    pub criteria: SegmentCriteria,
}

#[derive(Debug, Deserialize)]
pub struct CommunicateRequest {
    pub template_id: String,
}

fn college_scope(principal: &Principal) -> AppResult<Filter> {
    Ok(Filter::eq("college_id", principal.college()?))
}

async fn find_segment(state: &AppState, principal: &Principal, id: &ObjectId) -> AppResult<Value> {
    state
        .store
        .find_scoped(Collection::DataSegments, id, college_scope(principal)?)
        .await?
        .ok_or_not_found("Data segment")
}

async fn ensure_unique_name(state: &AppState, college: &str, name: &str, except: Option<&ObjectId>) -> AppResult<()> {
    let mut filter = Filter::eq("college_id", college).and(Filter::eq("name", name));
    if let Some(id) = except {
        filter = filter.and(Filter::id(id).negate());
    }
    if state.store.exists(Collection::DataSegments, filter).await? {
        return Err(AppError::validation("name", "Data segment name already exists"));
    }
    Ok(())
}

/// Ids of the documents currently matching, within the principal's scope.
async fn matching_ids(state: &AppState, principal: &Principal, module: SegmentModule, filter: Filter) -> AppResult<Vec<String>> {
    let pipeline = Pipeline::new(module.collection())
        .matching(scope_filter(module, principal)?)
        .matching(filter)
        .sort(vec![SortKey::asc("created_at")])
        .project(&["_id"]);
    let docs = state.store.find(&pipeline).await?;
    Ok(docs.iter().filter_map(|d| get_str(d, "_id").map(str::to_string)).collect())
}

fn description(raw: Option<&str>) -> AppResult<Option<String>> {
    match raw.map(str::trim).filter(|d| !d.is_empty()) {
        Some(d) => Ok(Some(require_text(d, "description", 1000)?)),
        None => Ok(None),
    }
}

pub async fn create_segment(
    State(state): State<AppState>,
    principal: Principal,
    JsonBody(req): JsonBody<CreateSegmentRequest>,
) -> AppResult<Response> {
    principal.require(Permission::ManageSegments)?;
    let college = principal.college()?;
    let name = require_text(&req.name, "name", 200)?;
    let filter = build_filter(req.module, &req.criteria)?;
    ensure_unique_name(&state, college, &name, None).await?;

    let frozen_ids = match req.segment_type {
        SegmentType::Static => Some(matching_ids(&state, &principal, req.module, filter).await?),
        SegmentType::Dynamic => None,
    };
    let doc = state
        .store
        .insert(
            Collection::DataSegments,
            json!({
                "name": name,
                "description": description(req.description.as_deref())?,
                "module": req.module,
                "criteria": req.criteria,
                "segment_type": req.segment_type,
                "frozen_ids": frozen_ids,
                "college_id": college,
                "created_by": actor(&principal),
            }),
        )
        .await?;
    state.cache.invalidate(&[NS_SEGMENTS]);
    tracing::info!(segment_id = %doc["_id"], module = ?req.module, "data segment created");
    Ok(data_response(StatusCode::CREATED, doc, "Data segment created."))
}

pub async fn list_segments(
    State(state): State<AppState>,
    principal: Principal,
    QueryParams(page): QueryParams<PageParams>,
) -> AppResult<impl IntoResponse> {
    principal.require(Permission::ViewSegments)?;
    let page = page.resolve(&state.config.pagination)?;
    let pipeline = Pipeline::new(Collection::DataSegments)
        .matching(college_scope(&principal)?)
        .sort(sort_keys(None, None, &[])?)
        .skip(page.skip)
        .limit(page.page_size);
    let (docs, total) = state.store.find_with_total(&pipeline).await?;
    Ok(Json(paginate("/data-segments", page, docs, total, &[])))
}

pub async fn get_segment(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> AppResult<Response> {
    principal.require(Permission::ViewSegments)?;
    let doc = find_segment(&state, &principal, &parse_id(&id)?).await?;
    Ok(data_response(StatusCode::OK, doc, "Get data."))
}

/// Partial update of name, description and criteria. A static segment whose criteria
/// change is frozen again.
pub async fn update_segment(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<Value>,
) -> AppResult<Response> {
    principal.require(Permission::ManageSegments)?;
    let id = parse_id(&id)?;
    let existing = find_segment(&state, &principal, &id).await?;
    let fields = pick_fields(&body, &["name", "description", "criteria"])?;
    let mut patch = Map::new();

    if let Some(name) = patch_text(&fields, "name")? {
        let name = require_text(name.as_deref().unwrap_or_default(), "name", 200)?;
        ensure_unique_name(&state, principal.college()?, &name, Some(&id)).await?;
        patch.insert("name".into(), json!(name));
    }
    if let Some(desc) = patch_text(&fields, "description")? {
        patch.insert("description".into(), json!(description(desc.as_deref())?));
    }
    if let Some(raw) = fields.get("criteria") {
        let criteria: SegmentCriteria = serde_json::from_value(raw.clone())
            .map_err(|e| AppError::validation("criteria", e.to_string()))?;
        let (module, _) = member_filter(&existing)?;
        let filter = build_filter(module, &criteria)?;
        if get_str(&existing, "segment_type") == Some("static") {
            patch.insert("frozen_ids".into(), json!(matching_ids(&state, &principal, module, filter).await?));
        }
        // merge patch would merge into the old criteria; store a full replacement
        state.store.update(Collection::DataSegments, &id, json!({ "criteria": null })).await?;
        patch.insert("criteria".into(), serde_json::to_value(&criteria)?);
    }

    state.store.update(Collection::DataSegments, &id, Value::Object(patch)).await?;
    state.cache.invalidate(&[NS_SEGMENTS]);
    let doc = state.store.find_by_id(Collection::DataSegments, &id).await?.ok_or_not_found("Data segment")?;
    Ok(data_response(StatusCode::OK, doc, "Data segment updated."))
}

pub async fn delete_segment(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> AppResult<Response> {
    principal.require(Permission::ManageSegments)?;
    let id = parse_id(&id)?;
    find_segment(&state, &principal, &id).await?;
    state.store.delete(Collection::DataSegments, &id).await?;
    state.cache.invalidate(&[NS_SEGMENTS]);
    Ok(message_response("Data segment deleted."))
}

pub async fn segment_members(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
    QueryParams(page): QueryParams<PageParams>,
) -> AppResult<impl IntoResponse> {
    principal.require(Permission::ViewSegments)?;
    let page = page.resolve(&state.config.pagination)?;
    let segment = find_segment(&state, &principal, &parse_id(&id)?).await?;
    let (module, filter) = member_filter(&segment)?;

    let pipeline = Pipeline::new(module.collection())
        .matching(scope_filter(module, &principal)?)
        .matching(filter)
        .sort(vec![SortKey::desc("created_at")])
        .skip(page.skip)
        .limit(page.page_size);
    let (docs, total) = state.store.find_with_total(&pipeline).await?;
    Ok(Json(paginate(&format!("/data-segments/{}/students", id), page, docs, total, &[])))
}

pub async fn segment_count(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    principal.require(Permission::ViewSegments)?;
    let id = parse_id(&id)?;
    let key = cache_key(NS_SEGMENTS, &cache_scope(&principal)?, &json!({ "count": id }))?;
    if let Some(hit) = state.cache.get(&key) {
        return Ok(Json(hit));
    }
    let generation = state.cache.generation(NS_SEGMENTS);
    let segment = find_segment(&state, &principal, &id).await?;
    let (module, filter) = member_filter(&segment)?;
    let count = state.store.count(module.collection(), scope_filter(module, &principal)?.and(filter)).await?;

    let body = json!({ "data": { "count": count, "module": module }, "message": "Get data." });
    state.cache.insert(NS_SEGMENTS, generation, key, body.clone());
    Ok(Json(body))
}

/// Counts what the criteria would select without saving a segment.
pub async fn preview_segment(
    State(state): State<AppState>,
    principal: Principal,
    JsonBody(req): JsonBody<PreviewRequest>,
) -> AppResult<impl IntoResponse> {
    principal.require(Permission::ViewSegments)?;
    let filter = build_filter(req.module, &req.criteria)?;
    let count = state.store.count(req.module.collection(), scope_filter(req.module, &principal)?.and(filter)).await?;
    Ok(Json(json!({ "data": { "count": count, "module": req.module }, "message": "Get data." })))
}

/// Student documents behind the segment's members, each student once.
async fn member_students(state: &AppState, principal: &Principal, segment: &Value) -> AppResult<Vec<Value>> {
    let (module, filter) = member_filter(segment)?;
    let scoped = scope_filter(module, principal)?.and(filter);
    match module {
        SegmentModule::Lead => state.store.find(&Pipeline::new(Collection::Students).matching(scoped)).await,
        SegmentModule::Application => {
            let apps = state
                .store
                .find(&Pipeline::new(Collection::Applications).matching(scoped).project(&["student_id"]))
                .await?;
            let ids: HashSet<String> =
                apps.iter().filter_map(|a| member_student_id(module, a)).map(|id| id.to_string()).collect();
            state
                .store
                .find(&Pipeline::new(Collection::Students).matching(Filter::is_in("_id", ids)))
                .await
        }
    }
}

/// Renders the template for every member and hands the messages to the dispatcher.
/// Members without an address for the channel are skipped.
pub async fn communicate(
    State(state): State<AppState>,
    principal: Principal,
    ClientIp(ip): ClientIp,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<CommunicateRequest>,
) -> AppResult<impl IntoResponse> {
    principal.require(Permission::Communicate)?;
    state.rate_limiter.check_endpoint_limit("/data-segments/{id}/communicate", ip).await?;
    let segment = find_segment(&state, &principal, &parse_id(&id)?).await?;
    let template_id = parse_id(&req.template_id)?;
    let template = state
        .store
        .find_scoped(Collection::Templates, &template_id, college_scope(&principal)?)
        .await?
        .ok_or_not_found("Template")?;
    if template.get("is_published").and_then(Value::as_bool) != Some(true) {
        return Err(AppError::validation("template_id", "Template is not published"));
    }

    let students = member_students(&state, &principal, &segment).await?;
    let mut messages = Vec::with_capacity(students.len());
    for student in &students {
        if let Some(message) = message_for(&template, student)? {
            messages.push(message);
        }
    }
    let skipped = students.len() - messages.len();

    let results: Vec<AppResult<bool>> = stream::iter(messages)
        .map(|message| {
            let state = state.clone();
            async move { deliver(&state.store, state.dispatcher.as_ref(), &state.metrics, message).await }
        })
        .buffer_unordered(SEND_CONCURRENCY)
        .collect()
        .await;

    let mut sent = 0u64;
    let mut failed = 0u64;
    for result in results {
        match result {
            Ok(true) => sent += 1,
            Ok(false) => failed += 1,
            Err(e) => {
                failed += 1;
                tracing::warn!(error = %e, "failed to record communication");
            }
        }
    }
    tracing::info!(segment_id = %doc_id(&segment)?, sent, failed, skipped, "segment communication finished");
    Ok(Json(json!({
        "data": { "sent": sent, "failed": failed, "skipped": skipped },
        "message": "Communication sent.",
    })))
}
