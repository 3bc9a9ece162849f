//! Interview slots: scheduling, booking by application and panel results.

use std::collections::BTreeSet;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    db::Collection,
    error::{
        validation::{require_text, validate_count},
        AppError, AppResult, OptionExt,
    },
    pagination::{paginate, PageParams},
    query::{Filter, Pipeline, SortKey},
    routes::applications::find_application,
    routes::common::{actor, data_response, message_response, parse_id},
    routes::students::invalidate_lead_views,
    state::AppState,
    store::{get_str, DocumentStore},
    types::{now_iso, parse_date, ApplicationStage, DayBound, JsonBody, ObjectId, Permission, Principal, QueryParams, Role},
};

#[derive(Debug, Deserialize)]
pub struct CreateSlotRequest {
    pub course_name: String,
    pub start_time: String,
    pub end_time: String,
    pub capacity: u64,
    pub panelist_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SlotListQuery {
    pub course_name: Option<String>,
    pub date: Option<String>,
    pub available: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct BookRequest {
    pub application_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterviewOutcome {
    Selected,
    Rejected,
    OnHold,
}

#[derive(Debug, Deserialize)]
pub struct ResultRequest {
    pub application_id: String,
    pub status: InterviewOutcome,
    pub remarks: Option<String>,
}

fn college_scope(principal: &Principal) -> AppResult<Filter> {
    let mut scope = Filter::eq("college_id", principal.college()?);
    if principal.role == Role::Panelist {
        // panelists only see the slots they sit on
        let own = principal.user_id.as_ref().map(|id| id.to_string()).unwrap_or_default();
        scope = scope.and(Filter::contains("panelist_ids", own));
    }
    Ok(scope)
}

async fn find_slot(state: &AppState, principal: &Principal, id: &ObjectId) -> AppResult<Value> {
    state
        .store
        .find_scoped(Collection::InterviewSlots, id, college_scope(principal)?)
        .await?
        .ok_or_not_found("Interview slot")
}

fn booked_ids(slot: &Value) -> Vec<&str> {
    slot.get("booked").and_then(Value::as_array).map(|b| b.iter().filter_map(Value::as_str).collect()).unwrap_or_default()
}

/// Rewrites the stored `seats_left` from the current bookings and returns it.
/// The value only serves listing filters; the `booked` array guard is authoritative.
pub(crate) async fn refresh_seats_left(store: &DocumentStore, id: &ObjectId) -> AppResult<u64> {
    let slot = store.find_by_id(Collection::InterviewSlots, id).await?.ok_or_not_found("Interview slot")?;
    let capacity = slot.get("capacity").and_then(Value::as_u64).unwrap_or(0);
    let seats_left = capacity.saturating_sub(booked_ids(&slot).len() as u64);
    store.update(Collection::InterviewSlots, id, json!({ "seats_left": seats_left })).await?;
    Ok(seats_left)
}

/// Parses and deduplicates panelist ids, keeping request order irrelevant.
fn panelist_set(raw: &[String]) -> AppResult<BTreeSet<ObjectId>> {
    let ids = raw.iter().map(|r| parse_id(r)).collect::<AppResult<BTreeSet<_>>>()?;
    if ids.is_empty() {
        return Err(AppError::validation("panelist_ids", "At least one panelist is required"));
    }
    Ok(ids)
}

pub async fn create_slot(
    State(state): State<AppState>,
    principal: Principal,
    JsonBody(req): JsonBody<CreateSlotRequest>,
) -> AppResult<Response> {
    principal.require(Permission::ManageInterviews)?;
    let college = principal.college()?;
    let course = require_text(&req.course_name, "course_name", 200)?;
    let start = parse_date(&req.start_time, "start_time", DayBound::Start)?;
    let end = parse_date(&req.end_time, "end_time", DayBound::Start)?;
    if end <= start {
        return Err(AppError::validation("end_time", "end_time must be after start_time"));
    }
    let capacity = validate_count(req.capacity, "capacity")?;
    let panelists = panelist_set(&req.panelist_ids)?;

    let valid = Filter::is_in("_id", panelists.iter().map(|id| id.to_string()))
        .and(Filter::eq("college_id", college))
        .and(Filter::eq("role", Role::Panelist.as_str()));
    if state.store.count(Collection::Users, valid).await? != panelists.len() as u64 {
        return Err(AppError::validation("panelist_ids", "Every panelist must be a panelist user of this college"));
    }

    let doc = state
        .store
        .insert(
            Collection::InterviewSlots,
            json!({
                "course_name": course,
                "start_time": start,
                "end_time": end,
                "capacity": capacity,
                "seats_left": capacity,
                "panelist_ids": panelists,
                "booked": [],
                "results": {},
                "college_id": college,
                "created_by": actor(&principal),
            }),
        )
        .await?;
    tracing::info!(slot_id = %doc["_id"], capacity, "interview slot created");
    Ok(data_response(StatusCode::CREATED, doc, "Interview slot created."))
}

pub async fn list_slots(
    State(state): State<AppState>,
    principal: Principal,
    QueryParams(page): QueryParams<PageParams>,
    QueryParams(query): QueryParams<SlotListQuery>,
) -> AppResult<impl IntoResponse> {
    principal.require(Permission::ViewApplications)?;
    let page = page.resolve(&state.config.pagination)?;
    let mut filter = college_scope(&principal)?;
    let mut extra = Vec::new();

    if let Some(course) = query.course_name.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        filter = filter.and(Filter::eq("course_name", course));
        extra.push(("course_name", course.to_string()));
    }
    if let Some(date) = query.date.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        filter = filter
            .and(Filter::gte("start_time", parse_date(date, "date", DayBound::Start)?))
            .and(Filter::lte("start_time", parse_date(date, "date", DayBound::End)?));
        extra.push(("date", date.to_string()));
    }
    if let Some(available) = query.available {
        filter = filter.and(if available { Filter::gt("seats_left", 0) } else { Filter::lte("seats_left", 0) });
        extra.push(("available", available.to_string()));
    }

    let pipeline = Pipeline::new(Collection::InterviewSlots)
        .matching(filter)
        .sort(vec![SortKey::asc("start_time")])
        .skip(page.skip)
        .limit(page.page_size);
    let (docs, total) = state.store.find_with_total(&pipeline).await?;
    Ok(Json(paginate("/interview-slots", page, docs, total, &extra)))
}

pub async fn get_slot(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> AppResult<Response> {
    principal.require(Permission::ViewApplications)?;
    let doc = find_slot(&state, &principal, &parse_id(&id)?).await?;
    Ok(data_response(StatusCode::OK, doc, "Get data."))
}

pub async fn delete_slot(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> AppResult<Response> {
    principal.require(Permission::ManageInterviews)?;
    let id = parse_id(&id)?;
    find_slot(&state, &principal, &id).await?;
    // a booking may commit after the read above, so emptiness is part of the delete
    let deleted = state
        .store
        .delete_many(Collection::InterviewSlots, Filter::id(&id).and(Filter::max_size("booked", 0)))
        .await?;
    if deleted == 0 {
        return Err(AppError::validation("booked", "Interview slot has bookings and cannot be deleted"));
    }
    tracing::info!(slot_id = %id, "interview slot deleted");
    Ok(message_response("Interview slot deleted."))
}

/// Books a submitted application into the slot. Capacity and duplicate checks are part
/// of the same guarded update.
pub async fn book_slot(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<BookRequest>,
) -> AppResult<Response> {
    principal.require(Permission::ManageApplications)?;
    let id = parse_id(&id)?;
    let slot = find_slot(&state, &principal, &id).await?;
    let app_id = parse_id(&req.application_id)?;
    let application = find_application(&state, &principal, &app_id).await?;

    if get_str(&application, "stage") != Some(ApplicationStage::Submitted.as_str()) {
        return Err(AppError::validation("application_id", "Application must be submitted before booking an interview"));
    }
    if get_str(&application, "course_name") != get_str(&slot, "course_name") {
        return Err(AppError::validation("application_id", "Application is for a different course"));
    }

    let not_booked = Filter::id(&id).and(Filter::contains("booked", app_id.as_str()).negate());
    let booked = state
        .store
        .push_bounded(Collection::InterviewSlots, not_booked, "booked", json!(app_id), "capacity")
        .await?;
    if booked == 0 {
        let slot = state.store.find_by_id(Collection::InterviewSlots, &id).await?.ok_or_not_found("Interview slot")?;
        return Err(if booked_ids(&slot).contains(&app_id.as_str()) {
            AppError::validation("application_id", "Application already booked in this slot")
        } else {
            AppError::validation("capacity", "Interview slot is full")
        });
    }

    let seats_left = refresh_seats_left(&state.store, &id).await?;
    state
        .store
        .update(
            Collection::Applications,
            &app_id,
            json!({ "interview": { "slot_id": id, "start_time": slot["start_time"], "booked_at": now_iso() } }),
        )
        .await?;
    invalidate_lead_views(&state);
    tracing::info!(slot_id = %id, application_id = %app_id, seats_left, "interview booked");

    let slot = state.store.find_by_id(Collection::InterviewSlots, &id).await?.ok_or_not_found("Interview slot")?;
    Ok(data_response(StatusCode::OK, slot, "Interview booked."))
}

/// Records the panel's decision for a booked application.
pub async fn record_result(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<ResultRequest>,
) -> AppResult<Response> {
    principal.require(Permission::ConductInterviews)?;
    let id = parse_id(&id)?;
    // panelists outside the slot's panel do not see it at all
    let slot = find_slot(&state, &principal, &id).await?;
    let app_id = parse_id(&req.application_id)?;
    if !booked_ids(&slot).contains(&app_id.as_str()) {
        return Err(AppError::validation("application_id", "Application is not booked in this slot"));
    }
    let remarks = match req.remarks.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
        Some(r) => Some(require_text(r, "remarks", 2000)?),
        None => None,
    };

    let result = json!({
        "status": req.status,
        "remarks": remarks,
        "by": actor(&principal),
        "at": now_iso(),
    });
    state
        .store
        .update(Collection::InterviewSlots, &id, json!({ "results": { app_id.as_str(): result.clone() } }))
        .await?;
    state.store.update(Collection::Applications, &app_id, json!({ "interview": { "result": result } })).await?;
    invalidate_lead_views(&state);

    let slot = state.store.find_by_id(Collection::InterviewSlots, &id).await?.ok_or_not_found("Interview slot")?;
    Ok(data_response(StatusCode::OK, slot, "Interview result recorded."))
}
