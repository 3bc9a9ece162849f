use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::{
    db::Collection,
    error::{
        validation::{require_text, validate_count, validate_positive_number},
        AppError, AppResult, OptionExt,
    },
    pagination::{paginate, PageParams},
    query::{Filter, Pipeline},
    routes::common::{actor, data_response, message_response, parse_id, patch_text, pick_fields, sort_keys},
    routes::students::{find_student, invalidate_lead_views},
    state::AppState,
    store::get_str,
    types::{now_iso, JsonBody, ObjectId, Permission, Principal, QueryParams},
};

#[derive(Debug, Deserialize)]
pub struct CreateScholarshipRequest {
    pub name: String,
    pub amount: Option<f64>,
    pub percentage: Option<f64>,
    pub seats: u64,
    #[serde(default)]
    pub programs: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct AllocateRequest {
    pub student_id: String,
}

/// A scholarship grants either a fixed amount or a percentage of the fee, never both.
pub fn validate_benefit(amount: Option<f64>, percentage: Option<f64>) -> AppResult<(Option<f64>, Option<f64>)> {
    match (amount, percentage) {
        (Some(a), None) => Ok((Some(validate_positive_number(a, "amount")?), None)),
        (None, Some(p)) if p.is_finite() && p > 0.0 && p <= 100.0 => Ok((None, Some(p))),
        (None, Some(_)) => Err(AppError::validation("percentage", "percentage must be greater than 0 and at most 100")),
        _ => Err(AppError::validation("amount", "Exactly one of amount or percentage is required")),
    }
}

fn clean_programs(programs: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for p in programs.iter().map(|p| p.trim()).filter(|p| !p.is_empty()) {
        if !out.iter().any(|seen| seen == p) {
            out.push(p.to_string());
        }
    }
    out
}

fn college_scope(principal: &Principal) -> AppResult<Filter> {
    Ok(Filter::eq("college_id", principal.college()?))
}

async fn find_scholarship(state: &AppState, principal: &Principal, id: &ObjectId) -> AppResult<Value> {
    state
        .store
        .find_scoped(Collection::Scholarships, id, college_scope(principal)?)
        .await?
        .ok_or_not_found("Scholarship")
}

async fn ensure_unique_name(state: &AppState, college: &str, name: &str, except: Option<&ObjectId>) -> AppResult<()> {
    let mut filter = Filter::eq("college_id", college).and(Filter::eq("name", name));
    if let Some(id) = except {
        filter = filter.and(Filter::id(id).negate());
    }
    if state.store.exists(Collection::Scholarships, filter).await? {
        return Err(AppError::validation("name", "Scholarship name already exists"));
    }
    Ok(())
}

pub async fn create_scholarship(
    State(state): State<AppState>,
    principal: Principal,
    JsonBody(req): JsonBody<CreateScholarshipRequest>,
) -> AppResult<Response> {
    principal.require(Permission::ManageScholarships)?;
    let college = principal.college()?;
    let name = require_text(&req.name, "name", 200)?;
    let (amount, percentage) = validate_benefit(req.amount, req.percentage)?;
    let seats = validate_count(req.seats, "seats")?;
    ensure_unique_name(&state, college, &name, None).await?;

    let doc = state
        .store
        .insert(
            Collection::Scholarships,
            json!({
                "name": name,
                "amount": amount,
                "percentage": percentage,
                "seats": seats,
                "programs": clean_programs(&req.programs),
                "allocated": [],
                "college_id": college,
                "created_by": actor(&principal),
            }),
        )
        .await?;
    Ok(data_response(StatusCode::CREATED, doc, "Scholarship created."))
}

pub async fn list_scholarships(
    State(state): State<AppState>,
    principal: Principal,
    QueryParams(page): QueryParams<PageParams>,
) -> AppResult<impl IntoResponse> {
    principal.require(Permission::ViewLeads)?;
    let page = page.resolve(&state.config.pagination)?;
    let pipeline = Pipeline::new(Collection::Scholarships)
        .matching(college_scope(&principal)?)
        .sort(sort_keys(None, None, &[])?)
        .skip(page.skip)
        .limit(page.page_size);
    let (docs, total) = state.store.find_with_total(&pipeline).await?;
    Ok(Json(paginate("/scholarships", page, docs, total, &[])))
}

pub async fn get_scholarship(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> AppResult<Response> {
    principal.require(Permission::ViewLeads)?;
    let doc = find_scholarship(&state, &principal, &parse_id(&id)?).await?;
    Ok(data_response(StatusCode::OK, doc, "Get data."))
}

fn allocated_count(scholarship: &Value) -> u64 {
    scholarship.get("allocated").and_then(Value::as_array).map_or(0, Vec::len) as u64
}

/// Partial update. Seats may not drop below the seats already allocated, and the
/// benefit is replaced as a pair when either side is given.
pub async fn update_scholarship(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<Value>,
) -> AppResult<Response> {
    principal.require(Permission::ManageScholarships)?;
    let id = parse_id(&id)?;
    let existing = find_scholarship(&state, &principal, &id).await?;
    let fields = pick_fields(&body, &["name", "amount", "percentage", "seats", "programs"])?;
    let mut patch = Map::new();

    if let Some(name) = patch_text(&fields, "name")? {
        let name = require_text(name.as_deref().unwrap_or_default(), "name", 200)?;
        ensure_unique_name(&state, principal.college()?, &name, Some(&id)).await?;
        patch.insert("name".into(), json!(name));
    }
    if fields.contains_key("amount") || fields.contains_key("percentage") {
        let number = |field: &str| -> AppResult<Option<f64>> {
            match fields.get(field) {
                None | Some(Value::Null) => Ok(None),
                Some(v) => v.as_f64().map(Some).ok_or_else(|| AppError::validation(field, format!("{} must be a number", field))),
            }
        };
        let (amount, percentage) = validate_benefit(number("amount")?, number("percentage")?)?;
        patch.insert("amount".into(), json!(amount));
        patch.insert("percentage".into(), json!(percentage));
    }
    let mut guard = Filter::id(&id);
    if let Some(seats) = fields.get("seats") {
        let seats = seats.as_u64().ok_or_else(|| AppError::validation("seats", "seats must be a whole number"))?;
        let seats = validate_count(seats, "seats")?;
        if seats < allocated_count(&existing) {
            return Err(AppError::validation("seats", format!("{} seats are already allocated", allocated_count(&existing))));
        }
        // allocations racing this update are checked again by the guarded write
        guard = guard.and(Filter::max_size("allocated", seats));
        patch.insert("seats".into(), json!(seats));
    }
    if let Some(programs) = fields.get("programs") {
        let programs: Vec<String> = serde_json::from_value(programs.clone())
            .map_err(|_| AppError::validation("programs", "programs must be a list of strings"))?;
        patch.insert("programs".into(), json!(clean_programs(&programs)));
    }

    if state.store.update_many(Collection::Scholarships, guard, Value::Object(patch)).await? == 0 {
        let current = state.store.find_by_id(Collection::Scholarships, &id).await?.ok_or_not_found("Scholarship")?;
        return Err(AppError::validation("seats", format!("{} seats are already allocated", allocated_count(&current))));
    }
    let doc = state.store.find_by_id(Collection::Scholarships, &id).await?.ok_or_not_found("Scholarship")?;
    Ok(data_response(StatusCode::OK, doc, "Scholarship updated."))
}

pub async fn delete_scholarship(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> AppResult<Response> {
    principal.require(Permission::ManageScholarships)?;
    let id = parse_id(&id)?;
    find_scholarship(&state, &principal, &id).await?;
    state.store.delete(Collection::Scholarships, &id).await?;
    Ok(message_response("Scholarship deleted."))
}

/// Grants a seat to a student. The seat check and the append happen in one guarded
/// update, so concurrent allocations cannot oversubscribe the scholarship.
pub async fn allocate_scholarship(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<AllocateRequest>,
) -> AppResult<Response> {
    principal.require(Permission::ManageScholarships)?;
    let id = parse_id(&id)?;
    let scholarship = find_scholarship(&state, &principal, &id).await?;
    let student_id = parse_id(&req.student_id)?;
    let student = find_student(&state, &principal, &student_id).await?;

    let programs: Vec<&str> = scholarship
        .get("programs")
        .and_then(Value::as_array)
        .map(|p| p.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if !programs.is_empty() && !get_str(&student, "course_name").is_some_and(|c| programs.contains(&c)) {
        return Err(AppError::validation("student_id", "Student's course is not eligible for this scholarship"));
    }

    let not_yet = Filter::id(&id).and(Filter::contains("allocated", student_id.as_str()).negate());
    let granted = state
        .store
        .push_bounded(Collection::Scholarships, not_yet, "allocated", json!(student_id), "seats")
        .await?;
    if granted == 0 {
        let already = state
            .store
            .exists(Collection::Scholarships, Filter::id(&id).and(Filter::contains("allocated", student_id.as_str())))
            .await?;
        return Err(if already {
            AppError::validation("student_id", "Scholarship already allocated to this student")
        } else {
            AppError::validation("seats", "No seats left")
        });
    }

    state
        .store
        .push(
            Collection::Students,
            Filter::id(&student_id),
            "scholarships",
            json!({
                "scholarship_id": id,
                "name": scholarship["name"],
                "amount": scholarship["amount"],
                "percentage": scholarship["percentage"],
                "allocated_at": now_iso(),
                "by": actor(&principal),
            }),
        )
        .await?;
    invalidate_lead_views(&state);
    tracing::info!(scholarship_id = %id, student_id = %student_id, "scholarship allocated");
    let doc = state.store.find_by_id(Collection::Scholarships, &id).await?.ok_or_not_found("Scholarship")?;
    Ok(data_response(StatusCode::OK, doc, "Scholarship allocated."))
}
