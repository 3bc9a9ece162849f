use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    cache::{cache_key, NS_APPLICATIONS},
    db::Collection,
    error::{
        validation::{require_text, validate_positive_number},
        AppError, AppResult, OptionExt,
    },
    leads::student_snapshot,
    pagination::{paginate, PageParams},
    query::Filter,
    routes::common::{actor, data_response, parse_id, patch_text, pick_fields, sort_keys, split_list},
    routes::students::{cache_scope, find_student, invalidate_lead_views},
    segments::{build_pipeline, scope_filter, SegmentCriteria, SegmentModule},
    state::AppState,
    store::get_str,
    types::{now_iso, ApplicationStage, JsonBody, ObjectId, PaymentStatus, Permission, Principal, QueryParams},
};

const SORTABLE: [&str; 5] = ["created_at", "updated_at", "fee", "course_name", "student.name"];

#[derive(Debug, Deserialize)]
pub struct CreateApplicationRequest {
    pub student_id: String,
    pub course_name: String,
    pub fee: f64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ApplicationListQuery {
    pub payment_status: Option<PaymentStatus>,
    pub stage: Option<ApplicationStage>,
    pub course_name: Option<String>,
    pub sort: Option<String>,
    pub sort_type: Option<String>,
}

impl ApplicationListQuery {
    fn criteria(&self) -> SegmentCriteria {
        SegmentCriteria {
            payment_status: self.payment_status,
            application_stage: self.stage,
            course_names: split_list(self.course_name.as_deref()),
            ..Default::default()
        }
    }

    fn link_params(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        if let Some(p) = self.payment_status {
            out.push(("payment_status", p.as_str().to_string()));
        }
        if let Some(s) = self.stage {
            out.push(("stage", s.as_str().to_string()));
        }
        for (k, v) in [("course_name", &self.course_name), ("sort", &self.sort), ("sort_type", &self.sort_type)] {
            if let Some(v) = v {
                out.push((k, v.clone()));
            }
        }
        out
    }
}

/// Loads an application visible to the principal.
pub async fn find_application(state: &AppState, principal: &Principal, id: &ObjectId) -> AppResult<Value> {
    state
        .store
        .find_scoped(Collection::Applications, id, scope_filter(SegmentModule::Application, principal)?)
        .await?
        .ok_or_not_found("Application")
}

async fn reload(state: &AppState, id: &ObjectId) -> AppResult<Value> {
    state.store.find_by_id(Collection::Applications, id).await?.ok_or_not_found("Application")
}

pub async fn create_application(
    State(state): State<AppState>,
    principal: Principal,
    JsonBody(req): JsonBody<CreateApplicationRequest>,
) -> AppResult<Response> {
    principal.require(Permission::ManageApplications)?;
    let college = principal.college()?.to_string();
    let student_id = parse_id(&req.student_id)?;
    let course = require_text(&req.course_name, "course_name", 200)?;
    let fee = validate_positive_number(req.fee, "fee")?;
    let student = find_student(&state, &principal, &student_id).await?;

    let duplicate = Filter::eq("college_id", college.as_str())
        .and(Filter::eq("student_id", student_id.as_str()))
        .and(Filter::eq("course_name", course.as_str()));
    if state.store.exists(Collection::Applications, duplicate).await? {
        return Err(AppError::validation("course_name", "Application already exists for this course"));
    }

    let doc = state
        .store
        .insert(
            Collection::Applications,
            json!({
                "college_id": college,
                "student_id": student_id,
                "course_name": course,
                "fee": fee,
                "payable_fee": fee,
                "payment_status": PaymentStatus::Unpaid,
                "stage": ApplicationStage::Initiated,
                "promocode": null,
                "payment": null,
                "student": student_snapshot(&student),
                "created_by": actor(&principal),
            }),
        )
        .await?;
    state.metrics.inc_applications();
    invalidate_lead_views(&state);
    tracing::info!(application_id = %doc["_id"], student_id = %student_id, "application created");
    Ok(data_response(StatusCode::CREATED, doc, "Application created."))
}

pub async fn list_applications(
    State(state): State<AppState>,
    principal: Principal,
    QueryParams(page): QueryParams<PageParams>,
    QueryParams(query): QueryParams<ApplicationListQuery>,
) -> AppResult<impl IntoResponse> {
    principal.require(Permission::ViewApplications)?;
    let page = page.resolve(&state.config.pagination)?;
    let key = cache_key(
        NS_APPLICATIONS,
        &cache_scope(&principal)?,
        &json!({ "q": &query, "p": [page.page_num, page.page_size] }),
    )?;
    if let Some(hit) = state.cache.get(&key) {
        return Ok(Json(hit));
    }
    let generation = state.cache.generation(NS_APPLICATIONS);

    let sort = sort_keys(query.sort.as_deref(), query.sort_type.as_deref(), &SORTABLE)?;
    let pipeline = build_pipeline(SegmentModule::Application, &query.criteria(), &principal, sort, Some(page))?;
    let (docs, total) = state.store.find_with_total(&pipeline).await?;
    let body = serde_json::to_value(paginate("/applications", page, docs, total, &query.link_params()))?;
    state.cache.insert(NS_APPLICATIONS, generation, key, body.clone());
    Ok(Json(body))
}

pub async fn get_application(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> AppResult<Response> {
    principal.require(Permission::ViewApplications)?;
    let doc = find_application(&state, &principal, &parse_id(&id)?).await?;
    Ok(data_response(StatusCode::OK, doc, "Get data."))
}

/// Partial update of course and fee. Paid applications keep their fee.
pub async fn update_application(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<Value>,
) -> AppResult<Response> {
    principal.require(Permission::ManageApplications)?;
    let id = parse_id(&id)?;
    let existing = find_application(&state, &principal, &id).await?;
    let fields = pick_fields(&body, &["course_name", "fee"])?;

    let mut patch = serde_json::Map::new();
    if let Some(course) = patch_text(&fields, "course_name")? {
        let course = require_text(course.as_deref().unwrap_or_default(), "course_name", 200)?;
        if Some(course.as_str()) != get_str(&existing, "course_name") {
            let duplicate = Filter::eq("college_id", principal.college()?)
                .and(Filter::eq("student_id", get_str(&existing, "student_id").unwrap_or_default()))
                .and(Filter::eq("course_name", course.as_str()))
                .and(Filter::id(&id).negate());
            if state.store.exists(Collection::Applications, duplicate).await? {
                return Err(AppError::validation("course_name", "Application already exists for this course"));
            }
        }
        patch.insert("course_name".into(), json!(course));
    }
    if let Some(fee) = fields.get("fee") {
        if get_str(&existing, "payment_status") == Some(PaymentStatus::Paid.as_str()) {
            return Err(AppError::validation("fee", "Fee cannot change after payment"));
        }
        let fee = fee.as_f64().ok_or_else(|| AppError::validation("fee", "fee must be a number"))?;
        let fee = validate_positive_number(fee, "fee")?;
        patch.insert("fee".into(), json!(fee));
        patch.insert("payable_fee".into(), json!(discounted(fee, existing.get("promocode"))));
    }

    state.store.update(Collection::Applications, &id, Value::Object(patch)).await?;
    invalidate_lead_views(&state);
    Ok(data_response(StatusCode::OK, reload(&state, &id).await?, "Application updated."))
}

/// Fee after the applied promocode's discount, rounded to paise.
pub fn discounted(fee: f64, promocode: Option<&Value>) -> f64 {
    let pct = promocode.and_then(|p| p.get("discount_percentage")).and_then(Value::as_f64).unwrap_or(0.0);
    ((fee * (100.0 - pct) / 100.0) * 100.0).round() / 100.0
}

pub async fn submit_application(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> AppResult<Response> {
    principal.require(Permission::ManageApplications)?;
    let id = parse_id(&id)?;
    let app = find_application(&state, &principal, &id).await?;
    if get_str(&app, "payment_status") != Some(PaymentStatus::Paid.as_str()) {
        return Err(AppError::validation("payment_status", "Application fee has not been paid"));
    }
    if get_str(&app, "stage") == Some(ApplicationStage::Submitted.as_str()) {
        return Err(AppError::validation("stage", "Application already submitted"));
    }

    state
        .store
        .update(Collection::Applications, &id, json!({ "stage": ApplicationStage::Submitted, "submitted_at": now_iso() }))
        .await?;
    if let Some(student_id) = get_str(&app, "student_id").and_then(|s| ObjectId::parse(s).ok()) {
        state
            .store
            .update(Collection::Students, &student_id, json!({ "application_stage": ApplicationStage::Submitted }))
            .await?;
    }
    invalidate_lead_views(&state);
    tracing::info!(application_id = %id, "application submitted");
    Ok(data_response(StatusCode::OK, reload(&state, &id).await?, "Application submitted."))
}

#[derive(Debug, Deserialize)]
pub struct PaymentRequest {
    pub amount: f64,
    pub reference: String,
}

/// Records an offline or gateway payment. The amount must cover the payable fee.
pub async fn record_payment(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<PaymentRequest>,
) -> AppResult<Response> {
    principal.require(Permission::ManageApplications)?;
    let id = parse_id(&id)?;
    let app = find_application(&state, &principal, &id).await?;
    let reference = require_text(&req.reference, "reference", 200)?;
    let amount = validate_positive_number(req.amount, "amount")?;
    if get_str(&app, "payment_status") == Some(PaymentStatus::Paid.as_str()) {
        return Err(AppError::validation("payment_status", "Application already paid"));
    }
    let payable = app.get("payable_fee").and_then(Value::as_f64).unwrap_or(0.0);
    if amount + f64::EPSILON < payable {
        return Err(AppError::validation("amount", format!("Amount must be at least {}", payable)));
    }

    // only the first writer flips unpaid -> paid
    let paid = state
        .store
        .update_many(
            Collection::Applications,
            Filter::id(&id).and(Filter::ne("payment_status", PaymentStatus::Paid.as_str())),
            json!({
                "payment_status": PaymentStatus::Paid,
                "payment": { "amount": amount, "reference": reference, "paid_at": now_iso(), "by": actor(&principal) },
            }),
        )
        .await?;
    if paid == 0 {
        return Err(AppError::validation("payment_status", "Application already paid"));
    }
    if let Some(student_id) = get_str(&app, "student_id").and_then(|s| ObjectId::parse(s).ok()) {
        state
            .store
            .update(Collection::Students, &student_id, json!({ "payment_status": PaymentStatus::Paid }))
            .await?;
    }
    invalidate_lead_views(&state);
    tracing::info!(application_id = %id, amount, "payment recorded");
    Ok(data_response(StatusCode::OK, reload(&state, &id).await?, "Payment recorded."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discount_applies_percentage() {
        assert_eq!(discounted(1000.0, None), 1000.0);
        assert_eq!(discounted(1000.0, Some(&json!({"discount_percentage": 15}))), 850.0);
        assert_eq!(discounted(999.99, Some(&json!({"discount_percentage": 33.3}))), 666.99);
    }

    #[test]
    fn list_query_maps_to_application_criteria() {
        let q = ApplicationListQuery {
            payment_status: Some(PaymentStatus::Unpaid),
            stage: Some(ApplicationStage::Submitted),
            course_name: Some("BSc".into()),
            ..Default::default()
        };
        let c = q.criteria();
        assert_eq!(c.payment_status, Some(PaymentStatus::Unpaid));
        assert_eq!(c.application_stage, Some(ApplicationStage::Submitted));
        assert_eq!(c.course_names, Some(vec!["BSc".to_string()]));
        assert_eq!(
            q.link_params(),
            vec![("payment_status", "unpaid".into()), ("stage", "submitted".into()), ("course_name", "BSc".into())]
        );
    }
}
