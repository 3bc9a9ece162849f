//! Promocodes: percentage discounts with a usage cap and a validity window.

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
        validation::{require_text, validate_count},
        AppError, AppResult, OptionExt,
    },
    pagination::{paginate, PageParams},
    query::{Filter, Pipeline},
    routes::applications::{discounted, find_application},
    routes::common::{actor, data_response, message_response, parse_id, pick_fields, sort_keys},
    routes::students::invalidate_lead_views,
    state::AppState,
    store::{doc_id, get_str},
    types::{now_iso, parse_date, DayBound, JsonBody, ObjectId, PaymentStatus, Permission, Principal, QueryParams},
};

#[derive(Debug, Deserialize)]
pub struct CreateVoucherRequest {
    pub code: String,
    pub discount_percentage: f64,
    pub max_uses: u64,
    pub start_date: String,
    pub end_date: String,
}

#[derive(Debug, Deserialize)]
pub struct ApplyVoucherRequest {
    pub code: String,
    pub application_id: String,
}

/// Codes are stored upper-cased; letters, digits, `-` and `_` only.
pub fn normalize_code(raw: &str) -> AppResult<String> {
    let code = require_text(raw, "code", 32)?.to_uppercase();
    if !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(AppError::validation("code", "code may only contain letters, digits, '-' and '_'"));
    }
    Ok(code)
}

fn validate_discount(pct: f64) -> AppResult<f64> {
    if !pct.is_finite() || pct <= 0.0 || pct > 100.0 {
        return Err(AppError::validation(
            "discount_percentage",
            "discount_percentage must be greater than 0 and at most 100",
        ));
    }
    Ok(pct)
}

/// Start resolves to the beginning of its day, end to the end of its day.
fn validity_window(start: &str, end: &str) -> AppResult<(String, String)> {
    let start = parse_date(start, "start_date", DayBound::Start)?;
    let end = parse_date(end, "end_date", DayBound::End)?;
    if start > end {
        return Err(AppError::validation("end_date", "end_date must not be before start_date"));
    }
    Ok((start, end))
}

/// Whether `now` falls inside the voucher's window. Stored timestamps share one
/// fixed-width format, so string comparison is chronological.
pub fn is_within_window(voucher: &Value, now: &str) -> bool {
    match (get_str(voucher, "start_date"), get_str(voucher, "end_date")) {
        (Some(start), Some(end)) => start <= now && now <= end,
        _ => false,
    }
}

fn college_scope(principal: &Principal) -> AppResult<Filter> {
    Ok(Filter::eq("college_id", principal.college()?))
}

async fn find_voucher(state: &AppState, principal: &Principal, id: &ObjectId) -> AppResult<Value> {
    state
        .store
        .find_scoped(Collection::Vouchers, id, college_scope(principal)?)
        .await?
        .ok_or_not_found("Promocode")
}

pub async fn create_voucher(
    State(state): State<AppState>,
    principal: Principal,
    JsonBody(req): JsonBody<CreateVoucherRequest>,
) -> AppResult<Response> {
    principal.require(Permission::ManageVouchers)?;
    let college = principal.college()?;
    let code = normalize_code(&req.code)?;
    let discount = validate_discount(req.discount_percentage)?;
    let max_uses = validate_count(req.max_uses, "max_uses")?;
    let (start, end) = validity_window(&req.start_date, &req.end_date)?;

    let taken = Filter::eq("college_id", college).and(Filter::eq("code", code.as_str()));
    if state.store.exists(Collection::Vouchers, taken).await? {
        return Err(AppError::validation("code", "Promocode already exists"));
    }
    let doc = state
        .store
        .insert(
            Collection::Vouchers,
            json!({
                "code": code,
                "discount_percentage": discount,
                "max_uses": max_uses,
                "used_count": 0,
                "start_date": start,
                "end_date": end,
                "college_id": college,
                "created_by": actor(&principal),
            }),
        )
        .await?;
    tracing::info!(code = %code, max_uses, "promocode created");
    Ok(data_response(StatusCode::CREATED, doc, "Promocode created."))
}

pub async fn list_vouchers(
    State(state): State<AppState>,
    principal: Principal,
    QueryParams(page): QueryParams<PageParams>,
) -> AppResult<impl IntoResponse> {
    principal.require(Permission::ManageVouchers)?;
    let page = page.resolve(&state.config.pagination)?;
    let pipeline = Pipeline::new(Collection::Vouchers)
        .matching(college_scope(&principal)?)
        .sort(sort_keys(None, None, &[])?)
        .skip(page.skip)
        .limit(page.page_size);
    let (docs, total) = state.store.find_with_total(&pipeline).await?;
    Ok(Json(paginate("/promocodes", page, docs, total, &[])))
}

pub async fn get_voucher(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> AppResult<Response> {
    principal.require(Permission::ManageVouchers)?;
    let doc = find_voucher(&state, &principal, &parse_id(&id)?).await?;
    Ok(data_response(StatusCode::OK, doc, "Get data."))
}

/// Partial update. The code itself is immutable once issued.
pub async fn update_voucher(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<Value>,
) -> AppResult<Response> {
    principal.require(Permission::ManageVouchers)?;
    let id = parse_id(&id)?;
    let existing = find_voucher(&state, &principal, &id).await?;
    let fields = pick_fields(&body, &["discount_percentage", "max_uses", "start_date", "end_date"])?;
    let mut patch = Map::new();

    if let Some(v) = fields.get("discount_percentage") {
        let pct = v.as_f64().ok_or_else(|| AppError::validation("discount_percentage", "must be a number"))?;
        patch.insert("discount_percentage".into(), json!(validate_discount(pct)?));
    }
    if let Some(v) = fields.get("max_uses") {
        let max_uses = validate_count(
            v.as_u64().ok_or_else(|| AppError::validation("max_uses", "max_uses must be a whole number"))?,
            "max_uses",
        )?;
        let used = existing.get("used_count").and_then(Value::as_u64).unwrap_or(0);
        if max_uses < used {
            return Err(AppError::validation("max_uses", format!("Promocode was already used {} times", used)));
        }
        patch.insert("max_uses".into(), json!(max_uses));
    }
    if fields.contains_key("start_date") || fields.contains_key("end_date") {
        let date = |field: &str| -> AppResult<String> {
            match fields.get(field) {
                Some(Value::String(s)) => Ok(s.clone()),
                Some(_) => Err(AppError::validation(field, format!("{} must be a date string", field))),
                None => Ok(get_str(&existing, field).unwrap_or_default().to_string()),
            }
        };
        let (start, end) = validity_window(&date("start_date")?, &date("end_date")?)?;
        patch.insert("start_date".into(), json!(start));
        patch.insert("end_date".into(), json!(end));
    }

    state.store.update(Collection::Vouchers, &id, Value::Object(patch)).await?;
    let doc = state.store.find_by_id(Collection::Vouchers, &id).await?.ok_or_not_found("Promocode")?;
    Ok(data_response(StatusCode::OK, doc, "Promocode updated."))
}

pub async fn delete_voucher(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> AppResult<Response> {
    principal.require(Permission::ManageVouchers)?;
    let id = parse_id(&id)?;
    find_voucher(&state, &principal, &id).await?;
    state.store.delete(Collection::Vouchers, &id).await?;
    Ok(message_response("Promocode deleted."))
}

/// Applies a promocode to an unpaid application.
///
/// The application is claimed first (guarded on having no code and being unpaid),
/// then a use is taken from the voucher with a guarded increment. If the voucher is
/// exhausted the claim is released again.
pub async fn apply_voucher(
    State(state): State<AppState>,
    principal: Principal,
    JsonBody(req): JsonBody<ApplyVoucherRequest>,
) -> AppResult<Response> {
    principal.require(Permission::ManageApplications)?;
    let college = principal.college()?;
    let code = normalize_code(&req.code)?;
    let app_id = parse_id(&req.application_id)?;
    let application = find_application(&state, &principal, &app_id).await?;

    let voucher = state
        .store
        .find_one(Collection::Vouchers, Filter::eq("college_id", college).and(Filter::eq("code", code.as_str())))
        .await?
        .ok_or_not_found("Promocode")?;
    if !is_within_window(&voucher, &now_iso()) {
        return Err(AppError::validation("code", "Promocode is not valid at this time"));
    }
    if get_str(&application, "payment_status") == Some(PaymentStatus::Paid.as_str()) {
        return Err(AppError::validation("application_id", "Application is already paid"));
    }
    if application.get("promocode").is_some_and(|p| !p.is_null()) {
        return Err(AppError::validation("application_id", "A promocode is already applied"));
    }

    let fee = application.get("fee").and_then(Value::as_f64).unwrap_or(0.0);
    let applied = json!({
        "code": code,
        "voucher_id": voucher["_id"],
        "discount_percentage": voucher["discount_percentage"],
        "applied_at": now_iso(),
    });
    let claim = Filter::id(&app_id)
        .and(Filter::eq("promocode", Value::Null))
        .and(Filter::ne("payment_status", PaymentStatus::Paid.as_str()));
    let claimed = state
        .store
        .update_many(
            Collection::Applications,
            claim,
            json!({ "promocode": applied, "payable_fee": discounted(fee, Some(&applied)) }),
        )
        .await?;
    if claimed == 0 {
        return Err(AppError::validation("application_id", "A promocode is already applied"));
    }

    let voucher_id = doc_id(&voucher)?;
    let used = state
        .store
        .increment_bounded(Collection::Vouchers, Filter::id(&voucher_id), "used_count", "max_uses")
        .await?;
    if used == 0 {
        state
            .store
            .update(Collection::Applications, &app_id, json!({ "promocode": null, "payable_fee": fee }))
            .await?;
        return Err(AppError::validation("code", "Promocode usage limit reached"));
    }

    invalidate_lead_views(&state);
    tracing::info!(code = %code, application_id = %app_id, "promocode applied");
    let doc = state.store.find_by_id(Collection::Applications, &app_id).await?.ok_or_not_found("Application")?;
    Ok(data_response(StatusCode::OK, doc, "Promocode applied."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_uppercased_and_restricted() {
        assert_eq!(normalize_code(" welcome-10 ").unwrap(), "WELCOME-10");
        assert!(normalize_code("50% OFF").is_err());
        assert!(normalize_code("").is_err());
    }

    #[test]
    fn window_covers_whole_days() {
        let (start, end) = validity_window("2024-06-01", "2024-06-30").unwrap();
        let voucher = json!({ "start_date": start, "end_date": end });
        assert!(is_within_window(&voucher, "2024-06-30T23:00:00.000Z"));
        assert!(!is_within_window(&voucher, "2024-07-01T00:00:00.000Z"));
        assert!(!is_within_window(&json!({}), "2024-06-15T00:00:00.000Z"));
        assert!(validity_window("2024-06-30", "2024-06-01").is_err());
    }

    #[test]
    fn discount_bounds() {
        assert!(validate_discount(0.0).is_err());
        assert!(validate_discount(100.0).is_ok());
        assert!(validate_discount(f64::NAN).is_err());
    }
}
