use std::collections::HashMap;

use axum::{extract::State, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    cache::{cache_key, NS_DASHBOARD},
    db::Collection,
    error::AppResult,
    query::{Filter, Pipeline, SortKey},
    routes::students::cache_scope,
    segments::{build_filter, scope_filter, DateRange, SegmentCriteria, SegmentModule},
    state::AppState,
    store::Bucket,
    types::{ApplicationStage, PaymentStatus, Permission, Principal, QueryParams, Role},
};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DashboardQuery {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

impl DashboardQuery {
    fn criteria(&self) -> SegmentCriteria {
        let date_range = (self.start_date.is_some() || self.end_date.is_some())
            .then(|| DateRange { start: self.start_date.clone(), end: self.end_date.clone() });
        SegmentCriteria { date_range, ..Default::default() }
    }
}

fn bucket_counts(buckets: &[Bucket]) -> Value {
    let mut rows: Vec<Value> = buckets.iter().map(|b| json!({ "key": b.key, "count": b.count })).collect();
    rows.sort_by(|a, b| b["count"].as_i64().cmp(&a["count"].as_i64()));
    Value::Array(rows)
}

fn count_for(buckets: &[Bucket], key: &str) -> i64 {
    buckets.iter().filter(|b| b.key.as_str() == Some(key)).map(|b| b.count).sum()
}

/// Lead and application totals for the principal's scope, optionally limited to
/// records created in a date range.
pub async fn summary(
    State(state): State<AppState>,
    principal: Principal,
    QueryParams(query): QueryParams<DashboardQuery>,
) -> AppResult<impl IntoResponse> {
    principal.require(Permission::ViewDashboard)?;
    let key = cache_key(NS_DASHBOARD, &cache_scope(&principal)?, &json!({ "summary": &query }))?;
    if let Some(hit) = state.cache.get(&key) {
        return Ok(Json(hit));
    }
    let generation = state.cache.generation(NS_DASHBOARD);

    let criteria = query.criteria();
    let leads = scope_filter(SegmentModule::Lead, &principal)?.and(build_filter(SegmentModule::Lead, &criteria)?);
    let apps = scope_filter(SegmentModule::Application, &principal)?
        .and(build_filter(SegmentModule::Application, &criteria)?);

    let total_leads = state.store.count(Collection::Students, leads.clone()).await?;
    let by_stage = state
        .store
        .aggregate(&Pipeline::new(Collection::Students).matching(leads.clone()).group_by("lead_stage", None))
        .await?;
    let by_source = state
        .store
        .aggregate(&Pipeline::new(Collection::Students).matching(leads.clone()).group_by("lead_source", None))
        .await?;
    let by_payment = state
        .store
        .aggregate(
            &Pipeline::new(Collection::Applications).matching(apps.clone()).group_by("payment_status", Some("payable_fee")),
        )
        .await?;
    let submitted = state
        .store
        .count(Collection::Applications, apps.and(Filter::eq("stage", ApplicationStage::Submitted.as_str())))
        .await?;
    let verified = state.store.count(Collection::Students, leads.and(Filter::eq("is_verified", true))).await?;

    let paid = count_for(&by_payment, PaymentStatus::Paid.as_str());
    let total_apps: i64 = by_payment.iter().map(|b| b.count).sum();
    let collected: f64 =
        by_payment.iter().filter(|b| b.key.as_str() == Some(PaymentStatus::Paid.as_str())).map(|b| b.total).sum();

    let body = json!({
        "data": {
            "total_leads": total_leads,
            "leads_by_stage": bucket_counts(&by_stage),
            "leads_by_source": bucket_counts(&by_source),
            "applications": {
                "total": total_apps,
                "paid": paid,
                "unpaid": total_apps - paid,
                "submitted": submitted,
                "fee_collected": collected,
            },
            "verified_students": verified,
        },
        "message": "Get data.",
    });
    state.cache.insert(NS_DASHBOARD, generation, key, body.clone());
    Ok(Json(body))
}

/// Lead counts per counselor of the college, including counselors without leads.
pub async fn counselors(
    State(state): State<AppState>,
    principal: Principal,
    QueryParams(query): QueryParams<DashboardQuery>,
) -> AppResult<impl IntoResponse> {
    principal.require(Permission::ViewDashboard)?;
    let college = principal.college()?;
    let key = cache_key(NS_DASHBOARD, &cache_scope(&principal)?, &json!({ "counselors": &query }))?;
    if let Some(hit) = state.cache.get(&key) {
        return Ok(Json(hit));
    }
    let generation = state.cache.generation(NS_DASHBOARD);

    let leads = scope_filter(SegmentModule::Lead, &principal)?.and(build_filter(SegmentModule::Lead, &query.criteria())?);
    let buckets = state
        .store
        .aggregate(&Pipeline::new(Collection::Students).matching(leads).group_by("counselor_id", None))
        .await?;
    let mut counts: HashMap<String, i64> = HashMap::new();
    let mut unassigned = 0;
    for b in &buckets {
        match b.key.as_str() {
            Some(id) => *counts.entry(id.to_string()).or_default() += b.count,
            None => unassigned += b.count,
        }
    }

    let users = state
        .store
        .find(
            &Pipeline::new(Collection::Users)
                .matching(Filter::eq("college_id", college).and(Filter::eq("role", Role::Counselor.as_str())))
                .sort(vec![SortKey::asc("name")])
                .project(&["name", "email", "is_active"]),
        )
        .await?;
    let rows: Vec<Value> = users
        .iter()
        .map(|u| {
            let id = u["_id"].as_str().unwrap_or_default();
            json!({
                "counselor_id": id,
                "name": u["name"],
                "email": u["email"],
                "is_active": u["is_active"],
                "leads": counts.get(id).copied().unwrap_or(0),
            })
        })
        .collect();

    let body = json!({ "data": { "counselors": rows, "unassigned": unassigned }, "message": "Get data." });
    state.cache.insert(NS_DASHBOARD, generation, key, body.clone());
    Ok(Json(body))
}
