//! Data segment filter builder.
//!
//! A segment is a saved set of optional criteria. Each present criterion contributes
//! one clause to the filter; absent or empty ones contribute nothing. Lead segments
//! query student documents directly. Application segments query application
//! documents, whose copy of the lead fields lives under `student.`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::Collection;
use crate::error::{AppError, AppResult};
use crate::pagination::Page;
use crate::query::{Filter, Pipeline, SortKey};
use crate::store::get_str;
use crate::types::{parse_date, ApplicationStage, DayBound, DvStatus, ObjectId, PaymentStatus, Principal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentModule {
    Lead,
    Application,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SegmentType {
    /// Criteria are evaluated on every read.
    #[default]
    Dynamic,
    /// Members are fixed when the segment is saved.
    Static,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SegmentCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_codes: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counselor_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_stages: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_sources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_names: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<PaymentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_stage: Option<ApplicationStage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dv_status: Option<DvStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twelve_score: Option<ScoreRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

/// Where each criterion lives for a module.
struct FieldMap {
    state_code: &'static str,
    city: &'static str,
    counselor_id: &'static str,
    lead_stage: &'static str,
    lead_source: &'static str,
    course_name: &'static str,
    payment_status: &'static str,
    application_stage: &'static str,
    dv_status: &'static str,
    is_verified: &'static str,
    twelve_score: &'static str,
    search: [&'static str; 3],
}

const LEAD_FIELDS: FieldMap = FieldMap {
    state_code: "state_code",
    city: "city",
    counselor_id: "counselor_id",
    lead_stage: "lead_stage",
    lead_source: "lead_source",
    course_name: "course_name",
    payment_status: "payment_status",
    application_stage: "application_stage",
    dv_status: "dv_status",
    is_verified: "is_verified",
    twelve_score: "twelve_score",
    search: ["name", "email", "mobile"],
};

const APPLICATION_FIELDS: FieldMap = FieldMap {
    state_code: "student.state_code",
    city: "student.city",
    counselor_id: "student.counselor_id",
    lead_stage: "student.lead_stage",
    lead_source: "student.lead_source",
    course_name: "course_name",
    payment_status: "payment_status",
    application_stage: "stage",
    dv_status: "student.dv_status",
    is_verified: "student.is_verified",
    twelve_score: "student.twelve_score",
    search: ["student.name", "student.email", "student.mobile"],
};

impl SegmentModule {
    pub fn collection(&self) -> Collection {
        match self {
            SegmentModule::Lead => Collection::Students,
            SegmentModule::Application => Collection::Applications,
        }
    }

    fn fields(&self) -> &'static FieldMap {
        match self {
            SegmentModule::Lead => &LEAD_FIELDS,
            SegmentModule::Application => &APPLICATION_FIELDS,
        }
    }

    /// Field holding the owning counselor on this module's documents.
    pub fn counselor_field(&self) -> &'static str {
        self.fields().counselor_id
    }
}

fn list_clause(field: &str, values: &Option<Vec<String>>) -> Option<Filter> {
    let values: Vec<&str> = values
        .as_deref()?
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .collect();
    match values.len() {
        0 => None,
        1 => Some(Filter::eq(field, values[0])),
        _ => Some(Filter::is_in(field, values)),
    }
}

fn date_clauses(range: &DateRange) -> AppResult<Vec<Filter>> {
    let start = match range.start.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => Some(parse_date(s, "date_range.start", DayBound::Start)?),
        None => None,
    };
    let end = match range.end.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => Some(parse_date(s, "date_range.end", DayBound::End)?),
        None => None,
    };
    if let (Some(s), Some(e)) = (&start, &end) {
        if s > e {
            return Err(AppError::validation("date_range", "start must not be after end"));
        }
    }
    let mut clauses = Vec::new();
    if let Some(s) = start {
        clauses.push(Filter::gte("created_at", s));
    }
    if let Some(e) = end {
        clauses.push(Filter::lte("created_at", e));
    }
    Ok(clauses)
}

/// Translates criteria into a filter over the module's collection.
pub fn build_filter(module: SegmentModule, criteria: &SegmentCriteria) -> AppResult<Filter> {
    let f = module.fields();
    let mut clauses: Vec<Filter> = [
        list_clause(f.state_code, &criteria.state_codes),
        list_clause(f.city, &criteria.cities),
        list_clause(f.counselor_id, &criteria.counselor_ids),
        list_clause(f.lead_stage, &criteria.lead_stages),
        list_clause(f.lead_source, &criteria.lead_sources),
        list_clause(f.course_name, &criteria.course_names),
    ]
    .into_iter()
    .flatten()
    .collect();

    match criteria.payment_status {
        Some(PaymentStatus::Paid) => clauses.push(Filter::eq(f.payment_status, "paid")),
        // unpaid includes records that never recorded a payment
        Some(PaymentStatus::Unpaid) => clauses.push(Filter::ne(f.payment_status, "paid")),
        None => {}
    }
    match criteria.application_stage {
        Some(ApplicationStage::Submitted) => clauses.push(Filter::eq(f.application_stage, "submitted")),
        Some(ApplicationStage::Initiated) => clauses.push(Filter::ne(f.application_stage, "submitted")),
        None => {}
    }
    if let Some(status) = criteria.dv_status {
        clauses.push(Filter::eq(f.dv_status, status.as_str()));
    }
    if let Some(range) = &criteria.date_range {
        clauses.extend(date_clauses(range)?);
    }
    if let Some(verified) = criteria.is_verified {
        clauses.push(if verified {
            Filter::eq(f.is_verified, true)
        } else {
            Filter::ne(f.is_verified, true)
        });
    }
    if let Some(score) = &criteria.twelve_score {
        if let (Some(min), Some(max)) = (score.min, score.max) {
            if min > max {
                return Err(AppError::validation("twelve_score", "min must not exceed max"));
            }
        }
        if let Some(min) = score.min {
            clauses.push(Filter::gte(f.twelve_score, min));
        }
        if let Some(max) = score.max {
            clauses.push(Filter::lte(f.twelve_score, max));
        }
    }
    if let Some(term) = criteria.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        clauses.push(Filter::search(&f.search, term));
    }

    Ok(Filter::all_of(clauses))
}

/// Restricts a module's documents to what the principal may see: their college, and
/// for counselors only their own leads.
pub fn scope_filter(module: SegmentModule, principal: &Principal) -> AppResult<Filter> {
    let mut scope = Filter::eq("college_id", principal.college()?);
    if principal.is_counselor() {
        let own = principal.user_id.as_ref().map(|id| id.to_string()).unwrap_or_default();
        scope = scope.and(Filter::eq(module.counselor_field(), own));
    }
    Ok(scope)
}

/// Full listing pipeline for the criteria: scope, criteria, sort, then the page window.
pub fn build_pipeline(
    module: SegmentModule,
    criteria: &SegmentCriteria,
    principal: &Principal,
    sort: Vec<SortKey>,
    page: Option<Page>,
) -> AppResult<Pipeline> {
    let mut pipeline = Pipeline::new(module.collection())
        .matching(scope_filter(module, principal)?)
        .matching(build_filter(module, criteria)?)
        .sort(if sort.is_empty() { vec![SortKey::desc("created_at")] } else { sort });
    if let Some(page) = page {
        pipeline = pipeline.skip(page.skip).limit(page.page_size);
    }
    Ok(pipeline)
}

/// Membership filter of a stored segment document.
pub fn member_filter(segment: &Value) -> AppResult<(SegmentModule, Filter)> {
    let module: SegmentModule = serde_json::from_value(segment.get("module").cloned().unwrap_or(Value::Null))
        .map_err(|_| AppError::Internal(anyhow::anyhow!("segment with invalid module")))?;
    let segment_type: SegmentType =
        serde_json::from_value(segment.get("segment_type").cloned().unwrap_or(Value::Null)).unwrap_or_default();

    let filter = match segment_type {
        SegmentType::Static => {
            let ids: Vec<String> = segment
                .get("frozen_ids")
                .and_then(Value::as_array)
                .map(|ids| ids.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            Filter::is_in("_id", ids)
        }
        SegmentType::Dynamic => {
            let criteria: SegmentCriteria =
                serde_json::from_value(segment.get("criteria").cloned().unwrap_or_else(|| Value::Object(Default::default())))
                    .map_err(|e| AppError::Internal(anyhow::anyhow!("stored segment criteria unreadable: {}", e)))?;
            build_filter(module, &criteria)?
        }
    };
    Ok((module, filter))
}

/// Student id of a member document.
pub fn member_student_id(module: SegmentModule, doc: &Value) -> Option<ObjectId> {
    let raw = match module {
        SegmentModule::Lead => get_str(doc, "_id"),
        SegmentModule::Application => get_str(doc, "student_id"),
    }?;
    ObjectId::parse(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use serde_json::json;

    fn admin() -> Principal {
        Principal { user_id: Some(ObjectId::new()), name: "a".into(), role: Role::CollegeAdmin, college_id: Some("c1".into()) }
    }

    #[test]
    fn empty_criteria_match_everything() {
        let criteria = SegmentCriteria { cities: Some(vec![" ".into()]), search: Some("".into()), ..Default::default() };
        assert_eq!(build_filter(SegmentModule::Lead, &criteria).unwrap(), Filter::All);
    }

    #[test]
    fn each_present_key_adds_one_clause() {
        let criteria = SegmentCriteria {
            state_codes: Some(vec!["MH".into(), "KA".into()]),
            cities: Some(vec!["Pune".into()]),
            payment_status: Some(PaymentStatus::Unpaid),
            ..Default::default()
        };
        let f = build_filter(SegmentModule::Lead, &criteria).unwrap();
        assert_eq!(
            f,
            Filter::And(vec![
                Filter::is_in("state_code", ["MH", "KA"]),
                Filter::eq("city", "Pune"),
                Filter::ne("payment_status", "paid"),
            ])
        );
    }

    #[test]
    fn application_module_uses_student_prefix() {
        let criteria = SegmentCriteria {
            cities: Some(vec!["Pune".into()]),
            application_stage: Some(ApplicationStage::Submitted),
            ..Default::default()
        };
        let f = build_filter(SegmentModule::Application, &criteria).unwrap();
        assert_eq!(f, Filter::And(vec![Filter::eq("student.city", "Pune"), Filter::eq("stage", "submitted")]));
    }

    #[test]
    fn date_range_is_inclusive_and_ordered() {
        let criteria = SegmentCriteria {
            date_range: Some(DateRange { start: Some("2024-01-01".into()), end: Some("2024-01-31".into()) }),
            ..Default::default()
        };
        let f = build_filter(SegmentModule::Lead, &criteria).unwrap();
        assert_eq!(
            f,
            Filter::And(vec![
                Filter::gte("created_at", "2024-01-01T00:00:00.000Z"),
                Filter::lte("created_at", "2024-01-31T23:59:59.999Z"),
            ])
        );

        let reversed = SegmentCriteria {
            date_range: Some(DateRange { start: Some("2024-02-01".into()), end: Some("2024-01-01".into()) }),
            ..Default::default()
        };
        assert!(matches!(
            build_filter(SegmentModule::Lead, &reversed),
            Err(AppError::ValidationError { .. })
        ));
    }

    #[test]
    fn unknown_criteria_keys_are_rejected() {
        let parsed: Result<SegmentCriteria, _> = serde_json::from_value(json!({"colour": "red"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn counselor_pipeline_is_scoped_to_own_leads() {
        let mut counselor = admin();
        counselor.role = Role::Counselor;
        let own = counselor.user_id.clone().unwrap().to_string();
        let plan = build_pipeline(SegmentModule::Application, &SegmentCriteria::default(), &counselor, vec![], None)
            .unwrap()
            .plan()
            .unwrap();
        assert_eq!(
            plan.filter,
            Filter::And(vec![Filter::eq("college_id", "c1"), Filter::eq("student.counselor_id", own)])
        );
        assert_eq!(plan.sort, vec![SortKey::desc("created_at")]);
    }

    #[test]
    fn static_segment_members_are_frozen_ids() {
        let segment = json!({"module": "lead", "segment_type": "static", "frozen_ids": ["a", "b"]});
        let (module, filter) = member_filter(&segment).unwrap();
        assert_eq!(module, SegmentModule::Lead);
        assert_eq!(filter, Filter::is_in("_id", ["a", "b"]));
    }
}
