//! Lead validation and creation shared by the students routes and the bulk upload job.

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::db::Collection;
use crate::error::validation::{require_text, validate_email, validate_mobile};
use crate::error::{AppError, AppResult};
use crate::query::Filter;
use crate::store::{get_str, DocumentStore};
use crate::types::{now_iso, ObjectId, Role};

pub const INITIAL_LEAD_STAGE: &str = "fresh";
const DEFAULT_LEAD_SOURCE: &str = "manual";

/// Lead fields copied onto each application as `student`.
const SNAPSHOT_FIELDS: [&str; 11] = [
    "name",
    "email",
    "mobile",
    "state_code",
    "city",
    "counselor_id",
    "lead_stage",
    "lead_source",
    "twelve_score",
    "dv_status",
    "is_verified",
];

#[derive(Debug, Clone, Deserialize)]
pub struct LeadInput {
    pub name: String,
    pub email: String,
    pub mobile: String,
    pub state_code: Option<String>,
    pub city: Option<String>,
    pub course_name: Option<String>,
    pub lead_source: Option<String>,
    pub twelve_score: Option<f64>,
    pub counselor_id: Option<String>,
}

/// A lead that passed field validation, not yet checked against stored data.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidLead {
    pub name: String,
    pub email: String,
    pub mobile: String,
    pub state_code: Option<String>,
    pub city: Option<String>,
    pub course_name: Option<String>,
    pub lead_source: String,
    pub twelve_score: Option<f64>,
    pub counselor_id: Option<ObjectId>,
}

fn optional_text(value: &Option<String>, field: &str, max_len: usize) -> AppResult<Option<String>> {
    match value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => Ok(Some(require_text(v, field, max_len)?)),
        None => Ok(None),
    }
}

pub fn validate_score(score: Option<f64>) -> AppResult<Option<f64>> {
    match score {
        Some(s) if !(0.0..=100.0).contains(&s) || s.is_nan() => {
            Err(AppError::validation("twelve_score", "twelve_score must be between 0 and 100"))
        }
        other => Ok(other),
    }
}

impl LeadInput {
    pub fn validate(&self) -> AppResult<ValidLead> {
        Ok(ValidLead {
            name: require_text(&self.name, "name", 200)?,
            email: validate_email(&self.email)?,
            mobile: validate_mobile(&self.mobile)?,
            state_code: optional_text(&self.state_code, "state_code", 8)?.map(|s| s.to_uppercase()),
            city: optional_text(&self.city, "city", 100)?,
            course_name: optional_text(&self.course_name, "course_name", 200)?,
            lead_source: optional_text(&self.lead_source, "lead_source", 100)?
                .unwrap_or_else(|| DEFAULT_LEAD_SOURCE.to_string()),
            twelve_score: validate_score(self.twelve_score)?,
            counselor_id: match self.counselor_id.as_deref().filter(|c| !c.trim().is_empty()) {
                Some(raw) => Some(ObjectId::parse(raw)?),
                None => None,
            },
        })
    }
}

/// Fails unless `counselor_id` names a counselor user of the college.
pub async fn ensure_counselor(store: &DocumentStore, college_id: &str, counselor_id: &ObjectId) -> AppResult<()> {
    let filter = Filter::id(counselor_id)
        .and(Filter::eq("college_id", college_id))
        .and(Filter::eq("role", Role::Counselor.as_str()));
    if store.exists(Collection::Users, filter).await? {
        Ok(())
    } else {
        Err(AppError::validation("counselor_id", "Counselor not found in this college"))
    }
}

/// Email and mobile must be unique among the college's leads. `except` skips the lead
/// being updated.
pub async fn ensure_unique_contact(
    store: &DocumentStore,
    college_id: &str,
    email: Option<&str>,
    mobile: Option<&str>,
    except: Option<&ObjectId>,
) -> AppResult<()> {
    let scope = |f: Filter| {
        let f = Filter::eq("college_id", college_id).and(f);
        match except {
            Some(id) => f.and(Filter::id(id).negate()),
            None => f,
        }
    };
    if let Some(email) = email {
        if store.exists(Collection::Students, scope(Filter::eq("email", email))).await? {
            return Err(AppError::validation("email", "Email already exists"));
        }
    }
    if let Some(mobile) = mobile {
        if store.exists(Collection::Students, scope(Filter::eq("mobile", mobile))).await? {
            return Err(AppError::validation("mobile", "Mobile number already exists"));
        }
    }
    Ok(())
}

/// Checks the lead against stored data and inserts it. Returns the stored document.
pub async fn create_lead(store: &DocumentStore, college_id: &str, lead: ValidLead, actor: &str) -> AppResult<Value> {
    if let Some(counselor) = &lead.counselor_id {
        ensure_counselor(store, college_id, counselor).await?;
    }
    ensure_unique_contact(store, college_id, Some(&lead.email), Some(&lead.mobile), None).await?;

    let now = now_iso();
    let doc = json!({
        "name": lead.name,
        "email": lead.email,
        "mobile": lead.mobile,
        "state_code": lead.state_code,
        "city": lead.city,
        "course_name": lead.course_name,
        "lead_source": lead.lead_source,
        "twelve_score": lead.twelve_score,
        "counselor_id": lead.counselor_id.map(|c| c.to_string()),
        "college_id": college_id,
        "lead_stage": INITIAL_LEAD_STAGE,
        "payment_status": "unpaid",
        "is_verified": false,
        "documents": {},
        "scholarships": [],
        "timeline": [{"event": "created", "lead_stage": INITIAL_LEAD_STAGE, "by": actor, "at": now}],
    });
    store.insert(Collection::Students, doc).await
}

/// Tracks emails and mobiles already seen within one upload batch.
#[derive(Default)]
pub struct BatchDedup {
    emails: HashSet<String>,
    mobiles: HashSet<String>,
}

impl BatchDedup {
    pub fn check(&mut self, lead: &ValidLead) -> AppResult<()> {
        if self.emails.contains(&lead.email) {
            return Err(AppError::validation("email", "Email repeated in upload"));
        }
        if self.mobiles.contains(&lead.mobile) {
            return Err(AppError::validation("mobile", "Mobile number repeated in upload"));
        }
        self.emails.insert(lead.email.clone());
        self.mobiles.insert(lead.mobile.clone());
        Ok(())
    }
}

/// The lead fields embedded in application documents.
pub fn student_snapshot(student: &Value) -> Value {
    let mut snapshot = serde_json::Map::new();
    for field in SNAPSHOT_FIELDS {
        snapshot.insert(field.to_string(), student.get(field).cloned().unwrap_or(Value::Null));
    }
    Value::Object(snapshot)
}

/// Refreshes the embedded snapshot on every application of the student.
pub async fn sync_applications(store: &DocumentStore, student: &Value) -> AppResult<u64> {
    let Some(student_id) = get_str(student, "_id") else {
        return Ok(0);
    };
    store
        .update_many(
            Collection::Applications,
            Filter::eq("student_id", student_id),
            json!({ "student": student_snapshot(student) }),
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> LeadInput {
        LeadInput {
            name: " Asha ".into(),
            email: "Asha@Example.com".into(),
            mobile: "9876543210".into(),
            state_code: Some("mh".into()),
            city: Some("  ".into()),
            course_name: None,
            lead_source: None,
            twelve_score: Some(91.0),
            counselor_id: None,
        }
    }

    #[test]
    fn validate_normalises_fields() {
        let lead = input().validate().unwrap();
        assert_eq!(lead.name, "Asha");
        assert_eq!(lead.email, "asha@example.com");
        assert_eq!(lead.state_code.as_deref(), Some("MH"));
        assert_eq!(lead.city, None);
        assert_eq!(lead.lead_source, "manual");
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut bad = input();
        bad.twelve_score = Some(101.0);
        assert!(bad.validate().is_err());

        let mut bad = input();
        bad.counselor_id = Some("nope".into());
        assert!(matches!(bad.validate(), Err(AppError::InvalidObjectId(_))));

        let mut bad = input();
        bad.mobile = "12345".into();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn batch_dedup_flags_repeats() {
        let mut seen = BatchDedup::default();
        let lead = input().validate().unwrap();
        seen.check(&lead).unwrap();
        assert!(seen.check(&lead).is_err());
    }

    #[test]
    fn snapshot_keeps_listed_fields_only() {
        let student = json!({"_id": "x", "name": "A", "city": "Pune", "documents": {}});
        let snap = student_snapshot(&student);
        assert_eq!(snap["name"], "A");
        assert_eq!(snap["city"], "Pune");
        assert_eq!(snap["email"], Value::Null);
        assert!(snap.get("documents").is_none());
    }
}
