//! Response envelopes and request helpers shared by the resource routes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Map, Value};

use crate::error::{AppError, AppResult};
use crate::query::{SortDirection, SortKey};
use crate::types::{ObjectId, Principal};

/// `{"data": ..., "message": ...}` with the given status.
pub fn data_response(status: StatusCode, data: Value, message: &str) -> Response {
    (status, Json(json!({ "data": data, "message": message }))).into_response()
}

pub fn message_response(message: &str) -> Response {
    (StatusCode::OK, Json(json!({ "message": message }))).into_response()
}

pub fn parse_id(raw: &str) -> AppResult<ObjectId> {
    ObjectId::parse(raw)
}

/// Who performed an action, as recorded in timelines and `created_by` fields.
pub fn actor(principal: &Principal) -> String {
    match &principal.user_id {
        Some(id) => id.to_string(),
        None => principal.role.as_str().to_string(),
    }
}

/// Comma separated query value as a list, `None` when nothing is left after trimming.
pub fn split_list(raw: Option<&str>) -> Option<Vec<String>> {
    let items: Vec<String> =
        raw?.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect();
    (!items.is_empty()).then_some(items)
}

/// Sort from `sort`/`sort_type` query parameters, restricted to `allowed` fields.
/// Defaults to newest first.
pub fn sort_keys(sort: Option<&str>, sort_type: Option<&str>, allowed: &[&str]) -> AppResult<Vec<SortKey>> {
    let direction = match sort_type.map(str::trim) {
        None | Some("") | Some("desc") => SortDirection::Desc,
        Some("asc") => SortDirection::Asc,
        Some(other) => {
            return Err(AppError::validation("sort_type", format!("sort_type must be asc or desc, got '{}'", other)))
        }
    };
    let field = match sort.map(str::trim).filter(|s| !s.is_empty()) {
        None => "created_at",
        Some(f) if allowed.contains(&f) => f,
        Some(f) => return Err(AppError::validation("sort", format!("Cannot sort by '{}'", f))),
    };
    Ok(vec![SortKey { field: field.to_string(), direction }])
}

/// Keeps only the keys a client may change; `null` values remove the field.
pub fn pick_fields(body: &Value, allowed: &[&str]) -> AppResult<Map<String, Value>> {
    let Value::Object(map) = body else {
        return Err(AppError::validation("body", "Request body must be a JSON object"));
    };
    let mut out = Map::new();
    for (key, value) in map {
        if !allowed.contains(&key.as_str()) {
            return Err(AppError::validation(key, format!("Field '{}' cannot be updated", key)));
        }
        out.insert(key.clone(), value.clone());
    }
    if out.is_empty() {
        return Err(AppError::validation("body", "Nothing to update"));
    }
    Ok(out)
}

/// Optional string field of an update body: absent, null (clear) or trimmed text.
pub fn patch_text(patch: &Map<String, Value>, field: &str) -> AppResult<Option<Option<String>>> {
    match patch.get(field) {
        None => Ok(None),
        Some(Value::Null) => Ok(Some(None)),
        Some(Value::String(s)) => Ok(Some(Some(s.trim().to_string()))),
        Some(_) => Err(AppError::validation(field, format!("{} must be a string", field))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_defaults_to_newest_first() {
        assert_eq!(sort_keys(None, None, &[]).unwrap(), vec![SortKey::desc("created_at")]);
        assert_eq!(sort_keys(Some("name"), Some("asc"), &["name"]).unwrap(), vec![SortKey::asc("name")]);
        assert!(sort_keys(Some("token_hash"), None, &["name"]).is_err());
        assert!(sort_keys(None, Some("up"), &[]).is_err());
    }

    #[test]
    fn split_list_drops_blanks() {
        assert_eq!(split_list(Some("MH, KA,,")), Some(vec!["MH".to_string(), "KA".to_string()]));
        assert_eq!(split_list(Some(" , ")), None);
        assert_eq!(split_list(None), None);
    }

    #[test]
    fn pick_fields_rejects_unknown_keys() {
        let body = json!({"name": "x", "city": null});
        let picked = pick_fields(&body, &["name", "city"]).unwrap();
        assert_eq!(picked.len(), 2);
        assert!(pick_fields(&json!({"college_id": "c2"}), &["name"]).is_err());
        assert!(pick_fields(&json!({}), &["name"]).is_err());
        assert!(pick_fields(&json!([1]), &["name"]).is_err());
    }

    #[test]
    fn patch_text_distinguishes_clear_and_absent() {
        let patch = pick_fields(&json!({"city": null, "name": " A "}), &["city", "name"]).unwrap();
        assert_eq!(patch_text(&patch, "city").unwrap(), Some(None));
        assert_eq!(patch_text(&patch, "name").unwrap(), Some(Some("A".to_string())));
        assert_eq!(patch_text(&patch, "state_code").unwrap(), None);
    }
}
