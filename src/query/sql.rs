//! Compilation of [`Filter`]s and [`Plan`]s to SQLite over the `documents` table.
//!
//! Every value is bound as a parameter. JSON paths are validated by [`json_path`]
//! (identifier characters only) and inlined as literals so that expression indexes on
//! `json_extract(body, '$.field')` apply.

use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite};

use super::{json_path, Filter, Plan, QueryError, SortDirection};

pub const LIKE_ESCAPE: char = '!';

/// Escapes LIKE wildcards so user input only ever matches literally.
pub fn escape_like_pattern(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | LIKE_ESCAPE) {
            out.push(LIKE_ESCAPE);
        }
        out.push(ch);
    }
    out
}

/// Scalar value as bound to SQLite. Booleans are stored by `json_extract` as 1/0.
#[derive(Debug, Clone, PartialEq)]
enum SqlValue {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
}

fn to_sql_value(field: &str, value: &Value) -> Result<SqlValue, QueryError> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Bool(b) => Ok(SqlValue::Int(i64::from(*b))),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(SqlValue::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(SqlValue::Real(f))
            } else {
                Err(QueryError::UnsupportedValue { field: field.to_string(), reason: "number out of range" })
            }
        }
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        Value::Array(_) | Value::Object(_) => Err(QueryError::UnsupportedValue {
            field: field.to_string(),
            reason: "only scalar values can be compared",
        }),
    }
}

fn push_value(qb: &mut QueryBuilder<'_, Sqlite>, value: SqlValue) {
    match value {
        SqlValue::Null => qb.push("NULL"),
        SqlValue::Int(i) => qb.push_bind(i),
        SqlValue::Real(f) => qb.push_bind(f),
        SqlValue::Text(s) => qb.push_bind(s),
    };
}

/// Pushes the SQL expression reading `field` from the current row.
pub fn push_field(qb: &mut QueryBuilder<'_, Sqlite>, field: &str) -> Result<(), QueryError> {
    if field == "_id" {
        qb.push("documents.id");
        return Ok(());
    }
    qb.push("json_extract(documents.body, ").push(quoted_path(field)?).push(")");
    Ok(())
}

/// Validated JSON path as an SQL string literal.
fn quoted_path(field: &str) -> Result<String, QueryError> {
    Ok(format!("'{}'", json_path(field)?))
}

fn push_comparison(
    qb: &mut QueryBuilder<'_, Sqlite>,
    field: &str,
    op: &str,
    value: &Value,
) -> Result<(), QueryError> {
    let v = to_sql_value(field, value)?;
    if v == SqlValue::Null {
        // Ordering against null never matches
        qb.push("0");
        return Ok(());
    }
    push_field(qb, field)?;
    qb.push(op);
    push_value(qb, v);
    Ok(())
}

/// Splits a value list into its non-null members and whether null was present.
fn split_nulls(field: &str, values: &[Value]) -> Result<(Vec<SqlValue>, bool), QueryError> {
    let mut out = Vec::with_capacity(values.len());
    let mut has_null = false;
    for v in values {
        match to_sql_value(field, v)? {
            SqlValue::Null => has_null = true,
            other => out.push(other),
        }
    }
    Ok((out, has_null))
}

fn push_value_list(qb: &mut QueryBuilder<'_, Sqlite>, values: Vec<SqlValue>) {
    qb.push("(");
    for (i, v) in values.into_iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        push_value(qb, v);
    }
    qb.push(")");
}

/// Appends a boolean SQL expression equivalent to `filter`.
pub fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &Filter) -> Result<(), QueryError> {
    match filter {
        Filter::All => {
            qb.push("1");
        }
        Filter::Nothing => {
            qb.push("0");
        }
        Filter::Eq(field, value) => match to_sql_value(field, value)? {
            SqlValue::Null => {
                qb.push("(");
                push_field(qb, field)?;
                qb.push(" IS NULL)");
            }
            v => {
                push_field(qb, field)?;
                qb.push(" = ");
                push_value(qb, v);
            }
        },
        Filter::Ne(field, value) => match to_sql_value(field, value)? {
            SqlValue::Null => {
                qb.push("(");
                push_field(qb, field)?;
                qb.push(" IS NOT NULL)");
            }
            v => {
                qb.push("(");
                push_field(qb, field)?;
                qb.push(" IS NULL OR ");
                push_field(qb, field)?;
                qb.push(" <> ");
                push_value(qb, v);
                qb.push(")");
            }
        },
        Filter::In(field, values) => {
            let (values, has_null) = split_nulls(field, values)?;
            if values.is_empty() && !has_null {
                qb.push("0");
                return Ok(());
            }
            qb.push("(");
            if !values.is_empty() {
                push_field(qb, field)?;
                qb.push(" IN ");
                push_value_list(qb, values.clone());
            }
            if has_null {
                if !values.is_empty() {
                    qb.push(" OR ");
                }
                push_field(qb, field)?;
                qb.push(" IS NULL");
            }
            qb.push(")");
        }
        Filter::NotIn(field, values) => {
            let (values, has_null) = split_nulls(field, values)?;
            if values.is_empty() && !has_null {
                qb.push("1");
                return Ok(());
            }
            qb.push("(");
            if has_null {
                push_field(qb, field)?;
                qb.push(" IS NOT NULL");
            } else {
                push_field(qb, field)?;
                qb.push(" IS NULL");
            }
            if !values.is_empty() {
                qb.push(if has_null { " AND " } else { " OR " });
                push_field(qb, field)?;
                qb.push(" NOT IN ");
                push_value_list(qb, values);
            }
            qb.push(")");
        }
        Filter::Gt(field, value) => push_comparison(qb, field, " > ", value)?,
        Filter::Gte(field, value) => push_comparison(qb, field, " >= ", value)?,
        Filter::Lt(field, value) => push_comparison(qb, field, " < ", value)?,
        Filter::Lte(field, value) => push_comparison(qb, field, " <= ", value)?,
        Filter::Exists(field, present) => {
            if field == "_id" {
                qb.push(if *present { "1" } else { "0" });
                return Ok(());
            }
            qb.push("(json_type(documents.body, ").push(quoted_path(field)?).push(")");
            qb.push(if *present { " IS NOT NULL)" } else { " IS NULL)" });
        }
        Filter::Contains(field, value) => {
            let v = to_sql_value(field, value)?;
            qb.push("EXISTS (SELECT 1 FROM json_each(documents.body, ").push(quoted_path(field)?).push(")");
            if v == SqlValue::Null {
                qb.push(" WHERE json_each.type = 'null')");
            } else {
                qb.push(" WHERE json_each.value = ");
                push_value(qb, v);
                qb.push(")");
            }
        }
        Filter::MaxSize(field, len) => {
            qb.push("COALESCE(json_array_length(documents.body, ").push(quoted_path(field)?).push("), 0) <= ");
            qb.push_bind((*len).min(i64::MAX as u64) as i64);
        }
        Filter::Search { fields, term } => {
            let term = term.trim();
            if fields.is_empty() {
                qb.push("0");
                return Ok(());
            }
            if term.is_empty() {
                qb.push("1");
                return Ok(());
            }
            let pattern = format!("%{}%", escape_like_pattern(&term.to_lowercase()));
            qb.push("(");
            for (i, field) in fields.iter().enumerate() {
                if i > 0 {
                    qb.push(" OR ");
                }
                qb.push("LOWER(COALESCE(");
                push_field(qb, field)?;
                qb.push(", '')) LIKE ").push_bind(pattern.clone()).push(" ESCAPE '!'");
            }
            qb.push(")");
        }
        Filter::And(filters) => {
            if filters.is_empty() {
                qb.push("1");
                return Ok(());
            }
            qb.push("(");
            for (i, f) in filters.iter().enumerate() {
                if i > 0 {
                    qb.push(" AND ");
                }
                push_filter(qb, f)?;
            }
            qb.push(")");
        }
        Filter::Or(filters) => {
            if filters.is_empty() {
                qb.push("0");
                return Ok(());
            }
            qb.push("(");
            for (i, f) in filters.iter().enumerate() {
                if i > 0 {
                    qb.push(" OR ");
                }
                push_filter(qb, f)?;
            }
            qb.push(")");
        }
        Filter::Not(inner) => {
            qb.push("NOT (");
            push_filter(qb, inner)?;
            qb.push(")");
        }
    }
    Ok(())
}

/// `FROM documents WHERE collection = ? AND (<filter>)`
pub fn push_from_where(
    qb: &mut QueryBuilder<'_, Sqlite>,
    collection: &str,
    filter: &Filter,
) -> Result<(), QueryError> {
    qb.push(" FROM documents WHERE documents.collection = ").push_bind(collection.to_string()).push(" AND ");
    push_filter(qb, filter)
}

/// Row-returning query for a plan without an aggregate stage: `SELECT id, body ...`.
pub fn select_documents(plan: &Plan) -> Result<QueryBuilder<'static, Sqlite>, QueryError> {
    let mut qb = QueryBuilder::new("SELECT documents.id AS id, documents.body AS body");
    push_from_where(&mut qb, plan.collection.name(), &plan.filter)?;
    qb.push(" ORDER BY ");
    for key in &plan.sort {
        push_field(&mut qb, &key.field)?;
        qb.push(match key.direction {
            SortDirection::Asc => " ASC, ",
            SortDirection::Desc => " DESC, ",
        });
    }
    // Stable tie-break: ids increase with creation time
    qb.push("documents.id ASC");
    qb.push(" LIMIT ").push_bind(plan.limit.map(|l| l.min(i64::MAX as u64) as i64).unwrap_or(-1));
    qb.push(" OFFSET ").push_bind(plan.skip.min(i64::MAX as u64) as i64);
    Ok(qb)
}

/// `SELECT COUNT(*) ...` over the plan's filter; sort and paging are ignored.
pub fn count_documents(collection: &str, filter: &Filter) -> Result<QueryBuilder<'static, Sqlite>, QueryError> {
    let mut qb = QueryBuilder::new("SELECT COUNT(*)");
    push_from_where(&mut qb, collection, filter)?;
    Ok(qb)
}

/// Grouping query: `bucket` is the JSON text of the group value (NULL when missing),
/// `n` the document count and `total` the sum of the optional sum field.
pub fn aggregate_documents(plan: &Plan) -> Result<QueryBuilder<'static, Sqlite>, QueryError> {
    let agg = plan.aggregate.as_ref().ok_or_else(|| QueryError::InvalidField("<aggregate>".to_string()))?;
    let mut qb = QueryBuilder::new("SELECT (documents.body -> ");
    qb.push(quoted_path(&agg.group_by)?).push(") AS bucket, COUNT(*) AS n, ");
    match &agg.sum {
        Some(field) => {
            qb.push("TOTAL(");
            push_field(&mut qb, field)?;
            qb.push(") AS total");
        }
        None => {
            qb.push("0.0 AS total");
        }
    }
    push_from_where(&mut qb, plan.collection.name(), &plan.filter)?;
    qb.push(" GROUP BY bucket ORDER BY n DESC, bucket ASC");
    if plan.limit.is_some() || plan.skip > 0 {
        qb.push(" LIMIT ").push_bind(plan.limit.map(|l| l.min(i64::MAX as u64) as i64).unwrap_or(-1));
        qb.push(" OFFSET ").push_bind(plan.skip.min(i64::MAX as u64) as i64);
    }
    Ok(qb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Collection;
    use crate::query::{Pipeline, SortKey};
    use serde_json::json;

    fn sql_of(filter: &Filter) -> String {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new("");
        push_filter(&mut qb, filter).unwrap();
        qb.sql().to_string()
    }

    #[test]
    fn escapes_like_wildcards() {
        assert_eq!(escape_like_pattern("50%_off!"), "50!%!_off!!");
    }

    #[test]
    fn eq_null_compiles_to_is_null() {
        assert_eq!(
            sql_of(&Filter::eq("counselor_id", Value::Null)),
            "(json_extract(documents.body, '$.counselor_id') IS NULL)"
        );
    }

    #[test]
    fn id_field_uses_primary_key_column() {
        assert_eq!(sql_of(&Filter::eq("_id", "abc")), "documents.id = ?");
    }

    #[test]
    fn empty_in_matches_nothing_and_empty_not_in_everything() {
        assert_eq!(sql_of(&Filter::In("a".into(), vec![])), "0");
        assert_eq!(sql_of(&Filter::NotIn("a".into(), vec![])), "1");
    }

    #[test]
    fn in_with_null_adds_is_null_branch() {
        let sql = sql_of(&Filter::In("a".into(), vec![json!("x"), Value::Null]));
        assert_eq!(
            sql,
            "(json_extract(documents.body, '$.a') IN (?) OR json_extract(documents.body, '$.a') IS NULL)"
        );
    }

    #[test]
    fn object_values_are_rejected() {
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new("");
        let err = push_filter(&mut qb, &Filter::eq("a", json!({"$gt": 1}))).unwrap_err();
        assert!(matches!(err, QueryError::UnsupportedValue { .. }));
    }

    #[test]
    fn select_has_stable_order_and_paging() {
        let plan = Pipeline::new(Collection::Students)
            .matching(Filter::eq("college_id", "c1"))
            .sort(vec![SortKey::desc("created_at")])
            .skip(10)
            .limit(5)
            .plan()
            .unwrap();
        let qb = select_documents(&plan).unwrap();
        let sql = qb.sql();
        assert!(sql.starts_with("SELECT documents.id AS id, documents.body AS body FROM documents"));
        assert!(sql.contains("ORDER BY json_extract(documents.body, '$.created_at') DESC, documents.id ASC"));
        assert!(sql.ends_with("LIMIT ? OFFSET ?"));
    }

    #[test]
    fn aggregate_groups_by_json_text() {
        let plan = Pipeline::new(Collection::Students).group_by("lead_stage", None).plan().unwrap();
        let qb = aggregate_documents(&plan).unwrap();
        assert!(qb.sql().contains("GROUP BY bucket ORDER BY n DESC"));
        assert!(!qb.sql().contains("LIMIT"));
    }

    #[test]
    fn aggregate_skip_without_limit_keeps_offset() {
        let plan = Pipeline::new(Collection::Students).skip(2).group_by("lead_stage", None).plan().unwrap();
        let qb = aggregate_documents(&plan).unwrap();
        assert!(qb.sql().ends_with("LIMIT ? OFFSET ?"));
    }

    #[test]
    fn max_size_treats_missing_array_as_empty() {
        assert_eq!(
            sql_of(&Filter::max_size("booked", 0)),
            "COALESCE(json_array_length(documents.body, '$.booked'), 0) <= ?"
        );
    }
}
