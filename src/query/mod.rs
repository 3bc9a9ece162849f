//! Filter and aggregation pipeline construction for the document store.
//!
//! Route helpers build a [`Filter`] from optional request parameters, wrap it in a
//! [`Pipeline`] together with sort/skip/limit stages and hand it to the
//! [`DocumentStore`](crate::store::DocumentStore), which compiles it to parameterised SQL
//! (see [`sql`]). Field names are dotted paths into the JSON document (`address.city`).
//!
//! Matching semantics follow document-database conventions:
//! - `Eq(field, null)` matches documents where the field is missing or null.
//! - `Ne` and `NotIn` also match documents where the field is missing.
//! - `Contains` tests membership in an array field.
//! - An empty `And` matches everything, an empty `Or` or `In` matches nothing.

pub mod sql;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::db::Collection;

const MAX_PATH_DEPTH: usize = 8;

#[derive(Debug, Error, PartialEq)]
pub enum QueryError {
    #[error("invalid field path '{0}'")]
    InvalidField(String),
    #[error("unsupported value for field '{field}': {reason}")]
    UnsupportedValue { field: String, reason: &'static str },
    #[error("match stage after skip/limit is not supported")]
    MatchAfterPage,
    #[error("aggregate must be the last stage")]
    AggregateNotLast,
}

/// Validates a dotted field path and returns it in JSON path form (`$.a.b`).
pub fn json_path(field: &str) -> Result<String, QueryError> {
    let segments: Vec<&str> = field.split('.').collect();
    if field.is_empty() || segments.len() > MAX_PATH_DEPTH {
        return Err(QueryError::InvalidField(field.to_string()));
    }
    for seg in &segments {
        if seg.is_empty() || !seg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(QueryError::InvalidField(field.to_string()));
        }
    }
    Ok(format!("$.{}", field))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every document.
    All,
    /// Matches no document.
    Nothing,
    Eq(String, Value),
    Ne(String, Value),
    In(String, Vec<Value>),
    NotIn(String, Vec<Value>),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    Exists(String, bool),
    /// Array field contains the value.
    Contains(String, Value),
    /// Array field holds at most this many elements; a missing field counts as empty.
    MaxSize(String, u64),
    /// Case-insensitive substring match over any of the fields.
    Search { fields: Vec<String>, term: String },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(field.to_string(), value.into())
    }

    pub fn ne(field: &str, value: impl Into<Value>) -> Self {
        Filter::Ne(field.to_string(), value.into())
    }

    pub fn is_in<V: Into<Value>>(field: &str, values: impl IntoIterator<Item = V>) -> Self {
        Filter::In(field.to_string(), values.into_iter().map(Into::into).collect())
    }

    pub fn not_in<V: Into<Value>>(field: &str, values: impl IntoIterator<Item = V>) -> Self {
        Filter::NotIn(field.to_string(), values.into_iter().map(Into::into).collect())
    }

    pub fn gte(field: &str, value: impl Into<Value>) -> Self {
        Filter::Gte(field.to_string(), value.into())
    }

    pub fn lte(field: &str, value: impl Into<Value>) -> Self {
        Filter::Lte(field.to_string(), value.into())
    }

    pub fn gt(field: &str, value: impl Into<Value>) -> Self {
        Filter::Gt(field.to_string(), value.into())
    }

    pub fn lt(field: &str, value: impl Into<Value>) -> Self {
        Filter::Lt(field.to_string(), value.into())
    }

    pub fn exists(field: &str, present: bool) -> Self {
        Filter::Exists(field.to_string(), present)
    }

    pub fn contains(field: &str, value: impl Into<Value>) -> Self {
        Filter::Contains(field.to_string(), value.into())
    }

    pub fn max_size(field: &str, len: u64) -> Self {
        Filter::MaxSize(field.to_string(), len)
    }

    pub fn search(fields: &[&str], term: &str) -> Self {
        Filter::Search { fields: fields.iter().map(|f| f.to_string()).collect(), term: term.to_string() }
    }

    /// Matches the document with the given id.
    pub fn id(id: &crate::types::ObjectId) -> Self {
        Filter::Eq("_id".to_string(), Value::String(id.to_string()))
    }

    /// Conjunction of all filters; nested `And`s are flattened and `All` dropped.
    pub fn all_of(filters: impl IntoIterator<Item = Filter>) -> Self {
        let mut flat = Vec::new();
        for f in filters {
            match f {
                Filter::All => {}
                Filter::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.iter().any(|f| *f == Filter::Nothing) {
            return Filter::Nothing;
        }
        match flat.len() {
            0 => Filter::All,
            1 => flat.remove(0),
            _ => Filter::And(flat),
        }
    }

    /// Disjunction; an empty input matches nothing.
    pub fn any_of(filters: impl IntoIterator<Item = Filter>) -> Self {
        let mut flat = Vec::new();
        for f in filters {
            match f {
                Filter::Nothing => {}
                Filter::Or(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.iter().any(|f| *f == Filter::All) {
            return Filter::All;
        }
        match flat.len() {
            0 => Filter::Nothing,
            1 => flat.remove(0),
            _ => Filter::Or(flat),
        }
    }

    pub fn and(self, other: Filter) -> Self {
        Filter::all_of([self, other])
    }

    pub fn negate(self) -> Self {
        match self {
            Filter::All => Filter::Nothing,
            Filter::Nothing => Filter::All,
            Filter::Not(inner) => *inner,
            other => Filter::Not(Box::new(other)),
        }
    }

    /// Every field path referenced by this filter, for validation before compilation.
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Filter::All | Filter::Nothing => {}
            Filter::Eq(f, _)
            | Filter::Ne(f, _)
            | Filter::In(f, _)
            | Filter::NotIn(f, _)
            | Filter::Gt(f, _)
            | Filter::Gte(f, _)
            | Filter::Lt(f, _)
            | Filter::Lte(f, _)
            | Filter::Exists(f, _)
            | Filter::Contains(f, _)
            | Filter::MaxSize(f, _) => out.push(f),
            Filter::Search { fields, .. } => out.extend(fields.iter().map(String::as_str)),
            Filter::And(fs) | Filter::Or(fs) => fs.iter().for_each(|f| f.collect_fields(out)),
            Filter::Not(f) => f.collect_fields(out),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

impl SortKey {
    pub fn asc(field: &str) -> Self {
        Self { field: field.to_string(), direction: SortDirection::Asc }
    }

    pub fn desc(field: &str) -> Self {
        Self { field: field.to_string(), direction: SortDirection::Desc }
    }
}

/// Terminal grouping stage: one bucket per distinct `group_by` value.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub group_by: String,
    /// Also total this numeric field per bucket.
    pub sum: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Filter),
    Sort(Vec<SortKey>),
    Skip(u64),
    Limit(u64),
    Project(Vec<String>),
    Aggregate(Aggregate),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub collection: Collection,
    pub stages: Vec<Stage>,
}

/// A pipeline reduced to the shape the SQL compiler understands.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub collection: Collection,
    pub filter: Filter,
    pub sort: Vec<SortKey>,
    pub skip: u64,
    pub limit: Option<u64>,
    pub projection: Option<Vec<String>>,
    pub aggregate: Option<Aggregate>,
}

impl Pipeline {
    pub fn new(collection: Collection) -> Self {
        Self { collection, stages: Vec::new() }
    }

    pub fn matching(mut self, filter: Filter) -> Self {
        self.stages.push(Stage::Match(filter));
        self
    }

    pub fn sort(mut self, keys: Vec<SortKey>) -> Self {
        self.stages.push(Stage::Sort(keys));
        self
    }

    pub fn skip(mut self, n: u64) -> Self {
        self.stages.push(Stage::Skip(n));
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.stages.push(Stage::Limit(n));
        self
    }

    pub fn project(mut self, fields: &[&str]) -> Self {
        self.stages.push(Stage::Project(fields.iter().map(|f| f.to_string()).collect()));
        self
    }

    pub fn group_by(mut self, field: &str, sum: Option<&str>) -> Self {
        self.stages.push(Stage::Aggregate(Aggregate {
            group_by: field.to_string(),
            sum: sum.map(str::to_string),
        }));
        self
    }

    /// Merges the stages: matches are AND-ed, the last sort wins, skips add up and the
    /// smallest limit applies. A limit followed by a skip shrinks the limit accordingly.
    pub fn plan(&self) -> Result<Plan, QueryError> {
        let mut filters = Vec::new();
        let mut sort = Vec::new();
        let mut skip: u64 = 0;
        let mut limit: Option<u64> = None;
        let mut projection = None;
        let mut aggregate = None;
        let mut paged = false;

        for (idx, stage) in self.stages.iter().enumerate() {
            match stage {
                Stage::Match(f) => {
                    if paged {
                        return Err(QueryError::MatchAfterPage);
                    }
                    filters.push(f.clone());
                }
                Stage::Sort(keys) => sort = keys.clone(),
                Stage::Skip(n) => {
                    paged = true;
                    skip = skip.saturating_add(*n);
                    limit = limit.map(|l| l.saturating_sub(*n));
                }
                Stage::Limit(n) => {
                    paged = true;
                    limit = Some(limit.map_or(*n, |l| l.min(*n)));
                }
                Stage::Project(fields) => projection = Some(fields.clone()),
                Stage::Aggregate(agg) => {
                    if idx + 1 != self.stages.len() {
                        return Err(QueryError::AggregateNotLast);
                    }
                    aggregate = Some(agg.clone());
                }
            }
        }

        let filter = Filter::all_of(filters);
        for field in filter.fields() {
            json_path(field)?;
        }
        for key in &sort {
            json_path(&key.field)?;
        }
        if let Some(agg) = &aggregate {
            json_path(&agg.group_by)?;
            if let Some(sum) = &agg.sum {
                json_path(sum)?;
            }
        }

        Ok(Plan { collection: self.collection, filter, sort, skip, limit, projection, aggregate })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_path_validation() {
        assert_eq!(json_path("address.city").unwrap(), "$.address.city");
        assert!(json_path("").is_err());
        assert!(json_path("a..b").is_err());
        assert!(json_path("name'); DROP TABLE documents;--").is_err());
        assert!(json_path("a.b.c.d.e.f.g.h.i").is_err());
    }

    #[test]
    fn all_of_flattens_and_drops_all() {
        let f = Filter::all_of([
            Filter::All,
            Filter::eq("a", 1),
            Filter::And(vec![Filter::eq("b", 2), Filter::eq("c", 3)]),
        ]);
        assert_eq!(f, Filter::And(vec![Filter::eq("a", 1), Filter::eq("b", 2), Filter::eq("c", 3)]));
        assert_eq!(Filter::all_of(Vec::new()), Filter::All);
        assert_eq!(Filter::all_of([Filter::eq("a", 1), Filter::Nothing]), Filter::Nothing);
    }

    #[test]
    fn any_of_empty_matches_nothing() {
        assert_eq!(Filter::any_of(Vec::new()), Filter::Nothing);
        assert_eq!(Filter::any_of([Filter::eq("a", 1)]), Filter::eq("a", 1));
        assert_eq!(Filter::any_of([Filter::eq("a", 1), Filter::All]), Filter::All);
    }

    #[test]
    fn plan_merges_stages() {
        let plan = Pipeline::new(Collection::Students)
            .matching(Filter::eq("college_id", "c1"))
            .matching(Filter::eq("lead_stage", "fresh"))
            .sort(vec![SortKey::desc("created_at")])
            .skip(20)
            .limit(10)
            .plan()
            .unwrap();
        assert_eq!(plan.filter, Filter::And(vec![Filter::eq("college_id", "c1"), Filter::eq("lead_stage", "fresh")]));
        assert_eq!(plan.skip, 20);
        assert_eq!(plan.limit, Some(10));
        assert_eq!(plan.sort, vec![SortKey::desc("created_at")]);
    }

    #[test]
    fn plan_limit_then_skip_shrinks_window() {
        let plan = Pipeline::new(Collection::Students).limit(10).skip(4).plan().unwrap();
        assert_eq!(plan.skip, 4);
        assert_eq!(plan.limit, Some(6));
    }

    #[test]
    fn plan_rejects_bad_stage_order_and_fields() {
        let err = Pipeline::new(Collection::Students).limit(5).matching(Filter::All).plan().unwrap_err();
        assert_eq!(err, QueryError::MatchAfterPage);

        let err = Pipeline::new(Collection::Students).group_by("lead_stage", None).limit(1).plan().unwrap_err();
        assert_eq!(err, QueryError::AggregateNotLast);

        let err = Pipeline::new(Collection::Students).matching(Filter::eq("bad field", json!(1))).plan();
        assert!(matches!(err, Err(QueryError::InvalidField(_))));
    }
}
