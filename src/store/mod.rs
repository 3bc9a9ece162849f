//! JSON document store on top of SQLite.
//!
//! Every document lives in the `documents` table under its collection name. The body
//! always carries `_id`, `created_at` and `updated_at`, so those fields can be filtered
//! and sorted like any other. Single statements give per-document atomicity; the
//! guarded updates (`increment_bounded`, `push_bounded`) put the guard in the `WHERE`
//! clause so concurrent requests cannot overshoot a limit.

use serde_json::{Map, Value};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::db::Collection;
use crate::error::{AppError, AppResult};
use crate::query::sql::{aggregate_documents, count_documents, push_filter, select_documents};
use crate::query::{json_path, Filter, Pipeline};
use crate::types::{now_iso, ObjectId};

/// Fields owned by the store that callers cannot overwrite through a patch.
const RESERVED_FIELDS: [&str; 2] = ["_id", "created_at"];

/// One group produced by an aggregate pipeline.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Bucket {
    /// Group value; `null` for documents missing the field.
    pub key: Value,
    pub count: i64,
    /// Sum of the aggregate's sum field (0 when none was requested).
    pub total: f64,
}

#[derive(Clone)]
pub struct DocumentStore {
    pool: SqlitePool,
}

impl DocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Inserts `body` (a JSON object) and returns the stored document including `_id`.
    pub async fn insert(&self, collection: Collection, body: Value) -> AppResult<Value> {
        let mut doc = into_object(body)?;
        let id = ObjectId::new();
        let now = now_iso();
        doc.insert("_id".to_string(), Value::String(id.to_string()));
        doc.insert("created_at".to_string(), Value::String(now.clone()));
        doc.insert("updated_at".to_string(), Value::String(now.clone()));
        let doc = Value::Object(doc);

        sqlx::query(
            "INSERT INTO documents (collection, id, body, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
        )
        .bind(collection.name())
        .bind(id.as_str())
        .bind(serde_json::to_string(&doc)?)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        tracing::debug!(collection = collection.name(), id = %id, "document inserted");
        Ok(doc)
    }

    pub async fn find_by_id(&self, collection: Collection, id: &ObjectId) -> AppResult<Option<Value>> {
        let row = sqlx::query("SELECT body FROM documents WHERE collection = ?1 AND id = ?2")
            .bind(collection.name())
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| parse_body(&r.try_get::<String, _>("body")?)).transpose()
    }

    /// Like [`find_by_id`](Self::find_by_id) but scoped by an extra filter (college, owner).
    pub async fn find_scoped(
        &self,
        collection: Collection,
        id: &ObjectId,
        scope: Filter,
    ) -> AppResult<Option<Value>> {
        self.find_one(collection, Filter::id(id).and(scope)).await
    }

    pub async fn find_one(&self, collection: Collection, filter: Filter) -> AppResult<Option<Value>> {
        let mut docs = self.find(&Pipeline::new(collection).matching(filter).limit(1)).await?;
        Ok(docs.pop())
    }

    pub async fn find(&self, pipeline: &Pipeline) -> AppResult<Vec<Value>> {
        let plan = pipeline.plan()?;
        if plan.aggregate.is_some() {
            return Err(AppError::Internal(anyhow::anyhow!("find() called with an aggregate pipeline")));
        }
        let mut qb = select_documents(&plan)?;
        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut docs = Vec::with_capacity(rows.len());
        for row in rows {
            let doc = parse_body(&row.try_get::<String, _>("body")?)?;
            docs.push(match &plan.projection {
                Some(fields) => project(doc, fields),
                None => doc,
            });
        }
        Ok(docs)
    }

    /// Runs the pipeline and also returns the total number of matches ignoring paging.
    pub async fn find_with_total(&self, pipeline: &Pipeline) -> AppResult<(Vec<Value>, u64)> {
        let plan = pipeline.plan()?;
        let total = self.count(pipeline.collection, plan.filter).await?;
        let docs = self.find(pipeline).await?;
        Ok((docs, total))
    }

    pub async fn count(&self, collection: Collection, filter: Filter) -> AppResult<u64> {
        check_fields(&filter)?;
        let mut qb = count_documents(collection.name(), &filter)?;
        let n: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(n.max(0) as u64)
    }

    pub async fn exists(&self, collection: Collection, filter: Filter) -> AppResult<bool> {
        Ok(self.find_one(collection, filter).await?.is_some())
    }

    pub async fn aggregate(&self, pipeline: &Pipeline) -> AppResult<Vec<Bucket>> {
        let plan = pipeline.plan()?;
        let mut qb = aggregate_documents(&plan)?;
        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut buckets = Vec::with_capacity(rows.len());
        for row in rows {
            let key = match row.try_get::<Option<String>, _>("bucket")? {
                Some(text) => serde_json::from_str(&text)?,
                None => Value::Null,
            };
            buckets.push(Bucket { key, count: row.try_get("n")?, total: row.try_get("total")? });
        }
        Ok(buckets)
    }

    /// Applies an RFC 7396 merge patch (`null` removes a field) to the document with `id`.
    /// Returns whether a document matched.
    pub async fn update(&self, collection: Collection, id: &ObjectId, patch: Value) -> AppResult<bool> {
        Ok(self.update_many(collection, Filter::id(id), patch).await? > 0)
    }

    /// Merge-patches every document matching `filter`; returns the number updated.
    pub async fn update_many(&self, collection: Collection, filter: Filter, patch: Value) -> AppResult<u64> {
        let mut patch = into_object(patch)?;
        for field in RESERVED_FIELDS {
            patch.remove(field);
        }
        let now = now_iso();
        patch.insert("updated_at".to_string(), Value::String(now.clone()));
        check_fields(&filter)?;

        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new("UPDATE documents SET body = json_patch(body, ");
        qb.push_bind(serde_json::to_string(&Value::Object(patch))?)
            .push("), updated_at = ")
            .push_bind(now)
            .push(" WHERE documents.collection = ")
            .push_bind(collection.name())
            .push(" AND ");
        push_filter(&mut qb, &filter)?;
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Replaces the whole body, keeping `_id` and `created_at` of the stored document.
    pub async fn replace(&self, collection: Collection, id: &ObjectId, body: Value) -> AppResult<Option<Value>> {
        let Some(existing) = self.find_by_id(collection, id).await? else {
            return Ok(None);
        };
        let mut doc = into_object(body)?;
        let now = now_iso();
        for field in RESERVED_FIELDS {
            if let Some(v) = existing.get(field) {
                doc.insert(field.to_string(), v.clone());
            }
        }
        doc.insert("updated_at".to_string(), Value::String(now.clone()));
        let doc = Value::Object(doc);

        let result = sqlx::query("UPDATE documents SET body = ?1, updated_at = ?2 WHERE collection = ?3 AND id = ?4")
            .bind(serde_json::to_string(&doc)?)
            .bind(&now)
            .bind(collection.name())
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok((result.rows_affected() > 0).then_some(doc))
    }

    pub async fn delete(&self, collection: Collection, id: &ObjectId) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = ?1 AND id = ?2")
            .bind(collection.name())
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_many(&self, collection: Collection, filter: Filter) -> AppResult<u64> {
        check_fields(&filter)?;
        let mut qb: QueryBuilder<'_, Sqlite> =
            QueryBuilder::new("DELETE FROM documents WHERE documents.collection = ");
        qb.push_bind(collection.name()).push(" AND ");
        push_filter(&mut qb, &filter)?;
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    /// Appends `value` to the array `field` of every matching document, creating the
    /// array when missing.
    pub async fn push(&self, collection: Collection, filter: Filter, field: &str, value: Value) -> AppResult<u64> {
        self.push_inner(collection, filter, field, value, None).await
    }

    /// Like [`push`](Self::push) but only while the array holds fewer elements than the
    /// numeric field `limit_field` of the same document.
    pub async fn push_bounded(
        &self,
        collection: Collection,
        filter: Filter,
        field: &str,
        value: Value,
        limit_field: &str,
    ) -> AppResult<u64> {
        self.push_inner(collection, filter, field, value, Some(limit_field)).await
    }

    async fn push_inner(
        &self,
        collection: Collection,
        filter: Filter,
        field: &str,
        value: Value,
        limit_field: Option<&str>,
    ) -> AppResult<u64> {
        let path = literal_path(field)?;
        check_fields(&filter)?;
        let now = now_iso();

        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
            "UPDATE documents SET body = json_set(json_set(body, {path}, json_insert(COALESCE(json_extract(body, {path}), json('[]')), '$[#]', json("
        ));
        qb.push_bind(serde_json::to_string(&value)?)
            .push("))), '$.updated_at', ")
            .push_bind(now.clone())
            .push("), updated_at = ")
            .push_bind(now)
            .push(" WHERE documents.collection = ")
            .push_bind(collection.name())
            .push(" AND ");
        push_filter(&mut qb, &filter)?;
        if let Some(limit_field) = limit_field {
            let limit = literal_path(limit_field)?;
            qb.push(format!(
                " AND COALESCE(json_array_length(documents.body, {path}), 0) < COALESCE(json_extract(documents.body, {limit}), 0)"
            ));
        }
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    /// Removes every occurrence of the string `value` from the array `field` of the
    /// matching documents. Returns the number of documents that held it.
    pub async fn pull(&self, collection: Collection, filter: Filter, field: &str, value: &str) -> AppResult<u64> {
        let path = literal_path(field)?;
        let filter = filter.and(Filter::contains(field, value));
        check_fields(&filter)?;
        let now = now_iso();

        // rebuild the array from json_each in key order, re-encoding each element as JSON
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
            "UPDATE documents SET body = json_set(body, {path}, (SELECT json_group_array(json(CASE \
             WHEN t IN ('object', 'array') THEN v WHEN t IN ('true', 'false', 'null') THEN t ELSE json_quote(v) END)) \
             FROM (SELECT json_each.type AS t, json_each.value AS v FROM json_each(documents.body, {path}) \
             WHERE NOT (json_each.type = 'text' AND json_each.value = "
        ));
        qb.push_bind(value.to_string())
            .push(") ORDER BY json_each.key)), '$.updated_at', ")
            .push_bind(now.clone())
            .push("), updated_at = ")
            .push_bind(now)
            .push(" WHERE documents.collection = ")
            .push_bind(collection.name())
            .push(" AND ");
        push_filter(&mut qb, &filter)?;
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    /// Increments the numeric `counter_field` by one while it is below `limit_field`.
    /// Returns the number of documents updated (0 when the limit was reached).
    pub async fn increment_bounded(
        &self,
        collection: Collection,
        filter: Filter,
        counter_field: &str,
        limit_field: &str,
    ) -> AppResult<u64> {
        let counter = literal_path(counter_field)?;
        let limit = literal_path(limit_field)?;
        check_fields(&filter)?;
        let now = now_iso();

        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
            "UPDATE documents SET body = json_set(body, {counter}, COALESCE(json_extract(body, {counter}), 0) + 1, '$.updated_at', "
        ));
        qb.push_bind(now.clone())
            .push("), updated_at = ")
            .push_bind(now)
            .push(" WHERE documents.collection = ")
            .push_bind(collection.name())
            .push(" AND ");
        push_filter(&mut qb, &filter)?;
        qb.push(format!(
            " AND COALESCE(json_extract(documents.body, {counter}), 0) < COALESCE(json_extract(documents.body, {limit}), 0)"
        ));
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }
}

fn literal_path(field: &str) -> AppResult<String> {
    Ok(format!("'{}'", json_path(field)?))
}

fn check_fields(filter: &Filter) -> AppResult<()> {
    for field in filter.fields() {
        json_path(field)?;
    }
    Ok(())
}

fn into_object(value: Value) -> AppResult<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(AppError::InvalidInput("Document body must be a JSON object".to_string())),
    }
}

fn parse_body(raw: &str) -> AppResult<Value> {
    Ok(serde_json::from_str(raw)?)
}

/// Keeps `_id` plus the requested top-level fields (the first segment of dotted paths).
fn project(doc: Value, fields: &[String]) -> Value {
    match doc {
        Value::Object(map) => {
            let keep: Vec<&str> = fields.iter().map(|f| f.split('.').next().unwrap_or(f)).collect();
            Value::Object(
                map.into_iter().filter(|(k, _)| k == "_id" || keep.contains(&k.as_str())).collect(),
            )
        }
        other => other,
    }
}

/// Reads a dotted path out of a JSON document.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |cur, seg| cur.get(seg))
}

/// String field of a document, if present.
pub fn get_str<'a>(doc: &'a Value, path: &str) -> Option<&'a str> {
    get_path(doc, path).and_then(Value::as_str)
}

/// The `_id` of a stored document.
pub fn doc_id(doc: &Value) -> AppResult<ObjectId> {
    let raw = get_str(doc, "_id").ok_or_else(|| AppError::Internal(anyhow::anyhow!("document without _id")))?;
    ObjectId::parse(raw)
}
