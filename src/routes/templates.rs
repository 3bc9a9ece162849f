use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    db::Collection,
    error::{AppError, AppResult, OptionExt},
    messaging::{render, TemplateInput, TemplateType},
    pagination::{paginate, PageParams},
    query::{Filter, Pipeline},
    routes::common::{actor, data_response, message_response, parse_id, sort_keys},
    routes::students::find_student,
    state::AppState,
    store::get_str,
    types::{JsonBody, ObjectId, Permission, Principal, QueryParams},
};

#[derive(Debug, Deserialize)]
pub struct TemplateListQuery {
    pub template_type: Option<TemplateType>,
    pub is_published: Option<bool>,
    pub search: Option<String>,
}

fn college_scope(principal: &Principal) -> AppResult<Filter> {
    Ok(Filter::eq("college_id", principal.college()?))
}

async fn find_template(state: &AppState, principal: &Principal, id: &ObjectId) -> AppResult<Value> {
    state
        .store
        .find_scoped(Collection::Templates, id, college_scope(principal)?)
        .await?
        .ok_or_not_found("Template")
}

/// Names are unique per channel within a college.
async fn ensure_unique_name(
    state: &AppState,
    college: &str,
    template_type: TemplateType,
    name: &str,
    except: Option<&ObjectId>,
) -> AppResult<()> {
    let mut filter = Filter::eq("college_id", college)
        .and(Filter::eq("template_type", template_type.as_str()))
        .and(Filter::eq("name", name));
    if let Some(id) = except {
        filter = filter.and(Filter::id(id).negate());
    }
    if state.store.exists(Collection::Templates, filter).await? {
        return Err(AppError::validation("name", "Template name already exists"));
    }
    Ok(())
}

pub async fn create_template(
    State(state): State<AppState>,
    principal: Principal,
    JsonBody(input): JsonBody<TemplateInput>,
) -> AppResult<Response> {
    principal.require(Permission::ManageTemplates)?;
    let college = principal.college()?;
    let mut body = input.validate()?;
    ensure_unique_name(&state, college, input.template_type, get_str(&body, "name").unwrap_or_default(), None).await?;

    body["college_id"] = json!(college);
    body["created_by"] = json!(actor(&principal));
    let doc = state.store.insert(Collection::Templates, body).await?;
    tracing::info!(template_id = %doc["_id"], template_type = input.template_type.as_str(), "template created");
    Ok(data_response(StatusCode::CREATED, doc, "Template created."))
}

pub async fn list_templates(
    State(state): State<AppState>,
    principal: Principal,
    QueryParams(page): QueryParams<PageParams>,
    QueryParams(query): QueryParams<TemplateListQuery>,
) -> AppResult<impl IntoResponse> {
    // counselors read templates to pick one for communication
    principal.require(Permission::Communicate)?;
    let page = page.resolve(&state.config.pagination)?;

    let mut filter = college_scope(&principal)?;
    let mut extra = Vec::new();
    if let Some(t) = query.template_type {
        filter = filter.and(Filter::eq("template_type", t.as_str()));
        extra.push(("template_type", t.as_str().to_string()));
    }
    if let Some(p) = query.is_published {
        filter = filter.and(if p { Filter::eq("is_published", true) } else { Filter::ne("is_published", true) });
        extra.push(("is_published", p.to_string()));
    }
    if let Some(term) = query.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        filter = filter.and(Filter::search(&["name", "content"], term));
        extra.push(("search", term.to_string()));
    }

    let pipeline = Pipeline::new(Collection::Templates)
        .matching(filter)
        .sort(sort_keys(None, None, &[])?)
        .skip(page.skip)
        .limit(page.page_size);
    let (docs, total) = state.store.find_with_total(&pipeline).await?;
    Ok(Json(paginate("/templates", page, docs, total, &extra)))
}

pub async fn get_template(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> AppResult<Response> {
    principal.require(Permission::Communicate)?;
    let doc = find_template(&state, &principal, &parse_id(&id)?).await?;
    Ok(data_response(StatusCode::OK, doc, "Get data."))
}

/// Full replacement: channel rules span several fields, so the whole template is
/// validated again.
pub async fn update_template(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
    JsonBody(input): JsonBody<TemplateInput>,
) -> AppResult<Response> {
    principal.require(Permission::ManageTemplates)?;
    let id = parse_id(&id)?;
    let existing = find_template(&state, &principal, &id).await?;
    let college = principal.college()?;
    let mut body = input.validate()?;
    ensure_unique_name(&state, college, input.template_type, get_str(&body, "name").unwrap_or_default(), Some(&id))
        .await?;

    body["college_id"] = json!(college);
    body["created_by"] = existing.get("created_by").cloned().unwrap_or(Value::Null);
    body["updated_by"] = json!(actor(&principal));
    let doc = state.store.replace(Collection::Templates, &id, body).await?.ok_or_not_found("Template")?;
    Ok(data_response(StatusCode::OK, doc, "Template updated."))
}

pub async fn delete_template(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> AppResult<Response> {
    principal.require(Permission::ManageTemplates)?;
    let id = parse_id(&id)?;
    find_template(&state, &principal, &id).await?;
    state.store.delete(Collection::Templates, &id).await?;
    Ok(message_response("Template deleted."))
}

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    pub student_id: String,
}

pub async fn preview_template(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<PreviewRequest>,
) -> AppResult<impl IntoResponse> {
    principal.require(Permission::Communicate)?;
    let template = find_template(&state, &principal, &parse_id(&id)?).await?;
    let student = find_student(&state, &principal, &parse_id(&req.student_id)?).await?;

    let subject = get_str(&template, "subject").map(|s| render(s, &student));
    let content = render(get_str(&template, "content").unwrap_or_default(), &student);
    Ok(Json(json!({
        "data": { "template_type": template["template_type"], "subject": subject, "content": content },
        "message": "Get data.",
    })))
}
