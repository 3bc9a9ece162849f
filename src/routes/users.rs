use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    cache::NS_DASHBOARD,
    db::Collection,
    error::{
        validation::{require_text, validate_email},
        AppError, AppResult, OptionExt,
    },
    middleware::auth::{generate_token, hash_token},
    pagination::{paginate, PageParams},
    query::{Filter, Pipeline, SortKey},
    routes::common::{message_response, parse_id},
    state::AppState,
    types::{JsonBody, Permission, Principal, QueryParams, Role},
};

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    pub email: String,
    pub role: Role,
    pub college_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UserListQuery {
    pub role: Option<Role>,
    pub college_id: Option<String>,
}

/// Stored user without its token digest.
pub fn public_user(mut user: Value) -> Value {
    if let Value::Object(map) = &mut user {
        map.remove("token_hash");
    }
    user
}

fn user_scope(principal: &Principal) -> AppResult<Filter> {
    if principal.role == Role::SuperAdmin {
        Ok(Filter::All)
    } else {
        Ok(Filter::eq("college_id", principal.college()?))
    }
}

fn is_admin_role(role: Role) -> bool {
    matches!(role, Role::SuperAdmin | Role::CollegeAdmin)
}

pub async fn create_user(
    State(state): State<AppState>,
    principal: Principal,
    JsonBody(req): JsonBody<CreateUserRequest>,
) -> AppResult<Response> {
    principal.require(Permission::ManageUsers)?;
    let name = require_text(&req.name, "name", 200)?;
    let email = validate_email(&req.email)?;

    let college_id = match principal.role {
        Role::SuperAdmin => match (req.role, req.college_id.as_deref().map(str::trim)) {
            (Role::SuperAdmin, _) => None,
            (_, Some(c)) if !c.is_empty() => Some(require_text(c, "college_id", 64)?),
            _ => return Err(AppError::validation("college_id", "college_id is required for college users")),
        },
        _ => {
            if is_admin_role(req.role) {
                return Err(AppError::Forbidden("Not enough permissions".to_string()));
            }
            let own = principal.college()?;
            if req.college_id.as_deref().is_some_and(|c| c.trim() != own) {
                return Err(AppError::Forbidden("Not enough permissions".to_string()));
            }
            Some(own.to_string())
        }
    };

    if state.store.exists(Collection::Users, Filter::eq("email", email.as_str())).await? {
        return Err(AppError::validation("email", "Email already exists"));
    }

    let token = generate_token();
    let doc = state
        .store
        .insert(
            Collection::Users,
            json!({
                "name": name,
                "email": email,
                "role": req.role,
                "college_id": college_id,
                "token_hash": hash_token(&token),
                "is_active": true,
                "created_by": principal.user_id.as_ref().map(|id| id.to_string()),
            }),
        )
        .await?;
    // counselor performance lists every counselor of the college
    state.cache.invalidate(&[NS_DASHBOARD]);
    tracing::info!(role = req.role.as_str(), college_id = ?college_id, "user created");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": doc["_id"],
            "token": token,
            "data": public_user(doc),
            "message": "User created.",
        })),
    )
        .into_response())
}

pub async fn me(State(state): State<AppState>, principal: Principal) -> AppResult<impl IntoResponse> {
    let user = match &principal.user_id {
        Some(id) => state.store.find_by_id(Collection::Users, id).await?.map(public_user),
        None => None,
    };
    Ok(Json(json!({ "principal": principal, "user": user })))
}

pub async fn list_users(
    State(state): State<AppState>,
    principal: Principal,
    QueryParams(page): QueryParams<PageParams>,
    QueryParams(query): QueryParams<UserListQuery>,
) -> AppResult<impl IntoResponse> {
    principal.require(Permission::ManageUsers)?;
    let page = page.resolve(&state.config.pagination)?;

    let mut filter = user_scope(&principal)?;
    let mut extra = Vec::new();
    if let Some(role) = query.role {
        filter = filter.and(Filter::eq("role", role.as_str()));
        extra.push(("role", role.as_str().to_string()));
    }
    if let Some(college) = query.college_id.as_deref().filter(|c| !c.trim().is_empty()) {
        filter = filter.and(Filter::eq("college_id", college.trim()));
        extra.push(("college_id", college.trim().to_string()));
    }

    let pipeline = Pipeline::new(Collection::Users)
        .matching(filter)
        .sort(vec![SortKey::asc("name")])
        .skip(page.skip)
        .limit(page.page_size);
    let (docs, total) = state.store.find_with_total(&pipeline).await?;
    let docs = docs.into_iter().map(public_user).collect();
    Ok(Json(paginate("/users", page, docs, total, &extra)))
}

pub async fn delete_user(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> AppResult<Response> {
    principal.require(Permission::ManageUsers)?;
    let id = parse_id(&id)?;
    if principal.user_id.as_ref() == Some(&id) {
        return Err(AppError::BadRequest("Cannot delete your own user".to_string()));
    }
    let user = state
        .store
        .find_scoped(Collection::Users, &id, user_scope(&principal)?)
        .await?
        .ok_or_not_found("User")?;
    let role: Option<Role> = user.get("role").cloned().and_then(|r| serde_json::from_value(r).ok());
    if principal.role != Role::SuperAdmin && role.is_some_and(is_admin_role) {
        return Err(AppError::Forbidden("Not enough permissions".to_string()));
    }
    state.store.delete(Collection::Users, &id).await?;
    state.cache.invalidate(&[NS_DASHBOARD]);
    tracing::info!(user_id = %id, "user deleted");
    Ok(message_response("User deleted."))
}

/// Issues a new token; the old one stops working immediately. Users may rotate
/// their own token, admins any token in scope.
pub async fn rotate_token(
    State(state): State<AppState>,
    principal: Principal,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let id = parse_id(&id)?;
    let own = principal.user_id.as_ref() == Some(&id);
    let scope = if own {
        Filter::All
    } else {
        principal.require(Permission::ManageUsers)?;
        user_scope(&principal)?
    };
    state.store.find_scoped(Collection::Users, &id, scope).await?.ok_or_not_found("User")?;

    let token = generate_token();
    state.store.update(Collection::Users, &id, json!({ "token_hash": hash_token(&token) })).await?;
    tracing::info!(user_id = %id, "api token rotated");
    Ok(Json(json!({ "id": id, "token": token, "message": "Token rotated." })))
}
