use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::Response,
};

use crate::db::Collection;
use crate::error::{AppError, AppResult};
use crate::query::Filter;
use crate::state::AppState;
use crate::store::{get_str, DocumentStore};
use crate::types::{ObjectId, Principal, Role};

/// Digest stored for a user's API token; the token itself is never persisted.
pub fn hash_token(token: &str) -> String {
    blake3::hash(token.as_bytes()).to_hex().to_string()
}

/// New random API token (64 hex characters).
pub fn generate_token() -> String {
    format!("{}{}", uuid::Uuid::new_v4().simple(), uuid::Uuid::new_v4().simple())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

fn bearer_token(req: &Request) -> Option<&str> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

/// Maps a bearer token to a principal: the configured admin token, or a stored user.
pub async fn resolve_principal(store: &DocumentStore, admin_token: Option<&str>, token: &str) -> AppResult<Principal> {
    if let Some(admin) = admin_token {
        if constant_time_eq(admin.as_bytes(), token.as_bytes()) {
            return Ok(Principal { user_id: None, name: "platform admin".to_string(), role: Role::SuperAdmin, college_id: None });
        }
    }

    let filter = Filter::eq("token_hash", hash_token(token)).and(Filter::ne("is_active", false));
    let user = store
        .find_one(Collection::Users, filter)
        .await?
        .ok_or_else(|| AppError::Unauthorized("Invalid token".to_string()))?;
    let role: Role = get_str(&user, "role")
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("user without role")))?
        .parse()?;
    Ok(Principal {
        user_id: get_str(&user, "_id").map(ObjectId::parse).transpose()?,
        name: get_str(&user, "name").unwrap_or_default().to_string(),
        role,
        college_id: get_str(&user, "college_id").map(str::to_string),
    })
}

/// Requires `Authorization: Bearer <token>` and stores the resolved [`Principal`] in
/// the request extensions.
pub async fn auth_middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Result<Response, AppError> {
    let token = bearer_token(&req)
        .ok_or_else(|| AppError::Unauthorized("Missing bearer token".to_string()))?
        .to_string();
    let principal = resolve_principal(&state.store, state.config.admin_token(), &token).await?;
    tracing::debug!(role = principal.role.as_str(), user = ?principal.user_id, "request authenticated");
    req.extensions_mut().insert(principal);
    Ok(next.run(req).await)
}

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .ok_or_else(|| AppError::Unauthorized("Not authenticated".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_random_and_hashed() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert_eq!(hash_token(&a), hash_token(&a));
        assert_ne!(hash_token(&a), a);
    }

    #[test]
    fn constant_time_compare() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
