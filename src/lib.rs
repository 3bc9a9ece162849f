//! # admitdesk backend library
//!
//! Admissions and CRM backend for colleges: student leads, applications, document
//! verification, templated communication, data segments, scholarships, promocodes,
//! interview scheduling and dashboards, served as a JSON API.
//!
//! ## Architecture
//!
//! - **Axum** for routing and middleware
//! - **SQLx** with SQLite, used as a JSON document store
//! - **Tokio** for the runtime and background jobs
//! - **Serde** for request/response and stored documents
//!
//! ## Core Components
//!
//! - [`query`]: filter/pipeline AST compiled to SQL over the documents table
//! - [`store`]: document store (CRUD, guarded atomic updates, aggregation)
//! - [`segments`]: data segment criteria to filter translation
//! - [`pagination`] and [`cache`]: shared listing helpers
//! - [`leads`], [`messaging`], [`export`], [`jobs`]: domain services used by routes
//! - [`routes`]: HTTP handlers
//! - [`middleware`]: auth, rate limiting, request validation, security headers
//! - [`config`], [`db`], [`error`], [`metrics`], [`state`], [`types`]

use axum::extract::DefaultBodyLimit;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::Router;
use tower_http::{compression::CompressionLayer, trace::TraceLayer};

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod export;
pub mod jobs;
pub mod leads;
pub mod messaging;
pub mod metrics;
pub mod middleware;
pub mod pagination;
pub mod query;
pub mod routes;
pub mod segments;
pub mod state;
pub mod store;
pub mod types;

#[cfg(test)]
mod tests;

use state::AppState;

/// Full application router with every middleware layer applied.
pub fn build_app(state: AppState) -> Router {
    let cfg = state.config.clone();
    let api = routes::api_routes()
        .route_layer(from_fn_with_state(state.clone(), middleware::auth::auth_middleware));

    Router::new()
        .merge(routes::public_routes())
        .merge(api)
        .with_state(state)
        .layer(DefaultBodyLimit::max(middleware::validation::max_body_size()))
        .layer(from_fn(middleware::validation::validate_request_middleware))
        .layer(from_fn(middleware::rate_limit::rate_limit_middleware))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(from_fn_with_state(cfg, middleware::security_headers::security_headers_middleware))
}
