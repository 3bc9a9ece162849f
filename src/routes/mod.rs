//! HTTP route handlers for the admitdesk API.
//!
//! Each sub-module handles one resource:
//!
//! - `health`: liveness, readiness, metrics and version endpoints (no auth)
//! - `users`: staff accounts and API tokens
//! - `students`: leads, counselor assignment, bulk upload and CSV export
//! - `applications`: application forms, payment and submission
//! - `documents`: document registration and verification (DV)
//! - `templates`: email/SMS/WhatsApp templates
//! - `segments`: saved data segments and segment communication
//! - `scholarships`, `vouchers`, `interviews`: admissions programmes
//! - `dashboard`: aggregated counts
//! - `jobs`: background job status and downloads
//! - `common`: response envelopes and request helpers

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

pub mod applications;
pub mod common;
pub mod dashboard;
pub mod documents;
pub mod health;
pub mod interviews;
pub mod jobs;
pub mod scholarships;
pub mod segments;
pub mod students;
pub mod templates;
pub mod users;
pub mod vouchers;

/// Unauthenticated operational endpoints.
pub fn public_routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/metrics", get(health::metrics))
        .route("/metrics/prometheus", get(health::metrics_prometheus))
        .route("/version", get(health::version))
}

/// Resource endpoints; the caller wraps them in the auth layer.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/users", post(users::create_user).get(users::list_users))
        .route("/users/me", get(users::me))
        .route("/users/{id}", axum::routing::delete(users::delete_user))
        .route("/users/{id}/rotate-token", post(users::rotate_token))
        .route("/students", post(students::create_student).get(students::list_students))
        .route("/students/bulk", post(students::bulk_upload))
        .route("/students/export", get(students::export_students).post(students::export_students_job))
        .route(
            "/students/{id}",
            get(students::get_student).put(students::update_student).delete(students::delete_student),
        )
        .route("/students/{id}/counselor", post(students::assign_counselor))
        .route("/students/{id}/lead-stage", post(students::change_lead_stage))
        .route("/students/{id}/documents", post(documents::register_document))
        .route("/students/{id}/documents/{doc_type}/verify", post(documents::verify_document))
        .route("/dv/queue", get(documents::dv_queue))
        .route("/applications", post(applications::create_application).get(applications::list_applications))
        .route("/applications/{id}", get(applications::get_application).put(applications::update_application))
        .route("/applications/{id}/submit", post(applications::submit_application))
        .route("/applications/{id}/payment", post(applications::record_payment))
        .route("/templates", post(templates::create_template).get(templates::list_templates))
        .route(
            "/templates/{id}",
            get(templates::get_template).put(templates::update_template).delete(templates::delete_template),
        )
        .route("/templates/{id}/preview", post(templates::preview_template))
        .route("/data-segments", post(segments::create_segment).get(segments::list_segments))
        .route("/data-segments/preview", post(segments::preview_segment))
        .route(
            "/data-segments/{id}",
            get(segments::get_segment).put(segments::update_segment).delete(segments::delete_segment),
        )
        .route("/data-segments/{id}/students", get(segments::segment_members))
        .route("/data-segments/{id}/count", get(segments::segment_count))
        .route("/data-segments/{id}/communicate", post(segments::communicate))
        .route("/scholarships", post(scholarships::create_scholarship).get(scholarships::list_scholarships))
        .route(
            "/scholarships/{id}",
            get(scholarships::get_scholarship)
                .put(scholarships::update_scholarship)
                .delete(scholarships::delete_scholarship),
        )
        .route("/scholarships/{id}/allocate", post(scholarships::allocate_scholarship))
        .route("/promocodes", post(vouchers::create_voucher).get(vouchers::list_vouchers))
        .route("/promocodes/apply", post(vouchers::apply_voucher))
        .route(
            "/promocodes/{id}",
            get(vouchers::get_voucher).put(vouchers::update_voucher).delete(vouchers::delete_voucher),
        )
        .route("/interview-slots", post(interviews::create_slot).get(interviews::list_slots))
        .route("/interview-slots/{id}", get(interviews::get_slot).delete(interviews::delete_slot))
        .route("/interview-slots/{id}/book", post(interviews::book_slot))
        .route("/interview-slots/{id}/result", post(interviews::record_result))
        .route("/dashboard/summary", get(dashboard::summary))
        .route("/dashboard/counselors", get(dashboard::counselors))
        .route("/jobs/{id}", get(jobs::get_job).delete(jobs::cancel_job))
        .route("/jobs/{id}/download", get(jobs::download_job))
}
