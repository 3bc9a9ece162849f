//! Integration and unit tests for the admitdesk backend.
//!
//! ## Test Modules
//!
//! - **api_tests**: users, leads, applications and promocodes through the full router
//! - **admissions_api_tests**: documents, scholarships, interviews, segments, dashboard, jobs
//! - **health_api_tests**: operational endpoints and response headers
//! - **error_tests**: error mapping and field validation helpers
//! - **config_tests**: configuration loading and validation
//! - **db_tests**: schema and document store operations
//!
//! Run a single module with `cargo test api_tests`.

pub mod api_tests;
pub mod config_tests;
pub mod health_api_tests;

#[cfg(test)]
pub mod support {
    use axum::{
        body::Body,
        http::{header, Method, Request, StatusCode},
        Router,
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
    use tower::ServiceExt;

    use crate::config::{AppConfig, SecurityConfig};
    use crate::state::AppState;

    pub const ADMIN_TOKEN: &str = "platform-admin-token-for-tests";
    pub const COLLEGE: &str = "college-north";

    /// Single-connection in-memory database; the connection must never be recycled.
    pub async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::db::init_db(&pool).await.unwrap();
        pool
    }

    pub fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.security = Some(SecurityConfig { admin_token: Some(ADMIN_TOKEN.to_string()), ..Default::default() });
        config
    }

    pub struct TestApp {
        pub app: Router,
        pub state: AppState,
        /// Token of a college admin of [`COLLEGE`].
        pub admin: String,
    }

    impl TestApp {
        pub async fn new() -> Self {
            Self::with_state(AppState::new(memory_pool().await, test_config())).await
        }

        pub async fn with_state(state: AppState) -> Self {
            let app = crate::build_app(state.clone());
            let mut test_app = Self { app, state, admin: String::new() };
            let (_, token) = test_app.create_user(ADMIN_TOKEN, "Principal Office", "office@north.edu", "college_admin", Some(COLLEGE)).await;
            test_app.admin = token;
            test_app
        }

        pub async fn request(&self, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
            let (status, _, body) = self.raw_request(method, uri, token, body).await;
            let value = serde_json::from_slice(&body).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()));
            (status, value)
        }

        pub async fn raw_request(
            &self,
            method: Method,
            uri: &str,
            token: Option<&str>,
            body: Option<Value>,
        ) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
            let mut builder = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
            }
            let request = match body {
                Some(body) => builder
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(serde_json::to_vec(&body).unwrap()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };
            let response = self.app.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let headers = response.headers().clone();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            (status, headers, bytes.to_vec())
        }

        pub async fn get(&self, uri: &str, token: &str) -> (StatusCode, Value) {
            self.request(Method::GET, uri, Some(token), None).await
        }

        pub async fn post(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
            self.request(Method::POST, uri, Some(token), Some(body)).await
        }

        pub async fn put(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
            self.request(Method::PUT, uri, Some(token), Some(body)).await
        }

        /// Returns `(user_id, token)`.
        pub async fn create_user(&self, token: &str, name: &str, email: &str, role: &str, college: Option<&str>) -> (String, String) {
            let (status, body) = self
                .post("/users", token, json!({ "name": name, "email": email, "role": role, "college_id": college }))
                .await;
            assert_eq!(status, StatusCode::CREATED, "create user failed: {}", body);
            (body["id"].as_str().unwrap().to_string(), body["token"].as_str().unwrap().to_string())
        }

        pub async fn create_student(&self, token: &str, body: Value) -> Value {
            let (status, body) = self.post("/students", token, body).await;
            assert_eq!(status, StatusCode::CREATED, "create student failed: {}", body);
            body["data"].clone()
        }

        /// A lead with unique contact details derived from `n`.
        pub async fn lead(&self, n: u32, state_code: &str, course: &str) -> Value {
            self.create_student(
                &self.admin,
                json!({
                    "name": format!("Student {}", n),
                    "email": format!("student{}@mail.test", n),
                    "mobile": format!("98765{:05}", n),
                    "state_code": state_code,
                    "city": "Pune",
                    "course_name": course,
                }),
            )
            .await
        }

        pub async fn application(&self, student_id: &str, course: &str, fee: f64) -> Value {
            let (status, body) = self
                .post("/applications", &self.admin, json!({ "student_id": student_id, "course_name": course, "fee": fee }))
                .await;
            assert_eq!(status, StatusCode::CREATED, "create application failed: {}", body);
            body["data"].clone()
        }

        /// Creates an application, pays the full fee and submits it.
        pub async fn submitted_application(&self, student_id: &str, course: &str) -> String {
            let app = self.application(student_id, course, 500.0).await;
            let id = app["_id"].as_str().unwrap().to_string();
            let (status, body) = self
                .post(&format!("/applications/{}/payment", id), &self.admin, json!({ "amount": 500.0, "reference": "TXN-1" }))
                .await;
            assert_eq!(status, StatusCode::OK, "payment failed: {}", body);
            let (status, body) = self.post(&format!("/applications/{}/submit", id), &self.admin, json!({})).await;
            assert_eq!(status, StatusCode::OK, "submit failed: {}", body);
            id
        }
    }

    pub fn id_of(doc: &Value) -> String {
        doc["_id"].as_str().unwrap().to_string()
    }
}
