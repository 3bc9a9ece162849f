use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::error::Error;
use std::fmt;

/// The primary error type for the application.
///
/// Every handler returns [`AppResult`]; the variant decides the HTTP status and the
/// `error.code` field of the JSON body.
#[derive(Debug)]
pub enum AppError {
    /// For internal server errors that are not expected to be handled by the client.
    Internal(anyhow::Error),
    /// For client errors due to invalid requests.
    BadRequest(String),
    /// For when a requested route-level resource is not found.
    NotFound(String),
    /// For when a document referenced by id does not exist in its collection.
    DataNotFound(String),
    /// For identifiers that are not 24-character hex object ids.
    InvalidObjectId(String),
    /// For when a request conflicts with the current state of the server.
    Conflict(String),
    /// For when a service is temporarily unavailable.
    ServiceUnavailable(String),
    /// For errors related to database operations.
    Database(String),
    /// For when user input is invalid.
    InvalidInput(String),
    /// For when a request carries no or an unknown credential.
    Unauthorized(String),
    /// For an authenticated principal lacking the permission for an operation.
    Forbidden(String),
    /// Business-rule failures with a human readable message.
    Custom(String),
    /// For when a client has sent too many requests in a given amount of time.
    RateLimited {
        /// The number of seconds to wait before retrying the request.
        retry_after_seconds: u64,
    },
    /// For when a specific field in a request fails validation.
    ValidationError {
        /// The name of the field that failed validation.
        field: String,
        /// A message describing the validation error.
        message: String,
    },
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(e) => write!(f, "Internal error: {}", e),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::DataNotFound(msg) => write!(f, "Data not found: {}", msg),
            AppError::InvalidObjectId(msg) => write!(f, "Invalid object id: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
            AppError::Database(msg) => write!(f, "Database error: {}", msg),
            AppError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            AppError::Custom(msg) => write!(f, "{}", msg),
            AppError::RateLimited { retry_after_seconds } => {
                write!(f, "Rate limited. Retry after {} seconds", retry_after_seconds)
            }
            AppError::ValidationError { field, message } => {
                write!(f, "Validation error on field '{}': {}", field, message)
            }
        }
    }
}

impl Error for AppError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AppError::Internal(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl AppError {
    /// Shorthand for a [`AppError::ValidationError`].
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        AppError::ValidationError { field: field.to_string(), message: message.into() }
    }

    /// The HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Internal(_) | AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::InvalidInput(_) | AppError::Custom(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::NotFound(_) | AppError::DataNotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidObjectId(_) | AppError::ValidationError { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Unauthorized(_) | AppError::Forbidden(_) => StatusCode::UNAUTHORIZED,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error_code, error_message, details) = match self {
            AppError::Internal(e) => {
                let error_id = uuid::Uuid::new_v4();
                tracing::error!(%error_id, "Internal error: {:?}", e);
                (
                    "INTERNAL_ERROR",
                    "An internal server error occurred".to_string(),
                    Some(json!({ "error_id": error_id.to_string() })),
                )
            }
            AppError::BadRequest(msg) => ("BAD_REQUEST", msg, None),
            AppError::NotFound(msg) => ("NOT_FOUND", msg, None),
            AppError::DataNotFound(msg) => ("DATA_NOT_FOUND", msg, None),
            AppError::InvalidObjectId(msg) => ("INVALID_OBJECT_ID", msg, None),
            AppError::Conflict(msg) => ("CONFLICT", msg, None),
            AppError::ServiceUnavailable(msg) => ("SERVICE_UNAVAILABLE", msg, None),
            AppError::Database(msg) => {
                tracing::error!("Database error: {}", msg);
                ("DATABASE_ERROR", "A database error occurred".to_string(), Some(json!({ "details": msg })))
            }
            AppError::InvalidInput(msg) => ("INVALID_INPUT", msg, None),
            AppError::Unauthorized(msg) => ("UNAUTHORIZED", msg, None),
            AppError::Forbidden(msg) => ("FORBIDDEN", msg, None),
            AppError::Custom(msg) => ("CUSTOM_ERROR", msg, None),
            AppError::RateLimited { retry_after_seconds } => (
                "RATE_LIMITED",
                format!("Too many requests. Please retry after {} seconds", retry_after_seconds),
                Some(json!({ "retry_after_seconds": retry_after_seconds })),
            ),
            AppError::ValidationError { field, message } => (
                "VALIDATION_ERROR",
                format!("Validation failed for field '{}'", field),
                Some(json!({ "field": field, "message": message })),
            ),
        };

        let mut body = json!({
            "error": {
                "code": error_code,
                "message": error_message,
            },
            "status": status.as_u16(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        if let Some(details) = details {
            body["error"]["details"] = details;
        }

        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::DataNotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) => {
                AppError::Database(format!("Database error: {}", db_err.message()))
            }
            sqlx::Error::PoolTimedOut => {
                AppError::ServiceUnavailable("Database connection pool timed out".to_string())
            }
            _ => AppError::Database(format!("Database error: {}", err)),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(anyhow::anyhow!("JSON (de)serialization failed: {}", err))
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::validation("body", rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::validation("query", rejection.body_text())
    }
}

impl From<crate::query::QueryError> for AppError {
    fn from(err: crate::query::QueryError) -> Self {
        AppError::InvalidInput(err.to_string())
    }
}

/// A type alias for `Result<T, AppError>`, used throughout the application.
pub type AppResult<T> = Result<T, AppError>;

/// An extension trait for `Option` that provides a convenient way to convert
/// an `Option` to a `Result` with a `DataNotFound` error.
pub trait OptionExt<T> {
    /// Converts `None` into `AppError::DataNotFound("<entity> not found")`.
    fn ok_or_not_found(self, entity: &str) -> AppResult<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, entity: &str) -> AppResult<T> {
        self.ok_or_else(|| AppError::DataNotFound(format!("{} not found", entity)))
    }
}

/// Request field validation helpers shared by the route modules.
pub mod validation {
    use super::*;

    /// Rejects empty (after trimming) or overlong strings and returns the trimmed value.
    pub fn require_text(value: &str, field: &str, max_len: usize) -> AppResult<String> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(AppError::validation(field, format!("{} cannot be empty", field)));
        }
        if trimmed.chars().count() > max_len {
            return Err(AppError::validation(
                field,
                format!("{} must be at most {} characters", field, max_len),
            ));
        }
        if trimmed.contains('\0') {
            return Err(AppError::validation(field, format!("{} contains null characters", field)));
        }
        Ok(trimmed.to_string())
    }

    /// Loose e-mail syntax check: one `@`, non-empty local part, dotted domain.
    pub fn validate_email(email: &str) -> AppResult<String> {
        let email = require_text(email, "email", 254)?.to_lowercase();
        let valid = match email.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && !domain.contains('@')
                    && domain.contains('.')
                    && !domain.starts_with('.')
                    && !domain.ends_with('.')
                    && !email.chars().any(char::is_whitespace)
            }
            None => false,
        };
        if !valid {
            return Err(AppError::validation("email", "Invalid email address"));
        }
        Ok(email)
    }

    /// Mobile numbers: 10 to 15 digits, optionally prefixed with `+`.
    pub fn validate_mobile(mobile: &str) -> AppResult<String> {
        let trimmed = mobile.trim();
        let digits = trimmed.strip_prefix('+').unwrap_or(trimmed);
        if digits.len() < 10 || digits.len() > 15 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(AppError::validation("mobile", "Mobile number must have 10 to 15 digits"));
        }
        Ok(trimmed.to_string())
    }

    /// Finite and strictly positive; returns the value.
    pub fn validate_positive_number(value: f64, field: &str) -> AppResult<f64> {
        if !value.is_finite() || value <= 0.0 {
            return Err(AppError::validation(field, format!("{} must be positive, got {}", field, value)));
        }
        Ok(value)
    }

    /// Counts such as seats or capacity: at least one.
    pub fn validate_count(value: u64, field: &str) -> AppResult<u64> {
        if value == 0 {
            return Err(AppError::validation(field, format!("{} must be at least 1", field)));
        }
        Ok(value)
    }
}
