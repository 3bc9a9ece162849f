use axum::{
    extract::Request,
    http::{Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::AppError;

pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Request body limit, `ADMITDESK_MAX_BODY_SIZE` clamped to 1..=50 MiB.
pub fn max_body_size() -> usize {
    std::env::var("ADMITDESK_MAX_BODY_SIZE")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(DEFAULT_MAX_BODY_SIZE)
        .clamp(1024 * 1024, 50 * 1024 * 1024)
}

/// Rejects traversal patterns in the URI and oversized bodies before routing, and
/// logs known scanner user agents.
pub async fn validate_request_middleware(req: Request, next: Next) -> Response {
    if contains_path_traversal(req.uri().path()) {
        return AppError::BadRequest("Path traversal detected in request".to_string()).into_response();
    }

    if let Some(ua_str) = req.headers().get("user-agent").and_then(|ua| ua.to_str().ok()) {
        if is_suspicious_user_agent(ua_str) {
            tracing::warn!("Suspicious user agent detected: {}", sanitize_for_logging(ua_str));
        }
    }

    // DefaultBodyLimit also applies; this rejects before the body is read
    if matches!(req.method(), &Method::POST | &Method::PUT) {
        let length = req
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        let limit = max_body_size();
        if let Some(length) = length.filter(|l| *l > limit) {
            tracing::debug!(length, limit, "request body too large");
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({
                    "error": {
                        "code": "PAYLOAD_TOO_LARGE",
                        "message": format!("Request body exceeds maximum size of {} bytes", limit),
                    },
                    "status": 413,
                })),
            )
                .into_response();
        }
    }

    next.run(req).await
}

fn contains_path_traversal(path: &str) -> bool {
    let lower = path.to_lowercase();

    if path.contains("/..") || path.contains("\\..") || path.starts_with("..") {
        return true;
    }
    if path.contains("/./") || path.contains("\\.\\") || path.contains("....") {
        return true;
    }

    // single and double URL-encoded variants
    const ENCODED_PATTERNS: [&str; 11] = [
        "%2e%2e", "%252e%252e", "%2e/", "%252e%2f", "/%2e", "%2f%2e", "%2e\\", "%2e%5c", "%5c%2e", "%5c%5c", "%00",
    ];
    if ENCODED_PATTERNS.iter().any(|p| lower.contains(p)) {
        return true;
    }

    path.contains('\0')
}

fn is_suspicious_user_agent(ua: &str) -> bool {
    let ua_lower = ua.to_lowercase();
    ua_lower.contains("scanner")
        || (ua_lower.contains("crawler") && !ua_lower.contains("googlebot") && !ua_lower.contains("bingbot"))
        || ua_lower.contains("nikto")
        || ua_lower.contains("sqlmap")
        || ua_lower.contains("havij")
        || ua_lower.contains("acunetix")
}

/// Strips control characters, escapes quotes and truncates to 200 characters.
pub fn sanitize_for_logging(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .take(200)
        .collect::<String>()
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\'', "\\\'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_traversal_detection() {
        assert!(contains_path_traversal("../etc/passwd"));
        assert!(contains_path_traversal("/students/../users"));
        assert!(contains_path_traversal("/students/%2e%2e/users"));
        assert!(contains_path_traversal("/students\0"));

        assert!(!contains_path_traversal("/students/64b7f0c2a1b2c3d4e5f60718"));
        assert!(!contains_path_traversal("/data-segments/preview"));
    }

    #[test]
    fn test_suspicious_user_agents() {
        assert!(is_suspicious_user_agent("nikto/2.1.5"));
        assert!(is_suspicious_user_agent("sqlmap/1.0"));
        assert!(!is_suspicious_user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64)"));
        assert!(!is_suspicious_user_agent("Googlebot/2.1"));
    }

    #[test]
    fn test_sanitize_for_logging() {
        assert_eq!(sanitize_for_logging("normal text"), "normal text");
        let sanitized = sanitize_for_logging("text\x00with\x01control");
        assert!(!sanitized.contains('\x00'));
        assert!(!sanitized.contains('\x01'));
        assert_eq!(sanitize_for_logging(&"a".repeat(300)).len(), 200);
    }

    #[test]
    fn body_limit_is_clamped() {
        assert!(max_body_size() >= 1024 * 1024);
        assert!(max_body_size() <= 50 * 1024 * 1024);
    }
}
