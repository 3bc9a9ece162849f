#[cfg(test)]
mod tests {
    use axum::http::{header, Method, StatusCode};
    use serde_json::json;

    use crate::tests::support::TestApp;

    #[tokio::test]
    async fn test_healthz_endpoint() {
        let app = TestApp::new().await;
        let (status, _, body) = app.raw_request(Method::GET, "/healthz", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_readyz_endpoint_ok() {
        let app = TestApp::new().await;
        let (status, _, body) = app.raw_request(Method::GET, "/readyz", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"ready");
    }

    #[tokio::test]
    async fn test_version_endpoint() {
        let app = TestApp::new().await;
        let (status, v) = app.request(Method::GET, "/version", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(v["name"], "admitdesk");
        assert!(!v["version"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_metrics_count_created_leads() {
        let app = TestApp::new().await;
        app.lead(1, "MH", "B.Tech").await;
        app.lead(2, "MH", "B.Tech").await;

        let (status, v) = app.request(Method::GET, "/metrics", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(v["leads_created"], 2);

        let (status, headers, body) = app.raw_request(Method::GET, "/metrics/prometheus", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers.get(header::CONTENT_TYPE).unwrap().to_str().unwrap().starts_with("text/plain"));
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("admitdesk_leads_created 2"));
    }

    #[tokio::test]
    async fn test_security_headers_present() {
        let app = TestApp::new().await;
        let (_, headers, _) = app.raw_request(Method::GET, "/healthz", None, None).await;
        assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
        assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
        assert_eq!(headers.get("referrer-policy").unwrap(), "no-referrer");
        assert!(headers.get(header::CACHE_CONTROL).is_none());

        // JSON payloads carry student data and must not be cached
        let (_, headers, _) = app.raw_request(Method::GET, "/students", Some(&app.admin), None).await;
        assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), "no-store");
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let app = TestApp::new().await;
        let (status, _) = app.request(Method::GET, "/students/%2e%2e/secret", Some(&app.admin), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_malformed_json_is_a_validation_error() {
        let app = TestApp::new().await;
        let (status, body) = app.post("/students", &app.admin, json!({ "name": "Missing contact" })).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(body["error"]["details"]["field"], "body");
    }
}
