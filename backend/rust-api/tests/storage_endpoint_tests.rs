mod common;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use chrono::Duration;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use common::{create_test_app, create_test_app_with};

async fn send(
    router: &Router,
    method: Method,
    uri: &str,
    content_type: Option<&str>,
    body: Vec<u8>,
) -> axum::response::Response {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(content_type) = content_type {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }

    router
        .clone()
        .oneshot(builder.body(Body::from(body)).unwrap())
        .await
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

#[tokio::test]
async fn test_upload_then_download_over_http() {
    let app = create_test_app();
    let key = "u1-problem7-att1";

    let upload_url = app.files.request_upload_url(key, "image/png").await.unwrap();
    let response = send(
        &app.router,
        Method::PUT,
        &upload_url,
        Some("image/png"),
        b"\x89PNG".to_vec(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let download_url = app.files.request_download_url(key).await.unwrap().unwrap();
    assert_eq!(download_url, upload_url);

    let response = send(&app.router, Method::GET, &download_url, None, Vec::new()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
    assert_eq!(response.headers()[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
    assert!(response.headers().contains_key("x-trace-id"));
    assert!(!response.headers().contains_key(header::CONTENT_DISPOSITION));
    assert_eq!(body_bytes(response).await, b"\x89PNG");
}

#[tokio::test]
async fn test_post_upload_is_accepted() {
    let app = create_test_app();
    let key = "posted";

    let upload_url = app.files.request_upload_url(key, "text/plain").await.unwrap();
    let response = send(
        &app.router,
        Method::POST,
        &upload_url,
        Some("text/plain"),
        b"hello".to_vec(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_composite_key_download_sets_filename() {
    let app = create_test_app();
    let key = "abc|my report.pdf";

    let upload_url = app.files.request_upload_url(key, "application/pdf").await.unwrap();
    assert_eq!(upload_url, "/storage/abc|my%20report.pdf/");

    let response = send(
        &app.router,
        Method::PUT,
        &upload_url,
        Some("application/pdf"),
        b"%PDF".to_vec(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let download_url = app.files.request_download_url(key).await.unwrap().unwrap();
    let response = send(&app.router, Method::GET, &download_url, None, Vec::new()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"my report.pdf\"; filename*=UTF-8''my%20report.pdf"
    );
}

#[tokio::test]
async fn test_missing_content_type_falls_back_to_octet_stream() {
    let app = create_test_app();
    let key = "untyped";

    let upload_url = app.files.request_upload_url(key, "").await.unwrap();
    let response = send(&app.router, Method::PUT, &upload_url, None, b"raw".to_vec()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let download_url = app.files.request_download_url(key).await.unwrap().unwrap();
    let response = send(&app.router, Method::GET, &download_url, None, Vec::new()).await;
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/octet-stream"
    );
}

#[tokio::test]
async fn test_upload_without_grant_is_forbidden() {
    let app = create_test_app();

    let response = send(
        &app.router,
        Method::PUT,
        "/storage/never-granted/",
        Some("text/plain"),
        b"sneaky".to_vec(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["message"], "Access denied");
}

#[tokio::test]
async fn test_expired_download_grant_is_forbidden() {
    let app = create_test_app();
    let key = "expiring";

    let upload_url = app.files.request_upload_url(key, "text/plain").await.unwrap();
    send(&app.router, Method::PUT, &upload_url, Some("text/plain"), b"x".to_vec()).await;
    let download_url = app.files.request_download_url(key).await.unwrap().unwrap();

    app.clock.advance(Duration::seconds(61));

    let response = send(&app.router, Method::GET, &download_url, None, Vec::new()).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_removed_content_looks_like_denied_access() {
    let app = create_test_app();
    let key = "gone";

    let upload_url = app.files.request_upload_url(key, "text/plain").await.unwrap();
    send(&app.router, Method::PUT, &upload_url, Some("text/plain"), b"x".to_vec()).await;
    let download_url = app.files.request_download_url(key).await.unwrap().unwrap();
    app.files.remove_blob(key).await.unwrap();

    let response = send(&app.router, Method::GET, &download_url, None, Vec::new()).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["message"], "Access denied");
}

#[tokio::test]
async fn test_oversized_upload_is_rejected() {
    let app = create_test_app_with(|settings| settings.max_upload_bytes = 16);
    let key = "too-big";

    let upload_url = app.files.request_upload_url(key, "text/plain").await.unwrap();
    let response = send(
        &app.router,
        Method::PUT,
        &upload_url,
        Some("text/plain"),
        vec![b'x'; 64],
    )
    .await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(app.files.request_download_url(key).await.unwrap(), None);
}

#[tokio::test]
async fn test_missing_root_is_server_error() {
    let app = create_test_app_with(|settings| settings.root_directory = None);
    let key = "no-root";

    let upload_url = app.files.request_upload_url(key, "text/plain").await.unwrap();
    let response = send(&app.router, Method::PUT, &upload_url, Some("text/plain"), b"x".to_vec()).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["message"], "File storage unavailable");
}

#[tokio::test]
async fn test_health_reports_file_storage_backend() {
    let app = create_test_app();

    let response = send(&app.router, Method::GET, "/health", None, Vec::new()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["dependencies"]["file_storage"]["backend"], "filesystem");
}

#[tokio::test]
async fn test_metrics_require_basic_auth() {
    let app = create_test_app();

    let response = send(&app.router, Method::GET, "/metrics", None, Vec::new()).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
