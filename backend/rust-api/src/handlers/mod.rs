use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose, Engine as _};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::metrics;
use crate::services::AppState;

pub mod storage;

#[derive(Debug, Serialize)]
struct DependencyHealth {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    backend: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'static str>,
}

impl DependencyHealth {
    fn healthy() -> Self {
        Self {
            status: "healthy",
            backend: None,
            error: None,
        }
    }

    fn unhealthy(error: &'static str) -> Self {
        Self {
            status: "unhealthy",
            backend: None,
            error: Some(error),
        }
    }

    fn is_healthy(&self) -> bool {
        self.status != "unhealthy"
    }
}

/// Pings MongoDB and Redis when the process is connected to them and reports
/// which blob backend serves files. Blob storage itself is not probed: the
/// filesystem backend resolves its root lazily.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut dependencies = BTreeMap::new();

    if let Some(mongo) = &state.mongo {
        dependencies.insert("mongodb", check_mongodb(mongo).await);
    }
    if let Some(redis) = &state.redis {
        dependencies.insert("redis", check_redis(redis).await);
    }
    dependencies.insert(
        "file_storage",
        DependencyHealth {
            status: "configured",
            backend: Some(state.files.blob_backend()),
            error: None,
        },
    );

    let (status_code, status) = if dependencies.values().all(DependencyHealth::is_healthy) {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status_code,
        Json(json!({
            "status": status,
            "service": "submissions-api",
            "version": env!("CARGO_PKG_VERSION"),
            "dependencies": dependencies
        })),
    )
}

async fn check_mongodb(mongo: &mongodb::Database) -> DependencyHealth {
    let ping = mongo.run_command(mongodb::bson::doc! { "ping": 1 });
    match tokio::time::timeout(Duration::from_secs(1), ping).await {
        Ok(Ok(_)) => DependencyHealth::healthy(),
        Ok(Err(e)) => {
            tracing::warn!("MongoDB health check failed: {}", e);
            DependencyHealth::unhealthy("MongoDB ping failed")
        }
        Err(_) => DependencyHealth::unhealthy("MongoDB timeout after 1s"),
    }
}

async fn check_redis(redis: &redis::aio::ConnectionManager) -> DependencyHealth {
    let mut conn = redis.clone();
    let ping = redis::cmd("PING");
    match tokio::time::timeout(
        Duration::from_millis(500),
        ping.query_async::<String>(&mut conn),
    )
    .await
    {
        Ok(Ok(_)) => DependencyHealth::healthy(),
        Ok(Err(e)) => {
            tracing::warn!("Redis health check failed: {}", e);
            DependencyHealth::unhealthy("Redis ping failed")
        }
        Err(_) => DependencyHealth::unhealthy("Redis timeout after 500ms"),
    }
}

pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::render_metrics() {
        Ok(metrics_text) => (StatusCode::OK, metrics_text),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to render metrics: {}", e),
        ),
    }
}

/// Protects /metrics with HTTP Basic Auth (`METRICS_AUTH=user:password`).
pub async fn metrics_auth_middleware(
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let encoded = auth_header
        .strip_prefix("Basic ")
        .ok_or(StatusCode::UNAUTHORIZED)?;
    let decoded = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;
    let credentials = String::from_utf8(decoded).map_err(|_| StatusCode::UNAUTHORIZED)?;

    let expected = std::env::var("METRICS_AUTH").map_err(|_| {
        tracing::warn!("METRICS_AUTH is not set; refusing metrics scrape");
        StatusCode::UNAUTHORIZED
    })?;

    if credentials != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(request).await)
}
