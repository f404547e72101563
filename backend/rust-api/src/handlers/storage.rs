//! File-serving endpoint behind issued upload/download URLs.
//!
//! `GET {prefix}/{key}/` streams content back when a download grant is live;
//! `PUT`/`POST` on the same path stores the request body when an upload
//! grant is live. The `{key}` segment is the logical key, optionally
//! `storage_key|filename`.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::json;

use crate::error::FileUploadError;
use crate::services::blob_store::StoredBlob;
use crate::services::file_keys::FileKey;
use crate::services::AppState;

/// RFC 5987 `attr-char` set for `filename*`.
const FILENAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

#[derive(Debug)]
pub enum StorageApiError {
    Forbidden,
    Internal,
}

impl From<FileUploadError> for StorageApiError {
    fn from(err: FileUploadError) -> Self {
        if err.is_client_error() {
            // Unknown key, missing content and missing grant look the same
            // from outside.
            tracing::info!("File request rejected: {}", err);
            StorageApiError::Forbidden
        } else {
            tracing::error!("File request failed: {}", err);
            StorageApiError::Internal
        }
    }
}

impl IntoResponse for StorageApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            StorageApiError::Forbidden => (StatusCode::FORBIDDEN, "Access denied"),
            StorageApiError::Internal => {
                (StatusCode::INTERNAL_SERVER_ERROR, "File storage unavailable")
            }
        };

        (status, Json(json!({ "message": message, "status": status.as_u16() }))).into_response()
    }
}

pub async fn serve_file(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Response, StorageApiError> {
    tracing::debug!("Download request for key: {}", key);

    let blob = state.files.authorize_and_read(&key).await?;
    // authorize_and_read already validated the key.
    let file_key = FileKey::parse(&key)?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(blob.content_type_or_default()).unwrap_or_else(|_| {
            HeaderValue::from_static(crate::services::blob_store::DEFAULT_CONTENT_TYPE)
        }),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    if let Some(filename) = file_key.filename() {
        if let Ok(value) = HeaderValue::from_str(&content_disposition(filename)) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
    }

    Ok((StatusCode::OK, headers, blob.content).into_response())
}

pub async fn accept_upload(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, StorageApiError> {
    tracing::debug!("Upload request for key: {} ({} bytes)", key, body.len());

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string());

    let blob = StoredBlob {
        content: body.to_vec(),
        content_type,
    };

    state.files.authorize_and_write(&key, blob).await?;
    Ok(StatusCode::OK)
}

/// `attachment` disposition with an ASCII fallback and the exact UTF-8 name.
fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();

    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        utf8_percent_encode(filename, FILENAME_ENCODE_SET)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_disposition_ascii() {
        assert_eq!(
            content_disposition("report.pdf"),
            "attachment; filename=\"report.pdf\"; filename*=UTF-8''report.pdf"
        );
    }

    #[test]
    fn test_content_disposition_escapes_quotes_and_unicode() {
        let value = content_disposition("отчёт \"v2\".pdf");
        assert!(value.starts_with("attachment; filename=\"_____ _v2_.pdf\""));
        assert!(value.contains("filename*=UTF-8''%D0%BE"));
        assert!(HeaderValue::from_str(&value).is_ok());
    }

    #[test]
    fn test_errors_do_not_leak_details() {
        let denied = StorageApiError::from(FileUploadError::NotFound {
            key: "secret-key".into(),
        });
        assert!(matches!(denied, StorageApiError::Forbidden));

        let internal = StorageApiError::from(FileUploadError::configuration(
            "Undefined file upload root directory setting",
        ));
        assert!(matches!(internal, StorageApiError::Internal));
    }
}
