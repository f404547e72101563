use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Client, Method, Response, StatusCode};
use sha2::{Digest, Sha256};
use url::Url;

use crate::config::ObjectStorageSettings;
use crate::error::FileUploadError;
use crate::metrics::track_blob_operation;
use crate::services::blob_store::{BlobStore, StoredBlob};
use crate::services::file_keys::FileKey;

type HmacSha256 = Hmac<Sha256>;

const AWS_URI_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const CONTENT_OBJECT: &str = "content";

/// S3-compatible blob store. Objects live at
/// `<prefix>/<file bucket>/<logical key>/content` inside the storage bucket.
#[derive(Clone, Debug)]
pub struct ObjectStorageClient {
    bucket: String,
    region: String,
    endpoint: Url,
    access_key: String,
    secret_key: String,
    prefix: String,
    file_bucket: String,
    http: Client,
}

impl ObjectStorageClient {
    pub fn new(settings: ObjectStorageSettings, file_bucket: &str) -> Result<Self> {
        let endpoint = settings
            .endpoint
            .unwrap_or_else(|| "https://storage.yandexcloud.net".to_string());

        let endpoint = Url::parse(&endpoint).context("Invalid object storage endpoint URL")?;
        if endpoint.host_str().is_none() {
            bail!("Object storage endpoint must include a host");
        }

        // Enforce HTTPS in production mode (check APP_ENV at runtime)
        let app_env = std::env::var("APP_ENV").unwrap_or_else(|_| "prod".to_string());
        if app_env == "prod" && endpoint.scheme() != "https" {
            bail!(
                "Object storage endpoint must use HTTPS in production mode. Got: {}",
                endpoint.scheme()
            );
        }

        if endpoint.scheme() != "https" && endpoint.scheme() != "http" {
            bail!(
                "Invalid endpoint scheme: {}. Must be http or https.",
                endpoint.scheme()
            );
        }

        let file_bucket = sanitize_prefix(file_bucket);
        if file_bucket.is_empty() {
            bail!("File upload bucket name must not be empty");
        }

        Ok(Self {
            bucket: settings.bucket,
            region: settings.region,
            access_key: settings.access_key,
            secret_key: settings.secret_key,
            endpoint,
            prefix: sanitize_prefix(&settings.prefix),
            file_bucket,
            http: Client::new(),
        })
    }

    fn object_key(&self, key: &FileKey) -> String {
        self.full_key(&format!(
            "{}/{}/{}",
            self.file_bucket,
            key.logical_key(),
            CONTENT_OBJECT
        ))
    }

    fn full_key(&self, key: &str) -> String {
        let cleaned = key.trim_matches('/');
        if self.prefix.is_empty() {
            cleaned.to_string()
        } else if cleaned.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}/{}", self.prefix, cleaned)
        }
    }

    fn canonical_uri(&self, key: &str) -> String {
        let encoded_key = key
            .split('/')
            .map(|segment| utf8_percent_encode(segment, AWS_URI_ENCODE_SET).to_string())
            .collect::<Vec<_>>()
            .join("/");

        format!("/{}/{}", self.bucket, encoded_key)
    }

    /// Send one SigV4-signed request for `object_key`.
    async fn send_signed(
        &self,
        method: Method,
        object_key: &str,
        body: Option<(Vec<u8>, &str)>,
    ) -> Result<Response> {
        let canonical_uri = self.canonical_uri(object_key);
        let payload: &[u8] = body.as_ref().map(|(bytes, _)| bytes.as_slice()).unwrap_or(&[]);
        let payload_hash = hex::encode(Sha256::digest(payload));

        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();
        let scope = format!("{}/{}/s3/aws4_request", date_stamp, self.region);

        let host = self.host_header()?;

        let canonical_headers = format!(
            "host:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n",
            host, payload_hash, amz_date
        );
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";

        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let hashed_canonical_request = hex::encode(Sha256::digest(canonical_request.as_bytes()));
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date, scope, hashed_canonical_request
        );

        let signing_key = derive_signing_key(&self.secret_key, &date_stamp, &self.region, "s3")?;
        let signature = hex::encode(hmac_sign(&signing_key, string_to_sign.as_bytes())?);

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key, scope, signed_headers, signature
        );

        let mut url = self.endpoint.clone();
        url.set_path(&canonical_uri);

        let mut request = self
            .http
            .request(method, url)
            .header("Authorization", authorization)
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", payload_hash);

        if let Some((bytes, content_type)) = body {
            request = request.header("content-type", content_type).body(bytes);
        }

        request
            .send()
            .await
            .with_context(|| format!("Object storage request failed for {}", object_key))
    }

    /// Host header value, including a non-default port.
    fn host_header(&self) -> Result<String> {
        let host = self
            .endpoint
            .host_str()
            .ok_or_else(|| anyhow!("Object storage endpoint missing host"))?
            .to_lowercase();

        Ok(match self.endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host,
        })
    }
}

fn storage_error(e: anyhow::Error) -> FileUploadError {
    FileUploadError::ObjectStorage(format!("{:#}", e))
}

#[async_trait]
impl BlobStore for ObjectStorageClient {
    fn backend_name(&self) -> &'static str {
        "s3"
    }

    async fn exists(&self, key: &FileKey) -> Result<bool, FileUploadError> {
        let object_key = self.object_key(key);

        track_blob_operation("exists", async {
            let response = self
                .send_signed(Method::HEAD, &object_key, None)
                .await
                .map_err(storage_error)?;

            match response.status() {
                status if status.is_success() => Ok(true),
                StatusCode::NOT_FOUND => Ok(false),
                status => Err(FileUploadError::ObjectStorage(format!(
                    "HEAD {} returned {}",
                    object_key, status
                ))),
            }
        })
        .await
    }

    async fn write(&self, key: &FileKey, blob: StoredBlob) -> Result<(), FileUploadError> {
        let object_key = self.object_key(key);
        let content_type = blob.content_type_or_default().to_string();

        track_blob_operation("write", async {
            self.send_signed(
                Method::PUT,
                &object_key,
                Some((blob.content, content_type.as_str())),
            )
            .await
            .and_then(|response| {
                response
                    .error_for_status()
                    .context("Object storage upload returned error status")
            })
            .map_err(storage_error)?;

            Ok(())
        })
        .await?;

        tracing::debug!(key = key.logical_key(), object_key = %object_key, "Uploaded object");
        Ok(())
    }

    async fn read(&self, key: &FileKey) -> Result<StoredBlob, FileUploadError> {
        let object_key = self.object_key(key);

        track_blob_operation("read", async {
            let response = self
                .send_signed(Method::GET, &object_key, None)
                .await
                .map_err(storage_error)?;

            if response.status() == StatusCode::NOT_FOUND {
                return Err(FileUploadError::NotFound {
                    key: key.logical_key().to_string(),
                });
            }

            let response = response
                .error_for_status()
                .context("Object storage download returned error status")
                .map_err(storage_error)?;

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.to_string());

            let content = response
                .bytes()
                .await
                .context("Failed to read object body")
                .map_err(storage_error)?;

            Ok(StoredBlob {
                content: content.to_vec(),
                content_type,
            })
        })
        .await
    }

    async fn remove(&self, key: &FileKey) -> Result<(), FileUploadError> {
        let object_key = self.object_key(key);

        track_blob_operation("remove", async {
            let response = self
                .send_signed(Method::DELETE, &object_key, None)
                .await
                .map_err(storage_error)?;

            // S3 answers 204 for missing keys; some compatible stores answer 404.
            match response.status() {
                status if status.is_success() => Ok(()),
                StatusCode::NOT_FOUND => Ok(()),
                status => Err(FileUploadError::ObjectStorage(format!(
                    "DELETE {} returned {}",
                    object_key, status
                ))),
            }
        })
        .await
    }
}

fn sanitize_prefix(prefix: &str) -> String {
    prefix
        .trim_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn derive_signing_key(secret: &str, date: &str, region: &str, service: &str) -> Result<Vec<u8>> {
    let mut key = format!("AWS4{}", secret).into_bytes();
    key = hmac_sign(&key, date)?;
    key = hmac_sign(&key, region)?;
    key = hmac_sign(&key, service)?;
    hmac_sign(&key, b"aws4_request")
}

fn hmac_sign(key: &[u8], message: impl AsRef<[u8]>) -> Result<Vec<u8>> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| anyhow!("Invalid HMAC key: {}", e))?;
    mac.update(message.as_ref());
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(endpoint: &str) -> ObjectStorageSettings {
        ObjectStorageSettings {
            bucket: "test".into(),
            region: "ru-central1".into(),
            endpoint: Some(endpoint.into()),
            access_key: "key".into(),
            secret_key: "secret".into(),
            prefix: "uploads".into(),
        }
    }

    #[test]
    #[serial_test::serial]
    fn test_https_required_in_prod() {
        std::env::set_var("APP_ENV", "prod");

        let result = ObjectStorageClient::new(settings("http://insecure.com"), "ora2");
        assert!(result.is_err());
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("HTTPS"));
        assert!(err_msg.contains("production"));

        std::env::remove_var("APP_ENV");
    }

    #[test]
    #[serial_test::serial]
    fn test_http_allowed_in_dev() {
        std::env::set_var("APP_ENV", "dev");

        let result = ObjectStorageClient::new(settings("http://localhost:9000"), "ora2");
        assert!(result.is_ok());

        std::env::remove_var("APP_ENV");
    }

    #[test]
    fn test_invalid_scheme_rejected() {
        let result = ObjectStorageClient::new(settings("ftp://example.com"), "ora2");
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_file_bucket_rejected() {
        let result = ObjectStorageClient::new(settings("https://storage.yandexcloud.net"), "/");
        assert!(result.is_err());
    }

    #[test]
    fn test_object_key_layout_and_encoding() {
        let client =
            ObjectStorageClient::new(settings("https://storage.yandexcloud.net"), "ora2").unwrap();
        let key = FileKey::parse("abc|my file.png").unwrap();

        let object_key = client.object_key(&key);
        assert_eq!(object_key, "uploads/ora2/abc|my file.png/content");
        assert_eq!(
            client.canonical_uri(&object_key),
            "/test/uploads/ora2/abc%7Cmy%20file.png/content"
        );
    }

    #[test]
    fn test_host_header_keeps_custom_port() {
        let client =
            ObjectStorageClient::new(settings("https://minio.internal:9000"), "ora2").unwrap();
        assert_eq!(client.host_header().unwrap(), "minio.internal:9000");
    }

    #[test]
    fn test_signing_key_is_deterministic() {
        let a = derive_signing_key("secret", "20240101", "us-east-1", "s3").unwrap();
        let b = derive_signing_key("secret", "20240101", "us-east-1", "s3").unwrap();
        let c = derive_signing_key("secret", "20240102", "us-east-1", "s3").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }
}
