// ABOUTME: Compute engine contract: fetch the original, transform, persist, deliver
// ABOUTME: Inline response within the size limit, redirect to storage above it

use crate::storage::{PutObject, StorageError};
use crate::transform::{self, Rendered, TransformError};
use crate::AppState;
use axum::{
    body::Body,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use bytes::Bytes;
use image_edge::{CanonicalKey, KeyError, MARKER_HEADER, PROTOCOL_VERSION};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{info, warn};

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("missing shared secret")]
    MissingSecret,

    #[error("invalid shared secret")]
    InvalidSecret,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("malformed variant key: {0}")]
    BadKey(#[from] KeyError),

    #[error("image not found")]
    NotFound,

    #[error("{0}")]
    Transform(#[from] TransformError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("output of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("image transformation timed out")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::MissingSecret => StatusCode::UNAUTHORIZED,
            EngineError::InvalidSecret => StatusCode::FORBIDDEN,
            EngineError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            EngineError::BadKey(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound => StatusCode::NOT_FOUND,
            EngineError::Transform(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::Storage(_) | EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            EngineError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound => EngineError::NotFound,
            StorageError::Backend(msg) => EngineError::Storage(msg),
        }
    }
}

// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let mut resp = (
            self.status_code(),
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response();
        let headers = resp.headers_mut();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        headers.insert(MARKER_HEADER, HeaderValue::from_static(PROTOCOL_VERSION));
        if matches!(self, EngineError::MethodNotAllowed) {
            headers.insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
        }
        resp
    }
}

/// Stage durations for `Server-Timing`
#[derive(Debug, Clone, Copy, Default)]
pub struct Timings {
    pub download: Duration,
    pub transform: Duration,
    pub upload: Option<Duration>,
}

impl Timings {
    pub fn server_timing(&self) -> String {
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;
        let mut parts = vec![
            format!("download;dur={:.1}", ms(self.download)),
            format!("transform;dur={:.1}", ms(self.transform)),
        ];
        if let Some(upload) = self.upload {
            parts.push(format!("upload;dur={:.1}", ms(upload)));
        }
        parts.join(", ")
    }
}

/// One computed variant, ready to deliver
#[derive(Debug, Clone)]
pub struct Variant {
    pub key: CanonicalKey,
    pub bytes: Bytes,
    pub content_type: String,
    /// Hex sha256 of `bytes`
    pub sha256: String,
    /// Written to the transformed bucket
    pub persisted: bool,
    pub timings: Timings,
}

/// Fetch the original behind `key`, produce the variant and persist it
pub async fn compute_variant(state: Arc<AppState>, key: CanonicalKey) -> Result<Variant, EngineError> {
    let config = &state.config;
    let (_, descriptor) = key.decompose()?;
    let source_name = key.source_object_name()?;

    let started = Instant::now();
    let source = state.store.get(&config.original_bucket, &source_name).await?;
    let download = started.elapsed();

    let started = Instant::now();
    let (bytes, content_type) = if key.is_original() {
        let content_type = source
            .content_type
            .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string());
        (source.bytes, content_type)
    } else {
        let input = source.bytes;
        let Rendered { bytes, format } =
            tokio::task::spawn_blocking(move || transform::render(&input, &descriptor))
                .await
                .map_err(|e| EngineError::Internal(format!("transform task failed: {}", e)))??;
        let content_type = format.content_type().unwrap_or(FALLBACK_CONTENT_TYPE).to_string();
        (Bytes::from(bytes), content_type)
    };
    let transform = started.elapsed();

    let sha256 = hex::encode(Sha256::digest(&bytes));

    let mut timings = Timings {
        download,
        transform,
        upload: None,
    };
    let mut persisted = false;
    if let Some(bucket) = &config.transformed_bucket {
        let started = Instant::now();
        let object = PutObject {
            bucket: bucket.clone(),
            name: key.object_name()?,
            bytes: bytes.clone(),
            content_type: content_type.clone(),
            cache_control: config.cache_control(),
            metadata: stored_metadata(&source_name, &sha256, config.transformed_ttl_days),
        };
        match state.store.put(object).await {
            Ok(()) => {
                persisted = true;
                timings.upload = Some(started.elapsed());
            }
            Err(e) => warn!(key = %key, error = %e, "Failed to persist variant"),
        }
    }

    info!(
        key = %key,
        size = bytes.len(),
        content_type = %content_type,
        persisted,
        "Computed variant"
    );

    Ok(Variant {
        key,
        bytes,
        content_type,
        sha256,
        persisted,
        timings,
    })
}

fn stored_metadata(source_path: &str, sha256: &str, ttl_days: u64) -> HashMap<String, String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let expires_at = now.saturating_add(ttl_days.saturating_mul(24 * 60 * 60));

    let mut metadata = HashMap::new();
    metadata.insert("expires-at".to_string(), expires_at.to_string());
    metadata.insert("source-path".to_string(), source_path.to_string());
    metadata.insert("sha256".to_string(), sha256.to_string());
    metadata
}

/// Inline within `max_output_bytes`; above it, redirect to the stored copy
pub fn deliver(state: &AppState, variant: Variant) -> Result<Response, EngineError> {
    let config = &state.config;
    let size = variant.bytes.len();

    let mut resp = if size <= config.max_output_bytes {
        let mut resp = Response::new(Body::from(variant.bytes));
        *resp.status_mut() = StatusCode::OK;
        let headers = resp.headers_mut();
        insert_header(headers, header::CONTENT_TYPE, &variant.content_type);
        insert_header(headers, header::CACHE_CONTROL, &config.cache_control());
        insert_header(headers, header::ETAG, &format!("\"{}\"", variant.sha256));
        resp
    } else if variant.persisted {
        let location = variant.key.redirect_target()?;
        info!(key = %variant.key, size, location = %location, "Variant too large, redirecting");
        let mut resp = Response::new(Body::empty());
        *resp.status_mut() = StatusCode::FOUND;
        let headers = resp.headers_mut();
        insert_header(headers, header::LOCATION, &location);
        insert_header(headers, header::CACHE_CONTROL, "private, no-store");
        resp
    } else {
        return Err(EngineError::TooLarge {
            size,
            max: config.max_output_bytes,
        });
    };

    let headers = resp.headers_mut();
    headers.insert(MARKER_HEADER, HeaderValue::from_static(PROTOCOL_VERSION));
    if config.log_timing {
        insert_header(headers, "server-timing", &variant.timings.server_timing());
    }
    Ok(resp)
}

fn insert_header<K>(headers: &mut axum::http::HeaderMap, name: K, value: &str)
where
    K: axum::http::header::IntoHeaderName,
{
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_timing() {
        let timings = Timings {
            download: Duration::from_millis(12),
            transform: Duration::from_micros(3400),
            upload: None,
        };
        assert_eq!(timings.server_timing(), "download;dur=12.0, transform;dur=3.4");

        let timings = Timings {
            upload: Some(Duration::from_millis(7)),
            ..timings
        };
        assert!(timings.server_timing().ends_with(", upload;dur=7.0"));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(EngineError::MissingSecret.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(EngineError::InvalidSecret.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(EngineError::BadKey(KeyError::MissingVariant).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(EngineError::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            EngineError::Transform(TransformError::Decode("bad".into())).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(EngineError::from(StorageError::NotFound).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            EngineError::from(StorageError::Backend("down".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(EngineError::Timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_stored_metadata() {
        let metadata = stored_metadata("cat.png", "abc", 90);
        assert_eq!(metadata["source-path"], "cat.png");
        assert_eq!(metadata["sha256"], "abc");
        let expires: u64 = metadata["expires-at"].parse().unwrap();
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        assert!(expires >= now + 89 * 86400);
    }
}
