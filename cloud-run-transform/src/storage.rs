// ABOUTME: Object storage behind a trait: GCS in production, in-memory in tests
// ABOUTME: Reads originals and writes variants with a single-shot upload plus metadata patch

use async_trait::async_trait;
use bytes::Bytes;
use google_cloud_storage::{
    client::Client as GcsClient,
    http::{
        objects::{
            download::Range as DownloadRange,
            get::GetObjectRequest,
            patch::PatchObjectRequest,
            upload::{Media, UploadObjectRequest, UploadType},
            Object,
        },
        Error as GcsError,
    },
};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("object not found")]
    NotFound,

    #[error("storage request failed: {0}")]
    Backend(String),
}

/// An object read back from a bucket
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

/// A complete object to write
#[derive(Debug, Clone)]
pub struct PutObject {
    pub bucket: String,
    pub name: String,
    pub bytes: Bytes,
    pub content_type: String,
    pub cache_control: String,
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, bucket: &str, name: &str) -> Result<StoredObject, StorageError>;

    async fn put(&self, object: PutObject) -> Result<(), StorageError>;
}

pub struct GcsStore {
    client: GcsClient,
}

impl GcsStore {
    pub fn new(client: GcsClient) -> Self {
        Self { client }
    }
}

fn map_gcs_error(e: GcsError) -> StorageError {
    match &e {
        GcsError::Response(resp) if resp.code == 404 => StorageError::NotFound,
        _ => StorageError::Backend(e.to_string()),
    }
}

#[async_trait]
impl ObjectStore for GcsStore {
    async fn get(&self, bucket: &str, name: &str) -> Result<StoredObject, StorageError> {
        let req = GetObjectRequest {
            bucket: bucket.to_string(),
            object: name.to_string(),
            ..Default::default()
        };

        let object = self.client.get_object(&req).await.map_err(map_gcs_error)?;
        let data = self
            .client
            .download_object(&req, &DownloadRange::default())
            .await
            .map_err(map_gcs_error)?;

        Ok(StoredObject {
            bytes: Bytes::from(data),
            content_type: object.content_type,
        })
    }

    async fn put(&self, object: PutObject) -> Result<(), StorageError> {
        let size = object.bytes.len();
        let req = UploadObjectRequest {
            bucket: object.bucket.clone(),
            ..Default::default()
        };
        let upload_type = UploadType::Simple(Media {
            name: object.name.clone().into(),
            content_type: object.content_type.clone().into(),
            content_length: Some(size as u64),
        });

        self.client
            .upload_object(&req, object.bytes, &upload_type)
            .await
            .map_err(map_gcs_error)?;

        // Object is complete at this point; metadata only affects serving headers
        let patch_req = PatchObjectRequest {
            bucket: object.bucket.clone(),
            object: object.name.clone(),
            metadata: Some(Object {
                metadata: Some(object.metadata),
                cache_control: Some(object.cache_control),
                ..Default::default()
            }),
            ..Default::default()
        };
        if let Err(e) = self.client.patch_object(&patch_req).await {
            warn!("Failed to patch metadata for gs://{}/{}: {}", object.bucket, object.name, e);
        }

        info!("Stored {} bytes at gs://{}/{}", size, object.bucket, object.name);
        Ok(())
    }
}

#[cfg(test)]
pub use memory::MemoryStore;
