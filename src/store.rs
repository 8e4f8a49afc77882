//! Object store gateway: page images in, result artifacts out.
//!
//! A thin wrapper over `Arc<dyn ObjectStore>` so production talks to S3
//! while tests run against the in-memory backend with identical semantics.
//! Encryption at rest is delegated to the backing bucket (server-side KMS);
//! the gateway never sees key material.
//!
//! Key shapes are the only structure the pipeline imposes on the store:
//!
//! ```text
//! uploads/{user}/{YYYY-MM}/{file_id}/{filename}
//! uploads/{user}/{YYYY-MM}/{file_id}/page_{N}.jpg
//! results/{user}/{YYYY-MM}/{task}/page_{N}_{format}_{ts}.{ext}
//! restricted/{user}/{YYYY-MM}/{task}/...      anon mapping + audit only
//! ```
//!
//! The `restricted/` root exists because mapping and audit files are the
//! only artifacts that can reconstruct original values; a separate root
//! lets bucket policy fence them without path gymnastics.

use crate::error::{PipelineError, StoreError};
use crate::types::ArtifactKind;
use chrono::Utc;
use object_store::aws::AmazonS3Builder;
use object_store::memory::InMemory;
use object_store::path::Path as StorePath;
use object_store::{Attribute, Attributes, ObjectStore, PutOptions, PutPayload};
use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Gateway over the configured object store backend.
#[derive(Clone)]
pub struct ArtifactStore {
    inner: Arc<dyn ObjectStore>,
}

impl ArtifactStore {
    /// S3 backend; credentials and region come from the standard `AWS_*`
    /// environment, the bucket from config.
    pub fn from_env(bucket: &str) -> Result<ArtifactStore, PipelineError> {
        let s3 = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .build()
            .map_err(|e| PipelineError::StoreInit(StoreError::Backend(e)))?;
        Ok(ArtifactStore {
            inner: Arc::new(s3),
        })
    }

    /// In-memory backend for tests and local development.
    pub fn in_memory() -> ArtifactStore {
        ArtifactStore {
            inner: Arc::new(InMemory::new()),
        }
    }

    pub fn from_backend(inner: Arc<dyn ObjectStore>) -> ArtifactStore {
        ArtifactStore { inner }
    }

    /// Write text content with a content type and string metadata.
    pub async fn put_text(
        &self,
        key: &str,
        content: &str,
        content_type: &str,
        metadata: &[(&str, String)],
    ) -> Result<(), StoreError> {
        self.put_bytes(key, content.as_bytes().to_vec(), content_type, metadata)
            .await
    }

    pub async fn put_bytes(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        metadata: &[(&str, String)],
    ) -> Result<(), StoreError> {
        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, content_type.to_string().into());
        for (name, value) in metadata {
            attributes.insert(
                Attribute::Metadata(Cow::Owned(name.to_string())),
                value.clone().into(),
            );
        }

        let mut opts = PutOptions::default();
        opts.attributes = attributes;
        self.inner
            .put_opts(&StorePath::from(key), PutPayload::from(bytes), opts)
            .await?;
        debug!("Stored object '{key}' ({content_type})");
        Ok(())
    }

    pub async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let result = self.inner.get(&StorePath::from(key)).await?;
        Ok(result.bytes().await?.to_vec())
    }

    pub async fn get_text(&self, key: &str) -> Result<String, StoreError> {
        let bytes = self.get_bytes(key).await?;
        String::from_utf8(bytes).map_err(|e| {
            StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("object '{key}' is not UTF-8: {e}"),
            ))
        })
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        match self.inner.head(&StorePath::from(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(StoreError::Backend(e)),
        }
    }

    /// Fetch an object to a local scratch path.
    pub async fn download_to(&self, key: &str, dest: &Path) -> Result<(), StoreError> {
        let bytes = self.get_bytes(key).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, bytes).await?;
        debug!("Downloaded '{key}' to {}", dest.display());
        Ok(())
    }
}

// ── Key builders ─────────────────────────────────────────────────────────

fn month_partition() -> String {
    Utc::now().format("%Y-%m").to_string()
}

/// Timestamp suffix used in result filenames.
pub fn key_timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

/// `uploads/{user}/{YYYY-MM}/{file_id}/{filename}`
pub fn upload_key(user_id: &str, file_id: &str, filename: &str) -> String {
    format!(
        "uploads/{user_id}/{}/{file_id}/{filename}",
        month_partition()
    )
}

/// `uploads/{user}/{YYYY-MM}/{file_id}/page_{N}.jpg`
pub fn page_image_key(user_id: &str, file_id: &str, page_number: u32) -> String {
    upload_key(user_id, file_id, &format!("page_{page_number}.jpg"))
}

/// `results/{user}/{YYYY-MM}/{task}/{filename}`, or the `restricted/` root
/// for reconstruction-enabling artifacts.
pub fn result_key(user_id: &str, task_id: &str, filename: &str, restricted: bool) -> String {
    let root = if restricted { "restricted" } else { "results" };
    format!(
        "{root}/{user_id}/{}/{task_id}/{filename}",
        month_partition()
    )
}

/// `page_{N}_{format}_{ts}.{ext}`
pub fn result_filename(page_number: u32, artifact: ArtifactKind, timestamp: &str) -> String {
    format!(
        "page_{page_number}_{}_{timestamp}.{}",
        artifact.label(),
        artifact.extension()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_exists_round_trip() {
        let store = ArtifactStore::in_memory();
        let key = "results/u1/2026-08/t1/page_1_html_20260801_120000.html";

        assert!(!store.exists(key).await.unwrap());
        store
            .put_text(
                key,
                "<html></html>",
                "text/html",
                &[("task_id", "t1".to_string())],
            )
            .await
            .unwrap();
        assert!(store.exists(key).await.unwrap());
        assert_eq!(store.get_text(key).await.unwrap(), "<html></html>");
    }

    #[tokio::test]
    async fn download_to_writes_scratch_file() {
        let store = ArtifactStore::in_memory();
        store
            .put_bytes("uploads/u/2026-08/f/page_1.jpg", vec![1, 2, 3], "image/jpeg", &[])
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("t1_page_1.jpg");
        store
            .download_to("uploads/u/2026-08/f/page_1.jpg", &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn key_shapes() {
        let upload = page_image_key("user-1", "file-9", 3);
        assert!(upload.starts_with("uploads/user-1/"));
        assert!(upload.ends_with("/file-9/page_3.jpg"));

        let name = result_filename(2, ArtifactKind::KvpJson, "20260801_090000");
        assert_eq!(name, "page_2_kvp_json_20260801_090000.json");

        let plain = result_key("u", "t", &name, false);
        assert!(plain.starts_with("results/u/"));
        let fenced = result_key("u", "t", &name, true);
        assert!(fenced.starts_with("restricted/u/"));
    }

    #[test]
    fn missing_object_is_not_an_error() {
        let store = ArtifactStore::in_memory();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let exists = rt.block_on(store.exists("nope/nothing.json")).unwrap();
        assert!(!exists);
    }
}
