use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::store::{ObjectStore, PutObject, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("local file {0} does not exist")]
    FileNotFound(PathBuf),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("fetching remote metadata for {key}: {source}")]
    RemoteMetadataFailed {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error("writing remote object {key}: {source}")]
    RemoteWriteFailed {
        key: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded,
    /// Remote copy already matches in size and content type.
    Skipped,
}

#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload_file(
        &self,
        local_path: &Path,
        key: &str,
        content_type: &str,
    ) -> Result<UploadOutcome, UploadError>;
}

/// Conditional uploader in front of an [`ObjectStore`] bucket.
#[derive(Clone)]
pub struct ObjectUploader {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl ObjectUploader {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl Uploader for ObjectUploader {
    async fn upload_file(
        &self,
        local_path: &Path,
        key: &str,
        content_type: &str,
    ) -> Result<UploadOutcome, UploadError> {
        let io_error = |source: std::io::Error| UploadError::Io {
            path: local_path.to_path_buf(),
            source,
        };

        let metadata = match tokio::fs::metadata(local_path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(UploadError::FileNotFound(local_path.to_path_buf()));
            }
            Err(err) => return Err(io_error(err)),
        };

        match self.store.head_object(&self.bucket, key).await {
            Ok(remote) => {
                if remote.content_length == metadata.len()
                    && remote.content_type.as_deref() == Some(content_type)
                {
                    tracing::debug!(key, "remote object unchanged, skipping upload");
                    return Ok(UploadOutcome::Skipped);
                }
            }
            Err(StoreError::NotFound { .. }) => {}
            Err(source) => {
                return Err(UploadError::RemoteMetadataFailed {
                    key: key.to_string(),
                    source,
                });
            }
        }

        let mut file = tokio::fs::File::open(local_path).await.map_err(io_error)?;
        let mut body = Vec::with_capacity(metadata.len() as usize);
        file.read_to_end(&mut body).await.map_err(io_error)?;
        let checksum_sha1 = STANDARD.encode(Sha1::digest(&body));
        file.rewind().await.map_err(io_error)?;
        drop(file);

        self.store
            .put_object(PutObject {
                bucket: self.bucket.clone(),
                key: key.to_string(),
                body,
                content_type: content_type.to_string(),
                checksum_sha1,
            })
            .await
            .map_err(|source| UploadError::RemoteWriteFailed {
                key: key.to_string(),
                source,
            })?;
        tracing::debug!(key, "uploaded");
        Ok(UploadOutcome::Uploaded)
    }
}
