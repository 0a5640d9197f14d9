use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use rusty_s3::{Bucket, BucketError, Credentials, S3Action, UrlStyle};
use url::Url;

pub const CHECKSUM_ALGORITHM_HEADER: &str = "x-amz-sdk-checksum-algorithm";
pub const CHECKSUM_SHA1_HEADER: &str = "x-amz-checksum-sha1";

/// Lifetime of each presigned request URL.
const SIGNATURE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },
    #[error("object store answered {status} for {bucket}/{key}")]
    Status {
        status: StatusCode,
        bucket: String,
        key: String,
    },
    #[error("object store request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid object url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("invalid bucket: {0}")]
    InvalidBucket(#[from] BucketError),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub content_length: u64,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PutObject {
    pub bucket: String,
    pub key: String,
    pub body: Vec<u8>,
    pub content_type: String,
    pub checksum_sha1: String,
}

/// Remote blob sink.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta, StoreError>;
    async fn put_object(&self, object: PutObject) -> Result<(), StoreError>;
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError>;
}

/// Path-style S3 REST client: `{endpoint}/{bucket}/{key}`.
///
/// Requests carry a SigV4 query signature when credentials are set and go
/// out unsigned otherwise.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: reqwest::Client,
    endpoint: Url,
    region: String,
    credentials: Option<Credentials>,
}

impl HttpObjectStore {
    pub fn new(
        client: reqwest::Client,
        endpoint: &str,
        region: &str,
        credentials: Option<Credentials>,
    ) -> Result<Self, StoreError> {
        let endpoint = Url::parse(&format!("{}/", endpoint.trim_end_matches('/')))?;
        Ok(Self {
            client,
            endpoint,
            region: region.trim().to_string(),
            credentials,
        })
    }

    fn bucket(&self, name: &str) -> Result<Bucket, StoreError> {
        Ok(Bucket::new(
            self.endpoint.clone(),
            UrlStyle::Path,
            name.to_string(),
            self.region.clone(),
        )?)
    }

    fn head_url(&self, bucket: &str, key: &str) -> Result<Url, StoreError> {
        let bucket = self.bucket(bucket)?;
        let action = bucket.head_object(self.credentials.as_ref(), key.trim_start_matches('/'));
        Ok(action.sign(SIGNATURE_TTL))
    }

    fn get_url(&self, bucket: &str, key: &str) -> Result<Url, StoreError> {
        let bucket = self.bucket(bucket)?;
        let action = bucket.get_object(self.credentials.as_ref(), key.trim_start_matches('/'));
        Ok(action.sign(SIGNATURE_TTL))
    }

    /// The content type and checksum headers are part of the signature, so
    /// the request must send them unchanged.
    fn put_url(&self, object: &PutObject) -> Result<Url, StoreError> {
        let bucket = self.bucket(&object.bucket)?;
        let mut action = bucket.put_object(
            self.credentials.as_ref(),
            object.key.trim_start_matches('/'),
        );
        let headers = action.headers_mut();
        headers.insert("content-type", object.content_type.clone());
        headers.insert(CHECKSUM_ALGORITHM_HEADER, "SHA1");
        headers.insert(CHECKSUM_SHA1_HEADER, object.checksum_sha1.clone());
        Ok(action.sign(SIGNATURE_TTL))
    }

    fn check(status: StatusCode, bucket: &str, key: &str) -> Result<(), StoreError> {
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        if !status.is_success() {
            return Err(StoreError::Status {
                status,
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta, StoreError> {
        let response = self.client.head(self.head_url(bucket, key)?).send().await?;
        Self::check(response.status(), bucket, key)?;

        let headers = response.headers();
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or_default();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(ObjectMeta {
            content_length,
            content_type,
        })
    }

    async fn put_object(&self, object: PutObject) -> Result<(), StoreError> {
        let response = self
            .client
            .put(self.put_url(&object)?)
            .header(CONTENT_TYPE, object.content_type)
            .header(CHECKSUM_ALGORITHM_HEADER, "SHA1")
            .header(CHECKSUM_SHA1_HEADER, object.checksum_sha1)
            .body(object.body)
            .send()
            .await?;
        Self::check(response.status(), &object.bucket, &object.key)
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let response = self.client.get(self.get_url(bucket, key)?).send().await?;
        Self::check(response.status(), bucket, key)?;
        Ok(response.bytes().await?.to_vec())
    }
}
