use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};

/// Blob storage for pipeline artifacts: uploads return the public URL the
/// image is served under, downloads resolve such a URL back to bytes.
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn upload(
        &self,
        data: &[u8],
        file_name: &str,
        folder: &str,
    ) -> Result<String, StorageError>;

    async fn download(&self, url: &str) -> Result<Vec<u8>, StorageError>;
}

/// Cloudflare R2 (S3-compatible) image store.
pub struct R2ImageStore {
    bucket: Box<Bucket>,
    public_base_url: String,
}

impl R2ImageStore {
    pub fn new(
        bucket_name: &str,
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        public_base_url: &str,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: "auto".to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials = Credentials::new(Some(access_key), Some(secret_key), None, None, None)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        let bucket = Bucket::new(bucket_name, region, credentials)
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            bucket,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Map a public URL back to the object key it was uploaded under.
    fn key_for_url<'a>(&self, url: &'a str) -> Result<&'a str, StorageError> {
        url.strip_prefix(&self.public_base_url)
            .map(|key| key.trim_start_matches('/'))
            .filter(|key| !key.is_empty())
            .ok_or_else(|| StorageError::NotFound(url.to_string()))
    }
}

#[async_trait]
impl ImageStore for R2ImageStore {
    async fn upload(
        &self,
        data: &[u8],
        file_name: &str,
        folder: &str,
    ) -> Result<String, StorageError> {
        let key = format!("{folder}/{file_name}");
        self.bucket
            .put_object_with_content_type(&key, data, "image/png")
            .await
            .map_err(StorageError::S3)?;
        Ok(format!("{}/{}", self.public_base_url, key))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, StorageError> {
        let key = self.key_for_url(url)?;
        let response = self.bucket.get_object(key).await.map_err(StorageError::S3)?;
        if response.status_code() == 404 {
            return Err(StorageError::NotFound(url.to_string()));
        }
        Ok(response.to_vec())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("storage configuration error: {0}")]
    Config(String),

    #[error("no stored image for url: {0}")]
    NotFound(String),
}
