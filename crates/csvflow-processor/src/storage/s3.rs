//! S3-compatible object source

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::DisplayErrorContext,
    Client,
};
use csvflow_common::types::ObjectRef;
use tracing::{debug, info, instrument};

use super::config::StorageConfig;
use super::ObjectSource;
use crate::engine::{ObjectBody, SourceFile};
use crate::error::FetchError;

/// Streams objects from S3 or MinIO.
#[derive(Clone)]
pub struct S3ObjectSource {
    client: Client,
}

impl S3ObjectSource {
    pub fn new(config: &StorageConfig) -> Self {
        debug!(endpoint = ?config.endpoint, region = %config.region, "Initializing S3 client");

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "csvflow-storage",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        info!(bucket = %config.bucket, "Object storage client initialized");

        Self {
            client: Client::from_conf(builder.build()),
        }
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectSource for S3ObjectSource {
    #[instrument(skip(self), fields(path = %object))]
    async fn open(&self, object: &ObjectRef) -> Result<SourceFile, FetchError> {
        let response = self
            .client
            .get_object()
            .bucket(&object.bucket)
            .key(&object.name)
            .send()
            .await
            .map_err(|e| FetchError::new(object.storage_path(), DisplayErrorContext(&e)))?;

        let size_bytes = response
            .content_length()
            .and_then(|len| u64::try_from(len).ok());
        debug!(size_bytes = ?size_bytes, "Opened object stream");

        let body: ObjectBody = Box::new(Box::pin(response.body.into_async_read()));
        Ok(SourceFile {
            object: object.clone(),
            size_bytes,
            body,
        })
    }
}
