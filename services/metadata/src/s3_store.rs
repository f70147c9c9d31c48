use crate::blob_store::{BlobObject, BlobStore, ObjectSummary, WriteCondition};
use crate::config::S3Config;
use crate::error::BlobError;
use anyhow::Context;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

/// Error codes S3 returns when a conditional write loses
const PRECONDITION_CODES: &[&str] = &["PreconditionFailed", "ConditionalRequestConflict"];

/// S3-backed blob store for catalog snapshots and the manifest
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
}

impl S3BlobStore {
    /// Create a new S3 blob store
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 blob store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
        })
    }

    /// Get the bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get(&self, path: &str) -> Result<Option<BlobObject>, BlobError> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Ok(None);
                }
                return Err(BlobError::backend(
                    path,
                    anyhow::Error::new(e).context("Failed to get object from S3"),
                ));
            }
        };

        let etag = response.e_tag().map(String::from);
        let body = response
            .body
            .collect()
            .await
            .context("Failed to read object body")
            .map_err(|e| BlobError::backend(path, e))?
            .into_bytes();

        debug!(path = %path, size_bytes = body.len(), "Fetched object");

        Ok(Some(BlobObject { body, etag }))
    }

    #[instrument(skip(self, body), fields(bucket = %self.bucket, size_bytes = body.len()))]
    async fn put(
        &self,
        path: &str,
        body: Bytes,
        condition: WriteCondition,
    ) -> Result<Option<String>, BlobError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .body(ByteStream::from(body))
            .content_type("application/json");

        request = match condition {
            WriteCondition::Unconditional => request,
            WriteCondition::IfAbsent => request.if_none_match("*"),
            WriteCondition::IfMatch(etag) => request.if_match(etag),
        };

        match request.send().await {
            Ok(output) => Ok(output.e_tag().map(String::from)),
            Err(e) => {
                if e.code().map(|c| PRECONDITION_CODES.contains(&c)).unwrap_or(false) {
                    debug!(path = %path, "Conditional put rejected");
                    Err(BlobError::PreconditionFailed {
                        path: path.to_string(),
                    })
                } else {
                    Err(BlobError::backend(
                        path,
                        anyhow::Error::new(e).context("Failed to put object to S3"),
                    ))
                }
            }
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, BlobError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(BlobError::backend(
                        path,
                        anyhow::Error::new(e).context("Failed to check object existence"),
                    ))
                }
            }
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectSummary>, BlobError> {
        let mut summaries = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .context("Failed to list objects")
                .map_err(|e| BlobError::backend(prefix, e))?;

            summaries.extend(response.contents().iter().filter_map(|obj| {
                obj.key().map(|key| ObjectSummary {
                    path: key.to_string(),
                    size_bytes: obj.size().unwrap_or(0).max(0) as u64,
                    last_modified: obj
                        .last_modified()
                        .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos())),
                })
            }));

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        debug!(prefix = %prefix, count = summaries.len(), "Listed objects");

        Ok(summaries)
    }
}
