use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Builder;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::{config::BehaviorVersion, config::Credentials, config::Region, Client};
use bytes::Bytes;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::common::error::{AdapterError, AdapterResult};
use crate::common::retry::{with_backoff, RetryPolicy};
use crate::common::upload::{self, MultipartTarget, MULTIPART_THRESHOLD};
use crate::modules::transcoding::storage::StorageGateway;

/// Maps SDK failures onto adapter outcomes: network trouble and 5xx are
/// transient, everything else (auth, missing keys, bad requests) is not.
fn classify<E>(op: &str, err: SdkError<E, HttpResponse>) -> AdapterError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let transient = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => true,
        SdkError::ServiceError(ctx) => ctx.raw().status().as_u16() >= 500,
        _ => false,
    };
    let message = format!("{} failed: {}", op, DisplayErrorContext(&err));
    if transient {
        AdapterError::Transient(message)
    } else {
        AdapterError::Permanent(message)
    }
}

#[derive(Clone)]
pub struct StorageService {
    pub client: Client,
    pub bucket: String,
    retry: RetryPolicy,
}

impl StorageService {
    pub async fn new(endpoint: &str, bucket: &str, access_key: &str, secret_key: &str, retry_attempts: u32) -> Self {
        let credentials = Credentials::new(access_key, secret_key, None, None, "static");

        let config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .endpoint_url(endpoint)
            .credentials_provider(credentials)
            .force_path_style(true) // Required for MinIO
            .build();

        let client = Client::from_conf(config);

        info!("✅ Connected to S3 (MinIO)");

        Self {
            client,
            bucket: bucket.to_string(),
            retry: RetryPolicy::new(retry_attempts, Duration::from_millis(250)),
        }
    }

    async fn put_object(&self, key: &str, body: ByteStream, content_type: &str) -> AdapterResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| classify("put object", e))?;
        Ok(())
    }
}

/// Create and complete are retried like single parts; abort is best effort.
#[async_trait]
impl MultipartTarget for StorageService {
    async fn create_multipart_upload(&self, key: &str, content_type: &str) -> AdapterResult<String> {
        let result = with_backoff(&self.retry, "create multipart upload", || async {
            self.client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .content_type(content_type)
                .send()
                .await
                .map_err(|e| classify("create multipart upload", e))
        })
        .await?;

        result
            .upload_id
            .ok_or_else(|| AdapterError::Permanent(format!("no upload id returned for {}", key)))
    }

    async fn upload_part(&self, key: &str, upload_id: &str, part_number: i32, body: Bytes) -> AdapterResult<CompletedPart> {
        let result = with_backoff(&self.retry, "upload part", || async {
            self.client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(body.clone()))
                .send()
                .await
                .map_err(|e| classify("upload part", e))
        })
        .await?;

        Ok(CompletedPart::builder()
            .set_e_tag(result.e_tag)
            .part_number(part_number)
            .build())
    }

    async fn complete_multipart_upload(&self, key: &str, upload_id: &str, parts: Vec<CompletedPart>) -> AdapterResult<()> {
        let completed = CompletedMultipartUpload::builder().set_parts(Some(parts)).build();

        with_backoff(&self.retry, "complete multipart upload", || async {
            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .multipart_upload(completed.clone())
                .send()
                .await
                .map_err(|e| classify("complete multipart upload", e))
        })
        .await?;

        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> AdapterResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify("abort multipart upload", e))?;

        Ok(())
    }
}

#[async_trait]
impl StorageGateway for StorageService {
    async fn download(&self, key: &str, dest: &Path) -> AdapterResult<u64> {
        with_backoff(&self.retry, "download", || async {
            let object = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| classify("get object", e))?;

            let mut reader = object.body.into_async_read();
            let mut file = tokio::fs::File::create(dest).await?;
            let written = tokio::io::copy(&mut reader, &mut file)
                .await
                .map_err(|e| AdapterError::Transient(format!("download stream interrupted: {}", e)))?;
            file.flush().await?;
            Ok::<_, AdapterError>(written)
        })
        .await
    }

    async fn upload_file(&self, src: &Path, key: &str, content_type: &str) -> AdapterResult<u64> {
        let size = tokio::fs::metadata(src).await?.len();
        if size > MULTIPART_THRESHOLD {
            return upload::upload_file_in_parts(self, src, key, content_type).await;
        }

        with_backoff(&self.retry, "upload file", || async {
            let body = ByteStream::from_path(src)
                .await
                .map_err(|e| AdapterError::Permanent(format!("cannot read {}: {}", src.display(), e)))?;
            self.put_object(key, body, content_type).await
        })
        .await?;
        debug!(key = %key, bytes = size, "Uploaded object");
        Ok(size)
    }

    async fn upload_bytes(&self, key: &str, body: Bytes, content_type: &str) -> AdapterResult<()> {
        with_backoff(&self.retry, "upload bytes", || async {
            self.put_object(key, ByteStream::from(body.clone()), content_type).await
        })
        .await
    }

    async fn exists(&self, key: &str) -> AdapterResult<bool> {
        with_backoff(&self.retry, "head object", || async {
            match self.client.head_object().bucket(&self.bucket).key(key).send().await {
                Ok(_) => Ok(true),
                Err(SdkError::ServiceError(ctx)) if ctx.err().is_not_found() => Ok(false),
                Err(e) => Err(classify("head object", e)),
            }
        })
        .await
    }

    async fn presign(&self, key: &str, ttl: Duration) -> AdapterResult<String> {
        let config = PresigningConfig::expires_in(ttl)
            .map_err(|e| AdapterError::Permanent(format!("invalid presign ttl: {}", e)))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|e| classify("presign", e))?;
        Ok(request.uri().to_string())
    }

    async fn ping(&self) -> AdapterResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| classify("head bucket", e))?;
        Ok(())
    }
}
