use crate::common::error::AdapterResult;
use async_trait::async_trait;
use aws_sdk_s3::types::CompletedPart;
use bytes::Bytes;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};

// Minimum part size for S3 is 5MB. We use 6MB to be safe.
const MIN_PART_SIZE: usize = 6 * 1024 * 1024;

/// Files above this size go through multipart upload.
pub const MULTIPART_THRESHOLD: u64 = 16 * 1024 * 1024;

/// The object-store calls a multipart upload is made of.
#[async_trait]
pub trait MultipartTarget: Send + Sync {
    async fn create_multipart_upload(&self, key: &str, content_type: &str) -> AdapterResult<String>;
    async fn upload_part(&self, key: &str, upload_id: &str, part_number: i32, body: Bytes) -> AdapterResult<CompletedPart>;
    async fn complete_multipart_upload(&self, key: &str, upload_id: &str, parts: Vec<CompletedPart>) -> AdapterResult<()>;
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> AdapterResult<()>;
}

pub struct MultipartUploader<'a, T: MultipartTarget + ?Sized> {
    target: &'a T,
    key: String,
    upload_id: String,
    parts: Vec<CompletedPart>,
    part_number: i32,
    buffer: Vec<u8>,
}

impl<'a, T: MultipartTarget + ?Sized> MultipartUploader<'a, T> {
    pub async fn new(target: &'a T, key: String, content_type: &str) -> AdapterResult<Self> {
        let upload_id = target.create_multipart_upload(&key, content_type).await?;

        Ok(Self {
            target,
            key,
            upload_id,
            parts: Vec::new(),
            part_number: 1,
            buffer: Vec::with_capacity(MIN_PART_SIZE),
        })
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> AdapterResult<()> {
        self.buffer.extend_from_slice(chunk);

        if self.buffer.len() >= MIN_PART_SIZE {
            self.flush_part().await?;
        }

        Ok(())
    }

    async fn flush_part(&mut self) -> AdapterResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let body = Bytes::from(std::mem::replace(&mut self.buffer, Vec::with_capacity(MIN_PART_SIZE)));
        let part = self
            .target
            .upload_part(&self.key, &self.upload_id, self.part_number, body)
            .await?;

        self.parts.push(part);
        self.part_number += 1;

        Ok(())
    }

    /// Uploads the tail and completes the upload. The upload is aborted if
    /// either step fails.
    pub async fn finish(mut self) -> AdapterResult<()> {
        // Last part may be smaller than the minimum
        if let Err(e) = self.flush_part().await {
            self.abort_quietly().await;
            return Err(e);
        }

        let parts = std::mem::take(&mut self.parts);
        match self
            .target
            .complete_multipart_upload(&self.key, &self.upload_id, parts)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(key = %self.key, "Completing multipart upload failed: {}", e);
                self.abort_quietly().await;
                Err(e)
            }
        }
    }

    pub async fn abort(&self) -> AdapterResult<()> {
        self.target.abort_multipart_upload(&self.key, &self.upload_id).await
    }

    // The original error matters more than a failed cleanup.
    async fn abort_quietly(&self) {
        if let Err(e) = self.abort().await {
            warn!(key = %self.key, upload_id = %self.upload_id, "Aborting multipart upload failed: {}", e);
        }
    }
}

/// Streams a local file to `key` part by part. A failed upload is aborted so
/// no orphaned parts stay billed in the bucket.
pub async fn upload_file_in_parts<T: MultipartTarget + ?Sized>(
    target: &T,
    path: &Path,
    key: &str,
    content_type: &str,
) -> AdapterResult<u64> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut uploader = MultipartUploader::new(target, key.to_string(), content_type).await?;
    let mut chunk = vec![0u8; 1024 * 1024];
    let mut total = 0u64;

    loop {
        let read = match file.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                error!(key = %key, "Read error during multipart upload: {}", e);
                uploader.abort_quietly().await;
                return Err(e.into());
            }
        };

        if let Err(e) = uploader.write_chunk(&chunk[..read]).await {
            error!(key = %key, "Upload error: {}", e);
            uploader.abort_quietly().await;
            return Err(e);
        }
        total += read as u64;
    }

    uploader.finish().await?;
    info!(key = %key, bytes = total, "Multipart upload complete");
    Ok(total)
}
