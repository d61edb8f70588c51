use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::time::Duration;

use crate::common::error::AdapterResult;

/// Object storage contract used for sources, rendition artifacts and manifests.
/// Keys are logical storage paths, never local filesystem paths.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Streams `key` into `dest`, returning the number of bytes written.
    async fn download(&self, key: &str, dest: &Path) -> AdapterResult<u64>;

    /// Uploads a local file, returning its size in bytes.
    async fn upload_file(&self, src: &Path, key: &str, content_type: &str) -> AdapterResult<u64>;

    async fn upload_bytes(&self, key: &str, body: Bytes, content_type: &str) -> AdapterResult<()>;

    async fn exists(&self, key: &str) -> AdapterResult<bool>;

    /// Time-limited read URL.
    async fn presign(&self, key: &str, ttl: Duration) -> AdapterResult<String>;

    async fn ping(&self) -> AdapterResult<()>;
}

/// Deterministic key layout, so re-runs overwrite instead of accumulating.
pub mod paths {
    pub fn output_base(tenant_id: &str, video_id: &str) -> String {
        format!("{}/{}", tenant_id, video_id)
    }

    pub fn rendition_prefix(output_base: &str, label: &str) -> String {
        format!("{}/renditions/{}", output_base, label)
    }

    pub fn manifest_prefix(output_base: &str, format: &str) -> String {
        format!("{}/manifests/{}", output_base, format)
    }
}

pub fn content_type_for(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some("m3u8") => "application/vnd.apple.mpegurl".to_string(),
        Some("mpd") => "application/dash+xml".to_string(),
        Some("m4s") => "video/iso.segment".to_string(),
        Some("ts") => "video/mp2t".to_string(),
        _ => mime_guess::from_path(path)
            .first()
            .unwrap_or(mime::APPLICATION_OCTET_STREAM)
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_deterministic() {
        let base = paths::output_base("T1", "V1");
        assert_eq!(base, "T1/V1");
        assert_eq!(paths::rendition_prefix(&base, "720p"), "T1/V1/renditions/720p");
        assert_eq!(paths::manifest_prefix(&base, "hls"), "T1/V1/manifests/hls");
    }

    #[test]
    fn streaming_content_types() {
        assert_eq!(content_type_for(Path::new("index.m3u8")), "application/vnd.apple.mpegurl");
        assert_eq!(content_type_for(Path::new("init.mp4")), "video/mp4");
        assert_eq!(content_type_for(Path::new("blob.unknownext")), "application/octet-stream");
    }
}
