use bytes::Bytes;
use std::fmt::{self, Write as _};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use super::pipeline::RenditionOutput;
use super::profile::Container;
use super::storage::{paths, StorageGateway};
use crate::common::error::AdapterError;
use crate::modules::jobs::events::ManifestUrls;
use crate::modules::jobs::model::TranscodingJob;

const HLS_MASTER: &str = "master.m3u8";
const DASH_MPD: &str = "manifest.mpd";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ManifestFormat {
    Hls,
    Dash,
}

impl ManifestFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManifestFormat::Hls => "hls",
            ManifestFormat::Dash => "dash",
        }
    }
}

impl fmt::Display for ManifestFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ManifestFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hls" => Ok(ManifestFormat::Hls),
            "dash" => Ok(ManifestFormat::Dash),
            other => Err(format!("unknown manifest format '{}'", other)),
        }
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("no completed renditions to package")]
    EmptyRenditionSet,
    #[error("{0}")]
    Unsupported(String),
    #[error("manifest upload failed: {0}")]
    Upload(#[from] AdapterError),
}

/// Builds adaptive-streaming manifests over a complete rendition set and
/// uploads them next to the renditions.
#[derive(Clone)]
pub struct ManifestGenerator {
    storage: Arc<dyn StorageGateway>,
    formats: Vec<ManifestFormat>,
    segment_seconds: u32,
}

impl ManifestGenerator {
    pub fn new(storage: Arc<dyn StorageGateway>, formats: Vec<ManifestFormat>, segment_seconds: u32) -> Self {
        Self {
            storage,
            formats,
            segment_seconds,
        }
    }

    pub async fn generate(
        &self,
        job: &TranscodingJob,
        outputs: &[RenditionOutput],
    ) -> Result<ManifestUrls, ManifestError> {
        if outputs.is_empty() {
            return Err(ManifestError::EmptyRenditionSet);
        }
        let mut ordered: Vec<&RenditionOutput> = outputs.iter().collect();
        ordered.sort_by_key(|o| o.profile.bandwidth_bps());

        // Render everything first so an unsupported format uploads nothing.
        let mut documents = Vec::with_capacity(self.formats.len());
        for format in &self.formats {
            let (body, content_type) = match format {
                ManifestFormat::Hls => (render_hls_master(&ordered), "application/vnd.apple.mpegurl"),
                ManifestFormat::Dash => (
                    render_dash_mpd(&ordered, self.segment_seconds, job.duration_seconds)?,
                    "application/dash+xml",
                ),
            };
            documents.push((*format, manifest_key(&job.output_base_path, *format), body, content_type));
        }

        let mut urls = ManifestUrls::default();
        for (format, key, body, content_type) in documents {
            self.storage
                .upload_bytes(&key, Bytes::from(body), content_type)
                .await?;
            info!(job_id = %job.id, format = %format, key = %key, "Manifest uploaded");
            match format {
                ManifestFormat::Hls => urls.hls = Some(key),
                ManifestFormat::Dash => urls.dash = Some(key),
            }
        }
        Ok(urls)
    }
}

/// Storage key of the manifest document for `format`.
pub fn manifest_key(output_base: &str, format: ManifestFormat) -> String {
    let name = match format {
        ManifestFormat::Hls => HLS_MASTER,
        ManifestFormat::Dash => DASH_MPD,
    };
    format!("{}/{}", paths::manifest_prefix(output_base, format.as_str()), name)
}

/// Path of a rendition artifact relative to `manifests/{format}/`.
fn relative_dir(output: &RenditionOutput) -> String {
    format!("../../renditions/{}", output.profile.label)
}

fn playlist_name(output: &RenditionOutput) -> &str {
    output
        .output_path
        .rsplit('/')
        .next()
        .unwrap_or(output.output_path.as_str())
}

/// HLS master playlist. `ordered` must already be ascending by bandwidth.
pub fn render_hls_master(ordered: &[&RenditionOutput]) -> String {
    let version = if ordered.iter().any(|o| o.profile.container == Container::Fmp4) {
        7
    } else {
        3
    };
    let mut out = String::new();
    let _ = writeln!(out, "#EXTM3U");
    let _ = writeln!(out, "#EXT-X-VERSION:{}", version);
    let _ = writeln!(out, "#EXT-X-INDEPENDENT-SEGMENTS");
    for output in ordered {
        let p = &output.profile;
        let _ = writeln!(
            out,
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={},CODECS=\"{}\",NAME=\"{}\"",
            p.bandwidth_bps(),
            p.resolution(),
            p.codecs(),
            p.label
        );
        let _ = writeln!(out, "{}/{}", relative_dir(output), playlist_name(output));
    }
    out
}

/// Static DASH MPD over the fMP4 segments written by the encoder.
pub fn render_dash_mpd(
    ordered: &[&RenditionOutput],
    segment_seconds: u32,
    duration_seconds: Option<f64>,
) -> Result<String, ManifestError> {
    if let Some(ts) = ordered.iter().find(|o| o.profile.container == Container::Ts) {
        return Err(ManifestError::Unsupported(format!(
            "DASH requires fmp4 segments, rendition '{}' uses ts",
            ts.profile.label
        )));
    }

    let mut out = String::new();
    let _ = writeln!(out, r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    let _ = write!(
        out,
        r#"<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" profiles="urn:mpeg:dash:profile:isoff-live:2011" type="static" minBufferTime="PT{}S""#,
        segment_seconds
    );
    match duration_seconds {
        Some(d) if d.is_finite() && d > 0.0 => {
            let _ = write!(out, r#" mediaPresentationDuration="PT{:.3}S""#, d);
        }
        _ => warn!("Source duration unknown, MPD written without mediaPresentationDuration"),
    }
    let _ = writeln!(out, ">");
    let _ = writeln!(out, r#"  <Period id="0" start="PT0S">"#);
    let _ = writeln!(
        out,
        r#"    <AdaptationSet id="0" contentType="video" mimeType="video/mp4" segmentAlignment="true" startWithSAP="1">"#
    );
    for output in ordered {
        let p = &output.profile;
        let _ = writeln!(
            out,
            r#"      <Representation id="{}" bandwidth="{}" width="{}" height="{}" codecs="{}">"#,
            xml_escape(&p.label),
            p.bandwidth_bps(),
            p.width,
            p.height,
            xml_escape(&p.codecs())
        );
        let _ = writeln!(out, "        <BaseURL>{}/</BaseURL>", xml_escape(&relative_dir(output)));
        let _ = writeln!(
            out,
            r#"        <SegmentTemplate timescale="1000" duration="{}" initialization="init.mp4" media="segment_$Number%05d$.m4s" startNumber="0"/>"#,
            u64::from(segment_seconds) * 1000
        );
        let _ = writeln!(out, "      </Representation>");
    }
    let _ = writeln!(out, "    </AdaptationSet>");
    let _ = writeln!(out, "  </Period>");
    let _ = writeln!(out, "</MPD>");
    Ok(out)
}

fn xml_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
