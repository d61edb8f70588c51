use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use utoipa::ToSchema;

pub const MAX_DIMENSION: u32 = 8192;
pub const MAX_VIDEO_BITRATE_KBPS: u32 = 200_000;
pub const MAX_AUDIO_BITRATE_KBPS: u32 = 1_536;

/// Segment container produced by the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Fmp4,
    Ts,
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Container::Fmp4 => write!(f, "fmp4"),
            Container::Ts => write!(f, "ts"),
        }
    }
}

impl FromStr for Container {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fmp4" => Ok(Container::Fmp4),
            "ts" => Ok(Container::Ts),
            other => Err(format!("unknown container '{}'", other)),
        }
    }
}

/// One rung of the encoding ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct QualityProfile {
    /// Resolution label, also the storage directory name ("720p").
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub video_codec: String,
    pub audio_codec: String,
    pub container: Container,
    /// Extra encoder arguments appended verbatim.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl QualityProfile {
    pub fn resolution(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }

    /// Combined video and audio bitrate. Validated profiles always fit an `i32`.
    pub fn total_bitrate_kbps(&self) -> u32 {
        self.video_bitrate_kbps.saturating_add(self.audio_bitrate_kbps)
    }

    /// Peak bandwidth in bits per second, as advertised in manifests.
    pub fn bandwidth_bps(&self) -> u64 {
        (self.video_bitrate_kbps as u64 + self.audio_bitrate_kbps as u64) * 1000
    }

    /// RFC 6381 codec string for the manifest.
    pub fn codecs(&self) -> String {
        let video = match self.video_codec.as_str() {
            "h264" | "libx264" => "avc1.64001f",
            "h265" | "hevc" | "libx265" => "hvc1.1.6.L93.B0",
            "av1" | "libsvtav1" => "av01.0.08M.08",
            "vp9" | "libvpx-vp9" => "vp09.00.40.08",
            other => other,
        };
        let audio = match self.audio_codec.as_str() {
            "aac" => "mp4a.40.2",
            "opus" | "libopus" => "opus",
            other => other,
        };
        format!("{},{}", video, audio)
    }

    fn validate(&self) -> Result<()> {
        if self.label.trim().is_empty() || self.label.contains('/') {
            return Err(anyhow!("profile label '{}' is not a valid path segment", self.label));
        }
        if self.width == 0 || self.height == 0 || self.video_bitrate_kbps == 0 {
            return Err(anyhow!("profile '{}' must have non-zero dimensions and bitrate", self.label));
        }
        if self.width > MAX_DIMENSION || self.height > MAX_DIMENSION {
            return Err(anyhow!("profile '{}' exceeds {}px", self.label, MAX_DIMENSION));
        }
        if self.video_bitrate_kbps > MAX_VIDEO_BITRATE_KBPS || self.audio_bitrate_kbps > MAX_AUDIO_BITRATE_KBPS {
            return Err(anyhow!(
                "profile '{}' bitrate exceeds {} kbps video / {} kbps audio",
                self.label,
                MAX_VIDEO_BITRATE_KBPS,
                MAX_AUDIO_BITRATE_KBPS
            ));
        }
        Ok(())
    }
}

fn rung(label: &str, width: u32, height: u32, video_kbps: u32, audio_kbps: u32) -> QualityProfile {
    QualityProfile {
        label: label.to_string(),
        width,
        height,
        video_bitrate_kbps: video_kbps,
        audio_bitrate_kbps: audio_kbps,
        video_codec: "h264".to_string(),
        audio_codec: "aac".to_string(),
        container: Container::Fmp4,
        extra_args: Vec::new(),
    }
}

pub fn default_ladder() -> Vec<QualityProfile> {
    vec![
        rung("360p", 640, 360, 800, 96),
        rung("480p", 854, 480, 1400, 128),
        rung("720p", 1280, 720, 2800, 128),
        rung("1080p", 1920, 1080, 5000, 192),
    ]
}

pub fn parse_profiles(raw: &str) -> Result<Vec<QualityProfile>> {
    let profiles: Vec<QualityProfile> = serde_json::from_str(raw)?;
    if profiles.is_empty() {
        return Err(anyhow!("at least one quality profile is required"));
    }
    for (i, profile) in profiles.iter().enumerate() {
        profile.validate()?;
        if profiles[..i].iter().any(|p| p.label == profile.label) {
            return Err(anyhow!("duplicate quality profile label '{}'", profile.label));
        }
    }
    Ok(profiles)
}

pub fn load_from_file(path: &Path) -> Result<Vec<QualityProfile>> {
    let raw = std::fs::read_to_string(path)?;
    parse_profiles(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ladder_is_valid() {
        let ladder = default_ladder();
        assert_eq!(ladder.len(), 4);
        assert!(ladder.iter().all(|p| p.validate().is_ok()));
    }

    #[test]
    fn profiles_parse_from_json() {
        let raw = r#"[
            {"label":"540p","width":960,"height":540,"video_bitrate_kbps":2000,
             "audio_bitrate_kbps":128,"video_codec":"h264","audio_codec":"aac","container":"ts"}
        ]"#;
        let profiles = parse_profiles(raw).unwrap();
        assert_eq!(profiles[0].container, Container::Ts);
        assert!(profiles[0].extra_args.is_empty());
        assert_eq!(profiles[0].bandwidth_bps(), 2_128_000);
        assert_eq!(profiles[0].resolution(), "960x540");
    }

    #[test]
    fn duplicate_labels_are_rejected() {
        let raw = r#"[
            {"label":"a","width":1,"height":1,"video_bitrate_kbps":1,"audio_bitrate_kbps":1,
             "video_codec":"h264","audio_codec":"aac","container":"fmp4"},
            {"label":"a","width":2,"height":2,"video_bitrate_kbps":2,"audio_bitrate_kbps":1,
             "video_codec":"h264","audio_codec":"aac","container":"fmp4"}
        ]"#;
        assert!(parse_profiles(raw).is_err());
    }

    #[test]
    fn oversized_bitrates_and_dimensions_are_rejected() {
        let raw = r#"[
            {"label":"huge","width":1920,"height":1080,"video_bitrate_kbps":4294967000,
             "audio_bitrate_kbps":4000,"video_codec":"h264","audio_codec":"aac","container":"fmp4"}
        ]"#;
        assert!(parse_profiles(raw).is_err());

        let mut p = rung("wide", 1280, 720, 2800, 128);
        p.width = MAX_DIMENSION + 1;
        assert!(p.validate().is_err());

        let p = rung("top", 7680, 4320, MAX_VIDEO_BITRATE_KBPS, MAX_AUDIO_BITRATE_KBPS);
        assert!(p.validate().is_ok());
        assert!(i32::try_from(p.total_bitrate_kbps()).is_ok());
    }

    #[test]
    fn codec_strings_follow_rfc6381() {
        let p = rung("720p", 1280, 720, 2800, 128);
        assert_eq!(p.codecs(), "avc1.64001f,mp4a.40.2");
    }
}
