use async_trait::async_trait;
use std::collections::VecDeque;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::modules::transcoding::executor::{EncodeError, EncodeExecutor, EncodeOutput, EncodeRequest, ProgressFn};
use crate::modules::transcoding::profile::{Container, QualityProfile};

const PLAYLIST: &str = "index.m3u8";
const STDERR_TAIL: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Encoded media time so far, in seconds.
    OutTime(f64),
    End,
}

/// Parses one `key=value` line of `-progress pipe:1` output.
pub fn parse_progress_line(line: &str) -> Option<ProgressEvent> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        // Both keys carry microseconds.
        "out_time_us" | "out_time_ms" => {
            let micros: i64 = value.parse().ok()?;
            (micros >= 0).then(|| ProgressEvent::OutTime(micros as f64 / 1_000_000.0))
        }
        "progress" if value == "end" => Some(ProgressEvent::End),
        _ => None,
    }
}

fn encoder_for(codec: &str) -> &str {
    match codec {
        "h264" => "libx264",
        "h265" | "hevc" => "libx265",
        "av1" => "libsvtav1",
        "vp9" => "libvpx-vp9",
        "opus" => "libopus",
        other => other,
    }
}

/// Runs the system `ffmpeg` binary, writing one HLS rendition per call.
pub struct FfmpegExecutor {
    binary: String,
}

impl FfmpegExecutor {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    pub fn build_args(request: &EncodeRequest) -> Vec<String> {
        let p: &QualityProfile = &request.profile;
        let seg = request.segment_seconds.max(1);
        let dir = request.output_dir.display();
        let (segment_type, segment_ext) = match p.container {
            Container::Fmp4 => ("fmp4", "m4s"),
            Container::Ts => ("mpegts", "ts"),
        };

        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-y".into(),
            "-i".into(),
            request.input.display().to_string(),
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            "0:a:0?".into(),
            "-vf".into(),
            format!("scale={}:{}", p.width, p.height),
            "-c:v".into(),
            encoder_for(&p.video_codec).to_string(),
            "-b:v".into(),
            format!("{}k", p.video_bitrate_kbps),
            "-maxrate".into(),
            format!("{}k", p.video_bitrate_kbps * 107 / 100),
            "-bufsize".into(),
            format!("{}k", p.video_bitrate_kbps * 3 / 2),
            "-force_key_frames".into(),
            format!("expr:gte(t,n_forced*{})", seg),
            "-c:a".into(),
            encoder_for(&p.audio_codec).to_string(),
            "-b:a".into(),
            format!("{}k", p.audio_bitrate_kbps),
            "-ac".into(),
            "2".into(),
            "-f".into(),
            "hls".into(),
            "-hls_time".into(),
            seg.to_string(),
            "-hls_playlist_type".into(),
            "vod".into(),
            "-hls_segment_type".into(),
            segment_type.into(),
            "-start_number".into(),
            "0".into(),
            "-hls_segment_filename".into(),
            format!("{}/segment_%05d.{}", dir, segment_ext),
        ];
        if p.container == Container::Fmp4 {
            args.push("-hls_fmp4_init_filename".into());
            args.push("init.mp4".into());
        }
        args.extend(p.extra_args.iter().cloned());
        args.extend(["-progress".into(), "pipe:1".into(), "-nostats".into()]);
        args.push(format!("{}/{}", dir, PLAYLIST));
        args
    }
}

#[async_trait]
impl EncodeExecutor for FfmpegExecutor {
    async fn run(
        &self,
        request: EncodeRequest,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<EncodeOutput, EncodeError> {
        tokio::fs::create_dir_all(&request.output_dir).await?;
        let label = request.profile.label.clone();
        let args = Self::build_args(&request);
        debug!(rendition = %label, "{} {}", self.binary, args.join(" "));

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EncodeError::Failed("ffmpeg stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EncodeError::Failed("ffmpeg stderr not captured".into()))?;

        let duration = request.source_duration.filter(|d| *d > 0.0);
        let progress_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match parse_progress_line(&line) {
                    Some(ProgressEvent::OutTime(secs)) => {
                        if let Some(total) = duration {
                            on_progress((secs / total).min(0.99) as f32);
                        }
                    }
                    Some(ProgressEvent::End) => on_progress(1.0),
                    None => {}
                }
            }
        });

        let stderr_task = tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                warn!(rendition = %label, "Cancelling ffmpeg");
                if let Err(e) = child.start_kill() {
                    warn!(rendition = %label, "Failed to signal ffmpeg: {}", e);
                }
                let _ = child.wait().await;
                progress_task.abort();
                stderr_task.abort();
                return Err(EncodeError::Cancelled);
            }
        };

        let _ = progress_task.await;
        let stderr_tail = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(EncodeError::Failed(format!(
                "ffmpeg exited with {} for {}: {}",
                status,
                label,
                stderr_tail.lines().last().unwrap_or("no output")
            )));
        }

        let playlist = request.output_dir.join(PLAYLIST);
        if !tokio::fs::try_exists(&playlist).await? {
            return Err(EncodeError::Failed(format!("ffmpeg produced no playlist for {}", label)));
        }

        info!(rendition = %label, "ffmpeg finished");
        Ok(EncodeOutput {
            output_dir: request.output_dir,
            playlist: PLAYLIST.to_string(),
        })
    }
}
