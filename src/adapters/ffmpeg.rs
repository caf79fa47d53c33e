//! Encoder backed by the `ffmpeg` command-line tool.

use crate::domain::rendition::RenditionSpec;
use crate::ports::encoder::{EncodeError, Encoder, RenditionOutput};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    binary: PathBuf,
    segment_secs: u32,
}

impl FfmpegEncoder {
    pub fn new(binary: impl Into<PathBuf>, segment_secs: u32) -> Self {
        Self {
            binary: binary.into(),
            segment_secs,
        }
    }

    fn args(&self, source: &Path, rendition: &RenditionSpec, output_dir: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-y", "-hide_banner", "-nostdin", "-i"]
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push(source.as_os_str().to_owned());
        args.extend(
            [
                "-c:v".to_string(),
                "libx264".into(),
                "-c:a".into(),
                "aac".into(),
                "-vf".into(),
                format!("scale={}:{}", rendition.width, rendition.height),
                "-preset".into(),
                "veryfast".into(),
                "-hls_time".into(),
                self.segment_secs.to_string(),
                "-hls_playlist_type".into(),
                "vod".into(),
                "-hls_flags".into(),
                "independent_segments".into(),
                "-hls_segment_type".into(),
                "mpegts".into(),
                "-f".into(),
                "hls".into(),
                "-hls_segment_filename".into(),
            ]
            .into_iter()
            .map(OsString::from),
        );
        args.push(output_dir.join(rendition.segment_pattern()).into_os_string());
        args.push(output_dir.join(rendition.playlist_name()).into_os_string());
        args
    }

    async fn collect_segments(
        rendition: &RenditionSpec,
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>, EncodeError> {
        let mut segments = Vec::new();
        let mut entries = tokio::fs::read_dir(output_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_str().is_some_and(|n| rendition.is_segment_of(n)) {
                segments.push(entry.path());
            }
        }
        segments.sort();
        Ok(segments)
    }
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new("ffmpeg", 6)
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode_rendition(
        &self,
        source: &Path,
        rendition: &RenditionSpec,
        output_dir: &Path,
    ) -> Result<RenditionOutput, EncodeError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(self.args(source, rendition, output_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        // Dropping the future (fan-out timeout) must take the process down.
        cmd.kill_on_drop(true);

        debug!(rendition = rendition.name, command = ?cmd, "spawning encoder");
        let output = cmd.output().await.map_err(EncodeError::Spawn)?;

        if !output.status.success() {
            return Err(EncodeError::Exited {
                status: output.status.to_string(),
                stderr: stderr_tail(&output.stderr),
            });
        }

        let playlist = output_dir.join(rendition.playlist_name());
        if !tokio::fs::try_exists(&playlist).await? {
            return Err(EncodeError::MissingOutput(format!(
                "playlist {}",
                playlist.display()
            )));
        }

        let segments = Self::collect_segments(rendition, output_dir).await?;
        if segments.is_empty() {
            return Err(EncodeError::MissingOutput(format!(
                "segments for {}",
                rendition.name
            )));
        }

        info!(
            rendition = rendition.name,
            segments = segments.len(),
            "rendition encoded"
        );
        Ok(RenditionOutput { playlist, segments })
    }
}
