//! Media housekeeping around the fabric: a local store for imported
//! files and codec inspection to decide whether a file can be streamed
//! as-is.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use crate::error::FabricError;

/// Files untouched this long are fair game for cleanup.
pub const STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

// ── Media store ─────────────────────────────────────────────────────────────

/// Directory of imported media files, named by UUID so concurrent imports
/// of files with the same name never collide.
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, FabricError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy a file into the store under a fresh name, keeping its
    /// extension so content-type detection still works downstream.
    pub async fn import(&self, source: &Path) -> Result<PathBuf, FabricError> {
        let file_name = match source.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{}.{ext}", Uuid::new_v4()),
            None => Uuid::new_v4().to_string(),
        };
        let dest = self.root.join(file_name);
        tokio::fs::copy(source, &dest).await?;
        log::info!("imported {} as {}", source.display(), dest.display());
        Ok(dest)
    }

    /// Delete stored files not modified within `max_age`. Returns how
    /// many were removed.
    pub async fn cleanup(&self, max_age: Duration) -> Result<usize, FabricError> {
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let stale = metadata
                .modified()
                .ok()
                .and_then(|m| m.elapsed().ok())
                .is_some_and(|age| age >= max_age);
            if stale {
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    log::warn!("could not remove {}: {e}", entry.path().display());
                } else {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            log::info!("cleaned up {removed} stale media files");
        }
        Ok(removed)
    }
}

// ── Media analysis ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct MediaAnalysis {
    pub container: String,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    /// Duration in seconds, when the container reports one.
    pub duration: Option<f64>,
}

impl MediaAnalysis {
    /// Whether the file must be transcoded before browser-grade players
    /// can consume it. H.264 video with AAC or MP3 audio streams as-is.
    pub fn needs_normalization(&self) -> bool {
        let video_ok = matches!(self.video_codec.as_deref(), Some("h264") | None);
        let audio_ok = matches!(
            self.audio_codec.as_deref(),
            Some("aac") | Some("mp3") | None
        );
        !(video_ok && audio_ok)
    }
}

/// Codec inspection and normalization seam, so tests and embedders can
/// substitute their own implementations.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn analyze(&self, path: &Path) -> Result<MediaAnalysis, FabricError>;

    /// Re-encode into an H.264/AAC mp4 under `out_dir`, reporting
    /// completion fractions while the encode runs.
    async fn normalize(
        &self,
        path: &Path,
        out_dir: &Path,
        progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<PathBuf, FabricError>;
}

/// [`MediaProbe`] backed by the `ffprobe` and `ffmpeg` binaries.
pub struct Ffmpeg {
    ffprobe: PathBuf,
    ffmpeg: PathBuf,
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self {
            ffprobe: PathBuf::from("ffprobe"),
            ffmpeg: PathBuf::from("ffmpeg"),
        }
    }
}

#[async_trait]
impl MediaProbe for Ffmpeg {
    async fn analyze(&self, path: &Path) -> Result<MediaAnalysis, FabricError> {
        let output = tokio::process::Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .output()
            .await?;
        if !output.status.success() {
            return Err(FabricError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "ffprobe failed on {}: {}",
                    path.display(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            )));
        }
        parse_probe(&output.stdout)
    }

    async fn normalize(
        &self,
        path: &Path,
        out_dir: &Path,
        progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<PathBuf, FabricError> {
        let duration = self.analyze(path).await.ok().and_then(|a| a.duration);
        tokio::fs::create_dir_all(out_dir).await?;
        let out_path = out_dir.join(format!("{}.mp4", Uuid::new_v4()));

        let mut child = tokio::process::Command::new(&self.ffmpeg)
            .args(["-y", "-i"])
            .arg(path)
            .args([
                "-c:v",
                "libx264",
                "-preset",
                "fast",
                "-c:a",
                "aac",
                "-movflags",
                "+faststart",
                "-progress",
                "pipe:1",
                "-nostats",
                "-loglevel",
                "error",
            ])
            .arg(&out_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if let Some(fraction) = parse_encode_progress(&line, duration) {
                    progress(fraction);
                }
            }
        }
        let status = child.wait().await?;
        if !status.success() {
            let _ = tokio::fs::remove_file(&out_path).await;
            return Err(FabricError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("ffmpeg failed on {}", path.display()),
            )));
        }
        progress(1.0);
        log::info!("normalized {} into {}", path.display(), out_path.display());
        Ok(out_path)
    }
}

/// One line of ffmpeg `-progress pipe:1` output, turned into a
/// completion fraction when the total duration is known.
fn parse_encode_progress(line: &str, duration: Option<f64>) -> Option<f64> {
    let micros: f64 = line.strip_prefix("out_time_us=")?.trim().parse().ok()?;
    let total = duration.filter(|d| *d > 0.0)?;
    Some((micros / 1_000_000.0 / total).clamp(0.0, 1.0))
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: ProbeFormat,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    format_name: String,
    duration: Option<String>,
}

fn parse_probe(raw: &[u8]) -> Result<MediaAnalysis, FabricError> {
    let output: ProbeOutput = serde_json::from_slice(raw)
        .map_err(|e| FabricError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
    let codec_of = |kind: &str| {
        output
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some(kind))
            .and_then(|s| s.codec_name.clone())
    };
    Ok(MediaAnalysis {
        video_codec: codec_of("video"),
        audio_codec: codec_of("audio"),
        duration: output.format.duration.as_deref().and_then(|d| d.parse().ok()),
        container: output.format.format_name,
    })
}
