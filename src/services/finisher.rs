//! Completion step for a fully assembled upload.
//!
//! Sniffs the content type from the blob's leading bytes, computes an MD5
//! checksum, and for video content extracts a still frame as a thumbnail.
//! Thumbnailing is best effort: any failure is logged and the upload still
//! completes.

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use md5::Context as Md5Context;
use std::{
    io,
    path::{Path, PathBuf},
    process::{Output, Stdio},
    sync::Arc,
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::AsyncReadExt,
    process::Command,
};
use tracing::{debug, info, warn};

use crate::services::blob_store::BlobStore;

/// Bytes handed to the content sniffer.
const SNIFF_LEN: usize = 8192;
const READ_BUF_LEN: usize = 64 * 1024;

/// Fallback content type when no signature matches.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Fraction of the duration at which the thumbnail frame is taken.
const THUMBNAIL_POSITION: f64 = 0.3;
/// Upper bound on the thumbnail seek offset, in seconds.
const THUMBNAIL_MAX_OFFSET_SECS: f64 = 5.0;

/// Default limit on each ffprobe/ffmpeg run.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Extracts a single still frame from a video file.
pub trait Thumbnailer: Send + Sync {
    fn extract_frame<'a>(&'a self, video: &'a Path, dest: &'a Path) -> BoxFuture<'a, Result<()>>;
}

/// Seek offset for the thumbnail frame: 30% into the video, capped at 5s.
pub fn thumbnail_offset(duration_secs: f64) -> f64 {
    if !duration_secs.is_finite() || duration_secs <= 0.0 {
        return 0.0;
    }
    (duration_secs * THUMBNAIL_POSITION).min(THUMBNAIL_MAX_OFFSET_SECS)
}

/// Thumbnailer backed by the `ffprobe` and `ffmpeg` binaries.
#[derive(Clone, Debug)]
pub struct FfmpegThumbnailer {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    timeout: Duration,
}

impl FfmpegThumbnailer {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Bound each external tool run; a run past the limit is killed.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, mut command: Command, program: &str) -> Result<Output> {
        command.kill_on_drop(true);
        match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(output) => output.with_context(|| format!("failed to run {program}")),
            Err(_) => anyhow::bail!("{program} timed out after {:?}", self.timeout),
        }
    }

    async fn probe_duration(&self, video: &Path) -> Result<f64> {
        let mut command = Command::new(&self.ffprobe);
        command
            .stdin(Stdio::null())
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("json")
            .arg(video);
        let output = self.run(command, "ffprobe").await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("ffprobe failed: {}", stderr.trim());
        }

        let v: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        let duration = v["format"]["duration"]
            .as_str()
            .context("no duration found")?
            .parse::<f64>()?;
        Ok(duration)
    }
}

impl Default for FfmpegThumbnailer {
    fn default() -> Self {
        Self::new("ffmpeg", "ffprobe")
    }
}

impl Thumbnailer for FfmpegThumbnailer {
    fn extract_frame<'a>(&'a self, video: &'a Path, dest: &'a Path) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let duration = self.probe_duration(video).await?;
            let seek_time = thumbnail_offset(duration);
            debug!(video = %video.display(), duration, seek_time, "extracting thumbnail frame");

            let mut command = Command::new(&self.ffmpeg);
            command
                .stdin(Stdio::null())
                .arg("-loglevel")
                .arg("error")
                .arg("-y")
                .arg("-ss")
                .arg(format!("{seek_time:.3}"))
                .arg("-i")
                .arg(video)
                .arg("-frames:v")
                .arg("1")
                .arg("-q:v")
                .arg("2")
                .arg("-f")
                .arg("image2")
                .arg(dest);
            let output = self.run(command, "ffmpeg").await?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                anyhow::bail!("ffmpeg exited with {}: {}", output.status, stderr.trim());
            }
            Ok(())
        })
    }
}

/// Derived metadata for a completed upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinishedMedia {
    pub mimetype: String,
    pub thumbnail_path: Option<String>,
    pub checksum: String,
}

#[derive(Clone)]
pub struct Finisher {
    thumbnailer: Arc<dyn Thumbnailer>,
}

impl Finisher {
    pub fn new(thumbnailer: Arc<dyn Thumbnailer>) -> Self {
        Self { thumbnailer }
    }

    /// Inspect the assembled blob and derive its completion metadata.
    ///
    /// Only I/O errors reading the blob itself are returned; thumbnail
    /// problems are swallowed.
    pub async fn finish(&self, upload_id: &str, blob: &Path) -> io::Result<FinishedMedia> {
        let (mimetype, checksum) = inspect_blob(blob).await?;

        let thumbnail_path = if is_video(&mimetype) {
            self.render_thumbnail(upload_id, blob).await
        } else {
            None
        };

        info!(
            upload_id,
            mimetype = %mimetype,
            thumbnail = thumbnail_path.is_some(),
            "upload finished"
        );

        Ok(FinishedMedia {
            mimetype,
            thumbnail_path,
            checksum,
        })
    }

    async fn render_thumbnail(&self, upload_id: &str, blob: &Path) -> Option<String> {
        let dest = BlobStore::thumbnail_path(blob);
        let result = match self.thumbnailer.extract_frame(blob, &dest).await {
            Ok(()) => match fs::metadata(&dest).await {
                Ok(meta) if meta.is_file() => Ok(()),
                _ => Err(anyhow::anyhow!("thumbnailer reported success but wrote no file")),
            },
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => Some(dest.to_string_lossy().into_owned()),
            Err(err) => {
                warn!(upload_id, error = ?err, "thumbnail extraction failed");
                let _ = fs::remove_file(&dest).await;
                None
            }
        }
    }
}

pub fn is_video(mimetype: &str) -> bool {
    mimetype.starts_with("video/")
}

/// Content type sniffed from leading bytes.
pub fn sniff_mimetype(head: &[u8]) -> String {
    infer::get(head)
        .map(|kind| kind.mime_type().to_string())
        .unwrap_or_else(|| OCTET_STREAM.to_string())
}

/// One pass over the blob: MD5 of everything, sniffing on the first bytes.
async fn inspect_blob(blob: &Path) -> io::Result<(String, String)> {
    let mut file = File::open(blob).await?;
    let mut digest = Md5Context::new();
    let mut head = Vec::with_capacity(SNIFF_LEN);
    let mut buf = vec![0u8; READ_BUF_LEN];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if head.len() < SNIFF_LEN {
            let take = (SNIFF_LEN - head.len()).min(n);
            head.extend_from_slice(&buf[..take]);
        }
        digest.consume(&buf[..n]);
    }

    Ok((sniff_mimetype(&head), format!("{:x}", digest.compute())))
}
