//! On-disk layout and durable writes for upload blobs.
//!
//! Blobs live beneath `base_path/{shard}/{shard}/{upload_id}.bin`, where the
//! shards are the first two bytes of MD5(upload_id). Thumbnails sit next to
//! their blob.

use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct BlobStore {
    base_path: PathBuf,
}

impl BlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Two-level shard identifiers for an upload id, lowercase hex (00–ff).
    fn shards(upload_id: &str) -> (String, String) {
        let digest = md5::compute(upload_id);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Fully-qualified blob path. Parent directories may not exist yet.
    pub fn blob_path(&self, upload_id: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::shards(upload_id);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(format!("{upload_id}.bin"));
        path
    }

    pub fn thumbnail_path(blob: &Path) -> PathBuf {
        blob.with_extension("thumb.jpg")
    }

    /// Write the first chunk of a new session.
    ///
    /// Bytes go to a temporary sibling, are fsynced, then renamed into place,
    /// so a half-written first chunk never appears under the final name.
    pub async fn write_initial(&self, path: &Path, data: &[u8]) -> io::Result<u64> {
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::new(ErrorKind::Other, "blob path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = write_temp(&parent, data).await?;
        if let Err(err) = fs::rename(&tmp_path, path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        Ok(data.len() as u64)
    }

    /// Append `data` after the first `committed_len` bytes of the blob.
    ///
    /// Anything past `committed_len` is the tail of an append whose metadata
    /// update never landed, and is discarded before writing. Returns the new
    /// committed length once the bytes are synced to disk.
    pub async fn append(&self, path: &Path, committed_len: u64, data: &[u8]) -> io::Result<u64> {
        let mut file = OpenOptions::new().write(true).open(path).await?;
        let on_disk = file.metadata().await?.len();
        if on_disk != committed_len {
            debug!(
                path = %path.display(),
                on_disk,
                committed_len,
                "discarding uncommitted blob tail"
            );
            file.set_len(committed_len).await?;
        }
        file.seek(SeekFrom::Start(committed_len)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_all().await?;

        Ok(committed_len + data.len() as u64)
    }

    /// Roll the blob back to `len` bytes after a failed metadata update.
    pub async fn truncate(&self, path: &Path, len: u64) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(path).await?;
        file.set_len(len).await?;
        file.sync_all().await
    }

    /// Remove a file, treating an already-missing file as success.
    ///
    /// Returns whether a file was actually removed.
    pub async fn remove_if_exists(&self, path: &Path) -> io::Result<bool> {
        match fs::remove_file(path).await {
            Ok(_) => {
                debug!("removed {}", path.display());
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", path.display());
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Remove empty shard directories from `start` up to, not including, the
    /// store root.
    pub async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Write `data` to a fresh temporary file inside `parent`.
///
/// A concurrent delete may prune `parent` between its creation and the file
/// create; the directory is recreated once in that case.
async fn write_temp(parent: &Path, data: &[u8]) -> io::Result<PathBuf> {
    let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
    let result = match write_synced(&tmp_path, data).await {
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!("shard {} vanished, recreating", parent.display());
            fs::create_dir_all(parent).await?;
            write_synced(&tmp_path, data).await
        }
        other => other,
    };

    match result {
        Ok(()) => Ok(tmp_path),
        Err(err) => {
            let _ = fs::remove_file(&tmp_path).await;
            Err(err)
        }
    }
}

async fn write_synced(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await
}
