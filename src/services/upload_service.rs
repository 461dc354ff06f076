//! src/services/upload_service.rs
//!
//! UploadService: the chunked upload state machine. Session metadata lives in
//! SQLite, the growing blob on local disk (see `BlobStore`). Each session moves
//! NEW → IN_PROGRESS → COMPLETE; an incomplete session past its TTL is treated
//! as expired and refuses further chunks.

use crate::{
    models::{
        chunk::{ChunkOutcome, ChunkSubmission},
        upload_session::{UploadSession, default_session_ttl},
    },
    services::{
        blob_store::BlobStore,
        finisher::{FfmpegThumbnailer, Finisher, Thumbnailer},
        session_locks::SessionLocks,
    },
};
use base64::{Engine as _, engine::general_purpose};
use chrono::{TimeDelta, Utc};
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{fs::File, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{field}: {message}")]
    Validation { field: &'static str, message: String },
    #[error("file does not exist")]
    NotFound,
    #[error("upload `{0}` has expired")]
    Gone(String),
    #[error("upload `{0}` was modified by another writer")]
    Conflict(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl UploadError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }
}

pub type UploadResult<T> = Result<T, UploadError>;

/// Receives chunks, assembles blobs, and finishes completed uploads.
///
/// Callers are expected to have authenticated and authorized the request; the
/// owner passed into every operation scopes all session lookups.
#[derive(Clone)]
pub struct UploadService {
    /// Shared SQLite connection pool used for session metadata.
    pub db: Arc<SqlitePool>,

    /// Blob layout and durable writes.
    pub blobs: BlobStore,

    session_ttl: TimeDelta,
    finisher: Finisher,
    locks: SessionLocks,
}

impl UploadService {
    /// Create a service storing blobs beneath `base_path`, with the default
    /// 12 hour session TTL and an ffmpeg thumbnailer.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            blobs: BlobStore::new(base_path),
            session_ttl: default_session_ttl(),
            finisher: Finisher::new(Arc::new(FfmpegThumbnailer::default())),
            locks: SessionLocks::default(),
        }
    }

    pub fn with_session_ttl(mut self, ttl: TimeDelta) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_thumbnailer(mut self, thumbnailer: Arc<dyn Thumbnailer>) -> Self {
        self.finisher = Finisher::new(thumbnailer);
        self
    }

    pub fn base_path(&self) -> &Path {
        self.blobs.base_path()
    }

    /// Apply one chunk submission.
    ///
    /// Without an upload id the chunk must be index 0 and opens a new session.
    /// With one, the chunk is appended only if it is exactly the next index;
    /// any other index is answered with the index the session still expects.
    pub async fn receive_chunk(&self, chunk: ChunkSubmission) -> UploadResult<ChunkOutcome> {
        validate_chunk(&chunk)?;

        match chunk.upload_id.as_deref() {
            None => self.start_session(&chunk).await,
            Some(upload_id) => self.continue_session(upload_id, &chunk).await,
        }
    }

    async fn start_session(&self, chunk: &ChunkSubmission) -> UploadResult<ChunkOutcome> {
        if chunk.chunk_index != 0 {
            return Err(UploadError::validation(
                "id",
                "id is required for every chunk after the first",
            ));
        }

        // Serializes session creation per owner so two id-less first chunks
        // cannot both pass the retransmission check.
        let owner_guard = self.locks.acquire(&format!("owner:{}", chunk.owner)).await;
        if let Some(pending) = self.find_pending_start(&chunk.owner, chunk.total_chunks).await? {
            debug!(
                upload_id = %pending.upload_id,
                owner = %chunk.owner,
                "first chunk resent without id"
            );
            return Err(UploadError::validation(
                "id",
                "an upload awaiting its second chunk already exists; resend with its id",
            ));
        }

        let upload_id = generate_upload_id();
        let _guard = self.locks.acquire(&upload_id).await;

        let file_path = self.blobs.blob_path(&upload_id);
        let bytes_written = self.blobs.write_initial(&file_path, &chunk.data).await?;

        let session = UploadSession {
            id: Uuid::new_v4(),
            upload_id,
            owner_id: chunk.owner.clone(),
            file_path: file_path.to_string_lossy().into_owned(),
            uploaded_on: Utc::now(),
            chunks_uploaded: 0,
            total_chunk: i64::from(chunk.total_chunks),
            bytes_written: bytes_written as i64,
            is_complete: false,
            mimetype: None,
            thumbnail_path: None,
            checksum: None,
            completed_at: None,
        };

        let insert_result = sqlx::query(
            "INSERT INTO upload_sessions (
                id, upload_id, owner_id, file_path, uploaded_on,
                chunks_uploaded, total_chunk, bytes_written, is_complete
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(session.id)
        .bind(&session.upload_id)
        .bind(&session.owner_id)
        .bind(&session.file_path)
        .bind(session.uploaded_on)
        .bind(session.chunks_uploaded)
        .bind(session.total_chunk)
        .bind(session.bytes_written)
        .execute(&*self.db)
        .await;

        if let Err(err) = insert_result {
            let _ = self.blobs.remove_if_exists(&file_path).await;
            return Err(UploadError::Sqlx(err));
        }
        drop(owner_guard);

        info!(
            upload_id = %session.upload_id,
            owner = %session.owner_id,
            total_chunk = session.total_chunk,
            "upload session started"
        );

        if session.all_chunks_written() {
            return self.complete(session).await;
        }

        Ok(ChunkOutcome::Accepted {
            next_chunk_index: session.next_chunk_index(),
            upload_id: session.upload_id,
        })
    }

    async fn continue_session(
        &self,
        upload_id: &str,
        chunk: &ChunkSubmission,
    ) -> UploadResult<ChunkOutcome> {
        let _guard = self.locks.acquire(upload_id).await;

        let session = self
            .fetch_open_session(upload_id, &chunk.owner, chunk.total_chunks)
            .await?;

        if session.is_expired(Utc::now(), self.session_ttl) {
            warn!(upload_id, uploaded_on = %session.uploaded_on, "rejecting chunk for expired upload");
            return Err(UploadError::Gone(upload_id.to_string()));
        }

        // Every byte is on disk but finishing never committed; only the final
        // index may trigger it again.
        let expected = if session.all_chunks_written() {
            session.total_chunk - 1
        } else {
            session.next_chunk_index()
        };

        let chunk_index = i64::from(chunk.chunk_index);
        if chunk_index != expected {
            debug!(
                upload_id,
                chunk_index, expected, "out-of-order chunk, asking client to resend"
            );
            return Ok(ChunkOutcome::OutOfOrder {
                upload_id: session.upload_id,
                next_chunk_index: expected,
            });
        }

        if session.all_chunks_written() {
            info!(upload_id, "final chunk already stored, resuming finish");
            return self.complete(session).await;
        }

        let session = self.append_chunk(session, &chunk.data).await?;
        if session.all_chunks_written() {
            return self.complete(session).await;
        }

        Ok(ChunkOutcome::Accepted {
            next_chunk_index: session.next_chunk_index(),
            upload_id: session.upload_id,
        })
    }

    /// Append bytes, then advance the counter.
    ///
    /// The counter update is gated on the previous value, and only happens
    /// after the blob write is synced. If the update fails the blob is cut
    /// back to its committed length.
    async fn append_chunk(
        &self,
        mut session: UploadSession,
        data: &[u8],
    ) -> UploadResult<UploadSession> {
        let path = PathBuf::from(&session.file_path);
        let committed_len = session.bytes_written as u64;
        let new_len = self.blobs.append(&path, committed_len, data).await?;
        let chunk_index = session.next_chunk_index();

        let update_result = sqlx::query(
            "UPDATE upload_sessions SET chunks_uploaded = ?, bytes_written = ?
             WHERE id = ? AND chunks_uploaded = ? AND is_complete = 0",
        )
        .bind(chunk_index)
        .bind(new_len as i64)
        .bind(session.id)
        .bind(session.chunks_uploaded)
        .execute(&*self.db)
        .await;

        match update_result {
            Ok(done) if done.rows_affected() == 1 => {}
            Ok(_) => return Err(UploadError::Conflict(session.upload_id)),
            Err(err) => {
                if let Err(io_err) = self.blobs.truncate(&path, committed_len).await {
                    warn!(
                        upload_id = %session.upload_id,
                        error = %io_err,
                        "failed to roll back blob after metadata error"
                    );
                }
                return Err(UploadError::Sqlx(err));
            }
        }

        debug!(
            upload_id = %session.upload_id,
            chunk_index,
            total_chunk = session.total_chunk,
            bytes_written = new_len,
            "chunk appended"
        );

        session.chunks_uploaded = chunk_index;
        session.bytes_written = new_len as i64;
        Ok(session)
    }

    /// Run the finisher and mark the session complete.
    async fn complete(&self, session: UploadSession) -> UploadResult<ChunkOutcome> {
        let finished = self
            .finisher
            .finish(&session.upload_id, Path::new(&session.file_path))
            .await?;

        let result = sqlx::query(
            "UPDATE upload_sessions
             SET is_complete = 1, mimetype = ?, thumbnail_path = ?, checksum = ?, completed_at = ?
             WHERE id = ? AND is_complete = 0",
        )
        .bind(&finished.mimetype)
        .bind(&finished.thumbnail_path)
        .bind(&finished.checksum)
        .bind(Utc::now())
        .bind(session.id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(UploadError::Conflict(session.upload_id));
        }

        info!(
            upload_id = %session.upload_id,
            size_bytes = session.bytes_written,
            "upload complete"
        );

        Ok(ChunkOutcome::Completed {
            id: session.id,
            upload_id: session.upload_id,
        })
    }

    /// Fetch a session that can still accept chunks.
    ///
    /// A mismatched owner or declared chunk count is indistinguishable from a
    /// missing session.
    async fn fetch_open_session(
        &self,
        upload_id: &str,
        owner: &str,
        total_chunks: u32,
    ) -> UploadResult<UploadSession> {
        sqlx::query_as::<_, UploadSession>(
            "SELECT id, upload_id, owner_id, file_path, uploaded_on, chunks_uploaded,
                    total_chunk, bytes_written, is_complete, mimetype, thumbnail_path,
                    checksum, completed_at
             FROM upload_sessions
             WHERE upload_id = ? AND owner_id = ? AND total_chunk = ? AND is_complete = 0",
        )
        .bind(upload_id)
        .bind(owner)
        .bind(i64::from(total_chunks))
        .fetch_optional(&*self.db)
        .await?
        .ok_or(UploadError::NotFound)
    }

    /// Live session of `owner` that holds only its first chunk and declares
    /// the same chunk count. A new id-less chunk 0 matching one is a resend.
    async fn find_pending_start(
        &self,
        owner: &str,
        total_chunks: u32,
    ) -> UploadResult<Option<UploadSession>> {
        let candidates = sqlx::query_as::<_, UploadSession>(
            "SELECT id, upload_id, owner_id, file_path, uploaded_on, chunks_uploaded,
                    total_chunk, bytes_written, is_complete, mimetype, thumbnail_path,
                    checksum, completed_at
             FROM upload_sessions
             WHERE owner_id = ? AND total_chunk = ? AND chunks_uploaded = 0 AND is_complete = 0",
        )
        .bind(owner)
        .bind(i64::from(total_chunks))
        .fetch_all(&*self.db)
        .await?;

        let now = Utc::now();
        Ok(candidates
            .into_iter()
            .find(|session| !session.is_expired(now, self.session_ttl)))
    }

    /// Fetch a session owned by `owner`, complete or not.
    pub async fn get_session(&self, upload_id: &str, owner: &str) -> UploadResult<UploadSession> {
        sqlx::query_as::<_, UploadSession>(
            "SELECT id, upload_id, owner_id, file_path, uploaded_on, chunks_uploaded,
                    total_chunk, bytes_written, is_complete, mimetype, thumbnail_path,
                    checksum, completed_at
             FROM upload_sessions
             WHERE upload_id = ? AND owner_id = ?",
        )
        .bind(upload_id)
        .bind(owner)
        .fetch_optional(&*self.db)
        .await?
        .ok_or(UploadError::NotFound)
    }

    /// Open a completed blob for reading.
    ///
    /// Incomplete sessions, and sessions whose blob vanished, are reported as
    /// not found.
    pub async fn open_content(
        &self,
        upload_id: &str,
        owner: &str,
    ) -> UploadResult<(UploadSession, File)> {
        let session = self.get_session(upload_id, owner).await?;
        if !session.is_complete {
            return Err(UploadError::NotFound);
        }

        let file = File::open(&session.file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                UploadError::NotFound
            } else {
                UploadError::Io(err)
            }
        })?;

        Ok((session, file))
    }

    /// Delete a session with its blob and thumbnail.
    ///
    /// Called when the media entity owning the upload goes away.
    pub async fn delete_session(&self, upload_id: &str, owner: &str) -> UploadResult<UploadSession> {
        let _guard = self.locks.acquire(upload_id).await;
        let session = self.get_session(upload_id, owner).await?;
        self.remove_session(&session).await?;

        info!(upload_id, owner, "upload deleted");
        Ok(session)
    }

    /// Blob first, then thumbnail, then the row. Missing files are fine.
    async fn remove_session(&self, session: &UploadSession) -> UploadResult<()> {
        let blob = PathBuf::from(&session.file_path);
        self.blobs.remove_if_exists(&blob).await?;

        if let Some(thumbnail) = session.thumbnail_path.as_deref() {
            self.blobs.remove_if_exists(Path::new(thumbnail)).await?;
        }

        sqlx::query("DELETE FROM upload_sessions WHERE id = ?")
            .bind(session.id)
            .execute(&*self.db)
            .await?;

        if let Some(parent) = blob.parent() {
            self.blobs.prune_empty_dirs(parent).await;
        }

        Ok(())
    }

    /// Remove every incomplete session past its TTL. Returns how many went.
    pub async fn purge_expired(&self) -> UploadResult<usize> {
        let candidates = sqlx::query_as::<_, UploadSession>(
            "SELECT id, upload_id, owner_id, file_path, uploaded_on, chunks_uploaded,
                    total_chunk, bytes_written, is_complete, mimetype, thumbnail_path,
                    checksum, completed_at
             FROM upload_sessions
             WHERE is_complete = 0
             ORDER BY uploaded_on ASC",
        )
        .fetch_all(&*self.db)
        .await?;

        let now = Utc::now();
        let mut purged = 0;
        for candidate in candidates
            .into_iter()
            .filter(|session| session.is_expired(now, self.session_ttl))
        {
            let _guard = self.locks.acquire(&candidate.upload_id).await;

            // Re-check under the lock; a chunk may have completed it meanwhile.
            let current = sqlx::query_as::<_, UploadSession>(
                "SELECT id, upload_id, owner_id, file_path, uploaded_on, chunks_uploaded,
                        total_chunk, bytes_written, is_complete, mimetype, thumbnail_path,
                        checksum, completed_at
                 FROM upload_sessions
                 WHERE id = ?",
            )
            .bind(candidate.id)
            .fetch_optional(&*self.db)
            .await?;

            let Some(session) = current.filter(|s| s.is_expired(now, self.session_ttl)) else {
                continue;
            };

            match self.remove_session(&session).await {
                Ok(()) => {
                    debug!(upload_id = %session.upload_id, "purged expired upload");
                    purged += 1;
                }
                Err(err) => warn!(
                    upload_id = %session.upload_id,
                    error = %err,
                    "failed to purge expired upload"
                ),
            }
        }

        Ok(purged)
    }

    /// Periodically purge expired sessions in the background.
    pub fn spawn_expiry_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match service.purge_expired().await {
                    Ok(0) => debug!("expiry sweep found nothing to purge"),
                    Ok(purged) => info!(purged, "expiry sweep removed stale uploads"),
                    Err(err) => warn!(error = %err, "expiry sweep failed"),
                }
            }
        })
    }
}

fn validate_chunk(chunk: &ChunkSubmission) -> UploadResult<()> {
    if chunk.data.is_empty() {
        return Err(UploadError::validation("file", "The submitted file is empty."));
    }
    if chunk.total_chunks == 0 {
        return Err(UploadError::validation(
            "total_chunk",
            "Ensure this value is greater than or equal to 1.",
        ));
    }
    if chunk.chunk_index >= chunk.total_chunks {
        return Err(UploadError::validation(
            "chunk_index",
            "chunk index must be less than total chunk",
        ));
    }
    Ok(())
}

/// Fresh opaque token: 16 random bytes, URL-safe base64 without padding.
fn generate_upload_id() -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::finisher::tests::{
        BrokenThumbnailer, MP4_HEADER, PNG_HEADER, StubThumbnailer,
    };
    use bytes::Bytes;
    use sqlx::sqlite::SqlitePoolOptions;

    const OWNER: &str = "admin";

    async fn test_service(dir: &Path) -> UploadService {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        UploadService::new(Arc::new(pool), dir).with_thumbnailer(Arc::new(StubThumbnailer))
    }

    fn chunk(upload_id: Option<&str>, chunk_index: u32, total_chunks: u32, data: &[u8]) -> ChunkSubmission {
        ChunkSubmission {
            owner: OWNER.into(),
            upload_id: upload_id.map(str::to_string),
            chunk_index,
            total_chunks,
            data: Bytes::copy_from_slice(data),
        }
    }

    async fn start(service: &UploadService, total: u32, data: &[u8]) -> String {
        match service.receive_chunk(chunk(None, 0, total, data)).await.unwrap() {
            ChunkOutcome::Accepted {
                upload_id,
                next_chunk_index,
            } => {
                assert_eq!(next_chunk_index, 1);
                upload_id
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    async fn blob_len(service: &UploadService, upload_id: &str) -> u64 {
        let session = service.get_session(upload_id, OWNER).await.unwrap();
        tokio::fs::metadata(&session.file_path).await.unwrap().len()
    }

    #[tokio::test]
    async fn three_chunks_assemble_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path()).await;

        let id = start(&service, 3, b"aaaa").await;

        let second = service.receive_chunk(chunk(Some(&id), 1, 3, b"bb")).await.unwrap();
        assert_eq!(
            second,
            ChunkOutcome::Accepted {
                upload_id: id.clone(),
                next_chunk_index: 2
            }
        );
        assert_eq!(service.get_session(&id, OWNER).await.unwrap().chunks_uploaded, 1);

        let last = service.receive_chunk(chunk(Some(&id), 2, 3, b"c")).await.unwrap();
        let session = service.get_session(&id, OWNER).await.unwrap();
        assert_eq!(
            last,
            ChunkOutcome::Completed {
                id: session.id,
                upload_id: id.clone()
            }
        );
        assert!(session.is_complete);
        assert_eq!(session.chunks_uploaded, 2);
        assert_eq!(session.bytes_written, 7);
        assert_eq!(session.checksum.as_deref(), Some(format!("{:x}", md5::compute(b"aaaabbc")).as_str()));
        assert_eq!(tokio::fs::read(&session.file_path).await.unwrap(), b"aaaabbc");
    }

    #[tokio::test]
    async fn later_chunk_without_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path()).await;
        start(&service, 3, b"aaaa").await;

        let err = service.receive_chunk(chunk(None, 1, 3, b"bb")).await.unwrap_err();
        assert!(matches!(err, UploadError::Validation { field: "id", .. }));
    }

    #[tokio::test]
    async fn resent_first_chunk_without_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path()).await;
        let id = start(&service, 3, b"aaaa").await;

        let err = service.receive_chunk(chunk(None, 0, 3, b"aaaa")).await.unwrap_err();
        assert!(matches!(err, UploadError::Validation { field: "id", .. }));

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_sessions")
            .fetch_one(&*service.db)
            .await
            .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(blob_len(&service, &id).await, 4);

        // A different declared size is a different file.
        start(&service, 5, b"other").await;
    }

    #[tokio::test]
    async fn first_chunk_may_restart_once_pending_session_moved_on_or_expired() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path()).await;

        let progressed = start(&service, 3, b"aaaa").await;
        service
            .receive_chunk(chunk(Some(&progressed), 1, 3, b"bb"))
            .await
            .unwrap();
        let second = start(&service, 3, b"cccc").await;
        assert_ne!(second, progressed);

        sqlx::query("UPDATE upload_sessions SET uploaded_on = ? WHERE upload_id = ?")
            .bind(Utc::now() - TimeDelta::hours(13))
            .bind(&second)
            .execute(&*service.db)
            .await
            .unwrap();
        let third = start(&service, 3, b"dddd").await;
        assert_ne!(third, second);
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path()).await;

        let err = service.receive_chunk(chunk(None, 3, 3, b"x")).await.unwrap_err();
        assert!(matches!(err, UploadError::Validation { field: "chunk_index", .. }));

        let err = service.receive_chunk(chunk(None, 0, 0, b"x")).await.unwrap_err();
        assert!(matches!(err, UploadError::Validation { field: "total_chunk", .. }));

        let err = service.receive_chunk(chunk(None, 0, 2, b"")).await.unwrap_err();
        assert!(matches!(err, UploadError::Validation { field: "file", .. }));

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM upload_sessions")
            .fetch_one(&*service.db)
            .await
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn duplicate_chunk_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path()).await;
        let id = start(&service, 4, b"aaaa").await;
        service.receive_chunk(chunk(Some(&id), 1, 4, b"bb")).await.unwrap();
        let before = blob_len(&service, &id).await;

        for _ in 0..2 {
            let outcome = service.receive_chunk(chunk(Some(&id), 1, 4, b"bb")).await.unwrap();
            assert_eq!(
                outcome,
                ChunkOutcome::OutOfOrder {
                    upload_id: id.clone(),
                    next_chunk_index: 2
                }
            );
        }

        assert_eq!(blob_len(&service, &id).await, before);
        assert_eq!(service.get_session(&id, OWNER).await.unwrap().chunks_uploaded, 1);
    }

    #[tokio::test]
    async fn skipped_chunk_asks_for_resend() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path()).await;
        let id = start(&service, 5, b"aaaa").await;
        service.receive_chunk(chunk(Some(&id), 1, 5, b"bb")).await.unwrap();
        let before = blob_len(&service, &id).await;

        let outcome = service.receive_chunk(chunk(Some(&id), 3, 5, b"dd")).await.unwrap();
        assert_eq!(
            outcome,
            ChunkOutcome::OutOfOrder {
                upload_id: id.clone(),
                next_chunk_index: 2
            }
        );
        assert_eq!(blob_len(&service, &id).await, before);
    }

    #[tokio::test]
    async fn unknown_or_foreign_sessions_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path()).await;
        let id = start(&service, 3, b"aaaa").await;

        let err = service
            .receive_chunk(chunk(Some("nope"), 1, 3, b"bb"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::NotFound));

        let mut foreign = chunk(Some(&id), 1, 3, b"bb");
        foreign.owner = "someone-else".into();
        assert!(matches!(
            service.receive_chunk(foreign).await.unwrap_err(),
            UploadError::NotFound
        ));

        let err = service
            .receive_chunk(chunk(Some(&id), 1, 4, b"bb"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::NotFound));
    }

    #[tokio::test]
    async fn completed_session_rejects_more_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path()).await;
        let id = start(&service, 2, b"aa").await;
        service.receive_chunk(chunk(Some(&id), 1, 2, b"bb")).await.unwrap();

        let err = service
            .receive_chunk(chunk(Some(&id), 1, 2, b"bb"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::NotFound));
    }

    #[tokio::test]
    async fn expired_session_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path()).await;
        let id = start(&service, 3, b"aaaa").await;

        sqlx::query("UPDATE upload_sessions SET uploaded_on = ? WHERE upload_id = ?")
            .bind(Utc::now() - TimeDelta::hours(13))
            .bind(&id)
            .execute(&*service.db)
            .await
            .unwrap();

        let err = service
            .receive_chunk(chunk(Some(&id), 1, 3, b"bb"))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Gone(ref gone) if gone == &id));
        assert_eq!(blob_len(&service, &id).await, 4);
    }

    #[tokio::test]
    async fn single_chunk_video_gets_thumbnail() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path()).await;

        let outcome = service.receive_chunk(chunk(None, 0, 1, &MP4_HEADER)).await.unwrap();
        let ChunkOutcome::Completed { upload_id, .. } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };

        let session = service.get_session(&upload_id, OWNER).await.unwrap();
        assert!(session.is_complete);
        assert_eq!(session.chunks_uploaded, 0);
        assert!(session.mimetype.as_deref().unwrap().contains("video"));
        let thumbnail = session.thumbnail_path.expect("thumbnail");
        assert!(Path::new(&thumbnail).is_file());
    }

    #[tokio::test]
    async fn single_chunk_image_has_no_thumbnail() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path()).await;

        let outcome = service.receive_chunk(chunk(None, 0, 1, &PNG_HEADER)).await.unwrap();
        let session = service.get_session(outcome.upload_id(), OWNER).await.unwrap();
        assert!(session.is_complete);
        assert_eq!(session.mimetype.as_deref(), Some("image/png"));
        assert!(session.thumbnail_path.is_none());
    }

    #[tokio::test]
    async fn thumbnail_failure_still_completes() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path())
            .await
            .with_thumbnailer(Arc::new(BrokenThumbnailer));

        let outcome = service.receive_chunk(chunk(None, 0, 1, &MP4_HEADER)).await.unwrap();
        assert!(matches!(outcome, ChunkOutcome::Completed { .. }));

        let session = service.get_session(outcome.upload_id(), OWNER).await.unwrap();
        assert!(session.is_complete);
        assert!(session.thumbnail_path.is_none());
    }

    #[tokio::test]
    async fn resending_final_chunk_resumes_interrupted_finish() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path()).await;
        let id = start(&service, 2, b"aa").await;

        // Final append committed but finishing never did.
        let session = service.get_session(&id, OWNER).await.unwrap();
        let new_len = service
            .blobs
            .append(Path::new(&session.file_path), 2, b"bb")
            .await
            .unwrap();
        sqlx::query("UPDATE upload_sessions SET chunks_uploaded = 1, bytes_written = ? WHERE id = ?")
            .bind(new_len as i64)
            .bind(session.id)
            .execute(&*service.db)
            .await
            .unwrap();

        let early = service.receive_chunk(chunk(Some(&id), 0, 2, b"aa")).await.unwrap();
        assert_eq!(
            early,
            ChunkOutcome::OutOfOrder {
                upload_id: id.clone(),
                next_chunk_index: 1
            }
        );

        let outcome = service.receive_chunk(chunk(Some(&id), 1, 2, b"bb")).await.unwrap();
        assert!(matches!(outcome, ChunkOutcome::Completed { .. }));
        assert_eq!(blob_len(&service, &id).await, 4);
    }

    #[tokio::test]
    async fn concurrent_duplicates_append_once() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path()).await;
        let id = start(&service, 3, b"aaaa").await;

        let tasks = (0..4)
            .map(|_| {
                let service = service.clone();
                let id = id.clone();
                tokio::spawn(async move {
                    service.receive_chunk(chunk(Some(&id), 1, 3, b"bbb")).await.unwrap()
                })
            })
            .collect::<Vec<_>>();

        let mut accepted = 0;
        for task in tasks {
            match task.await.unwrap() {
                ChunkOutcome::Accepted { .. } => accepted += 1,
                ChunkOutcome::OutOfOrder { next_chunk_index, .. } => assert_eq!(next_chunk_index, 2),
                other => panic!("unexpected outcome {other:?}"),
            }
        }

        assert_eq!(accepted, 1);
        assert_eq!(blob_len(&service, &id).await, 7);
    }

    #[tokio::test]
    async fn delete_removes_blob_thumbnail_and_row() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path()).await;
        let outcome = service.receive_chunk(chunk(None, 0, 1, &MP4_HEADER)).await.unwrap();
        let session = service.get_session(outcome.upload_id(), OWNER).await.unwrap();
        let thumbnail = session.thumbnail_path.clone().unwrap();

        service.delete_session(&session.upload_id, OWNER).await.unwrap();

        assert!(!Path::new(&session.file_path).exists());
        assert!(!Path::new(&thumbnail).exists());
        assert!(matches!(
            service.get_session(&session.upload_id, OWNER).await.unwrap_err(),
            UploadError::NotFound
        ));
        assert!(matches!(
            service.delete_session(&session.upload_id, OWNER).await.unwrap_err(),
            UploadError::NotFound
        ));
    }

    #[tokio::test]
    async fn delete_tolerates_missing_blob() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path()).await;
        let id = start(&service, 2, b"aa").await;
        let session = service.get_session(&id, OWNER).await.unwrap();
        tokio::fs::remove_file(&session.file_path).await.unwrap();

        service.delete_session(&id, OWNER).await.unwrap();
        assert!(matches!(
            service.get_session(&id, OWNER).await.unwrap_err(),
            UploadError::NotFound
        ));
    }

    #[tokio::test]
    async fn purge_removes_only_expired_incomplete_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path()).await;
        let stale = start(&service, 3, b"old").await;
        let fresh = start(&service, 4, b"new").await;
        let done = service
            .receive_chunk(chunk(None, 0, 1, &PNG_HEADER))
            .await
            .unwrap()
            .upload_id()
            .to_string();

        sqlx::query("UPDATE upload_sessions SET uploaded_on = ? WHERE upload_id IN (?, ?)")
            .bind(Utc::now() - TimeDelta::hours(13))
            .bind(&stale)
            .bind(&done)
            .execute(&*service.db)
            .await
            .unwrap();
        let stale_path = service.get_session(&stale, OWNER).await.unwrap().file_path;

        assert_eq!(service.purge_expired().await.unwrap(), 1);
        assert!(!Path::new(&stale_path).exists());
        assert!(matches!(
            service.get_session(&stale, OWNER).await.unwrap_err(),
            UploadError::NotFound
        ));
        service.get_session(&fresh, OWNER).await.unwrap();
        service.get_session(&done, OWNER).await.unwrap();
    }

    #[tokio::test]
    async fn content_is_only_served_when_complete() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path()).await;
        let id = start(&service, 2, b"aa").await;

        assert!(matches!(
            service.open_content(&id, OWNER).await.unwrap_err(),
            UploadError::NotFound
        ));

        service.receive_chunk(chunk(Some(&id), 1, 2, b"bb")).await.unwrap();
        let (session, _file) = service.open_content(&id, OWNER).await.unwrap();
        assert!(session.is_complete);
    }

    #[test]
    fn upload_ids_are_url_safe_and_unique() {
        let a = generate_upload_id();
        let b = generate_upload_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 22);
        assert!(a.bytes().all(|c| c.is_ascii_alphanumeric() || c == b'-' || c == b'_'));
    }
}
