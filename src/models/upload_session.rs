//! Represents a chunked upload session and its persisted progress.

use chrono::{DateTime, TimeDelta, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Hours an incomplete session lives before it stops accepting chunks.
pub const DEFAULT_SESSION_TTL_HOURS: i64 = 12;

pub fn default_session_ttl() -> TimeDelta {
    TimeDelta::hours(DEFAULT_SESSION_TTL_HOURS)
}

/// One logical file being assembled from sequential chunks.
///
/// The blob at `file_path` always holds exactly `bytes_written` committed bytes,
/// which are chunks `0..=chunks_uploaded` in submission order.
#[derive(Clone, FromRow, Debug)]
pub struct UploadSession {
    /// Internal UUID, returned to the client as `id` once the upload completes.
    pub id: Uuid,

    /// Opaque token handed to the client on the first chunk.
    pub upload_id: String,

    /// Identity of the caller that opened the session.
    pub owner_id: String,

    /// Location of the accumulating blob on disk.
    pub file_path: String,

    /// When the first chunk was received. Drives expiry.
    pub uploaded_on: DateTime<Utc>,

    /// Highest contiguous chunk index appended so far.
    pub chunks_uploaded: i64,

    /// Declared chunk count, fixed at creation.
    pub total_chunk: i64,

    /// Committed blob length in bytes.
    pub bytes_written: i64,

    /// Set once the last chunk landed and finishing is done.
    pub is_complete: bool,

    /// Content type sniffed from the assembled bytes.
    pub mimetype: Option<String>,

    /// Still frame extracted from video uploads, when extraction succeeded.
    pub thumbnail_path: Option<String>,

    /// MD5 hex digest of the assembled blob.
    pub checksum: Option<String>,

    pub completed_at: Option<DateTime<Utc>>,
}

impl UploadSession {
    /// Index of the chunk the session is waiting for.
    pub fn next_chunk_index(&self) -> i64 {
        self.chunks_uploaded + 1
    }

    /// True when every chunk is on disk, whether or not finishing has run.
    pub fn all_chunks_written(&self) -> bool {
        self.chunks_uploaded + 1 == self.total_chunk
    }

    /// An incomplete session older than `ttl` no longer accepts chunks.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: TimeDelta) -> bool {
        !self.is_complete && now.signed_duration_since(self.uploaded_on) > ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(age: TimeDelta, is_complete: bool) -> UploadSession {
        UploadSession {
            id: Uuid::new_v4(),
            upload_id: "token".into(),
            owner_id: "owner".into(),
            file_path: "/tmp/blob".into(),
            uploaded_on: Utc::now() - age,
            chunks_uploaded: 0,
            total_chunk: 3,
            bytes_written: 10,
            is_complete,
            mimetype: None,
            thumbnail_path: None,
            checksum: None,
            completed_at: None,
        }
    }

    #[test]
    fn incomplete_session_expires_after_ttl() {
        let now = Utc::now();
        assert!(!session(TimeDelta::hours(11), false).is_expired(now, default_session_ttl()));
        assert!(session(TimeDelta::hours(13), false).is_expired(now, default_session_ttl()));
    }

    #[test]
    fn completed_session_never_expires() {
        assert!(!session(TimeDelta::days(30), true).is_expired(Utc::now(), default_session_ttl()));
    }
}
