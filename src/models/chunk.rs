//! Inbound chunk submissions and the protocol's answers to them.

use bytes::Bytes;
use uuid::Uuid;

/// A single chunk as handed to the upload service by the HTTP layer.
#[derive(Clone, Debug)]
pub struct ChunkSubmission {
    /// Authenticated caller. Scopes every session lookup.
    pub owner: String,

    /// Absent on the first chunk of a new session.
    pub upload_id: Option<String>,

    /// Zero-based position of this chunk.
    pub chunk_index: u32,

    /// Declared chunk count. Must match the stored value on later chunks.
    pub total_chunks: u32,

    pub data: Bytes,
}

/// What the receiver did with a submission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Chunk appended; more are expected.
    Accepted {
        upload_id: String,
        next_chunk_index: i64,
    },

    /// Chunk was a duplicate or skipped ahead. Nothing was written and the
    /// client should resend `next_chunk_index`.
    OutOfOrder {
        upload_id: String,
        next_chunk_index: i64,
    },

    /// Final chunk appended and the session finished.
    Completed { id: Uuid, upload_id: String },
}

impl ChunkOutcome {
    pub fn upload_id(&self) -> &str {
        match self {
            Self::Accepted { upload_id, .. }
            | Self::OutOfOrder { upload_id, .. }
            | Self::Completed { upload_id, .. } => upload_id,
        }
    }
}
