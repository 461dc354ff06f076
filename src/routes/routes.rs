//! Defines routes for the chunked upload API.
//!
//! ## Structure
//! - **Upload endpoints**
//!   - `POST   /media-files`: submit one chunk (multipart)
//!   - `GET    /media-files/{upload_id}`: session status
//!   - `GET    /media-files/{upload_id}/content`: download a completed upload
//!   - `DELETE /media-files/{upload_id}`: delete blob, thumbnail and record
//!
//! - **Probes**
//!   - `GET /healthz`, `GET /readyz`

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{delete_upload, get_upload, get_upload_content, upload_chunk},
    },
    services::upload_service::UploadService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

/// Room for the multipart framing around a chunk's bytes.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Build the router for all upload routes.
///
/// `max_chunk_bytes` bounds the body of a chunk request; larger requests are
/// refused with 413 before reaching the service.
pub fn routes(max_chunk_bytes: usize) -> Router<UploadService> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/media-files",
            post(upload_chunk)
                .layer(DefaultBodyLimit::max(max_chunk_bytes.saturating_add(MULTIPART_OVERHEAD))),
        )
        .route(
            "/media-files/{upload_id}",
            get(get_upload).delete(delete_upload),
        )
        .route("/media-files/{upload_id}/content", get(get_upload_content))
        .layer(TraceLayer::new_for_http())
}
