//! HTTP handlers for chunked media uploads.
//! Parses multipart chunk submissions and delegates the protocol to
//! `UploadService`. Caller identity comes from the upstream auth layer.

use crate::{
    errors::AppError,
    models::{
        chunk::{ChunkOutcome, ChunkSubmission},
        upload_session::UploadSession,
    },
    services::{finisher::OCTET_STREAM, upload_service::UploadService},
};
use axum::{
    Json,
    body::Body,
    extract::{FromRequestParts, Multipart, Path, State, multipart::MultipartError},
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

/// Header the auth layer uses to pass the authenticated user id.
pub const OWNER_HEADER: &str = "x-user-id";

/// Authenticated caller, as asserted by the upstream auth layer.
#[derive(Debug, Clone)]
pub struct Owner(pub String);

impl<S> FromRequestParts<S> for Owner
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Owner(v.to_string()))
            .ok_or_else(|| {
                AppError::new(
                    StatusCode::UNAUTHORIZED,
                    "Authentication credentials were not provided.",
                )
            })
    }
}

/// Reply while more chunks are expected.
#[derive(Debug, Serialize)]
pub struct ChunkProgressResponse {
    pub upload_id: String,
    /// Index the client should send next.
    pub chunk_index: i64,
}

/// Reply once the last chunk landed.
#[derive(Debug, Serialize)]
pub struct UploadCompleteResponse {
    pub id: Uuid,
    pub upload_id: String,
    pub is_complete: bool,
}

#[derive(Debug, Serialize)]
pub struct UploadStatusResponse {
    pub id: Uuid,
    pub upload_id: String,
    pub uploaded_on: DateTime<Utc>,
    pub chunks_uploaded: i64,
    pub total_chunk: i64,
    pub size_bytes: i64,
    pub is_complete: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub mimetype: Option<String>,
    pub checksum: Option<String>,
    pub has_thumbnail: bool,
}

impl From<UploadSession> for UploadStatusResponse {
    fn from(session: UploadSession) -> Self {
        Self {
            id: session.id,
            upload_id: session.upload_id,
            uploaded_on: session.uploaded_on,
            chunks_uploaded: session.chunks_uploaded,
            total_chunk: session.total_chunk,
            size_bytes: session.bytes_written,
            is_complete: session.is_complete,
            completed_at: session.completed_at,
            mimetype: session.mimetype,
            checksum: session.checksum,
            has_thumbnail: session.thumbnail_path.is_some(),
        }
    }
}

/// Raw multipart fields of one chunk request.
#[derive(Debug, Default)]
struct ChunkForm {
    file: Option<Bytes>,
    chunk_index: Option<String>,
    id: Option<String>,
    total_chunk: Option<String>,
}

impl ChunkForm {
    async fn read(multipart: &mut Multipart) -> Result<Self, AppError> {
        let mut form = Self::default();
        while let Some(field) = multipart.next_field().await.map_err(multipart_err)? {
            let field_name = field.name().map(|s| s.to_string());
            match field_name.as_deref() {
                Some("file") => form.file = Some(field.bytes().await.map_err(multipart_err)?),
                Some("chunk_index") => {
                    form.chunk_index = Some(field.text().await.map_err(multipart_err)?)
                }
                Some("id") => form.id = Some(field.text().await.map_err(multipart_err)?),
                Some("total_chunk") => {
                    form.total_chunk = Some(field.text().await.map_err(multipart_err)?)
                }
                _ => continue,
            }
        }
        Ok(form)
    }

    /// Check field presence and types, reporting every bad field at once.
    fn into_submission(self, owner: String) -> Result<ChunkSubmission, AppError> {
        let mut errors: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut reject = |field: &str, msg: &str| {
            errors
                .entry(field.to_string())
                .or_default()
                .push(msg.to_string());
        };

        if self.file.is_none() {
            reject("file", "No file was submitted.");
        }

        let chunk_index = match self.chunk_index.as_deref().map(str::trim) {
            None | Some("") => Some(0),
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|_| reject("chunk_index", "A valid integer is required."))
                .ok(),
        };

        let total_chunk = match self.total_chunk.as_deref().map(str::trim) {
            None | Some("") => {
                reject("total_chunk", "This field is required.");
                None
            }
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|_| reject("total_chunk", "A valid integer is required."))
                .ok(),
        };

        let upload_id = self
            .id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());

        match (self.file, chunk_index, total_chunk) {
            (Some(data), Some(chunk_index), Some(total_chunks)) if errors.is_empty() => {
                Ok(ChunkSubmission {
                    owner,
                    upload_id,
                    chunk_index,
                    total_chunks,
                    data,
                })
            }
            _ => {
                let mut err = AppError::new(StatusCode::BAD_REQUEST, "invalid chunk submission");
                err.fields = errors;
                Err(err)
            }
        }
    }
}

fn multipart_err(err: MultipartError) -> AppError {
    AppError::new(err.status(), err.body_text())
}

/// `POST /media-files`: submit one chunk.
///
/// 200 with the next expected index while the upload is in progress (also
/// when the chunk was a duplicate or out of order), 201 on completion.
pub async fn upload_chunk(
    State(service): State<UploadService>,
    Owner(owner): Owner,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let submission = ChunkForm::read(&mut multipart)
        .await?
        .into_submission(owner)?;

    let response = match service.receive_chunk(submission).await? {
        ChunkOutcome::Accepted {
            upload_id,
            next_chunk_index,
        }
        | ChunkOutcome::OutOfOrder {
            upload_id,
            next_chunk_index,
        } => (
            StatusCode::OK,
            Json(ChunkProgressResponse {
                upload_id,
                chunk_index: next_chunk_index,
            }),
        )
            .into_response(),
        ChunkOutcome::Completed { id, upload_id } => (
            StatusCode::CREATED,
            Json(UploadCompleteResponse {
                id,
                upload_id,
                is_complete: true,
            }),
        )
            .into_response(),
    };

    Ok(response)
}

/// `GET /media-files/{upload_id}`: session progress and completion metadata.
pub async fn get_upload(
    State(service): State<UploadService>,
    Owner(owner): Owner,
    Path(upload_id): Path<String>,
) -> Result<Json<UploadStatusResponse>, AppError> {
    let session = service.get_session(&upload_id, &owner).await?;
    Ok(Json(session.into()))
}

/// `GET /media-files/{upload_id}/content`: stream a completed upload.
pub async fn get_upload_content(
    State(service): State<UploadService>,
    Owner(owner): Owner,
    Path(upload_id): Path<String>,
) -> Result<Response, AppError> {
    let (session, file) = service.open_content(&upload_id, &owner).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_content_headers(response.headers_mut(), &session);
    Ok(response)
}

/// `DELETE /media-files/{upload_id}`: remove blob, thumbnail, and record.
pub async fn delete_upload(
    State(service): State<UploadService>,
    Owner(owner): Owner,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    service.delete_session(&upload_id, &owner).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn set_content_headers(headers: &mut HeaderMap, session: &UploadSession) {
    let content_type = session.mimetype.as_deref().unwrap_or(OCTET_STREAM);
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static(OCTET_STREAM)),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(session.bytes_written.max(0) as u64),
    );

    if let Some(checksum) = session.checksum.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", checksum)) {
            headers.insert(header::ETAG, value);
        }
    }

    if let Some(completed_at) = session.completed_at {
        if let Ok(value) = HeaderValue::from_str(&completed_at.to_rfc2822()) {
            headers.insert(header::LAST_MODIFIED, value);
        }
    }
}
