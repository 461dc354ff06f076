use crate::services::upload_service::UploadError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{collections::BTreeMap, fmt};

/// A lightweight wrapper for request errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    /// Per-field validation messages, rendered as `fields`.
    pub fields: BTreeMap<String, Vec<String>>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// 400 Bad Request naming the offending form field.
    pub fn field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        let mut err = Self::new(StatusCode::BAD_REQUEST, msg.clone());
        err.fields.insert(field.into(), vec![msg]);
        err
    }

    /// 410 Gone, sent without a body.
    pub fn gone() -> Self {
        Self::new(StatusCode::GONE, "")
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status == StatusCode::GONE {
            return self.status.into_response();
        }

        let mut body = json!({
            "error": self.message,
            "status": self.status.as_u16()
        });
        if !self.fields.is_empty() {
            body["fields"] = json!(self.fields);
        }

        (self.status, Json(body)).into_response()
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Validation { field, message } => AppError::field(field, message),
            UploadError::NotFound => AppError::not_found(err.to_string()),
            UploadError::Gone(_) => AppError::gone(),
            UploadError::Conflict(_) => AppError::new(StatusCode::CONFLICT, err.to_string()),
            UploadError::Sqlx(_) | UploadError::Io(_) => {
                tracing::error!(error = %err, "upload request failed");
                AppError::internal("internal storage error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_errors_map_to_statuses() {
        let cases = [
            (UploadError::validation("file", "required"), StatusCode::BAD_REQUEST),
            (UploadError::NotFound, StatusCode::NOT_FOUND),
            (UploadError::Gone("x".into()), StatusCode::GONE),
            (UploadError::Conflict("x".into()), StatusCode::CONFLICT),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn validation_error_carries_field() {
        let err = AppError::from(UploadError::validation("total_chunk", "This field is required."));
        assert_eq!(
            err.fields.get("total_chunk"),
            Some(&vec!["This field is required.".to_string()])
        );
    }
}
