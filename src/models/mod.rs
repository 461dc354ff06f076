//! Core data models for the chunked upload service.
//!
//! `UploadSession` maps to the `upload_sessions` table via `sqlx::FromRow`;
//! the chunk types describe a single protocol exchange.

pub mod chunk;
pub mod upload_session;
