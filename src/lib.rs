//! Chunked media upload service.
//!
//! Clients push a file as a sequence of multipart chunks; the service appends
//! them in order to a single blob, answers duplicates and gaps with the index
//! it still expects, expires abandoned uploads, and on completion sniffs the
//! content type and thumbnails video.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
