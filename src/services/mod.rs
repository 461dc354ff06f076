//! Upload session services: the chunk state machine, blob storage, and the
//! completion finisher.

pub mod blob_store;
pub mod finisher;
pub mod session_locks;
pub mod upload_service;
