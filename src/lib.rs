//! Object metadata engine for an S3-compatible gateway.
//!
//! [`services::metadata_service::MetadataService`] tracks the version and
//! delete-marker history of every key, coordinates writes with a
//! non-transactional backend store, and keeps multipart upload accounting.
//! The binary wraps it in an operator HTTP surface and a maintenance worker.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
