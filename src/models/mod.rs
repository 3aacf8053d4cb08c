//! Core data models for the object metadata engine.
//!
//! These entities describe the versioned object history and the multipart
//! part accounting. Object and part records map to the `objects` and `parts`
//! tables via `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod acl;
pub mod bucket;
pub mod object;
pub mod part;
