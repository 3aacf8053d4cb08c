//! The metadata engine and its collaborators.

pub mod backend;
pub mod error;
pub mod garbage;
pub mod listing;
pub mod maintenance;
pub mod metadata_service;
pub mod multipart;
pub mod protocol;
pub mod repair;
pub mod schema;

#[cfg(test)]
pub(crate) mod test_support;
