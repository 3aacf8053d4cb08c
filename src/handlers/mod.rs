//! HTTP handlers of the operator surface.

pub mod admin_handlers;
pub mod health_handlers;

use crate::services::{
    backend::BackendStore, maintenance::MaintenanceWorker, metadata_service::MetadataService,
};
use std::sync::Arc;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub metadata: MetadataService,
    pub backend: Arc<dyn BackendStore>,
    pub worker: MaintenanceWorker,
}
