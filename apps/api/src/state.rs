use std::sync::Arc;

use crate::pipeline::catalog::ContentDispatchCatalog;
use crate::pipeline::driver::FlowDriver;
use crate::pipeline::queue::PendingQueue;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub driver: Arc<FlowDriver>,
    pub catalog: Arc<ContentDispatchCatalog>,
    /// Read-only use here: queue depth for operators.
    pub queue: Arc<dyn PendingQueue>,
}
