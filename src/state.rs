use crate::api::Adapters;
use crate::registry::ProviderRegistry;
use crate::storage::StorageManager;
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// Shared state handed to every request handler
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<StorageManager>,
    pub registry: Arc<ProviderRegistry>,
    pub adapters: Adapters,
    /// Assistant turns still streaming, keyed by turn id, for explicit stop.
    pub in_flight: Arc<DashMap<Uuid, CancellationToken>>,
    pub sse_buffer: usize,
}

impl AppState {
    pub fn new(
        storage: StorageManager,
        registry: ProviderRegistry,
        adapters: Adapters,
        sse_buffer: usize,
    ) -> Self {
        Self {
            storage: Arc::new(storage),
            registry: Arc::new(registry),
            adapters,
            in_flight: Arc::new(DashMap::new()),
            sse_buffer: sse_buffer.max(1),
        }
    }
}
