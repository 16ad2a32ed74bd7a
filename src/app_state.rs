use std::sync::Arc;

use crate::engine::CaptionEngine;

/// Shared state handed to every route through rocket's managed state.
///
/// Holds nothing mutable: the engine is built before launch and only read
/// afterwards.
pub struct AppState {
    pub engine: Arc<dyn CaptionEngine>,
}

impl AppState {
    pub fn new(engine: Arc<dyn CaptionEngine>) -> Arc<Self> {
        Arc::new(Self { engine })
    }

    pub fn model_id(&self) -> &str {
        self.engine.model_id()
    }
}
