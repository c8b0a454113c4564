//! Application state shared across handlers.

use std::sync::Arc;

use crate::gate::RequestGate;

#[derive(Clone)]
pub struct AppState {
    /// The one engine, behind its request gate.
    pub gate: Arc<RequestGate>,
}

impl AppState {
    pub fn new(gate: RequestGate) -> Self {
        Self {
            gate: Arc::new(gate),
        }
    }
}
