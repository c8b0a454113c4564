//! Health check handler.

use axum::extract::State;

use crate::state::AppState;

/// Liveness probe; answers even while a generation is running.
pub async fn handle_health(State(state): State<AppState>) -> &'static str {
    tracing::debug!(
        busy = state.gate.is_busy(),
        queued = state.gate.queued(),
        "health check"
    );
    "LLM Server is running"
}
