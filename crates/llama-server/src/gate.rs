//! Request gate around the single generation engine.
//!
//! At most one generation runs against the shared context. Callers either
//! wait (bounded by `acquire_timeout`) or, with a zero timeout, are turned
//! away immediately while a generation is in flight.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use llama_engine::{GenerationResult, LlamaError, Message};
use llama_runtime::GenerationEngine;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

/// Gate settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateConfig {
    /// How long a request may wait for the engine; zero rejects immediately.
    pub acquire_timeout: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("a generation is already running")]
    Busy,

    #[error("timed out after {0:?} waiting for the running generation")]
    Timeout(Duration),

    #[error(transparent)]
    Engine(#[from] LlamaError),

    #[error("generation task failed: {0}")]
    Join(String),
}

impl GateError {
    /// True when the request never reached the engine because of contention.
    pub fn is_contention(&self) -> bool {
        matches!(self, GateError::Busy | GateError::Timeout(_))
    }
}

/// Counts a request while it waits for the engine.
struct QueueSlot<'a> {
    waiting: &'a AtomicUsize,
}

impl<'a> QueueSlot<'a> {
    fn enter(waiting: &'a AtomicUsize) -> Self {
        waiting.fetch_add(1, Ordering::SeqCst);
        Self { waiting }
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Exclusive hold on the engine for one generation.
struct EngineLease {
    engine: OwnedMutexGuard<GenerationEngine>,
    busy: Arc<AtomicBool>,
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// Serializes generations on the shared engine.
pub struct RequestGate {
    engine: Arc<Mutex<GenerationEngine>>,
    config: GateConfig,
    waiting: AtomicUsize,
    busy: Arc<AtomicBool>,
}

impl RequestGate {
    pub fn new(engine: GenerationEngine, config: GateConfig) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            config,
            waiting: AtomicUsize::new(0),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> GateConfig {
        self.config
    }

    /// Requests currently waiting for the engine.
    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// True while a generation holds the engine.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    async fn acquire(&self) -> Result<EngineLease, GateError> {
        let timeout = self.config.acquire_timeout;
        let engine = if timeout.is_zero() {
            Arc::clone(&self.engine)
                .try_lock_owned()
                .map_err(|_| GateError::Busy)?
        } else {
            let _slot = QueueSlot::enter(&self.waiting);
            tokio::time::timeout(timeout, Arc::clone(&self.engine).lock_owned())
                .await
                .map_err(|_| GateError::Timeout(timeout))?
        };
        self.busy.store(true, Ordering::SeqCst);
        Ok(EngineLease {
            engine,
            busy: Arc::clone(&self.busy),
        })
    }

    /// Run one generation while holding the gate.
    ///
    /// The generation itself runs on the blocking pool. If this future is
    /// dropped (client disconnect) the generation is cancelled at its next
    /// loop iteration; the gate stays held until it has actually stopped.
    pub async fn run(&self, messages: Vec<Message>) -> Result<GenerationResult, GateError> {
        let mut lease = match self.acquire().await {
            Ok(lease) => lease,
            Err(e) => {
                tracing::warn!(error = %e, queued = self.queued(), "request rejected");
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let on_disconnect = cancel.clone().drop_guard();

        let result = tokio::task::spawn_blocking(move || lease.engine.generate(&messages, &cancel))
            .await
            .map_err(|e| GateError::Join(e.to_string()))?;

        on_disconnect.disarm();
        result.map_err(GateError::Engine)
    }
}

impl std::fmt::Debug for RequestGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGate")
            .field("config", &self.config)
            .field("queued", &self.queued())
            .field("busy", &self.is_busy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llama_runtime::{EngineOptions, ScriptedBackend};
    use llama_sampling::SamplerPipeline;

    fn gate(backend: ScriptedBackend, acquire_timeout: Duration) -> Arc<RequestGate> {
        let engine = GenerationEngine::new(
            backend.build().unwrap(),
            SamplerPipeline::baseline(42),
            EngineOptions::default(),
        );
        Arc::new(RequestGate::new(engine, GateConfig { acquire_timeout }))
    }

    #[tokio::test]
    async fn run_returns_generation() {
        let gate = gate(ScriptedBackend::new().with_reply("hey"), Duration::from_secs(1));
        let result = gate.run(vec![Message::user("hi")]).await.unwrap();
        assert_eq!(result.text, "hey");
        assert!(!gate.is_busy());
        assert_eq!(gate.queued(), 0);
    }

    #[tokio::test]
    async fn zero_timeout_rejects_while_busy() {
        let backend = ScriptedBackend::new()
            .with_reply("slow reply")
            .with_decode_delay(Duration::from_millis(20));
        let gate = gate(backend, Duration::ZERO);

        let first = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.run(vec![Message::user("a")]).await }
        });
        while !gate.is_busy() {
            tokio::task::yield_now().await;
        }

        let second = gate.run(vec![Message::user("b")]).await;
        assert!(matches!(second, Err(GateError::Busy)));

        let first = first.await.unwrap().unwrap();
        assert_eq!(first.text, "slow reply");
    }

    #[tokio::test]
    async fn bounded_wait_times_out() {
        let backend = ScriptedBackend::new()
            .with_reply("slow reply")
            .with_decode_delay(Duration::from_millis(20));
        let gate = gate(backend, Duration::from_millis(30));

        let first = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.run(vec![Message::user("a")]).await }
        });
        while !gate.is_busy() {
            tokio::task::yield_now().await;
        }

        let second = gate.run(vec![Message::user("b")]).await;
        assert!(matches!(second, Err(GateError::Timeout(_))));
        assert!(second.unwrap_err().is_contention());
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn dropped_request_cancels_generation() {
        let backend = ScriptedBackend::new()
            .with_reply("abc")
            .never_end()
            .with_decode_delay(Duration::from_millis(5));
        let gate = gate(backend, Duration::from_secs(5));

        let abandoned = tokio::spawn({
            let gate = Arc::clone(&gate);
            async move { gate.run(vec![Message::user("a")]).await }
        });
        while !gate.is_busy() {
            tokio::task::yield_now().await;
        }
        abandoned.abort();

        // The endless generation stops once its request is gone.
        tokio::time::timeout(Duration::from_secs(5), async {
            while gate.is_busy() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(gate.queued(), 0);
    }
}
