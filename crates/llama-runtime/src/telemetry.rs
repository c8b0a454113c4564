//! Telemetry hooks for generation performance measurement.
//!
//! Provides:
//! - [`GenerationMetrics`]: TTFT, tokens/sec, and generation summary
//! - [`TelemetryHook`] trait: callback interface for real-time metric reporting
//! - [`GenerationTimer`]: records timestamps and computes metrics
//! - [`TracingTelemetry`] / [`LogTelemetry`] / [`NoopTelemetry`]: built-in hooks

use std::sync::{Arc, Mutex};
use std::time::Instant;

use llama_engine::TerminationReason;

/// Aggregate metrics from a generation run.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationMetrics {
    /// Time to first sampled token in milliseconds (prompt decode latency).
    pub ttft_ms: f64,
    /// Tokens generated per second (decode throughput, excludes the prompt).
    pub tokens_per_sec: f64,
    /// Number of prompt tokens decoded.
    pub prompt_tokens: usize,
    /// Number of tokens appended to the output.
    pub generated_tokens: usize,
    /// Total wall-clock time in milliseconds.
    pub total_time_ms: f64,
    pub termination_reason: TerminationReason,
}

/// Callback trait for real-time generation telemetry.
///
/// All methods have default no-op implementations so hooks can be selective.
pub trait TelemetryHook: Send + Sync {
    /// Called after the prompt batch is decoded.
    fn on_prompt_decoded(&self, _ttft_ms: f64) {}

    /// Called after each token is appended to the output.
    fn on_token_generated(&self, _token_idx: usize, _elapsed_ms: f64) {}

    /// Called when generation finishes with the full metrics summary.
    fn on_generation_complete(&self, _metrics: &GenerationMetrics) {}
}

/// No-op telemetry hook.
#[derive(Debug, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Emits one `tracing` event per finished generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetryHook for TracingTelemetry {
    fn on_prompt_decoded(&self, ttft_ms: f64) {
        tracing::debug!(ttft_ms, "prompt decoded");
    }

    fn on_generation_complete(&self, m: &GenerationMetrics) {
        tracing::info!(
            reason = %m.termination_reason,
            prompt_tokens = m.prompt_tokens,
            generated_tokens = m.generated_tokens,
            ttft_ms = format_args!("{:.1}", m.ttft_ms),
            tokens_per_sec = format_args!("{:.1}", m.tokens_per_sec),
            total_ms = format_args!("{:.1}", m.total_time_ms),
            "generation finished"
        );
    }
}

/// Keeps the most recent metrics for later inspection.
#[derive(Debug, Clone, Default)]
pub struct LogTelemetry {
    last_report: Arc<Mutex<Option<GenerationMetrics>>>,
}

impl LogTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retrieve the last completed generation's metrics.
    pub fn last_metrics(&self) -> Option<GenerationMetrics> {
        self.last_report
            .lock()
            .map(|report| report.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl TelemetryHook for LogTelemetry {
    fn on_generation_complete(&self, metrics: &GenerationMetrics) {
        let mut report = self
            .last_report
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *report = Some(metrics.clone());
    }
}

/// Records timestamps during generation to compute [`GenerationMetrics`].
///
/// Usage:
/// 1. Call [`GenerationTimer::new`] once the prompt is tokenized
/// 2. Call [`mark_prompt_decoded`](Self::mark_prompt_decoded) after the first decode
/// 3. Call [`mark_token`](Self::mark_token) after each appended token
/// 4. Call [`finish`](Self::finish) to compute final metrics
pub struct GenerationTimer {
    prompt_tokens: usize,
    start: Instant,
    prompt_end: Option<Instant>,
    token_count: usize,
    hook: Arc<dyn TelemetryHook>,
}

impl GenerationTimer {
    pub fn new(prompt_tokens: usize, hook: Arc<dyn TelemetryHook>) -> Self {
        Self {
            prompt_tokens,
            start: Instant::now(),
            prompt_end: None,
            token_count: 0,
            hook,
        }
    }

    /// Mark the prompt batch decoded. Only the first call counts.
    pub fn mark_prompt_decoded(&mut self) {
        if self.prompt_end.is_some() {
            return;
        }
        let now = Instant::now();
        self.prompt_end = Some(now);
        let ttft_ms = now.duration_since(self.start).as_secs_f64() * 1000.0;
        self.hook.on_prompt_decoded(ttft_ms);
    }

    pub fn mark_token(&mut self) {
        self.token_count += 1;
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.hook.on_token_generated(self.token_count, elapsed_ms);
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    /// Finalize and return metrics. Fires `on_generation_complete`.
    pub fn finish(self, termination_reason: TerminationReason) -> GenerationMetrics {
        let total_time_ms = self.start.elapsed().as_secs_f64() * 1000.0;

        let ttft_ms = self
            .prompt_end
            .map(|t| t.duration_since(self.start).as_secs_f64() * 1000.0)
            .unwrap_or(0.0);

        let decode_time_ms = total_time_ms - ttft_ms;
        let tokens_per_sec = if decode_time_ms > 0.0 && self.token_count > 0 {
            self.token_count as f64 / (decode_time_ms / 1000.0)
        } else {
            0.0
        };

        let metrics = GenerationMetrics {
            ttft_ms,
            tokens_per_sec,
            prompt_tokens: self.prompt_tokens,
            generated_tokens: self.token_count,
            total_time_ms,
            termination_reason,
        };

        self.hook.on_generation_complete(&metrics);
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_telemetry_captures_metrics() {
        let hook = LogTelemetry::new();
        assert!(hook.last_metrics().is_none());

        let metrics = GenerationMetrics {
            ttft_ms: 12.5,
            tokens_per_sec: 80.0,
            prompt_tokens: 4,
            generated_tokens: 8,
            total_time_ms: 112.5,
            termination_reason: TerminationReason::EndOfGeneration,
        };
        hook.on_generation_complete(&metrics);

        let captured = hook.last_metrics().unwrap();
        assert_eq!(captured.ttft_ms, 12.5);
        assert_eq!(captured.generated_tokens, 8);
    }

    #[test]
    fn generation_timer_basic_flow() {
        let log = LogTelemetry::new();
        let mut timer = GenerationTimer::new(3, Arc::new(log.clone()));

        timer.mark_prompt_decoded();
        timer.mark_token();
        timer.mark_token();
        timer.mark_token();

        let metrics = timer.finish(TerminationReason::ContextExceeded);
        assert_eq!(metrics.prompt_tokens, 3);
        assert_eq!(metrics.generated_tokens, 3);
        assert!(metrics.ttft_ms >= 0.0);
        assert!(metrics.total_time_ms >= metrics.ttft_ms);
        assert_eq!(log.last_metrics(), Some(metrics));
    }

    #[test]
    fn prompt_mark_is_idempotent() {
        let mut timer = GenerationTimer::new(1, Arc::new(NoopTelemetry));
        timer.mark_prompt_decoded();
        let first = timer.prompt_end;
        timer.mark_prompt_decoded();
        assert_eq!(timer.prompt_end, first);
    }

    #[test]
    fn generation_timer_no_prompt_mark() {
        let timer = GenerationTimer::new(1, Arc::new(TracingTelemetry));
        let metrics = timer.finish(TerminationReason::DecodeFailure);
        assert_eq!(metrics.ttft_ms, 0.0);
        assert_eq!(metrics.generated_tokens, 0);
        assert_eq!(metrics.tokens_per_sec, 0.0);
    }
}
