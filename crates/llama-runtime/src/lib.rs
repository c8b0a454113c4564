//! # llama-runtime
//!
//! Drives generations on the single shared inference context:
//! - [`GenerationEngine`]: render, tokenize, then the decode/sample loop
//! - [`telemetry`]: TTFT and throughput per generation
//! - [`mock::ScriptedBackend`]: deterministic backend without model weights
//! - [`load`]: llama.cpp model loading behind the `llama-cpp` feature

pub mod generate;
pub mod mock;
pub mod telemetry;

#[cfg(feature = "llama-cpp")]
mod ffi;

pub use generate::{CachePolicy, EngineOptions, GenerationEngine};
pub use mock::ScriptedBackend;
pub use telemetry::{GenerationMetrics, GenerationTimer, LogTelemetry, TelemetryHook};

use llama_engine::{LoadedModel, ModelSpec, Result};

/// Load the model at `spec.path` and create its inference context.
#[cfg(feature = "llama-cpp")]
pub fn load(spec: &ModelSpec) -> Result<LoadedModel> {
    ffi::load(spec)
}

/// Load the model at `spec.path` and create its inference context.
///
/// This build has no model backend; enable the `llama-cpp` feature.
#[cfg(not(feature = "llama-cpp"))]
pub fn load(spec: &ModelSpec) -> Result<LoadedModel> {
    Err(llama_engine::LlamaError::ModelLoad(format!(
        "cannot load {}: built without the `llama-cpp` feature",
        spec.path
    )))
}
