//! Command-line configuration.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use llama_engine::{ContextParams, ModelParams, ModelSpec};
use llama_runtime::{CachePolicy, EngineOptions};
use llama_sampling::SamplerConfig;

use crate::gate::GateConfig;

/// Serve a GGUF model over HTTP.
#[derive(Debug, Clone, Parser)]
#[command(name = "llama-server", version, about)]
pub struct ServerArgs {
    /// Path to the GGUF model file.
    pub model: String,

    /// TCP port to listen on.
    #[arg(default_value_t = 8080)]
    pub port: u16,

    /// Address to bind.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Context size in cache cells.
    #[arg(long, default_value_t = 8192)]
    pub ctx_size: u32,

    /// CPU threads used for decoding.
    #[arg(long, default_value_t = 4)]
    pub threads: i32,

    /// Layers offloaded to the GPU.
    #[arg(long, default_value_t = 99)]
    pub gpu_layers: i32,

    /// Min-p cutoff relative to the most likely token.
    #[arg(long, default_value_t = 0.05)]
    pub min_p: f32,

    /// Sampling temperature.
    #[arg(long = "temp", default_value_t = 0.8)]
    pub temperature: f32,

    /// Fixed sampling seed (random per start when omitted).
    #[arg(long)]
    pub seed: Option<u64>,

    /// Milliseconds a request waits for a running generation; 0 answers 503
    /// immediately.
    #[arg(long, default_value_t = 30_000)]
    pub queue_timeout_ms: u64,

    /// Cache handling between requests: `reset` or `continue`.
    #[arg(long, default_value = "reset")]
    pub cache_policy: CachePolicy,

    /// Chat template used instead of the model's own.
    #[arg(long)]
    pub chat_template: Option<String>,
}

impl ServerArgs {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn model_spec(&self) -> ModelSpec {
        ModelSpec {
            path: self.model.clone(),
            model: ModelParams {
                n_gpu_layers: self.gpu_layers,
            },
            context: ContextParams {
                n_threads: self.threads,
                ..ContextParams::with_n_ctx(self.ctx_size)
            },
        }
    }

    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            min_p: self.min_p,
            temperature: self.temperature,
            seed: self.seed,
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            cache_policy: self.cache_policy,
            template_override: self.chat_template.clone(),
        }
    }

    pub fn gate_config(&self) -> GateConfig {
        GateConfig {
            acquire_timeout: Duration::from_millis(self.queue_timeout_ms),
        }
    }
}
