use clap::Parser;
use llama_runtime::GenerationEngine;
use llama_server::{run_server, AppState, RequestGate, ServerArgs};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = ServerArgs::parse();

    let sampler = match args.sampler_config().build() {
        Ok(sampler) => sampler,
        Err(e) => {
            tracing::error!(error = %e, "invalid sampler settings");
            std::process::exit(1);
        }
    };

    let spec = args.model_spec();
    tracing::info!(model = %spec.path, n_ctx = spec.context.n_ctx, "loading model");
    let model = match llama_runtime::load(&spec) {
        Ok(model) => model,
        Err(e) => {
            tracing::error!(error = %e, "failed to load model");
            std::process::exit(1);
        }
    };

    let engine = GenerationEngine::new(model, sampler, args.engine_options());
    let state = AppState::new(RequestGate::new(engine, args.gate_config()));

    if let Err(e) = run_server(state, args.addr()).await {
        tracing::error!(error = %e, "server failed");
        std::process::exit(1);
    }
}
