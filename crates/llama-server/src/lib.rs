//! # llama-server
//!
//! Minimal HTTP text-generation server over one loaded model.
//!
//! - `GET /health`: liveness text
//! - `POST /generate`: form field `prompt`, plain-text reply
//! - `POST /api/generate`: JSON `{"prompt"}` in, `{"response"}` out
//!
//! Every generation runs on the same inference context, so requests pass
//! through a [`RequestGate`] that admits one generation at a time.

pub mod config;
pub mod error;
pub mod gate;
pub mod handlers;
pub mod models;
pub mod server;
pub mod state;

pub use config::ServerArgs;
pub use error::ServerError;
pub use gate::{GateConfig, GateError, RequestGate};
pub use server::{create_router, run_server};
pub use state::AppState;
