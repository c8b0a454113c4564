//! HTTP request handlers for API endpoints.

pub mod generate;
pub mod health;

pub use generate::{handle_api_generate, handle_generate, TERMINATION_REASON_HEADER};
pub use health::handle_health;
