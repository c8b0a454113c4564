//! Request/response bodies.

pub mod generate;

pub use generate::{ErrorBody, GenerateParams, GenerateRequest, GenerateResponse};
