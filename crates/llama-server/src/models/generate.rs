//! Text-generation request and response types.

use serde::{Deserialize, Serialize};

/// `POST /generate` parameters, from the form body or the query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateParams {
    pub prompt: Option<String>,
}

/// `POST /api/generate` body.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
}

/// `POST /api/generate` reply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerateResponse {
    pub response: String,
}

/// JSON error body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
}
