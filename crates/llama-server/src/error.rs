//! HTTP error handling and response mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::{gate::GateError, models::ErrorBody};

/// Body shape of the endpoint that produced the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    Text,
    Json,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Error: 'prompt' parameter is required")]
    MissingPromptParam,

    #[error("Request must include JSON body")]
    JsonBodyRequired,

    #[error("'prompt' field required in JSON body")]
    PromptFieldRequired,

    #[error("Server is busy, try again later")]
    Unavailable { source: GateError, format: BodyFormat },

    #[error("Internal server error")]
    Internal { source: GateError, format: BodyFormat },
}

impl ServerError {
    /// Map a gate failure that is not answered with a normal body.
    pub fn from_gate(source: GateError, format: BodyFormat) -> Self {
        if source.is_contention() {
            ServerError::Unavailable { source, format }
        } else {
            ServerError::Internal { source, format }
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ServerError::MissingPromptParam
            | ServerError::JsonBodyRequired
            | ServerError::PromptFieldRequired => StatusCode::BAD_REQUEST,
            ServerError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn format(&self) -> BodyFormat {
        match self {
            ServerError::MissingPromptParam => BodyFormat::Text,
            ServerError::JsonBodyRequired | ServerError::PromptFieldRequired => BodyFormat::Json,
            ServerError::Unavailable { format, .. } | ServerError::Internal { format, .. } => {
                *format
            }
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let ServerError::Internal { source, .. } = &self {
            tracing::error!(error = %source, "request failed");
        }
        match self.format() {
            BodyFormat::Text => {
                let message = match &self {
                    ServerError::MissingPromptParam => self.to_string(),
                    other => format!("Error: {other}"),
                };
                (status, message).into_response()
            }
            BodyFormat::Json => (
                status,
                Json(ErrorBody {
                    error: self.to_string(),
                }),
            )
                .into_response(),
        }
    }
}
