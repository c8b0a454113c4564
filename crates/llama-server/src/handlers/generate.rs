//! Text-generation handlers.

use axum::{
    body::Bytes,
    extract::{Form, Query, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use llama_engine::{LlamaError, Message, TerminationReason};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    error::{BodyFormat, ServerError},
    gate::GateError,
    models::{GenerateParams, GenerateRequest, GenerateResponse},
    state::AppState,
};

/// Response header naming why the generation stopped.
pub const TERMINATION_REASON_HEADER: &str = "x-termination-reason";

/// Reply text plus the reason, when a generation actually ran.
struct Reply {
    text: String,
    reason: Option<TerminationReason>,
}

impl Reply {
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(reason) = self.reason {
            headers.insert(
                TERMINATION_REASON_HEADER,
                HeaderValue::from_static(reason.as_str()),
            );
        }
        headers
    }
}

/// Run `prompt` through the gate. Template and tokenization failures are
/// answered with explanatory text in a normal body.
async fn generate_reply(
    state: &AppState,
    prompt: String,
    format: BodyFormat,
) -> Result<Reply, ServerError> {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("generate", %request_id);

    async move {
        tracing::info!(prompt_bytes = prompt.len(), "generation requested");
        match state.gate.run(vec![Message::user(prompt)]).await {
            Ok(result) => {
                tracing::info!(
                    reason = %result.termination_reason,
                    generated_tokens = result.usage.generated_tokens,
                    "generation complete"
                );
                Ok(Reply {
                    text: result.text,
                    reason: Some(result.termination_reason),
                })
            }
            Err(GateError::Engine(LlamaError::TemplateRender(e))) => {
                tracing::warn!(error = %e, "template rendering failed");
                Ok(Reply {
                    text: "Error: Failed to apply chat template".to_string(),
                    reason: None,
                })
            }
            Err(GateError::Engine(LlamaError::Tokenization(e))) => {
                tracing::warn!(error = %e, "prompt tokenization failed");
                Ok(Reply {
                    text: "Error: Failed to tokenize prompt".to_string(),
                    reason: None,
                })
            }
            Err(e) => Err(ServerError::from_gate(e, format)),
        }
    }
    .instrument(span)
    .await
}

/// `POST /generate`: form-encoded `prompt`, plain-text reply. An empty
/// `prompt` is still a prompt.
pub async fn handle_generate(
    State(state): State<AppState>,
    query: Option<Query<GenerateParams>>,
    form: Option<Form<GenerateParams>>,
) -> Result<Response, ServerError> {
    let prompt = form
        .and_then(|Form(params)| params.prompt)
        .or_else(|| query.and_then(|Query(params)| params.prompt))
        .ok_or(ServerError::MissingPromptParam)?;

    let reply = generate_reply(&state, prompt, BodyFormat::Text).await?;
    Ok((reply.headers(), reply.text).into_response())
}

/// `POST /api/generate`: JSON `{"prompt": ...}`, JSON `{"response": ...}`.
pub async fn handle_api_generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ServerError> {
    if body.is_empty() || !is_json(&headers) {
        return Err(ServerError::JsonBodyRequired);
    }
    let prompt = serde_json::from_slice::<GenerateRequest>(&body)
        .map(|req| req.prompt)
        .ok()
        .filter(|p| !p.is_empty())
        .ok_or(ServerError::PromptFieldRequired)?;

    let reply = generate_reply(&state, prompt, BodyFormat::Json).await?;
    Ok((
        reply.headers(),
        Json(GenerateResponse {
            response: reply.text,
        }),
    )
        .into_response())
}

/// `Content-Type` is `application/json`, parameters allowed.
fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content_type(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn json_media_type_detection() {
        assert!(is_json(&content_type("application/json")));
        assert!(is_json(&content_type("application/json; charset=utf-8")));
        assert!(!is_json(&content_type("text/plain")));
        assert!(!is_json(&content_type("application/x-www-form-urlencoded")));
        assert!(!is_json(&HeaderMap::new()));
    }

    #[test]
    fn reply_header_only_after_generation() {
        let ran = Reply {
            text: String::new(),
            reason: Some(TerminationReason::ContextExceeded),
        };
        assert_eq!(
            ran.headers().get(TERMINATION_REASON_HEADER).unwrap(),
            "context_exceeded"
        );
        let failed = Reply {
            text: String::new(),
            reason: None,
        };
        assert!(failed.headers().is_empty());
    }
}
