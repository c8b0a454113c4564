//! The generation state machine.
//!
//! One call to [`GenerationEngine::generate`] renders the conversation,
//! tokenizes it, then alternates decode and sample until the model emits an
//! end-of-generation token or a terminal condition is hit:
//!
//! ```text
//! Idle -> Prepared -> Decoding <-> Sampling -> Terminated(reason)
//! ```
//!
//! Template and tokenization failures happen before anything is decoded and
//! are returned as `Err`. Every failure inside the loop ends the generation
//! with a [`TerminationReason`] whose sentinel is appended to the partial text.

use std::sync::Arc;

use llama_engine::{
    ContextState, GenerationResult, InferenceContext, LlamaError, LoadedModel, Message, Result,
    TerminationReason, TokenId, Usage,
};
use llama_sampling::SamplerPipeline;
use llama_tokenizer::{Conversation, DecodingState, PieceDecoder, TemplateRenderer, Tokenizer};
use tokio_util::sync::CancellationToken;

use crate::telemetry::{GenerationTimer, TelemetryHook, TracingTelemetry};

/// What happens to the cache between requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CachePolicy {
    /// Clear the cache before every request; each request stands alone.
    #[default]
    ResetEachRequest,
    /// Keep cached state; each request continues the previous conversation
    /// and only the text its messages add to the rendered history is
    /// decoded. A turn that no longer fits starts a fresh conversation.
    Continue,
}

impl std::str::FromStr for CachePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "reset" => Ok(CachePolicy::ResetEachRequest),
            "continue" => Ok(CachePolicy::Continue),
            other => Err(format!("unknown cache policy '{other}' (expected reset|continue)")),
        }
    }
}

/// Construction options for [`GenerationEngine`].
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub cache_policy: CachePolicy,
    /// Chat template used instead of the one the model declares.
    pub template_override: Option<String>,
}

/// Owns the single inference context and drives generations on it.
///
/// Not shareable: callers serialize access (the server wraps it in a mutex).
pub struct GenerationEngine {
    context: Box<dyn InferenceContext>,
    tokenizer: Tokenizer,
    renderer: TemplateRenderer,
    decoder: PieceDecoder,
    sampler: SamplerPipeline,
    cache_policy: CachePolicy,
    /// What the cache holds, rendered.
    conversation: Conversation,
    telemetry: Arc<dyn TelemetryHook>,
}

impl GenerationEngine {
    pub fn new(model: LoadedModel, sampler: SamplerPipeline, options: EngineOptions) -> Self {
        let LoadedModel { vocab, context } = model;
        Self {
            context,
            tokenizer: Tokenizer::new(Arc::clone(&vocab)),
            renderer: TemplateRenderer::new(Arc::clone(&vocab), options.template_override),
            decoder: PieceDecoder::new(vocab),
            sampler,
            cache_policy: options.cache_policy,
            conversation: Conversation::new(),
            telemetry: Arc::new(TracingTelemetry),
        }
    }

    /// Replace the default `tracing` telemetry hook.
    pub fn with_telemetry(mut self, hook: Arc<dyn TelemetryHook>) -> Self {
        self.telemetry = hook;
        self
    }

    pub fn cache_policy(&self) -> CachePolicy {
        self.cache_policy
    }

    pub fn context_state(&self) -> ContextState {
        self.context.context_state()
    }

    /// Drop all cached conversation state.
    pub fn reset(&mut self) {
        self.context.clear_cache();
        self.conversation.clear();
    }

    /// Render and tokenize the turn for `messages` against a copy of the
    /// conversation; the caller commits the copy once the turn is accepted.
    fn prepare(
        &self,
        messages: &[Message],
        is_first_turn: bool,
    ) -> Result<(Conversation, Vec<TokenId>)> {
        let mut conversation = self.conversation.clone();
        let prompt = self
            .renderer
            .render_turn(&mut conversation, messages, is_first_turn)
            .map_err(|e| LlamaError::TemplateRender(e.to_string()))?;

        // The sequence marker belongs only at the very start of the cache.
        let tokens = self
            .tokenizer
            .encode(&prompt, is_first_turn)
            .map_err(|e| LlamaError::Tokenization(e.to_string()))?;
        if tokens.is_empty() {
            return Err(LlamaError::Tokenization(
                "prompt encoded to zero tokens".to_string(),
            ));
        }
        Ok((conversation, tokens))
    }

    /// Generate the assistant reply to `messages`.
    ///
    /// `cancel` is checked once per loop iteration; a cancelled generation
    /// keeps its partial text and ends with [`TerminationReason::Cancelled`].
    pub fn generate(
        &mut self,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<GenerationResult> {
        if self.cache_policy == CachePolicy::ResetEachRequest {
            self.reset();
        }

        let is_first_turn = self.context.used_cells() == 0;
        let mut prepared = self.prepare(messages, is_first_turn);
        if !is_first_turn {
            let continues = match &prepared {
                Ok((_, tokens)) => self.context.context_state().check_fits(tokens.len()).is_ok(),
                Err(_) => false,
            };
            if !continues {
                tracing::info!(
                    cells = %self.context.context_state(),
                    "turn does not continue the cached conversation; starting over"
                );
                self.reset();
                prepared = self.prepare(messages, true);
            }
        }
        let (conversation, prompt_tokens) = prepared?;
        self.conversation = conversation;
        let add_special = self.context.used_cells() == 0;

        tracing::debug!(
            messages = messages.len(),
            prompt_tokens = prompt_tokens.len(),
            add_special,
            cells = %self.context.context_state(),
            "generation started"
        );

        let n_prompt = prompt_tokens.len();
        let mut timer = GenerationTimer::new(n_prompt, Arc::clone(&self.telemetry));
        let mut output = DecodingState::new();
        let mut batch: Vec<TokenId> = prompt_tokens;

        let reason = loop {
            if cancel.is_cancelled() {
                break TerminationReason::Cancelled;
            }

            let state = self.context.context_state();
            if let Err(e) = state.check_fits(batch.len()) {
                tracing::warn!(error = %e, "stopping generation");
                break TerminationReason::ContextExceeded;
            }

            if let Err(status) = self.context.decode(&batch) {
                tracing::warn!(status, batch = batch.len(), "decode failed");
                break TerminationReason::DecodeFailure;
            }
            timer.mark_prompt_decoded();

            let token = match self.sampler.sample(self.context.logits()) {
                Ok(index) => index as TokenId,
                Err(e) => {
                    tracing::warn!(error = %e, "sampling failed");
                    break TerminationReason::DecodeFailure;
                }
            };

            if self.tokenizer.is_eog(token) {
                break TerminationReason::EndOfGeneration;
            }

            if let Err(e) = self.decoder.decode_into(token, &mut output) {
                tracing::warn!(error = %e, token, "token conversion failed");
                break TerminationReason::ConversionFailure;
            }
            timer.mark_token();

            batch.clear();
            batch.push(token);
        };

        if output.pending_utf8() > 0 {
            tracing::debug!(
                pending = output.pending_utf8(),
                "reply ends inside a multi-byte character"
            );
        }
        if let Some(sentinel) = reason.sentinel() {
            output.push_str(sentinel);
        }
        let metrics = timer.finish(reason);
        let text = output.into_string();

        if self.cache_policy == CachePolicy::Continue {
            if reason.is_completed() {
                // Every emitted token was decoded; only the EOG token is not.
                self.conversation.push_reply(&text);
            } else {
                // The cache no longer matches the rendered conversation.
                self.reset();
            }
        }

        Ok(GenerationResult {
            text,
            termination_reason: reason,
            usage: Usage {
                prompt_tokens: metrics.prompt_tokens,
                generated_tokens: metrics.generated_tokens,
            },
        })
    }
}

impl std::fmt::Debug for GenerationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationEngine")
            .field("context", &self.context.context_state())
            .field("cache_policy", &self.cache_policy)
            .field("tokenizer", &self.tokenizer)
            .finish()
    }
}
