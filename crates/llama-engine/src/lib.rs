//! # llama-engine
//!
//! The "narrow waist" of the llama.rs stack. Defines the boundary to the
//! inference engine ([`Vocab`] + [`InferenceContext`]) and the request-level
//! types every other crate depends on. Backends (llama.cpp FFI, the scripted
//! test backend) plug in behind these traits without changing the generation
//! pipeline.
//!
//! ## Design Notes
//!
//! ### Read-only vocabulary vs. the mutable context
//! Vocabulary and chat-template metadata are immutable after load, so [`Vocab`]
//! is `Send + Sync` and shared through an `Arc`. The inference context owns the
//! key/value cache and is only `Send`: exactly one caller may drive it at a
//! time, and the server guarantees that with its request gate.
//!
//! ### Sizing conventions
//! The raw calls mirror the engine's C contract: fill a caller buffer and
//! return the count written, or a negated required length when the buffer is
//! too small. The safe wrappers live in `llama-tokenizer`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use llama_kv::ContextState;

pub type Result<T> = std::result::Result<T, LlamaError>;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Top-level error type for engine and pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum LlamaError {
    #[error("Model loading failed: {0}")]
    ModelLoad(String),
    #[error("Context initialization failed: {0}")]
    ContextInit(String),
    #[error("Chat template rendering failed: {0}")]
    TemplateRender(String),
    #[error("Tokenization failed: {0}")]
    Tokenization(String),
    #[error("Inference failed: {0}")]
    Inference(String),
}

impl LlamaError {
    /// True for failures that end only the current request; the process and
    /// the shared context stay usable.
    pub fn is_request_scoped(&self) -> bool {
        matches!(
            self,
            LlamaError::TemplateRender(_) | LlamaError::Tokenization(_)
        )
    }
}

/// Parameters applied when loading model weights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelParams {
    /// Layers to offload to the GPU (99 = everything the backend can take).
    pub n_gpu_layers: i32,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self { n_gpu_layers: 99 }
    }
}

/// Parameters for the single inference context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextParams {
    /// Cache capacity in cells.
    pub n_ctx: u32,
    /// Largest batch one decode call accepts.
    pub n_batch: u32,
    /// CPU threads for decoding.
    pub n_threads: i32,
}

impl ContextParams {
    /// Context of `n_ctx` cells whose batch limit matches, so a prompt that
    /// fits the cache also fits one decode call.
    pub fn with_n_ctx(n_ctx: u32) -> Self {
        Self {
            n_ctx,
            n_batch: n_ctx,
            ..Self::default()
        }
    }
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            n_ctx: 8192,
            n_batch: 8192,
            n_threads: 4,
        }
    }
}

/// Specification for loading a model and creating its context.
#[derive(Debug, Clone, Default)]
pub struct ModelSpec {
    pub path: String,
    pub model: ModelParams,
    pub context: ContextParams,
}

/// Chat role of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A role-tagged chat message. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    role: Role,
    content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }
}

/// Read-only model vocabulary and chat-template metadata.
pub trait Vocab: Send + Sync {
    /// Tokenize `text` into `out`.
    ///
    /// Returns the number of tokens written, or the negated required length
    /// when `out` is too small (an empty `out` is the size probe).
    /// `add_special` prepends the beginning-of-sequence marker.
    /// `parse_special` turns control-token text into control tokens.
    fn tokenize(
        &self,
        text: &str,
        out: &mut [TokenId],
        add_special: bool,
        parse_special: bool,
    ) -> i32;

    /// Write the text piece for `token` into `out`.
    ///
    /// Returns the number of bytes written; negative when `out` is too small
    /// or the token is unknown. Pieces may be partial UTF-8 sequences.
    fn token_to_piece(&self, token: TokenId, out: &mut [u8], lstrip: i32, special: bool) -> i32;

    /// True for end-of-generation tokens (EOS, EOT, ...).
    fn is_eog(&self, token: TokenId) -> bool;

    /// Vocabulary size; logits have this many entries.
    fn n_tokens(&self) -> usize;

    /// The model's declared chat template, if it ships one.
    fn chat_template(&self) -> Option<&str>;

    /// Render `messages` with `template` (the model's own when `None`).
    ///
    /// Returns the total rendered length, which may exceed `out.len()`; in
    /// that case the caller grows the buffer and calls again. Negative on
    /// failure.
    fn apply_chat_template(
        &self,
        template: Option<&str>,
        messages: &[Message],
        add_assistant: bool,
        out: &mut [u8],
    ) -> i32;
}

/// The single mutable inference context holding the key/value cache.
pub trait InferenceContext: Send {
    /// Run one forward pass over `batch`, appending it to the cache.
    ///
    /// `Err` carries the engine's nonzero status code.
    fn decode(&mut self, batch: &[TokenId]) -> std::result::Result<(), i32>;

    /// Next-token logits for the last decoded position.
    fn logits(&self) -> &[f32];

    /// Cells currently occupied.
    fn used_cells(&self) -> usize;

    /// Total cache capacity in cells.
    fn n_ctx(&self) -> usize;

    /// Drop all cached state; `used_cells()` is 0 afterwards.
    fn clear_cache(&mut self);

    /// Snapshot of the cache occupancy.
    fn context_state(&self) -> ContextState {
        ContextState::saturating(self.used_cells(), self.n_ctx())
    }
}

/// A loaded model: shared vocabulary plus its one inference context.
pub struct LoadedModel {
    pub vocab: Arc<dyn Vocab>,
    pub context: Box<dyn InferenceContext>,
}

impl fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModel")
            .field("n_vocab", &self.vocab.n_tokens())
            .field("context", &self.context.context_state())
            .finish()
    }
}

/// Why a generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The model emitted an end-of-generation token.
    EndOfGeneration,
    /// The next batch would not fit in the cache.
    ContextExceeded,
    /// The engine's decode step failed.
    DecodeFailure,
    /// A sampled token could not be converted to text.
    ConversionFailure,
    /// The caller cancelled between loop iterations.
    Cancelled,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::EndOfGeneration => "end_of_generation",
            TerminationReason::ContextExceeded => "context_exceeded",
            TerminationReason::DecodeFailure => "decode_failure",
            TerminationReason::ConversionFailure => "conversion_failure",
            TerminationReason::Cancelled => "cancelled",
        }
    }

    /// Marker appended to the partial output on early termination.
    pub fn sentinel(&self) -> Option<&'static str> {
        match self {
            TerminationReason::EndOfGeneration => None,
            TerminationReason::ContextExceeded => Some("\n[Context size exceeded]"),
            TerminationReason::DecodeFailure => Some("\n[Decoding failed]"),
            TerminationReason::ConversionFailure => Some("\n[Token conversion failed]"),
            TerminationReason::Cancelled => Some("\n[Generation cancelled]"),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TerminationReason::EndOfGeneration)
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token counts for one generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
}

/// Final output of one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResult {
    /// Generated text, including the sentinel on early termination.
    pub text: String,
    pub termination_reason: TerminationReason,
    pub usage: Usage,
}
