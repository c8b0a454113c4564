//! # llama-tokenizer
//!
//! Safe wrappers over the engine's vocabulary calls.
//!
//! This crate provides:
//! - [`Tokenizer`]: two-phase prompt encoding (size probe, then exact fill)
//! - [`PieceDecoder`]: per-token text conversion into a fixed scratch buffer
//! - [`DecodingState`]: byte accumulation that tolerates pieces splitting a
//!   multi-byte character
//! - [`TemplateRenderer`]: chat-template rendering with grow-and-retry
//! - [`Conversation`]: the rendered history already held by the cache

use std::sync::Arc;

use llama_engine::{TokenId, Vocab};

mod template;

pub use template::{Conversation, TemplateRenderer};

/// Scratch size for one token piece.
pub const PIECE_BUFFER_SIZE: usize = 256;

/// Error type for tokenization operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizerError {
    #[error("Invalid token ID: {0}")]
    InvalidToken(TokenId),
    #[error("Piece for token {token} needs {needed} bytes (buffer is {PIECE_BUFFER_SIZE})")]
    PieceTooLarge { token: TokenId, needed: usize },
    #[error("Encoding error: {0}")]
    EncodingError(String),
    #[error("Template error: {0}")]
    TemplateError(String),
}

pub type TokenizerResult<T> = std::result::Result<T, TokenizerError>;

/// Prompt encoder over a shared vocabulary.
#[derive(Clone)]
pub struct Tokenizer {
    vocab: Arc<dyn Vocab>,
}

impl Tokenizer {
    pub fn new(vocab: Arc<dyn Vocab>) -> Self {
        Self { vocab }
    }

    /// Encode `text`, prepending the beginning-of-sequence marker when
    /// `add_special` is set. Control-token text always parses to control
    /// tokens.
    pub fn encode(&self, text: &str, add_special: bool) -> TokenizerResult<Vec<TokenId>> {
        let probe = self.vocab.tokenize(text, &mut [], add_special, true);
        let required = probe.unsigned_abs() as usize;
        if required == 0 {
            return Ok(Vec::new());
        }

        let mut tokens = vec![0; required];
        let written = self.vocab.tokenize(text, &mut tokens, add_special, true);
        if written < 0 {
            return Err(TokenizerError::EncodingError(format!(
                "engine needs {} tokens after sizing for {}",
                written.unsigned_abs(),
                required
            )));
        }
        tokens.truncate(written as usize);
        Ok(tokens)
    }

    /// Convert a token sequence back to text.
    pub fn decode(&self, tokens: &[TokenId]) -> TokenizerResult<String> {
        let mut decoder = PieceDecoder::new(Arc::clone(&self.vocab));
        let mut state = DecodingState::new();
        for &token in tokens {
            decoder.decode_into(token, &mut state)?;
        }
        Ok(state.into_string())
    }

    pub fn is_eog(&self, token: TokenId) -> bool {
        self.vocab.is_eog(token)
    }

}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("vocab_size", &self.vocab.n_tokens())
            .finish()
    }
}

/// Converts sampled tokens to text one at a time.
pub struct PieceDecoder {
    vocab: Arc<dyn Vocab>,
    buf: [u8; PIECE_BUFFER_SIZE],
}

impl PieceDecoder {
    pub fn new(vocab: Arc<dyn Vocab>) -> Self {
        Self {
            vocab,
            buf: [0; PIECE_BUFFER_SIZE],
        }
    }

    /// Append the piece for `token` to `state`, returning its byte length.
    ///
    /// Control tokens render as their text. The piece may end inside a
    /// multi-byte character; `state` keeps the raw bytes until the end.
    pub fn decode_into(
        &mut self,
        token: TokenId,
        state: &mut DecodingState,
    ) -> TokenizerResult<usize> {
        let n = self.vocab.token_to_piece(token, &mut self.buf, 0, true);
        if n < 0 {
            let needed = n.unsigned_abs() as usize;
            return Err(if needed > PIECE_BUFFER_SIZE {
                TokenizerError::PieceTooLarge { token, needed }
            } else {
                TokenizerError::InvalidToken(token)
            });
        }
        let n = n as usize;
        state.push(&self.buf[..n]);
        Ok(n)
    }
}

/// Raw output bytes of one generation.
///
/// Pieces are stored unvalidated; a character split across two pieces is
/// whole again once both have been pushed.
#[derive(Debug, Clone, Default)]
pub struct DecodingState {
    bytes: Vec<u8>,
}

impl DecodingState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, piece: &[u8]) {
        self.bytes.extend_from_slice(piece);
    }

    /// Append marker text (e.g. a termination sentinel).
    pub fn push_str(&mut self, text: &str) {
        self.bytes.extend_from_slice(text.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Number of trailing bytes that start a character not yet complete.
    pub fn pending_utf8(&self) -> usize {
        match std::str::from_utf8(&self.bytes) {
            Ok(_) => 0,
            Err(e) if e.error_len().is_none() => self.bytes.len() - e.valid_up_to(),
            Err(_) => 0,
        }
    }

    /// Final text; invalid or dangling sequences become U+FFFD.
    pub fn into_string(self) -> String {
        match String::from_utf8(self.bytes) {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(
                    valid_up_to = e.utf8_error().valid_up_to(),
                    "generated bytes are not valid UTF-8; replacing"
                );
                String::from_utf8_lossy(e.as_bytes()).into_owned()
            }
        }
    }
}
