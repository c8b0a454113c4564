//! Chat-template rendering.

use std::sync::Arc;

use llama_engine::{Message, Vocab};

use crate::{TokenizerError, TokenizerResult};

/// Renders a message list into the model's prompt format.
#[derive(Clone)]
pub struct TemplateRenderer {
    vocab: Arc<dyn Vocab>,
    template_override: Option<String>,
}

impl TemplateRenderer {
    /// Use `template_override` when given, else the model's declared template.
    pub fn new(vocab: Arc<dyn Vocab>, template_override: Option<String>) -> Self {
        Self {
            vocab,
            template_override,
        }
    }

    /// The template that `render` will apply, if any.
    pub fn template(&self) -> Option<&str> {
        self.template_override
            .as_deref()
            .or_else(|| self.vocab.chat_template())
    }

    /// Render `messages`, optionally opening an assistant turn at the end.
    ///
    /// The first pass uses a buffer of twice the total message length; when
    /// the engine reports a larger size the buffer grows once and the render
    /// is repeated.
    pub fn render(&self, messages: &[Message], add_assistant: bool) -> TokenizerResult<String> {
        let template = self.template().ok_or_else(|| {
            TokenizerError::TemplateError("model declares no chat template".to_string())
        })?;

        let content_len: usize = messages.iter().map(|m| m.content().len()).sum();
        let mut buf = vec![0u8; content_len * 2];

        let mut len = self
            .vocab
            .apply_chat_template(Some(template), messages, add_assistant, &mut buf);
        if len < 0 {
            return Err(TokenizerError::TemplateError(format!(
                "engine returned {len}"
            )));
        }
        if len as usize > buf.len() {
            tracing::trace!(from = buf.len(), to = len, "growing template buffer");
            buf.resize(len as usize, 0);
            len = self
                .vocab
                .apply_chat_template(Some(template), messages, add_assistant, &mut buf);
            if len < 0 || len as usize > buf.len() {
                return Err(TokenizerError::TemplateError(format!(
                    "engine returned {len} after resize to {}",
                    buf.len()
                )));
            }
        }

        buf.truncate(len as usize);
        String::from_utf8(buf)
            .map_err(|e| TokenizerError::TemplateError(format!("rendered prompt: {e}")))
    }

    /// Render the text one new turn appends to the cache.
    ///
    /// On the first turn `conversation` restarts and the whole prompt for
    /// `messages` is returned. On later turns the full history is rendered and
    /// only the text after what the cache already holds is returned, so the
    /// template closes the previous assistant turn and any header it emits
    /// once stays at the start. `conversation` is untouched on error.
    pub fn render_turn(
        &self,
        conversation: &mut Conversation,
        messages: &[Message],
        is_first_turn: bool,
    ) -> TokenizerResult<String> {
        let mut history = if is_first_turn {
            Vec::with_capacity(messages.len())
        } else {
            conversation.history.clone()
        };
        history.extend_from_slice(messages);

        let full = self.render(&history, true)?;
        let cached = if is_first_turn {
            ""
        } else {
            conversation.cached.as_str()
        };
        let delta = full
            .strip_prefix(cached)
            .ok_or_else(|| {
                TokenizerError::TemplateError(
                    "rendered history does not extend the cached conversation".to_string(),
                )
            })?
            .to_string();

        conversation.history = history;
        conversation.cached = full;
        Ok(delta)
    }
}

/// Messages whose rendering is in the cache, and that exact text.
///
/// `cached` ends just after the last assistant reply; the reply's closing
/// marker is rendered as the start of the next turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    history: Vec<Message>,
    cached: String,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Record the assistant reply generated after the last rendered turn.
    pub fn push_reply(&mut self, reply: &str) {
        self.history.push(Message::assistant(reply));
        self.cached.push_str(reply);
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.cached.clear();
    }
}

impl std::fmt::Debug for TemplateRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateRenderer")
            .field("template_override", &self.template_override)
            .finish()
    }
}
