//! Deterministic in-process backend.
//!
//! [`ScriptedBackend`] implements the engine traits without model weights:
//! a byte-level vocabulary with ChatML control tokens, a ChatML template, and
//! a cache whose occupancy is tracked by a [`CellLedger`]. Each new prompt
//! starts the next scripted reply; the logits put all mass on the reply's
//! next token, then on `<|im_end|>`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use llama_engine::{InferenceContext, LlamaError, LoadedModel, Message, Result, TokenId, Vocab};
use llama_kv::CellLedger;

pub const BOS: TokenId = 256;
pub const EOS: TokenId = 257;
pub const IM_START: TokenId = 258;
pub const IM_END: TokenId = 259;
/// Token whose piece is larger than any per-token conversion buffer.
pub const BLOB: TokenId = 260;
pub const N_VOCAB: usize = 261;

pub const BLOB_PIECE_LEN: usize = 300;

const SCRIPTED_LOGIT: f32 = 30.0;

/// A ChatML template as shipped in model metadata.
pub const CHATML_TEMPLATE: &str = "{% for message in messages %}{{'<|im_start|>' + message['role'] + '\\n' + message['content'] + '<|im_end|>' + '\\n'}}{% endfor %}{% if add_generation_prompt %}{{ '<|im_start|>assistant\\n' }}{% endif %}";

const CONTROL_TEXT: [(TokenId, &str); 4] = [
    (BOS, "<s>"),
    (EOS, "</s>"),
    (IM_START, "<|im_start|>"),
    (IM_END, "<|im_end|>"),
];

/// Something the scripted context observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEvent {
    Clear,
    Decode {
        used_before: usize,
        batch: Vec<TokenId>,
    },
}

/// Shared record of context events, in call order.
pub type EventLog = Arc<Mutex<Vec<ContextEvent>>>;

/// Builder for a scripted model.
#[derive(Debug, Clone)]
pub struct ScriptedBackend {
    n_ctx: usize,
    template: Option<String>,
    replies: VecDeque<Vec<TokenId>>,
    never_end: bool,
    fail_decode_at: Option<usize>,
    decode_delay: Duration,
    events: EventLog,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            n_ctx: 8192,
            template: Some(CHATML_TEMPLATE.to_string()),
            replies: VecDeque::new(),
            never_end: false,
            fail_decode_at: None,
            decode_delay: Duration::ZERO,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_n_ctx(mut self, n_ctx: usize) -> Self {
        self.n_ctx = n_ctx;
        self
    }

    /// Queue a reply; consecutive prompts consume replies in order and the
    /// last one repeats.
    pub fn with_reply(self, text: &str) -> Self {
        self.with_reply_tokens(text.bytes().map(TokenId::from).collect())
    }

    pub fn with_reply_tokens(mut self, tokens: Vec<TokenId>) -> Self {
        self.replies.push_back(tokens);
        self
    }

    /// Never predict the end-of-generation token; the reply loops.
    pub fn never_end(mut self) -> Self {
        self.never_end = true;
        self
    }

    /// Fail the `n`th decode call (0-based, counted over the context's life).
    pub fn fail_decode_at(mut self, n: usize) -> Self {
        self.fail_decode_at = Some(n);
        self
    }

    /// Model metadata declares no chat template.
    pub fn without_template(mut self) -> Self {
        self.template = None;
        self
    }

    /// Sleep this long inside every decode call.
    pub fn with_decode_delay(mut self, delay: Duration) -> Self {
        self.decode_delay = delay;
        self
    }

    /// Handle to the event log shared with the built context.
    pub fn events(&self) -> EventLog {
        Arc::clone(&self.events)
    }

    pub fn build(self) -> Result<LoadedModel> {
        let ledger =
            CellLedger::new(self.n_ctx).map_err(|e| LlamaError::ContextInit(e.to_string()))?;
        Ok(LoadedModel {
            vocab: Arc::new(ScriptedVocab {
                template: self.template,
            }),
            context: Box::new(ScriptedContext {
                ledger,
                logits: vec![0.0; N_VOCAB],
                replies: self.replies,
                current: Vec::new(),
                cursor: 0,
                expected: None,
                never_end: self.never_end,
                fail_decode_at: self.fail_decode_at,
                decode_calls: 0,
                decode_delay: self.decode_delay,
                events: self.events,
            }),
        })
    }
}

struct ScriptedVocab {
    template: Option<String>,
}

fn write_tokens(ids: &[TokenId], out: &mut [TokenId]) -> i32 {
    if ids.len() > out.len() {
        return -(ids.len() as i32);
    }
    out[..ids.len()].copy_from_slice(ids);
    ids.len() as i32
}

impl Vocab for ScriptedVocab {
    fn tokenize(
        &self,
        text: &str,
        out: &mut [TokenId],
        add_special: bool,
        parse_special: bool,
    ) -> i32 {
        let mut ids = Vec::with_capacity(text.len() + 1);
        if add_special {
            ids.push(BOS);
        }
        let mut rest = text.as_bytes();
        'outer: while let Some((&first, tail)) = rest.split_first() {
            if parse_special {
                for (id, marker) in CONTROL_TEXT {
                    if rest.starts_with(marker.as_bytes()) {
                        ids.push(id);
                        rest = &rest[marker.len()..];
                        continue 'outer;
                    }
                }
            }
            ids.push(TokenId::from(first));
            rest = tail;
        }
        write_tokens(&ids, out)
    }

    fn token_to_piece(&self, token: TokenId, out: &mut [u8], _lstrip: i32, special: bool) -> i32 {
        let piece: Vec<u8> = match token {
            0..=255 => vec![token as u8],
            BLOB => vec![b'#'; BLOB_PIECE_LEN],
            _ => match CONTROL_TEXT.iter().find(|(id, _)| *id == token) {
                Some((_, text)) if special => text.as_bytes().to_vec(),
                Some(_) => Vec::new(),
                None => return -1,
            },
        };
        if piece.len() > out.len() {
            return -(piece.len() as i32);
        }
        out[..piece.len()].copy_from_slice(&piece);
        piece.len() as i32
    }

    fn is_eog(&self, token: TokenId) -> bool {
        token == EOS || token == IM_END
    }

    fn n_tokens(&self) -> usize {
        N_VOCAB
    }

    fn chat_template(&self) -> Option<&str> {
        self.template.as_deref()
    }

    fn apply_chat_template(
        &self,
        template: Option<&str>,
        messages: &[Message],
        add_assistant: bool,
        out: &mut [u8],
    ) -> i32 {
        // Only ChatML-style templates are understood.
        match template.or(self.template.as_deref()) {
            Some(t) if t.contains("<|im_start|>") => {}
            _ => return -1,
        }
        let mut rendered = String::new();
        for m in messages {
            rendered.push_str("<|im_start|>");
            rendered.push_str(m.role().as_str());
            rendered.push('\n');
            rendered.push_str(m.content());
            rendered.push_str("<|im_end|>\n");
        }
        if add_assistant {
            rendered.push_str("<|im_start|>assistant\n");
        }
        let bytes = rendered.as_bytes();
        let n = bytes.len().min(out.len());
        out[..n].copy_from_slice(&bytes[..n]);
        bytes.len() as i32
    }
}

struct ScriptedContext {
    ledger: CellLedger,
    logits: Vec<f32>,
    replies: VecDeque<Vec<TokenId>>,
    current: Vec<TokenId>,
    cursor: usize,
    /// Token the logits currently point at.
    expected: Option<TokenId>,
    never_end: bool,
    fail_decode_at: Option<usize>,
    decode_calls: usize,
    decode_delay: Duration,
    events: EventLog,
}

impl ScriptedContext {
    fn record(&self, event: ContextEvent) {
        if let Ok(mut log) = self.events.lock() {
            log.push(event);
        }
    }

    fn start_reply(&mut self) {
        if self.replies.len() > 1 {
            self.current = self.replies.pop_front().unwrap_or_default();
        } else {
            self.current = self.replies.front().cloned().unwrap_or_default();
        }
        self.cursor = 0;
    }

    fn next_target(&mut self) -> TokenId {
        if self.cursor < self.current.len() {
            let token = self.current[self.cursor];
            self.cursor += 1;
            return token;
        }
        if !self.never_end {
            return IM_END;
        }
        if self.current.is_empty() {
            return TokenId::from(b'.');
        }
        self.cursor = 1;
        self.current[0]
    }
}

impl InferenceContext for ScriptedContext {
    fn decode(&mut self, batch: &[TokenId]) -> std::result::Result<(), i32> {
        let call = self.decode_calls;
        self.decode_calls += 1;
        self.record(ContextEvent::Decode {
            used_before: self.ledger.used(),
            batch: batch.to_vec(),
        });
        if !self.decode_delay.is_zero() {
            std::thread::sleep(self.decode_delay);
        }

        if batch.is_empty() || self.fail_decode_at == Some(call) {
            return Err(-1);
        }
        if self.ledger.occupy(batch.len()).is_err() {
            return Err(1);
        }

        // A batch that is not the single predicted token is a new prompt.
        let continues = batch.len() == 1 && self.expected == Some(batch[0]);
        if !continues {
            self.start_reply();
        }

        let target = self.next_target();
        self.logits.iter_mut().for_each(|l| *l = 0.0);
        self.logits[target as usize] = SCRIPTED_LOGIT;
        self.expected = Some(target);
        Ok(())
    }

    fn logits(&self) -> &[f32] {
        &self.logits
    }

    fn used_cells(&self) -> usize {
        self.ledger.used()
    }

    fn n_ctx(&self) -> usize {
        self.ledger.capacity()
    }

    fn clear_cache(&mut self) {
        self.ledger.clear();
        self.expected = None;
        self.record(ContextEvent::Clear);
    }
}
