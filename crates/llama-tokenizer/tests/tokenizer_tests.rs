//! Integration tests for llama-tokenizer.
//!
//! Validates:
//! - Two-phase encoding and the beginning-of-sequence flag
//! - Control-token text parses to control tokens
//! - Per-token decoding across split UTF-8 sequences
//! - Piece conversion failures
//! - Template rendering with grow-and-retry and override precedence

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use llama_engine::{Message, TokenId, Vocab};
use llama_tokenizer::*;

// ===========================================================================
// Test vocabulary
// ===========================================================================

const BOS: TokenId = 256;
const END: TokenId = 257;
const BLOB: TokenId = 258;
const END_TEXT: &str = "<|end|>";

/// Byte-level vocabulary: ids 0..=255 are raw bytes.
#[derive(Default)]
struct ByteVocab {
    template: Option<String>,
    template_calls: AtomicUsize,
    tokenize_calls: AtomicUsize,
}

impl ByteVocab {
    fn with_template(template: &str) -> Self {
        Self {
            template: Some(template.to_string()),
            ..Self::default()
        }
    }
}

impl Vocab for ByteVocab {
    fn tokenize(&self, text: &str, out: &mut [TokenId], add_special: bool, parse_special: bool) -> i32 {
        self.tokenize_calls.fetch_add(1, Ordering::SeqCst);
        let mut ids = Vec::new();
        if add_special {
            ids.push(BOS);
        }
        let mut rest = text;
        while !rest.is_empty() {
            if parse_special && rest.starts_with(END_TEXT) {
                ids.push(END);
                rest = &rest[END_TEXT.len()..];
                continue;
            }
            let c = rest.chars().next().unwrap();
            ids.extend(rest[..c.len_utf8()].bytes().map(TokenId::from));
            rest = &rest[c.len_utf8()..];
        }
        if ids.len() > out.len() {
            return -(ids.len() as i32);
        }
        out[..ids.len()].copy_from_slice(&ids);
        ids.len() as i32
    }

    fn token_to_piece(&self, token: TokenId, out: &mut [u8], _lstrip: i32, special: bool) -> i32 {
        let piece: Vec<u8> = match token {
            0..=255 => vec![token as u8],
            BOS => Vec::new(),
            END if special => END_TEXT.as_bytes().to_vec(),
            END => Vec::new(),
            BLOB => vec![b'x'; 300],
            _ => return -1,
        };
        if piece.len() > out.len() {
            return -(piece.len() as i32);
        }
        out[..piece.len()].copy_from_slice(&piece);
        piece.len() as i32
    }

    fn is_eog(&self, token: TokenId) -> bool {
        token == END
    }

    fn n_tokens(&self) -> usize {
        259
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
        self.template_calls.fetch_add(1, Ordering::SeqCst);
        let Some(template) = template else {
            return -1;
        };
        if template == "broken" {
            return -1;
        }
        let mut rendered = String::new();
        for m in messages {
            rendered.push_str(&format!("[{}:{}]{}{END_TEXT}\n", template, m.role(), m.content()));
        }
        if add_assistant {
            rendered.push_str(&format!("[{template}:assistant]"));
        }
        let bytes = rendered.as_bytes();
        let n = bytes.len().min(out.len());
        out[..n].copy_from_slice(&bytes[..n]);
        bytes.len() as i32
    }
}

fn shared(vocab: ByteVocab) -> (Arc<ByteVocab>, Arc<dyn Vocab>) {
    let vocab = Arc::new(vocab);
    let dyn_vocab: Arc<dyn Vocab> = vocab.clone();
    (vocab, dyn_vocab)
}

// ===========================================================================
// Encoding
// ===========================================================================

#[test]
fn encode_probes_then_fills() {
    let (raw, vocab) = shared(ByteVocab::default());
    let tok = Tokenizer::new(vocab);

    let ids = tok.encode("hi", true).unwrap();
    assert_eq!(ids, vec![BOS, 'h' as i32, 'i' as i32]);
    assert_eq!(raw.tokenize_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn encode_without_special_has_no_bos() {
    let (_, vocab) = shared(ByteVocab::default());
    let tok = Tokenizer::new(vocab);
    let ids = tok.encode("hi", false).unwrap();
    assert_eq!(ids.first(), Some(&('h' as i32)));
}

#[test]
fn encode_parses_control_text() {
    let (_, vocab) = shared(ByteVocab::default());
    let tok = Tokenizer::new(vocab);
    let ids = tok.encode("a<|end|>", false).unwrap();
    assert_eq!(ids, vec!['a' as i32, END]);
}

#[test]
fn encode_empty_text_is_empty() {
    let (_, vocab) = shared(ByteVocab::default());
    let tok = Tokenizer::new(vocab);
    assert!(tok.encode("", false).unwrap().is_empty());
}

// ===========================================================================
// Decoding
// ===========================================================================

#[test]
fn decode_roundtrip_multibyte() {
    let (_, vocab) = shared(ByteVocab::default());
    let tok = Tokenizer::new(vocab);
    for input in ["hello world", "héllo", "日本語", "emoji 🦙!"] {
        let ids = tok.encode(input, false).unwrap();
        assert_eq!(tok.decode(&ids).unwrap(), input, "roundtrip failed for {input:?}");
    }
}

#[test]
fn piece_decoder_accumulates_split_characters() {
    let (_, vocab) = shared(ByteVocab::default());
    let mut decoder = PieceDecoder::new(vocab);
    let mut state = DecodingState::new();

    // "🦙" is four bytes, one token each.
    for b in "🦙".bytes() {
        assert_eq!(decoder.decode_into(TokenId::from(b), &mut state).unwrap(), 1);
    }
    assert_eq!(state.pending_utf8(), 0);
    assert_eq!(state.into_string(), "🦙");
}

#[test]
fn piece_decoder_renders_control_tokens() {
    let (_, vocab) = shared(ByteVocab::default());
    let mut decoder = PieceDecoder::new(vocab);
    let mut state = DecodingState::new();
    decoder.decode_into(END, &mut state).unwrap();
    assert_eq!(state.into_string(), END_TEXT);
}

#[test]
fn piece_decoder_oversized_piece_fails() {
    let (_, vocab) = shared(ByteVocab::default());
    let mut decoder = PieceDecoder::new(vocab);
    let mut state = DecodingState::new();
    state.push(b"partial");

    let err = decoder.decode_into(BLOB, &mut state).unwrap_err();
    assert_eq!(
        err,
        TokenizerError::PieceTooLarge {
            token: BLOB,
            needed: 300
        }
    );
    assert_eq!(state.into_string(), "partial");
}

#[test]
fn piece_decoder_unknown_token_fails() {
    let (_, vocab) = shared(ByteVocab::default());
    let mut decoder = PieceDecoder::new(vocab);
    let mut state = DecodingState::new();
    assert_eq!(
        decoder.decode_into(9999, &mut state).unwrap_err(),
        TokenizerError::InvalidToken(9999)
    );
}

// ===========================================================================
// Template rendering
// ===========================================================================

#[test]
fn render_uses_model_template() {
    let (_, vocab) = shared(ByteVocab::with_template("chatml"));
    let renderer = TemplateRenderer::new(vocab, None);
    let prompt = renderer.render(&[Message::user("hi")], true).unwrap();
    assert_eq!(prompt, "[chatml:user]hi<|end|>\n[chatml:assistant]");
}

#[test]
fn render_override_wins() {
    let (_, vocab) = shared(ByteVocab::with_template("chatml"));
    let renderer = TemplateRenderer::new(vocab, Some("custom".to_string()));
    assert_eq!(renderer.template(), Some("custom"));
    let prompt = renderer.render(&[Message::user("hi")], false).unwrap();
    assert!(prompt.starts_with("[custom:user]"));
}

#[test]
fn render_grows_buffer_once() {
    let (raw, vocab) = shared(ByteVocab::with_template("chatml"));
    let renderer = TemplateRenderer::new(vocab, None);

    // Rendered output is far longer than twice the one-byte content.
    let prompt = renderer.render(&[Message::user("x")], true).unwrap();
    assert_eq!(prompt, "[chatml:user]x<|end|>\n[chatml:assistant]");
    assert_eq!(raw.template_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn render_fits_first_try_with_long_content() {
    let (raw, vocab) = shared(ByteVocab::with_template("t"));
    let renderer = TemplateRenderer::new(vocab, None);
    let content = "a".repeat(200);
    let prompt = renderer.render(&[Message::user(content.clone())], false).unwrap();
    assert!(prompt.contains(&content));
    assert_eq!(raw.template_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn render_multi_turn_keeps_order() {
    let (_, vocab) = shared(ByteVocab::with_template("t"));
    let renderer = TemplateRenderer::new(vocab, None);
    let msgs = [
        Message::system("be brief"),
        Message::user("q1"),
        Message::assistant("a1"),
        Message::user("q2"),
    ];
    let prompt = renderer.render(&msgs, true).unwrap();
    let order: Vec<usize> = ["be brief", "q1", "a1", "q2"]
        .iter()
        .map(|s| prompt.find(s).unwrap())
        .collect();
    assert!(order.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn render_without_template_fails() {
    let (_, vocab) = shared(ByteVocab::default());
    let renderer = TemplateRenderer::new(vocab, None);
    assert!(matches!(
        renderer.render(&[Message::user("hi")], true),
        Err(TokenizerError::TemplateError(_))
    ));
}

#[test]
fn render_engine_failure_is_template_error() {
    let (_, vocab) = shared(ByteVocab::with_template("broken"));
    let renderer = TemplateRenderer::new(vocab, None);
    assert!(matches!(
        renderer.render(&[Message::user("hi")], true),
        Err(TokenizerError::TemplateError(_))
    ));
}

// ===========================================================================
// Conversation turns
// ===========================================================================

#[test]
fn first_turn_renders_whole_prompt() {
    let (_, vocab) = shared(ByteVocab::with_template("t"));
    let renderer = TemplateRenderer::new(vocab, None);
    let mut conversation = Conversation::new();

    let prompt = renderer
        .render_turn(&mut conversation, &[Message::user("hi")], true)
        .unwrap();
    assert_eq!(prompt, "[t:user]hi<|end|>\n[t:assistant]");
    assert_eq!(conversation.history(), &[Message::user("hi")]);
}

#[test]
fn next_turn_closes_previous_reply() {
    let (_, vocab) = shared(ByteVocab::with_template("t"));
    let renderer = TemplateRenderer::new(vocab, None);
    let mut conversation = Conversation::new();

    renderer
        .render_turn(&mut conversation, &[Message::user("hi")], true)
        .unwrap();
    conversation.push_reply("yo");
    let prompt = renderer
        .render_turn(&mut conversation, &[Message::user("more")], false)
        .unwrap();

    assert_eq!(prompt, "<|end|>\n[t:user]more<|end|>\n[t:assistant]");
    assert_eq!(conversation.history().len(), 3);
    assert_eq!(conversation.history()[1], Message::assistant("yo"));
}

#[test]
fn first_turn_discards_earlier_history() {
    let (_, vocab) = shared(ByteVocab::with_template("t"));
    let renderer = TemplateRenderer::new(vocab, None);
    let mut conversation = Conversation::new();

    renderer
        .render_turn(&mut conversation, &[Message::user("old")], true)
        .unwrap();
    conversation.push_reply("reply");
    let prompt = renderer
        .render_turn(&mut conversation, &[Message::user("new")], true)
        .unwrap();

    assert_eq!(prompt, "[t:user]new<|end|>\n[t:assistant]");
    assert_eq!(conversation.history(), &[Message::user("new")]);
}

#[test]
fn diverging_history_is_template_error() {
    let (_, vocab) = shared(ByteVocab::with_template("t"));
    let first = TemplateRenderer::new(Arc::clone(&vocab), None);
    let other = TemplateRenderer::new(vocab, Some("u".to_string()));
    let mut conversation = Conversation::new();

    first
        .render_turn(&mut conversation, &[Message::user("hi")], true)
        .unwrap();
    conversation.push_reply("yo");
    let before = conversation.clone();

    assert!(matches!(
        other.render_turn(&mut conversation, &[Message::user("more")], false),
        Err(TokenizerError::TemplateError(_))
    ));
    assert_eq!(conversation, before);
}
