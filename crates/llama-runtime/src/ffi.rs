//! llama.cpp backend (feature `llama-cpp`).
//!
//! All `unsafe` stays in here; the rest of the crate only sees the engine
//! traits.

use std::ffi::{c_char, CStr, CString};
use std::ptr::NonNull;
use std::sync::{Arc, Once};

use llama_cpp_sys_2 as sys;
use llama_engine::{
    InferenceContext, LlamaError, LoadedModel, Message, ModelSpec, Result, TokenId, Vocab,
};

static BACKEND_INIT: Once = Once::new();

/// Owns the model weights; freed when the last holder drops.
struct ModelHandle {
    ptr: NonNull<sys::llama_model>,
}

// SAFETY: the model is immutable after load and llama.cpp allows reading it
// from any thread.
unsafe impl Send for ModelHandle {}
unsafe impl Sync for ModelHandle {}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        unsafe { sys::llama_model_free(self.ptr.as_ptr()) };
    }
}

struct LlamaVocab {
    _model: Arc<ModelHandle>,
    vocab: *const sys::llama_vocab,
    template: Option<String>,
    n_tokens: usize,
}

// SAFETY: the vocabulary is owned by the model and read-only.
unsafe impl Send for LlamaVocab {}
unsafe impl Sync for LlamaVocab {}

struct ChatMessages {
    // Keeps the strings the raw messages point into alive.
    _owned: Vec<(CString, CString)>,
    raw: Vec<sys::llama_chat_message>,
}

fn chat_messages(messages: &[Message]) -> Option<ChatMessages> {
    let mut owned = Vec::with_capacity(messages.len());
    for m in messages {
        let role = CString::new(m.role().as_str()).ok()?;
        let content = CString::new(m.content()).ok()?;
        owned.push((role, content));
    }
    let raw = owned
        .iter()
        .map(|(role, content)| sys::llama_chat_message {
            role: role.as_ptr(),
            content: content.as_ptr(),
        })
        .collect();
    Some(ChatMessages {
        _owned: owned,
        raw,
    })
}

impl Vocab for LlamaVocab {
    fn tokenize(
        &self,
        text: &str,
        out: &mut [TokenId],
        add_special: bool,
        parse_special: bool,
    ) -> i32 {
        let out_ptr = if out.is_empty() {
            std::ptr::null_mut()
        } else {
            out.as_mut_ptr()
        };
        unsafe {
            sys::llama_tokenize(
                self.vocab,
                text.as_ptr().cast::<c_char>(),
                text.len() as i32,
                out_ptr,
                out.len() as i32,
                add_special,
                parse_special,
            )
        }
    }

    fn token_to_piece(&self, token: TokenId, out: &mut [u8], lstrip: i32, special: bool) -> i32 {
        unsafe {
            sys::llama_token_to_piece(
                self.vocab,
                token,
                out.as_mut_ptr().cast::<c_char>(),
                out.len() as i32,
                lstrip,
                special,
            )
        }
    }

    fn is_eog(&self, token: TokenId) -> bool {
        unsafe { sys::llama_vocab_is_eog(self.vocab, token) }
    }

    fn n_tokens(&self) -> usize {
        self.n_tokens
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
        let Some(template) = template.or(self.template.as_deref()) else {
            return -1;
        };
        let Ok(template) = CString::new(template) else {
            return -1;
        };
        let Some(chat) = chat_messages(messages) else {
            return -1;
        };
        unsafe {
            sys::llama_chat_apply_template(
                template.as_ptr(),
                chat.raw.as_ptr(),
                chat.raw.len(),
                add_assistant,
                out.as_mut_ptr().cast::<c_char>(),
                out.len() as i32,
            )
        }
    }
}

struct LlamaContext {
    ctx: NonNull<sys::llama_context>,
    // Outlives `ctx`: the context is freed in `drop` before fields drop.
    _model: Arc<ModelHandle>,
    n_vocab: usize,
}

// SAFETY: a context may move between threads; it is never used from two at once
// because every method takes `&mut self` or is a read of the last logits.
unsafe impl Send for LlamaContext {}

impl Drop for LlamaContext {
    fn drop(&mut self) {
        unsafe { sys::llama_free(self.ctx.as_ptr()) };
    }
}

impl InferenceContext for LlamaContext {
    fn decode(&mut self, batch: &[TokenId]) -> std::result::Result<(), i32> {
        let mut tokens = batch.to_vec();
        let status = unsafe {
            let batch = sys::llama_batch_get_one(tokens.as_mut_ptr(), tokens.len() as i32);
            sys::llama_decode(self.ctx.as_ptr(), batch)
        };
        if status == 0 {
            Ok(())
        } else {
            Err(status)
        }
    }

    fn logits(&self) -> &[f32] {
        unsafe {
            let ptr = sys::llama_get_logits_ith(self.ctx.as_ptr(), -1);
            if ptr.is_null() {
                return &[];
            }
            std::slice::from_raw_parts(ptr, self.n_vocab)
        }
    }

    fn used_cells(&self) -> usize {
        let pos_max = unsafe {
            let mem = sys::llama_get_memory(self.ctx.as_ptr());
            sys::llama_memory_seq_pos_max(mem, 0)
        };
        if pos_max < 0 {
            0
        } else {
            pos_max as usize + 1
        }
    }

    fn n_ctx(&self) -> usize {
        unsafe { sys::llama_n_ctx(self.ctx.as_ptr()) as usize }
    }

    fn clear_cache(&mut self) {
        unsafe {
            let mem = sys::llama_get_memory(self.ctx.as_ptr());
            sys::llama_memory_clear(mem, true);
        }
    }
}

/// Load weights and create the single inference context.
pub fn load(spec: &ModelSpec) -> Result<LoadedModel> {
    BACKEND_INIT.call_once(|| unsafe { sys::llama_backend_init() });

    let path = CString::new(spec.path.as_str())
        .map_err(|_| LlamaError::ModelLoad("model path contains NUL".to_string()))?;

    let mut model_params = unsafe { sys::llama_model_default_params() };
    model_params.n_gpu_layers = spec.model.n_gpu_layers;

    let model_ptr = unsafe { sys::llama_model_load_from_file(path.as_ptr(), model_params) };
    let model = Arc::new(ModelHandle {
        ptr: NonNull::new(model_ptr).ok_or_else(|| {
            LlamaError::ModelLoad(format!("unable to load model from {}", spec.path))
        })?,
    });

    let mut ctx_params = unsafe { sys::llama_context_default_params() };
    ctx_params.n_ctx = spec.context.n_ctx;
    ctx_params.n_batch = spec.context.n_batch;
    ctx_params.n_threads = spec.context.n_threads;
    ctx_params.n_threads_batch = spec.context.n_threads;

    let ctx_ptr = unsafe { sys::llama_init_from_model(model.ptr.as_ptr(), ctx_params) };
    let ctx = NonNull::new(ctx_ptr)
        .ok_or_else(|| LlamaError::ContextInit("failed to create the llama_context".to_string()))?;

    let vocab = unsafe { sys::llama_model_get_vocab(model.ptr.as_ptr()) };
    let n_tokens = unsafe { sys::llama_vocab_n_tokens(vocab) }.max(0) as usize;
    let template = unsafe {
        let ptr = sys::llama_model_chat_template(model.ptr.as_ptr(), std::ptr::null());
        (!ptr.is_null()).then(|| CStr::from_ptr(ptr).to_string_lossy().into_owned())
    };

    tracing::info!(
        path = %spec.path,
        n_ctx = spec.context.n_ctx,
        n_vocab = n_tokens,
        has_template = template.is_some(),
        "model loaded"
    );

    Ok(LoadedModel {
        vocab: Arc::new(LlamaVocab {
            _model: Arc::clone(&model),
            vocab,
            template,
            n_tokens,
        }),
        context: Box::new(LlamaContext {
            ctx,
            _model: model,
            n_vocab: n_tokens,
        }),
    })
}
