//! A deterministic reference backend.
//!
//! `ScriptedBackend` tokenizes byte-by-byte with [`ByteTokenizer`] and, after
//! any prompt, "predicts" a fixed reply followed by EOS. It has no weights;
//! it exists so that everything above the kernel can run end to end.
//!
//! Model files must exist on disk but their contents are not read.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use pocket_engine::{
    Batch, ContextParams, EngineError, InferenceBackend, ModelKind, ModelSpec, Result, TokenId,
};
use pocket_tokenizer::{ByteTokenizer, Tokenizer, TokenizerError};

const CHATML_SOURCE: &str =
    "{% for m in messages %}<|im_start|>{{ m.role }}\n{{ m.content }}<|im_end|>\n{% endfor %}";

const HIGH: f32 = 10.0;

/// Scripted byte-level backend.
#[derive(Debug)]
pub struct ScriptedBackend {
    tokenizer: ByteTokenizer,
    /// Reply bytes as token ids, EOS-terminated.
    reply: Vec<TokenId>,
    context_size: Option<u32>,
    fail_decode_after: Option<usize>,
    fail_sampled: AtomicBool,
    template: Option<String>,
    models_loaded: AtomicUsize,
    contexts_created: AtomicUsize,
    decode_calls: AtomicUsize,
}

#[derive(Debug)]
pub struct ScriptedModel {
    pub path: PathBuf,
    pub kind: ModelKind,
}

#[derive(Debug)]
pub struct ScriptedContext {
    n_ctx: u32,
    tokens: Vec<TokenId>,
    /// Index into the reply of the next token to predict.
    cursor: usize,
    logits: Option<Vec<f32>>,
}

impl ScriptedContext {
    /// Every token decoded so far.
    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }
}

impl ScriptedBackend {
    pub fn new(reply: &str) -> Self {
        let tokenizer = ByteTokenizer::new();
        let mut ids: Vec<TokenId> = reply.bytes().map(ByteTokenizer::byte_token).collect();
        ids.push(ByteTokenizer::EOS);
        Self {
            tokenizer,
            reply: ids,
            context_size: None,
            fail_decode_after: None,
            fail_sampled: AtomicBool::new(false),
            template: Some(CHATML_SOURCE.to_string()),
            models_loaded: AtomicUsize::new(0),
            contexts_created: AtomicUsize::new(0),
            decode_calls: AtomicUsize::new(0),
        }
    }

    /// Override the window of every context, ignoring requested parameters.
    pub fn with_context_size(mut self, n_ctx: u32) -> Self {
        self.context_size = Some(n_ctx);
        self
    }

    /// Fail every decode call after the first `n`.
    pub fn with_decode_failure_after(mut self, n: usize) -> Self {
        self.fail_decode_after = Some(n);
        self
    }

    /// While set, decoding a single sampled token fails. Prompt batches are
    /// unaffected.
    pub fn set_fail_sampled_decodes(&self, fail: bool) {
        self.fail_sampled.store(fail, Ordering::SeqCst);
    }

    /// Template source reported for loaded models.
    pub fn with_template(mut self, source: Option<&str>) -> Self {
        self.template = source.map(str::to_string);
        self
    }

    pub fn models_loaded(&self) -> usize {
        self.models_loaded.load(Ordering::SeqCst)
    }

    pub fn contexts_created(&self) -> usize {
        self.contexts_created.load(Ordering::SeqCst)
    }

    pub fn decode_calls(&self) -> usize {
        self.decode_calls.load(Ordering::SeqCst)
    }

    fn vocab_size(&self) -> usize {
        self.tokenizer.vocab_size()
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new("Hello from pocket.")
    }
}

fn tokenizer_error(e: TokenizerError) -> EngineError {
    EngineError::Tokenization(e.to_string())
}

impl InferenceBackend for ScriptedBackend {
    type Model = ScriptedModel;
    type Context = ScriptedContext;

    fn load_model(&self, spec: &ModelSpec) -> Result<ScriptedModel> {
        if !spec.path.is_file() {
            return Err(EngineError::ModelLoad(format!(
                "no model file at {}",
                spec.path.display()
            )));
        }
        self.models_loaded.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedModel {
            path: spec.path.clone(),
            kind: spec.kind,
        })
    }

    fn new_context(&self, _model: &ScriptedModel, params: &ContextParams) -> Result<ScriptedContext> {
        let n_ctx = self.context_size.unwrap_or(params.n_ctx);
        if n_ctx == 0 {
            return Err(EngineError::Context("context window must be > 0".to_string()));
        }
        self.contexts_created.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedContext {
            n_ctx,
            tokens: Vec::new(),
            cursor: 0,
            logits: None,
        })
    }

    fn context_size(&self, ctx: &ScriptedContext) -> u32 {
        ctx.n_ctx
    }

    fn used_positions(&self, ctx: &ScriptedContext) -> u32 {
        ctx.tokens.len() as u32
    }

    fn tokenize(&self, _model: &ScriptedModel, text: &str, add_bos: bool) -> Result<Vec<TokenId>> {
        self.tokenizer.encode(text, add_bos).map_err(tokenizer_error)
    }

    fn token_to_piece(&self, _model: &ScriptedModel, token: TokenId) -> Result<Vec<u8>> {
        self.tokenizer.token_bytes(token).map_err(tokenizer_error)
    }

    fn decode(&self, _model: &ScriptedModel, ctx: &mut ScriptedContext, batch: &Batch) -> Result<()> {
        let call = self.decode_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_decode_after.is_some_and(|n| call >= n) {
            return Err(EngineError::Decode("injected decode failure".to_string()));
        }
        if batch.is_empty() {
            return Err(EngineError::Decode("empty batch".to_string()));
        }
        if batch.len() == 1 && self.fail_sampled.load(Ordering::SeqCst) {
            return Err(EngineError::Decode("injected sampled-token failure".to_string()));
        }
        if ctx.tokens.len() + batch.len() > ctx.n_ctx as usize {
            return Err(EngineError::Decode("context window exhausted".to_string()));
        }
        if batch.positions().first() != Some(&(ctx.tokens.len() as u32)) {
            return Err(EngineError::Decode("batch positions are not contiguous".to_string()));
        }

        ctx.tokens.extend_from_slice(batch.tokens());
        // A single token matching the script advances it; anything else is a
        // new prompt and restarts the reply.
        match batch.tokens() {
            [token] if self.reply.get(ctx.cursor) == Some(token) => ctx.cursor += 1,
            _ => ctx.cursor = 0,
        }

        if batch.logit_requests() > 0 {
            let next = self
                .reply
                .get(ctx.cursor)
                .copied()
                .unwrap_or(ByteTokenizer::EOS);
            let mut logits = vec![0.0; self.vocab_size()];
            logits[next as usize] = HIGH;
            ctx.logits = Some(logits);
        }
        Ok(())
    }

    fn logits<'a>(&self, ctx: &'a ScriptedContext) -> Option<&'a [f32]> {
        ctx.logits.as_deref()
    }

    fn is_end_of_generation(&self, _model: &ScriptedModel, token: TokenId) -> bool {
        token == ByteTokenizer::EOS
    }

    fn chat_template(&self, _model: &ScriptedModel) -> Option<String> {
        self.template.clone()
    }
}
