//! A loaded checkpoint: model, processor, tokenizer and chat template.

use std::ops::ControlFlow;
use std::sync::Arc;

use candle_core::{Device, Tensor};

use crate::chat::{ChatTemplate, Message};
use crate::config::ArchitectureConfig;
use crate::error::VlmError;
use crate::generation::{
    GeneratedToken, GenerationOutput, GenerationParams, StopReason, TokenStream,
};
use crate::kv_cache::KvCache;
use crate::model::VisionLanguageModel;
use crate::processor::{
    ImageInput, LmInput, MediaKind, MediaSpec, MultimodalProcessor, VideoInput, VisualInput,
};
use crate::rotary::{PositionIds, RopeIndexing};
use crate::tokenizer::TextTokenizer;
use crate::weights::LoadReport;

/// Everything needed to run generation sessions against one checkpoint.
///
/// Cloning is cheap and clones share the read-only model; each session started with
/// [`Context::generate`] owns its own cache, so sessions may run on different threads.
#[derive(Clone)]
pub struct Context {
    model: Arc<dyn VisionLanguageModel>,
    processor: Arc<dyn MultimodalProcessor>,
    tokenizer: Arc<dyn TextTokenizer>,
    chat_template: Option<Arc<ChatTemplate>>,
    report: Arc<LoadReport>,
    end_ids: Vec<u32>,
    prefill_chunk_size: usize,
}

impl Context {
    pub fn new(
        model: Arc<dyn VisionLanguageModel>,
        processor: Arc<dyn MultimodalProcessor>,
        tokenizer: Arc<dyn TextTokenizer>,
        chat_template: Option<Arc<ChatTemplate>>,
        report: LoadReport,
        prefill_chunk_size: usize,
    ) -> Self {
        let mut end_ids = model.config().eos_token_ids.clone();
        end_ids.extend(processor.stop_token_ids());
        end_ids.sort_unstable();
        end_ids.dedup();

        Self {
            model,
            processor,
            tokenizer,
            chat_template,
            report: Arc::new(report),
            end_ids,
            prefill_chunk_size,
        }
    }

    pub fn model(&self) -> &Arc<dyn VisionLanguageModel> {
        &self.model
    }

    pub fn config(&self) -> &ArchitectureConfig {
        self.model.config()
    }

    pub fn processor(&self) -> &Arc<dyn MultimodalProcessor> {
        &self.processor
    }

    pub fn tokenizer(&self) -> &Arc<dyn TextTokenizer> {
        &self.tokenizer
    }

    /// Parameters injected during the load and checkpoint tensors left unused.
    pub fn load_report(&self) -> &LoadReport {
        &self.report
    }

    /// Token ids that end a session as end-of-sequence.
    pub fn end_token_ids(&self) -> &[u32] {
        &self.end_ids
    }

    /// Lower the context window of sessions started from the returned context.
    pub fn with_max_context(mut self, max_context: usize) -> Self {
        self.model = Arc::new(ContextLimit {
            inner: self.model,
            max_context,
        });
        self
    }

    pub fn with_prefill_chunk_size(mut self, chunk_size: usize) -> Self {
        self.prefill_chunk_size = chunk_size;
        self
    }

    /// What the media collaborator must hand over for a `height` x `width` source.
    pub fn media_spec(
        &self,
        kind: MediaKind,
        height: usize,
        width: usize,
    ) -> Result<MediaSpec, VlmError> {
        self.processor.media_spec(kind, height, width)
    }

    /// Render chat messages with the checkpoint's template.
    pub fn apply_chat_template(
        &self,
        messages: &[Message],
        add_generation_prompt: bool,
    ) -> Result<String, VlmError> {
        let template = self.chat_template.as_ref().ok_or_else(|| {
            VlmError::InvalidConfiguration("checkpoint has no chat template".to_string())
        })?;
        template.apply(messages, add_generation_prompt)
    }

    pub fn process(
        &self,
        prompt: &str,
        images: &[ImageInput],
        videos: &[VideoInput],
    ) -> Result<LmInput, VlmError> {
        self.processor.process(prompt, images, videos)
    }

    /// Start a session. Fails before any forward pass if `input` cannot fit the context.
    pub fn generate(
        &self,
        input: LmInput,
        params: GenerationParams,
    ) -> Result<TokenStream, VlmError> {
        TokenStream::new(
            Arc::clone(&self.model),
            Arc::clone(&self.tokenizer),
            input,
            params,
            self.end_ids.clone(),
            self.prefill_chunk_size,
        )
    }

    /// Run a session, handing every token to `on_token` until it breaks or a stop
    /// condition is hit.
    pub fn generate_with<F>(
        &self,
        input: LmInput,
        params: GenerationParams,
        mut on_token: F,
    ) -> Result<GenerationOutput, VlmError>
    where
        F: FnMut(&GeneratedToken) -> ControlFlow<()>,
    {
        let mut stream = self.generate(input, params)?;
        // `stop` needs the stream back, so no `for` loop here
        while let Some(token) = stream.next() {
            if on_token(&token?).is_break() {
                stream.stop(StopReason::Callback);
                break;
            }
        }
        Ok(stream.into_output())
    }

    pub fn generate_text(
        &self,
        input: LmInput,
        params: GenerationParams,
    ) -> Result<GenerationOutput, VlmError> {
        self.generate(input, params)?.collect_output()
    }
}

/// Delegates to `inner` with a shorter context window.
struct ContextLimit {
    inner: Arc<dyn VisionLanguageModel>,
    max_context: usize,
}

impl VisionLanguageModel for ContextLimit {
    fn config(&self) -> &ArchitectureConfig {
        self.inner.config()
    }

    fn device(&self) -> &Device {
        self.inner.device()
    }

    fn num_layers(&self) -> usize {
        self.inner.num_layers()
    }

    fn max_context(&self) -> usize {
        self.max_context.min(self.inner.max_context())
    }

    fn rope_indexing(&self) -> &RopeIndexing {
        self.inner.rope_indexing()
    }

    fn placeholder_ids(&self) -> Vec<u32> {
        self.inner.placeholder_ids()
    }

    fn embed_tokens(&self, ids: &[u32]) -> Result<Tensor, VlmError> {
        self.inner.embed_tokens(ids)
    }

    fn encode_visual(&self, visual: &VisualInput) -> Result<Tensor, VlmError> {
        self.inner.encode_visual(visual)
    }

    fn forward(
        &self,
        embeds: &Tensor,
        positions: &PositionIds,
        cache: &mut KvCache,
    ) -> Result<Tensor, VlmError> {
        self.inner.forward(embeds, positions, cache)
    }

    fn new_cache(&self) -> KvCache {
        self.inner.new_cache()
    }
}
