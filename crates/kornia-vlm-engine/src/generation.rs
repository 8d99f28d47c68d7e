//! Autoregressive generation: prefill the prompt, then decode one token at a time until
//! a stop condition fires.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;

use crate::error::VlmError;
use crate::fusion::embed_prompt;
use crate::kv_cache::KvCache;
use crate::model::VisionLanguageModel;
use crate::processor::LmInput;
use crate::sampling::Sampler;
use crate::tokenizer::{IncrementalDecoder, TextTokenizer};

/// Caller predicate over the text generated so far; returning `true` stops the session.
pub type StopPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Knobs of a single generation session.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub max_tokens: usize,
    /// Values at or below zero select the arg-max token.
    pub temperature: f64,
    /// Values at or below zero select the arg-max token.
    pub top_p: f64,
    pub stop_strings: Vec<String>,
    pub stop_token_ids: Vec<u32>,
    pub seed: u64,
    pub repeat_penalty: f32,
    pub repeat_last_n: usize,
    /// Prompt tokens per prefill forward pass; `Some(0)` disables chunking and `None`
    /// defers to the context default.
    pub prefill_chunk_size: Option<usize>,
    #[serde(skip)]
    pub stop_predicate: Option<StopPredicate>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: 0.0,
            top_p: 1.0,
            stop_strings: Vec::new(),
            stop_token_ids: Vec::new(),
            seed: 299792458,
            repeat_penalty: 1.0,
            repeat_last_n: 64,
            prefill_chunk_size: None,
            stop_predicate: None,
        }
    }
}

impl fmt::Debug for GenerationParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationParams")
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("top_p", &self.top_p)
            .field("stop_strings", &self.stop_strings)
            .field("stop_token_ids", &self.stop_token_ids)
            .field("seed", &self.seed)
            .field("repeat_penalty", &self.repeat_penalty)
            .field("repeat_last_n", &self.repeat_last_n)
            .field("prefill_chunk_size", &self.prefill_chunk_size)
            .field("stop_predicate", &self.stop_predicate.is_some())
            .finish()
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndOfSequence,
    MaxTokens,
    StopString(String),
    StopToken(u32),
    Predicate,
    Callback,
}

/// One sampled token and the text it added.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedToken {
    pub id: u32,
    /// Text delta. Text that may still start a stop string is held back and arrives
    /// with a later token; the deltas of a finished stream add up to its output text.
    pub text: String,
    /// Zero-based decode step.
    pub step: usize,
}

/// Collected result of a finished session.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    pub text: String,
    pub tokens: Vec<u32>,
    pub stop_reason: StopReason,
    pub prompt_tokens: usize,
}

enum Phase {
    Prefill(LmInput),
    Decode { last: u32 },
    Stopped,
}

/// A generation session yielding one token per decode step.
///
/// The stream is lazy: nothing runs until the first call to `next`. It ends after the
/// token that triggered a stop condition, or after the first error. Dropping it abandons
/// the session and frees its cache.
pub struct TokenStream {
    model: Arc<dyn VisionLanguageModel>,
    params: GenerationParams,
    end_ids: Vec<u32>,
    sampler: Sampler,
    cache: KvCache,
    phase: Phase,
    chunk_size: usize,
    next_position: u32,
    prompt_tokens: usize,
    history: Vec<u32>,
    generated: Vec<u32>,
    decoder: IncrementalDecoder,
    text: String,
    /// Bytes of `text` already yielded as deltas.
    emitted: usize,
    stop_reason: Option<StopReason>,
    started: Option<Instant>,
}

impl TokenStream {
    /// Validate `input` against the model's context window and set up a session.
    ///
    /// `end_ids` are the token ids that end the turn (the checkpoint's end-of-sequence ids
    /// and the processor's stop tokens). `chunk_size` applies when `params` does not set one.
    pub fn new(
        model: Arc<dyn VisionLanguageModel>,
        tokenizer: Arc<dyn TextTokenizer>,
        input: LmInput,
        params: GenerationParams,
        end_ids: Vec<u32>,
        chunk_size: usize,
    ) -> Result<Self, VlmError> {
        let maximum = model.max_context();
        if input.len() > maximum {
            return Err(VlmError::ContextLengthExceeded {
                requested: input.len(),
                maximum,
            });
        }
        if input.is_empty() {
            return Err(VlmError::TokenizationFailure("prompt has no tokens".to_string()));
        }

        let sampler = Sampler::new(
            params.seed,
            params.temperature,
            params.top_p,
            params.repeat_penalty,
            params.repeat_last_n,
        );
        let chunk_size = params.prefill_chunk_size.unwrap_or(chunk_size);
        let prompt_tokens = input.len();
        let history = input.token_ids.clone();
        let (phase, stop_reason) = if params.max_tokens == 0 {
            (Phase::Stopped, Some(StopReason::MaxTokens))
        } else {
            (Phase::Prefill(input), None)
        };

        Ok(Self {
            cache: model.new_cache(),
            model,
            params,
            end_ids,
            sampler,
            phase,
            chunk_size,
            next_position: 0,
            prompt_tokens,
            history,
            generated: Vec::new(),
            decoder: IncrementalDecoder::new(tokenizer),
            text: String::new(),
            emitted: 0,
            stop_reason,
            started: None,
        })
    }

    /// Why the session ended, once it has.
    pub fn stop_reason(&self) -> Option<&StopReason> {
        self.stop_reason.as_ref()
    }

    /// Text generated so far, cut before any matched stop string.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn tokens(&self) -> &[u32] {
        &self.generated
    }

    /// Tokens currently held in the session's cache: the prompt plus every sampled
    /// token except the latest.
    pub fn cached_tokens(&self) -> usize {
        self.cache.tokens_processed()
    }

    pub fn prompt_tokens(&self) -> usize {
        self.prompt_tokens
    }

    /// End the session early, releasing its cache. Text held back for a possible stop
    /// string is dropped.
    pub fn stop(&mut self, reason: StopReason) {
        if self.stop_reason.is_none() {
            self.stop_reason = Some(reason);
            self.text.truncate(self.emitted);
        }
        self.phase = Phase::Stopped;
        self.cache.reset();
    }

    /// Drain the stream and collect the result.
    pub fn collect_output(mut self) -> Result<GenerationOutput, VlmError> {
        for token in self.by_ref() {
            token?;
        }
        Ok(self.into_output())
    }

    pub(crate) fn into_output(self) -> GenerationOutput {
        GenerationOutput {
            text: self.text,
            tokens: self.generated,
            stop_reason: self.stop_reason.unwrap_or(StopReason::MaxTokens),
            prompt_tokens: self.prompt_tokens,
        }
    }

    fn prefill(&mut self, input: &LmInput) -> Result<candle_core::Tensor, VlmError> {
        let model = self.model.as_ref();
        let embeds = embed_prompt(model, input)?;
        let grids: Vec<_> = input.visuals.iter().map(|v| v.grid).collect();
        let (positions, next_position) = model.rope_indexing().prompt_positions(
            &input.token_ids,
            &model.placeholder_ids(),
            &grids,
            0,
        )?;

        let len = input.len();
        let chunk = if self.chunk_size == 0 { len } else { self.chunk_size };
        let mut logits = None;
        let mut start = 0;
        while start < len {
            let n = chunk.min(len - start);
            log::debug!("prefill tokens {start}..{}", start + n);
            logits = Some(model.forward(
                &embeds.narrow(0, start, n)?,
                &positions.slice(start, n),
                &mut self.cache,
            )?);
            start += n;
        }
        self.next_position = next_position;
        logits.ok_or_else(|| VlmError::inference("prefill produced no logits"))
    }

    fn decode(&mut self, last: u32) -> Result<candle_core::Tensor, VlmError> {
        let maximum = self.model.max_context();
        let requested = self.cache.tokens_processed() + 1;
        if requested > maximum {
            return Err(VlmError::ContextLengthExceeded { requested, maximum });
        }

        let embeds = self.model.embed_tokens(&[last])?;
        let positions = self.model.rope_indexing().decode_positions(self.next_position);
        self.next_position += 1;
        self.model.forward(&embeds, &positions, &mut self.cache)
    }

    fn step(&mut self) -> Result<Option<GeneratedToken>, VlmError> {
        let logits = match std::mem::replace(&mut self.phase, Phase::Stopped) {
            Phase::Stopped => return Ok(None),
            Phase::Prefill(input) => {
                self.started = Some(Instant::now());
                self.prefill(&input)?
            }
            Phase::Decode { last } => self.decode(last)?,
        };

        let id = self.sampler.sample(&logits, &self.history)?;
        let step = self.generated.len();
        self.generated.push(id);
        self.history.push(id);
        log::debug!("step {step}: token {id}");

        if self.end_ids.contains(&id) {
            self.stop_reason = Some(StopReason::EndOfSequence);
        } else if self.params.stop_token_ids.contains(&id) {
            self.stop_reason = Some(StopReason::StopToken(id));
        } else if let Some(piece) = self.decoder.next_token(id)? {
            self.append_text(&piece);
        }

        if self.stop_reason.is_none() && self.generated.len() >= self.params.max_tokens {
            self.stop_reason = Some(StopReason::MaxTokens);
        }

        if self.stop_reason.is_some() {
            self.finish()?;
        } else {
            self.phase = Phase::Decode { last: id };
        }
        let text = self.release_text();
        Ok(Some(GeneratedToken { id, text, step }))
    }

    /// Append decoded text, applying stop strings and the stop predicate. A matched stop
    /// string is cut from the accumulated text.
    fn append_text(&mut self, piece: &str) {
        self.text.push_str(piece);

        let matched = self
            .params
            .stop_strings
            .iter()
            .filter(|s| !s.is_empty())
            .filter_map(|s| self.text.find(s.as_str()).map(|at| (at, s)))
            .min_by_key(|(at, _)| *at);
        if let Some((at, stop)) = matched {
            let stop = stop.clone();
            self.text.truncate(at);
            self.stop_reason.get_or_insert(StopReason::StopString(stop));
            return;
        }

        if let Some(predicate) = &self.params.stop_predicate {
            if predicate(&self.text) {
                self.stop_reason.get_or_insert(StopReason::Predicate);
            }
        }
    }

    /// Length of the longest tail of `text` that could still grow into a stop string.
    fn stop_prefix_len(&self) -> usize {
        self.params
            .stop_strings
            .iter()
            .filter_map(|stop| {
                (1..stop.len())
                    .rev()
                    .filter(|&n| stop.is_char_boundary(n))
                    .find(|&n| self.text.ends_with(&stop[..n]))
            })
            .max()
            .unwrap_or(0)
    }

    /// Text not yet yielded, minus any tail that may turn out to start a stop string
    /// while the session is still running.
    fn release_text(&mut self) -> String {
        let end = match self.stop_reason {
            Some(_) => self.text.len(),
            None => self.text.len() - self.stop_prefix_len(),
        };
        let delta = self
            .text
            .get(self.emitted..end)
            .unwrap_or_default()
            .to_string();
        self.emitted = self.emitted.max(end);
        delta
    }

    /// Mark the session stopped, decoding any bytes the decoder still holds unless a
    /// stop string already cut the text.
    fn finish(&mut self) -> Result<(), VlmError> {
        self.phase = Phase::Stopped;
        if !matches!(self.stop_reason, Some(StopReason::StopString(_))) {
            if let Some(rest) = self.decoder.flush()? {
                self.append_text(&rest);
            }
        }
        if let Some(started) = self.started {
            let secs = started.elapsed().as_secs_f64();
            log::debug!(
                "generated {} tokens in {secs:.2}s ({:.2} tokens/s), stop: {:?}",
                self.generated.len(),
                self.generated.len() as f64 / secs.max(f64::EPSILON),
                self.stop_reason
            );
        }
        Ok(())
    }
}

impl Iterator for TokenStream {
    type Item = Result<GeneratedToken, VlmError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(token) => token.map(Ok),
            Err(e) => {
                self.phase = Phase::Stopped;
                self.cache.reset();
                Some(Err(e))
            }
        }
    }
}
