use candle_core::{DType, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};

use crate::error::VlmError;

/// Index of the largest value, preferring the lowest index on ties.
pub fn argmax(logits: &[f32]) -> Option<u32> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in logits.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i as u32)
}

/// Sampling strategy for the given knobs. Non-positive (or NaN) temperature or top-p
/// selects the arg-max token.
pub fn sampling_for(temperature: f64, top_p: f64) -> Sampling {
    let positive = |v: f64| v > 0.0;
    if !positive(temperature) || !positive(top_p) {
        Sampling::ArgMax
    } else if top_p >= 1.0 {
        Sampling::All { temperature }
    } else {
        Sampling::TopP {
            p: top_p,
            temperature,
        }
    }
}

/// Turns next-token logits into a token id.
pub struct Sampler {
    logits_processor: Option<LogitsProcessor>,
    repeat_penalty: f32,
    repeat_last_n: usize,
}

impl Sampler {
    pub fn new(
        seed: u64,
        temperature: f64,
        top_p: f64,
        repeat_penalty: f32,
        repeat_last_n: usize,
    ) -> Self {
        let logits_processor = match sampling_for(temperature, top_p) {
            Sampling::ArgMax => None,
            sampling => Some(LogitsProcessor::from_sampling(seed, sampling)),
        };
        Self {
            logits_processor,
            repeat_penalty,
            repeat_last_n,
        }
    }

    pub fn is_deterministic(&self) -> bool {
        self.logits_processor.is_none()
    }

    /// Pick the next token from 1-D `logits`, penalising the tail of `history`.
    pub fn sample(&mut self, logits: &Tensor, history: &[u32]) -> Result<u32, VlmError> {
        let logits = logits.to_dtype(DType::F32)?;
        let values = logits.to_vec1::<f32>()?;
        if let Some(i) = values.iter().position(|v| !v.is_finite()) {
            return Err(VlmError::inference(format!(
                "logit {i} is {} out of {} values",
                values[i],
                values.len()
            )));
        }

        let logits = if self.repeat_penalty != 1.0 && !history.is_empty() {
            let start = history.len().saturating_sub(self.repeat_last_n);
            candle_transformers::utils::apply_repeat_penalty(
                &logits,
                self.repeat_penalty,
                &history[start..],
            )?
        } else {
            logits
        };

        match &mut self.logits_processor {
            Some(processor) => Ok(processor.sample(&logits)?),
            None => argmax(&logits.to_vec1::<f32>()?)
                .ok_or_else(|| VlmError::inference("empty logit vector")),
        }
    }
}
