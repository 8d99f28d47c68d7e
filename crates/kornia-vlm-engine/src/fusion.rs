use candle_core::Tensor;

use crate::error::VlmError;
use crate::model::VisionLanguageModel;
use crate::processor::LmInput;

/// Substitute visual feature rows for placeholder token embeddings.
///
/// `embeds` is `(seq, hidden)` and `features` is `(placeholders, hidden)`, ordered as
/// the placeholders appear in `token_ids`.
pub fn merge_visual_features(
    embeds: &Tensor,
    token_ids: &[u32],
    placeholder_ids: &[u32],
    features: Option<&Tensor>,
) -> Result<Tensor, VlmError> {
    let mask: Vec<u8> = token_ids
        .iter()
        .map(|id| u8::from(placeholder_ids.contains(id)))
        .collect();
    let placeholders = mask.iter().filter(|&&m| m == 1).count();
    let available = match features {
        Some(f) => f.dim(0)?,
        None => 0,
    };

    if placeholders != available {
        return Err(VlmError::VisualTokenCountMismatch {
            placeholders,
            features: available,
        });
    }
    let features = match features {
        Some(f) if placeholders > 0 => f,
        _ => return Ok(embeds.clone()),
    };

    let (seq_len, hidden_size) = embeds.dims2()?;
    let device = embeds.device();

    // feature row for every position, clamped where the mask is off
    let last = placeholders as u32 - 1;
    let mut seen = 0u32;
    let indices: Vec<u32> = mask
        .iter()
        .map(|&m| {
            let idx = seen.min(last);
            seen += u32::from(m);
            idx
        })
        .collect();

    let indices = Tensor::new(indices.as_slice(), device)?;
    let gathered = features
        .to_dtype(embeds.dtype())?
        .index_select(&indices, 0)?;

    let merged = Tensor::new(mask.as_slice(), device)?
        .unsqueeze(1)?
        .expand((seq_len, hidden_size))?
        .where_cond(&gathered, embeds)?;
    Ok(merged)
}

/// Embed a processed prompt, running every visual item through the model's vision path.
pub fn embed_prompt(model: &dyn VisionLanguageModel, input: &LmInput) -> Result<Tensor, VlmError> {
    let embeds = model.embed_tokens(&input.token_ids)?;

    let mut features = Vec::with_capacity(input.visuals.len());
    for visual in &input.visuals {
        features.push(model.encode_visual(visual)?);
    }
    let features = if features.is_empty() {
        None
    } else {
        Some(Tensor::cat(&features, 0)?.to_dtype(embeds.dtype())?)
    };

    merge_visual_features(
        &embeds,
        &input.token_ids,
        &model.placeholder_ids(),
        features.as_ref(),
    )
}
