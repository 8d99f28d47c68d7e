//! Typed views over a checkpoint's `config.json` and `preprocessor_config.json`.
//!
//! Checkpoint families disagree on key names (`embed_dim` vs `hidden_size`, `depth` vs
//! `num_hidden_layers`, flat vs nested text config), so every file is first decoded into a
//! permissive raw record and then resolved into the strict structures below.

use std::path::Path;

use serde::Deserialize;

use crate::error::VlmError;
use crate::layers::Activation;

/// Language stack hyper-parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TextConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub head_dim: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f64,
    pub max_position_embeddings: usize,
    pub tie_word_embeddings: bool,
}

/// Vision tower hyper-parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct VisionConfig {
    /// Width of the vision transformer blocks.
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub num_channels: usize,
    pub image_size: usize,
    pub patch_size: usize,
    pub layer_norm_eps: f64,
    pub hidden_act: Activation,
    /// Width of the features handed to the language stack after merging.
    pub out_hidden_size: usize,
    pub spatial_merge_size: usize,
    pub temporal_patch_size: usize,
    /// Attention window edge in pixels, 0 when every block attends globally.
    pub window_size: usize,
    pub fullatt_block_indexes: Vec<usize>,
    pub tokens_per_second: Option<f64>,
}

/// Immutable description of a checkpoint's network, decoded once at load time.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchitectureConfig {
    /// First entry of `architectures`, used as the registry key.
    pub architecture: String,
    pub model_type: Option<String>,
    pub text: TextConfig,
    pub vision: VisionConfig,
    pub image_token_id: u32,
    pub video_token_id: Option<u32>,
    pub vision_start_token_id: Option<u32>,
    pub eos_token_ids: Vec<u32>,
    /// Pixel-shuffle factor of the connector.
    pub scale_factor: usize,
    /// Multimodal rotary sections (temporal, height, width), in rotary half-dims.
    pub mrope_section: Option<Vec<usize>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRopeScaling {
    #[serde(default)]
    mrope_section: Option<Vec<usize>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTokenIds {
    One(u32),
    Many(Vec<u32>),
}

impl RawTokenIds {
    fn into_vec(self) -> Vec<u32> {
        match self {
            RawTokenIds::One(id) => vec![id],
            RawTokenIds::Many(ids) => ids,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawTextConfig {
    vocab_size: Option<usize>,
    hidden_size: Option<usize>,
    intermediate_size: Option<usize>,
    num_hidden_layers: Option<usize>,
    num_attention_heads: Option<usize>,
    num_key_value_heads: Option<usize>,
    head_dim: Option<usize>,
    rms_norm_eps: Option<f64>,
    rope_theta: Option<f64>,
    max_position_embeddings: Option<usize>,
    tie_word_embeddings: Option<bool>,
    rope_scaling: Option<RawRopeScaling>,
    eos_token_id: Option<RawTokenIds>,
}

#[derive(Debug, Default, Deserialize)]
struct RawVisionConfig {
    hidden_size: Option<usize>,
    embed_dim: Option<usize>,
    intermediate_size: Option<usize>,
    mlp_ratio: Option<f64>,
    num_hidden_layers: Option<usize>,
    depth: Option<usize>,
    num_attention_heads: Option<usize>,
    num_heads: Option<usize>,
    num_channels: Option<usize>,
    in_chans: Option<usize>,
    in_channels: Option<usize>,
    image_size: Option<usize>,
    patch_size: Option<usize>,
    layer_norm_eps: Option<f64>,
    hidden_act: Option<Activation>,
    out_hidden_size: Option<usize>,
    spatial_merge_size: Option<usize>,
    temporal_patch_size: Option<usize>,
    window_size: Option<usize>,
    #[serde(default)]
    fullatt_block_indexes: Vec<usize>,
    tokens_per_second: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawArchitectureConfig {
    #[serde(default)]
    architectures: Vec<String>,
    model_type: Option<String>,
    text_config: Option<RawTextConfig>,
    vision_config: Option<RawVisionConfig>,
    image_token_id: Option<u32>,
    image_token_index: Option<u32>,
    video_token_id: Option<u32>,
    vision_start_token_id: Option<u32>,
    scale_factor: Option<usize>,
    #[serde(flatten)]
    flat_text: RawTextConfig,
}

fn required<T>(value: Option<T>, key: &str) -> Result<T, VlmError> {
    value.ok_or_else(|| VlmError::InvalidConfiguration(format!("missing `{key}`")))
}

impl ArchitectureConfig {
    /// Decode `config.json` from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, VlmError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            VlmError::InvalidConfiguration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&data)
    }

    pub fn from_json_str(data: &str) -> Result<Self, VlmError> {
        let raw: RawArchitectureConfig = serde_json::from_str(data)
            .map_err(|e| VlmError::InvalidConfiguration(e.to_string()))?;

        let architecture = raw
            .architectures
            .first()
            .cloned()
            .ok_or_else(|| VlmError::InvalidConfiguration("missing `architectures`".into()))?;

        // nested text config wins, flat keys fill the gaps
        let nested = raw.text_config.unwrap_or_default();
        let flat = raw.flat_text;

        let hidden_size = required(nested.hidden_size.or(flat.hidden_size), "hidden_size")?;
        let num_attention_heads = required(
            nested.num_attention_heads.or(flat.num_attention_heads),
            "num_attention_heads",
        )?;
        if num_attention_heads == 0 {
            return Err(VlmError::InvalidConfiguration(
                "`num_attention_heads` must be positive".into(),
            ));
        }

        let head_dim = match nested.head_dim.or(flat.head_dim) {
            Some(head_dim) => head_dim,
            None if hidden_size % num_attention_heads != 0 => {
                return Err(VlmError::InvalidConfiguration(format!(
                    "`hidden_size` ({hidden_size}) is not a multiple of `num_attention_heads` \
                     ({num_attention_heads}) and no `head_dim` is given"
                )));
            }
            None => hidden_size / num_attention_heads,
        };

        let text = TextConfig {
            vocab_size: required(nested.vocab_size.or(flat.vocab_size), "vocab_size")?,
            hidden_size,
            intermediate_size: required(
                nested.intermediate_size.or(flat.intermediate_size),
                "intermediate_size",
            )?,
            num_hidden_layers: required(
                nested.num_hidden_layers.or(flat.num_hidden_layers),
                "num_hidden_layers",
            )?,
            num_attention_heads,
            num_key_value_heads: nested
                .num_key_value_heads
                .or(flat.num_key_value_heads)
                .unwrap_or(num_attention_heads),
            head_dim,
            rms_norm_eps: nested.rms_norm_eps.or(flat.rms_norm_eps).unwrap_or(1e-6),
            rope_theta: nested.rope_theta.or(flat.rope_theta).unwrap_or(10_000.0),
            max_position_embeddings: nested
                .max_position_embeddings
                .or(flat.max_position_embeddings)
                .unwrap_or(4096),
            tie_word_embeddings: flat
                .tie_word_embeddings
                .or(nested.tie_word_embeddings)
                .unwrap_or(false),
        };

        let mrope_section = nested
            .rope_scaling
            .and_then(|r| r.mrope_section)
            .or_else(|| flat.rope_scaling.and_then(|r| r.mrope_section));

        let eos_token_ids = flat
            .eos_token_id
            .or(nested.eos_token_id)
            .map(RawTokenIds::into_vec)
            .unwrap_or_default();

        let rv = raw.vision_config.ok_or_else(|| {
            VlmError::InvalidConfiguration("missing `vision_config`".into())
        })?;
        let vision = resolve_vision(rv, text.hidden_size)?;

        let config = Self {
            architecture,
            model_type: raw.model_type,
            text,
            vision,
            image_token_id: required(
                raw.image_token_id.or(raw.image_token_index),
                "image_token_id",
            )?,
            video_token_id: raw.video_token_id,
            vision_start_token_id: raw.vision_start_token_id,
            eos_token_ids,
            scale_factor: raw.scale_factor.unwrap_or(1),
            mrope_section,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), VlmError> {
        let invalid = |msg: String| Err(VlmError::InvalidConfiguration(msg));
        let t = &self.text;
        let v = &self.vision;

        for (key, value) in [
            ("vocab_size", t.vocab_size),
            ("hidden_size", t.hidden_size),
            ("intermediate_size", t.intermediate_size),
            ("num_hidden_layers", t.num_hidden_layers),
            ("num_key_value_heads", t.num_key_value_heads),
            ("head_dim", t.head_dim),
            ("max_position_embeddings", t.max_position_embeddings),
            ("vision_config.hidden_size", v.hidden_size),
            ("vision_config.num_hidden_layers", v.num_hidden_layers),
            ("vision_config.num_attention_heads", v.num_attention_heads),
            ("vision_config.patch_size", v.patch_size),
            ("vision_config.spatial_merge_size", v.spatial_merge_size),
            ("scale_factor", self.scale_factor),
        ] {
            if value == 0 {
                return invalid(format!("`{key}` must be positive"));
            }
        }

        if t.num_attention_heads % t.num_key_value_heads != 0 {
            return invalid(format!(
                "`num_attention_heads` ({}) is not a multiple of `num_key_value_heads` ({})",
                t.num_attention_heads, t.num_key_value_heads
            ));
        }
        if t.head_dim % 2 != 0 {
            return invalid(format!("`head_dim` ({}) must be even", t.head_dim));
        }
        if v.hidden_size % v.num_attention_heads != 0 {
            return invalid(format!(
                "vision `hidden_size` ({}) is not a multiple of its head count ({})",
                v.hidden_size, v.num_attention_heads
            ));
        }
        if let Some(sections) = &self.mrope_section {
            let total: usize = sections.iter().sum();
            if sections.len() != 3 || total != t.head_dim / 2 {
                return invalid(format!(
                    "`mrope_section` {sections:?} must have three entries summing to {}",
                    t.head_dim / 2
                ));
            }
        }
        if let Some(&idx) = v
            .fullatt_block_indexes
            .iter()
            .find(|&&i| i >= v.num_hidden_layers)
        {
            return invalid(format!(
                "`fullatt_block_indexes` entry {idx} exceeds the vision depth {}",
                v.num_hidden_layers
            ));
        }
        Ok(())
    }
}

fn resolve_vision(rv: RawVisionConfig, text_hidden: usize) -> Result<VisionConfig, VlmError> {
    // `embed_dim` marks checkpoints whose `hidden_size` is the merger output width
    let hidden_size = required(rv.embed_dim.or(rv.hidden_size), "vision_config.hidden_size")?;
    let out_hidden_size = rv
        .out_hidden_size
        .or(rv.embed_dim.and(rv.hidden_size))
        .unwrap_or(text_hidden);
    let intermediate_size = match (rv.intermediate_size, rv.mlp_ratio) {
        (Some(size), _) => size,
        (None, Some(ratio)) => (hidden_size as f64 * ratio) as usize,
        (None, None) => 4 * hidden_size,
    };
    let patch_size = required(rv.patch_size, "vision_config.patch_size")?;

    Ok(VisionConfig {
        hidden_size,
        intermediate_size,
        num_hidden_layers: required(
            rv.num_hidden_layers.or(rv.depth),
            "vision_config.num_hidden_layers",
        )?,
        num_attention_heads: required(
            rv.num_attention_heads.or(rv.num_heads),
            "vision_config.num_attention_heads",
        )?,
        num_channels: rv
            .num_channels
            .or(rv.in_channels)
            .or(rv.in_chans)
            .unwrap_or(3),
        image_size: rv.image_size.unwrap_or(patch_size),
        patch_size,
        layer_norm_eps: rv.layer_norm_eps.unwrap_or(1e-6),
        hidden_act: rv.hidden_act.unwrap_or(Activation::GeluPytorchTanh),
        out_hidden_size,
        spatial_merge_size: rv.spatial_merge_size.unwrap_or(1),
        temporal_patch_size: rv.temporal_patch_size.unwrap_or(1),
        window_size: rv.window_size.unwrap_or(0),
        fullatt_block_indexes: rv.fullatt_block_indexes,
        tokens_per_second: rv.tokens_per_second,
    })
}

/// How the external media collaborator must size an image before handing it over.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionPolicy {
    /// Scale the longest edge to `longest_edge`, round both edges up to whole tiles of
    /// `tile_edge` pixels and supply a `tile_edge` square global view alongside.
    Tiled {
        tile_edge: usize,
        longest_edge: usize,
    },
    /// Keep the aspect ratio, snap both edges to multiples of `factor` and keep the pixel
    /// count within `[min_pixels, max_pixels]`.
    PixelBudget {
        min_pixels: usize,
        max_pixels: usize,
        factor: usize,
    },
}

/// Immutable processor metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorConfig {
    pub processor_class: Option<String>,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
    pub rescale_factor: f32,
    pub resolution: ResolutionPolicy,
    pub patch_size: usize,
    pub temporal_patch_size: usize,
    pub merge_size: usize,
    /// Placeholder tokens per tile, for processors that use a fixed count.
    pub image_seq_len: usize,
    pub max_frames: usize,
}

#[derive(Debug, Default, Deserialize)]
struct RawEdge {
    longest_edge: Option<usize>,
    shortest_edge: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawVideoSampling {
    max_frames: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct RawProcessorConfig {
    processor_class: Option<String>,
    image_mean: Option<[f32; 3]>,
    image_std: Option<[f32; 3]>,
    rescale_factor: Option<f32>,
    size: Option<RawEdge>,
    max_image_size: Option<RawEdge>,
    min_pixels: Option<usize>,
    max_pixels: Option<usize>,
    patch_size: Option<usize>,
    temporal_patch_size: Option<usize>,
    merge_size: Option<usize>,
    image_seq_len: Option<usize>,
    video_sampling: Option<RawVideoSampling>,
}

impl ProcessorConfig {
    /// Resolve processor metadata from the optional `preprocessor_config.json` and
    /// `processor_config.json` contents, falling back to values implied by `arch`.
    pub fn from_json_strs(
        preprocessor: Option<&str>,
        processor: Option<&str>,
        arch: &ArchitectureConfig,
    ) -> Result<Self, VlmError> {
        let parse = |data: &str| {
            serde_json::from_str::<RawProcessorConfig>(data)
                .map_err(|e| VlmError::InvalidConfiguration(format!("processor config: {e}")))
        };
        let pre = preprocessor.map(parse).transpose()?.unwrap_or_default();
        let post = processor.map(parse).transpose()?.unwrap_or_default();

        let vision = &arch.vision;
        let patch_size = pre.patch_size.unwrap_or(vision.patch_size);
        let merge_size = pre.merge_size.unwrap_or(vision.spatial_merge_size);

        let budget = match (pre.min_pixels, pre.max_pixels) {
            (Some(min), Some(max)) => Some((min, max)),
            _ if merge_size > 1 => {
                // newer pixel-budget processors store the budget under `size`
                let size = pre.size.as_ref();
                Some((
                    size.and_then(|s| s.shortest_edge).unwrap_or(56 * 56),
                    size.and_then(|s| s.longest_edge)
                        .unwrap_or(28 * 28 * 1280),
                ))
            }
            _ => None,
        };

        let resolution = match budget {
            Some((min_pixels, max_pixels)) => ResolutionPolicy::PixelBudget {
                min_pixels,
                max_pixels,
                factor: patch_size * merge_size,
            },
            None => {
                let tile_edge = pre
                    .max_image_size
                    .as_ref()
                    .and_then(|e| e.longest_edge)
                    .unwrap_or(vision.image_size);
                ResolutionPolicy::Tiled {
                    tile_edge,
                    longest_edge: pre
                        .size
                        .as_ref()
                        .and_then(|e| e.longest_edge)
                        .unwrap_or(4 * tile_edge),
                }
            }
        };

        let tokens_per_tile = {
            let side = vision.image_size / vision.patch_size.max(1);
            side * side / (arch.scale_factor * arch.scale_factor).max(1)
        };

        let config = Self {
            processor_class: post.processor_class.or(pre.processor_class),
            image_mean: pre.image_mean.unwrap_or([0.5; 3]),
            image_std: pre.image_std.unwrap_or([0.5; 3]),
            rescale_factor: pre.rescale_factor.unwrap_or(1.0 / 255.0),
            resolution,
            patch_size,
            temporal_patch_size: pre
                .temporal_patch_size
                .unwrap_or(vision.temporal_patch_size),
            merge_size,
            image_seq_len: post
                .image_seq_len
                .or(pre.image_seq_len)
                .unwrap_or(tokens_per_tile),
            max_frames: pre
                .video_sampling
                .and_then(|v| v.max_frames)
                .unwrap_or(64),
        };

        if let ResolutionPolicy::Tiled { tile_edge, .. } = config.resolution {
            if tile_edge == 0 {
                return Err(VlmError::InvalidConfiguration(
                    "`max_image_size.longest_edge` must be positive".into(),
                ));
            }
        }
        if config.image_std.iter().any(|&s| s == 0.0) {
            return Err(VlmError::InvalidConfiguration(
                "`image_std` entries must be non-zero".into(),
            ));
        }
        Ok(config)
    }
}
