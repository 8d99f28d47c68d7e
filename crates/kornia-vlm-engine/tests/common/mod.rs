#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use kornia_vlm_engine::kv_cache::KvCache;
use kornia_vlm_engine::processor::VisualInput;
use kornia_vlm_engine::rotary::{PositionIds, RopeIndexing};
use kornia_vlm_engine::weights::LoadReport;
use kornia_vlm_engine::{
    ArchitectureConfig, Context, MediaKind, MediaSpec, MultimodalProcessor, TextTokenizer,
    VisionLanguageModel, VlmError,
};
use serde_json::json;

/// Word-level vocabulary of the tiny checkpoints; a token's id is its index.
pub const VOCAB: &[&str] = &[
    "<unk>",
    "<end_of_utterance>",
    "<image>",
    "<fake_token_around_image>",
    "<global-img>",
    "User:",
    "Assistant:",
    "hello",
    "world",
    "the",
    "cat",
    "sat",
    "on",
    "a",
    "mat",
    ".",
];

pub const END_OF_UTTERANCE: u32 = 1;
pub const IMAGE_TOKEN: u32 = 2;
pub const EOS_TOKEN: u32 = 15;

pub const CHAT_TEMPLATE: &str = "{% for m in messages %}{{ m.role | capitalize }}:\
    {% for line in m.content %}{% if line.type == 'text' %} {{ line.text }}\
    {% elif line.type == 'image' %} <image>{% endif %}{% endfor %} <end_of_utterance> \
    {% endfor %}{% if add_generation_prompt %}Assistant:{% endif %}";

pub fn idefics3_config() -> serde_json::Value {
    json!({
        "architectures": ["Idefics3ForConditionalGeneration"],
        "model_type": "idefics3",
        "image_token_id": IMAGE_TOKEN,
        "scale_factor": 2,
        "text_config": {
            "vocab_size": VOCAB.len(),
            "hidden_size": 8,
            "intermediate_size": 16,
            "num_hidden_layers": 2,
            "num_attention_heads": 2,
            "num_key_value_heads": 1,
            "max_position_embeddings": 64,
            "eos_token_id": EOS_TOKEN,
        },
        "vision_config": {
            "hidden_size": 8,
            "intermediate_size": 16,
            "num_hidden_layers": 1,
            "num_attention_heads": 2,
            "image_size": 8,
            "patch_size": 2,
        }
    })
}

/// Every tensor of the tiny Idefics3 checkpoint, named and laid out as published
/// checkpoints store them.
pub fn idefics3_shapes() -> BTreeMap<String, Vec<usize>> {
    let (h, i, v) = (8, 16, VOCAB.len());
    let mut shapes = BTreeMap::new();
    let mut add = |name: String, shape: &[usize]| {
        shapes.insert(name, shape.to_vec());
    };

    let vp = "model.vision_model";
    // channels-last kernel, fixed up by the sanitizer
    add(format!("{vp}.embeddings.patch_embedding.weight"), &[8, 2, 2, 3]);
    add(format!("{vp}.embeddings.patch_embedding.bias"), &[8]);
    add(format!("{vp}.embeddings.position_embedding.weight"), &[16, 8]);
    let lp = format!("{vp}.encoder.layers.0");
    for norm in ["layer_norm1", "layer_norm2"] {
        add(format!("{lp}.{norm}.weight"), &[8]);
        add(format!("{lp}.{norm}.bias"), &[8]);
    }
    for proj in ["q_proj", "k_proj", "v_proj", "out_proj"] {
        add(format!("{lp}.self_attn.{proj}.weight"), &[8, 8]);
        add(format!("{lp}.self_attn.{proj}.bias"), &[8]);
    }
    add(format!("{lp}.mlp.fc1.weight"), &[16, 8]);
    add(format!("{lp}.mlp.fc1.bias"), &[16]);
    add(format!("{lp}.mlp.fc2.weight"), &[8, 16]);
    add(format!("{lp}.mlp.fc2.bias"), &[8]);
    add(format!("{vp}.post_layernorm.weight"), &[8]);
    add(format!("{vp}.post_layernorm.bias"), &[8]);

    add("model.connector.modality_projection.proj.weight".into(), &[h, 8 * 4]);

    let tp = "model.text_model";
    add(format!("{tp}.embed_tokens.weight"), &[v, h]);
    for layer in 0..2 {
        let lp = format!("{tp}.layers.{layer}");
        add(format!("{lp}.input_layernorm.weight"), &[h]);
        add(format!("{lp}.post_attention_layernorm.weight"), &[h]);
        add(format!("{lp}.self_attn.q_proj.weight"), &[8, h]);
        add(format!("{lp}.self_attn.k_proj.weight"), &[4, h]);
        add(format!("{lp}.self_attn.v_proj.weight"), &[4, h]);
        add(format!("{lp}.self_attn.o_proj.weight"), &[h, 8]);
        add(format!("{lp}.mlp.gate_proj.weight"), &[i, h]);
        add(format!("{lp}.mlp.up_proj.weight"), &[i, h]);
        add(format!("{lp}.mlp.down_proj.weight"), &[h, i]);
    }
    add(format!("{tp}.norm.weight"), &[h]);
    add("lm_head.weight".into(), &[v, h]);
    shapes
}

pub fn random_tensors(shapes: &BTreeMap<String, Vec<usize>>) -> HashMap<String, Tensor> {
    shapes
        .iter()
        .map(|(name, shape)| {
            let tensor = Tensor::randn(0f32, 0.5, shape.as_slice(), &Device::Cpu).unwrap();
            (name.clone(), tensor)
        })
        .collect()
}

pub fn write_json(path: &Path, value: &serde_json::Value) {
    std::fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
}

/// A `tokenizer.json` for a whitespace-split word-level tokenizer over [`VOCAB`].
pub fn write_tokenizer(dir: &Path) {
    write_word_tokenizer(dir, VOCAB);
}

/// A whitespace-split word-level `tokenizer.json` where a token's id is its index in
/// `words`.
pub fn write_word_tokenizer(dir: &Path, words: &[&str]) {
    let vocab: serde_json::Map<String, serde_json::Value> = words
        .iter()
        .enumerate()
        .map(|(id, word)| (word.to_string(), json!(id)))
        .collect();
    // bracketed tokens are matched before whitespace splitting
    let added: Vec<serde_json::Value> = words
        .iter()
        .enumerate()
        .filter(|(_, word)| word.starts_with('<'))
        .map(|(id, word)| {
            json!({
                "id": id, "content": word, "single_word": false, "lstrip": false,
                "rstrip": false, "normalized": false, "special": true
            })
        })
        .collect();
    write_json(
        &dir.join("tokenizer.json"),
        &json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": added,
            "normalizer": null,
            "pre_tokenizer": {"type": "WhitespaceSplit"},
            "post_processor": null,
            "decoder": null,
            "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"}
        }),
    );
}

/// Write a complete checkpoint directory holding `tensors`.
pub fn write_checkpoint(dir: &Path, config: &serde_json::Value, tensors: &HashMap<String, Tensor>) {
    write_json(&dir.join("config.json"), config);
    candle_core::safetensors::save(tensors, dir.join("model.safetensors")).unwrap();
    write_tokenizer(dir);
    write_json(
        &dir.join("preprocessor_config.json"),
        &json!({
            "processor_class": "Idefics3Processor",
            "image_mean": [0.5, 0.5, 0.5],
            "image_std": [0.5, 0.5, 0.5],
            "max_image_size": {"longest_edge": 8},
            "size": {"longest_edge": 16}
        }),
    );
    write_json(
        &dir.join("tokenizer_config.json"),
        &json!({"chat_template": CHAT_TEMPLATE, "eos_token": "."}),
    );
}

pub fn tiny_idefics3() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_checkpoint(
        dir.path(),
        &idefics3_config(),
        &random_tensors(&idefics3_shapes()),
    );
    dir
}

pub const QWEN_VOCAB: &[&str] = &[
    "<unk>",
    "<|endoftext|>",
    "<|im_end|>",
    "<|vision_start|>",
    "<|vision_end|>",
    "<|image_pad|>",
    "<|video_pad|>",
    "hello",
    "world",
    "the",
    "cat",
    "sat",
    "on",
    "a",
    "mat",
    ".",
];

pub const QWEN_ENDOFTEXT: u32 = 1;
pub const QWEN_IM_END: u32 = 2;
pub const QWEN_IMAGE_PAD: u32 = 5;
pub const QWEN_VIDEO_PAD: u32 = 6;

/// Tiny Qwen2-VL (or Qwen2.5-VL) config: head width 8 split `[2, 1, 1]` between the
/// temporal, height and width rotary axes, and 2x2 patches merged 2x2.
pub fn qwen2_vl_config(qwen2_5: bool) -> serde_json::Value {
    let vision = if qwen2_5 {
        // window of 8 pixels is 2x2 merged cells; block 1 attends globally
        json!({
            "depth": 2, "hidden_size": 8, "intermediate_size": 16, "num_heads": 2,
            "in_chans": 3, "patch_size": 2, "spatial_merge_size": 2,
            "temporal_patch_size": 2, "hidden_act": "silu", "out_hidden_size": 16,
            "window_size": 8, "fullatt_block_indexes": [1], "tokens_per_second": 2
        })
    } else {
        json!({
            "depth": 2, "embed_dim": 8, "hidden_size": 16, "mlp_ratio": 2, "num_heads": 2,
            "in_chans": 3, "patch_size": 2, "spatial_merge_size": 2,
            "temporal_patch_size": 2, "hidden_act": "quick_gelu"
        })
    };
    let architecture = if qwen2_5 {
        "Qwen2_5_VLForConditionalGeneration"
    } else {
        "Qwen2VLForConditionalGeneration"
    };
    json!({
        "architectures": [architecture],
        "model_type": if qwen2_5 { "qwen2_5_vl" } else { "qwen2_vl" },
        "vocab_size": QWEN_VOCAB.len(),
        "hidden_size": 16,
        "intermediate_size": 16,
        "num_hidden_layers": 2,
        "num_attention_heads": 2,
        "num_key_value_heads": 1,
        "max_position_embeddings": 128,
        "rope_theta": 10000.0,
        "tie_word_embeddings": !qwen2_5,
        "eos_token_id": QWEN_ENDOFTEXT,
        "image_token_id": QWEN_IMAGE_PAD,
        "video_token_id": QWEN_VIDEO_PAD,
        "vision_start_token_id": 3,
        "rope_scaling": {"type": "mrope", "mrope_section": [2, 1, 1]},
        "vision_config": vision
    })
}

/// Every tensor of the tiny Qwen2-VL checkpoint. Qwen2.5-VL uses the newer
/// `model.visual` / `model.language_model` prefixes and an untied `lm_head`.
pub fn qwen2_vl_shapes(qwen2_5: bool) -> BTreeMap<String, Vec<usize>> {
    let (h, i, v) = (16, 16, QWEN_VOCAB.len());
    let (e, vi) = (8, 16);
    let (vp, tp) = if qwen2_5 {
        ("model.visual", "model.language_model")
    } else {
        ("visual", "model")
    };
    let mut shapes = BTreeMap::new();
    let mut add = |name: String, shape: &[usize]| {
        shapes.insert(name, shape.to_vec());
    };

    // Conv3d kernel (out, C, T, P, P), flattened by the sanitizer
    add(format!("{vp}.patch_embed.proj.weight"), &[e, 3, 2, 2, 2]);
    for block in 0..2 {
        let bp = format!("{vp}.blocks.{block}");
        for norm in ["norm1", "norm2"] {
            add(format!("{bp}.{norm}.weight"), &[e]);
            if !qwen2_5 {
                add(format!("{bp}.{norm}.bias"), &[e]);
            }
        }
        add(format!("{bp}.attn.qkv.weight"), &[3 * e, e]);
        add(format!("{bp}.attn.qkv.bias"), &[3 * e]);
        add(format!("{bp}.attn.proj.weight"), &[e, e]);
        add(format!("{bp}.attn.proj.bias"), &[e]);
        if qwen2_5 {
            for proj in ["gate_proj", "up_proj"] {
                add(format!("{bp}.mlp.{proj}.weight"), &[vi, e]);
                add(format!("{bp}.mlp.{proj}.bias"), &[vi]);
            }
            add(format!("{bp}.mlp.down_proj.weight"), &[e, vi]);
            add(format!("{bp}.mlp.down_proj.bias"), &[e]);
        } else {
            add(format!("{bp}.mlp.fc1.weight"), &[vi, e]);
            add(format!("{bp}.mlp.fc1.bias"), &[vi]);
            add(format!("{bp}.mlp.fc2.weight"), &[e, vi]);
            add(format!("{bp}.mlp.fc2.bias"), &[e]);
        }
    }
    add(format!("{vp}.merger.ln_q.weight"), &[e]);
    if !qwen2_5 {
        add(format!("{vp}.merger.ln_q.bias"), &[e]);
    }
    add(format!("{vp}.merger.mlp.0.weight"), &[4 * e, 4 * e]);
    add(format!("{vp}.merger.mlp.0.bias"), &[4 * e]);
    add(format!("{vp}.merger.mlp.2.weight"), &[h, 4 * e]);
    add(format!("{vp}.merger.mlp.2.bias"), &[h]);

    add(format!("{tp}.embed_tokens.weight"), &[v, h]);
    for layer in 0..2 {
        let lp = format!("{tp}.layers.{layer}");
        add(format!("{lp}.input_layernorm.weight"), &[h]);
        add(format!("{lp}.post_attention_layernorm.weight"), &[h]);
        add(format!("{lp}.self_attn.q_proj.weight"), &[16, h]);
        add(format!("{lp}.self_attn.q_proj.bias"), &[16]);
        for proj in ["k_proj", "v_proj"] {
            add(format!("{lp}.self_attn.{proj}.weight"), &[8, h]);
            add(format!("{lp}.self_attn.{proj}.bias"), &[8]);
        }
        add(format!("{lp}.self_attn.o_proj.weight"), &[h, 16]);
        add(format!("{lp}.mlp.gate_proj.weight"), &[i, h]);
        add(format!("{lp}.mlp.up_proj.weight"), &[i, h]);
        add(format!("{lp}.mlp.down_proj.weight"), &[h, i]);
    }
    add(format!("{tp}.norm.weight"), &[h]);
    if qwen2_5 {
        add("lm_head.weight".into(), &[v, h]);
    }
    shapes
}

/// Write a Qwen2-VL style checkpoint directory holding `tensors`.
pub fn write_qwen2_vl_checkpoint(
    dir: &Path,
    config: &serde_json::Value,
    tensors: &HashMap<String, Tensor>,
    processor_class: &str,
) {
    write_json(&dir.join("config.json"), config);
    candle_core::safetensors::save(tensors, dir.join("model.safetensors")).unwrap();
    write_word_tokenizer(dir, QWEN_VOCAB);
    write_json(
        &dir.join("preprocessor_config.json"),
        &json!({
            "processor_class": processor_class,
            "min_pixels": 16,
            "max_pixels": 256,
            "patch_size": 2,
            "temporal_patch_size": 2,
            "merge_size": 2,
            "image_mean": [0.48145466, 0.4578275, 0.40821073],
            "image_std": [0.26862954, 0.26130258, 0.27577711]
        }),
    );
}

pub fn tiny_qwen2_vl(qwen2_5: bool) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let class = if qwen2_5 {
        "Qwen2_5_VLProcessor"
    } else {
        "Qwen2VLProcessor"
    };
    write_qwen2_vl_checkpoint(
        dir.path(),
        &qwen2_vl_config(qwen2_5),
        &random_tensors(&qwen2_vl_shapes(qwen2_5)),
        class,
    );
    dir
}

/// Tokens are `t<id>` words; decoding prefixes each with a space.
pub struct IdTokenizer;

impl TextTokenizer for IdTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, VlmError> {
        text.split_whitespace()
            .map(|word| {
                word.strip_prefix('t')
                    .and_then(|id| id.parse().ok())
                    .ok_or_else(|| VlmError::TokenizationFailure(format!("unknown word {word}")))
            })
            .collect()
    }

    fn decode(&self, ids: &[u32]) -> Result<String, VlmError> {
        Ok(ids.iter().map(|id| format!(" t{id}")).collect())
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.encode(token).ok().and_then(|ids| ids.first().copied())
    }
}

pub type Script = dyn Fn(usize) -> Vec<f32> + Send + Sync;

/// A language model whose logits depend only on how many tokens its cache holds.
pub struct ScriptedModel {
    config: ArchitectureConfig,
    rope: RopeIndexing,
    device: Device,
    script: Box<Script>,
    pub forwards: AtomicUsize,
}

impl ScriptedModel {
    /// `script` maps the cache length after a forward pass to the next-token logits.
    pub fn new(
        vocab: usize,
        max_context: usize,
        script: impl Fn(usize) -> Vec<f32> + Send + Sync + 'static,
    ) -> Self {
        let config = ArchitectureConfig::from_json_str(
            &json!({
                "architectures": ["ScriptedForCausalLM"],
                "image_token_id": vocab,
                "vocab_size": vocab,
                "hidden_size": 4,
                "intermediate_size": 4,
                "num_hidden_layers": 2,
                "num_attention_heads": 1,
                "max_position_embeddings": max_context,
                "vision_config": {"hidden_size": 4, "num_hidden_layers": 1,
                    "num_attention_heads": 1, "patch_size": 1}
            })
            .to_string(),
        )
        .unwrap();
        Self {
            config,
            rope: RopeIndexing::Sequential,
            device: Device::Cpu,
            script: Box::new(script),
            forwards: AtomicUsize::new(0),
        }
    }

    pub fn forward_count(&self) -> usize {
        self.forwards.load(Ordering::SeqCst)
    }
}

impl VisionLanguageModel for ScriptedModel {
    fn config(&self) -> &ArchitectureConfig {
        &self.config
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn num_layers(&self) -> usize {
        self.config.text.num_hidden_layers
    }

    fn rope_indexing(&self) -> &RopeIndexing {
        &self.rope
    }

    fn placeholder_ids(&self) -> Vec<u32> {
        vec![self.config.image_token_id]
    }

    fn embed_tokens(&self, ids: &[u32]) -> Result<Tensor, VlmError> {
        Ok(Tensor::zeros((ids.len(), 4), DType::F32, &self.device)?)
    }

    fn encode_visual(&self, _visual: &VisualInput) -> Result<Tensor, VlmError> {
        Err(VlmError::InvalidMedia("text-only model".into()))
    }

    fn forward(
        &self,
        embeds: &Tensor,
        positions: &PositionIds,
        cache: &mut KvCache,
    ) -> Result<Tensor, VlmError> {
        self.forwards.fetch_add(1, Ordering::SeqCst);
        let seq = embeds.dim(0)?;
        assert_eq!(positions.len(), seq);
        let kv = Tensor::zeros((1, 1, seq, 1), DType::F32, &self.device)?;
        for layer in 0..self.num_layers() {
            cache.append(layer, &kv, &kv)?;
        }
        cache.commit(seq);
        Ok(Tensor::new((self.script)(cache.tokens_processed()), &self.device)?)
    }
}

/// Text-only processor over [`IdTokenizer`].
pub struct IdProcessor {
    tokenizer: Arc<dyn TextTokenizer>,
}

impl MultimodalProcessor for IdProcessor {
    fn processor_class(&self) -> &str {
        "IdProcessor"
    }

    fn media_spec(&self, _kind: MediaKind, _h: usize, _w: usize) -> Result<MediaSpec, VlmError> {
        Err(VlmError::InvalidMedia("text-only processor".into()))
    }

    fn process(
        &self,
        prompt: &str,
        images: &[kornia_vlm_engine::ImageInput],
        videos: &[kornia_vlm_engine::VideoInput],
    ) -> Result<kornia_vlm_engine::LmInput, VlmError> {
        if !images.is_empty() || !videos.is_empty() {
            return Err(VlmError::InvalidMedia("text-only processor".into()));
        }
        Ok(kornia_vlm_engine::LmInput::from_tokens(
            self.tokenizer.encode(prompt)?,
        ))
    }
}

/// A context over a [`ScriptedModel`], also returned so tests can count forward passes.
pub fn scripted_context(model: ScriptedModel, chunk_size: usize) -> (Context, Arc<ScriptedModel>) {
    let model = Arc::new(model);
    let tokenizer: Arc<dyn TextTokenizer> = Arc::new(IdTokenizer);
    let context = Context::new(
        model.clone(),
        Arc::new(IdProcessor {
            tokenizer: tokenizer.clone(),
        }),
        tokenizer,
        None,
        LoadReport::default(),
        chunk_size,
    );
    (context, model)
}

/// Logits of `vocab` entries peaking at `id`.
pub fn peak(vocab: usize, id: u32) -> Vec<f32> {
    (0..vocab)
        .map(|i| if i == id as usize { 5.0 } else { 0.1 })
        .collect()
}
