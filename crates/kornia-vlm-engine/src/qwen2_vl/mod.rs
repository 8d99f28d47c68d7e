//! Qwen2-VL and Qwen2.5-VL: a native-resolution vision tower with 2D rotary patches,
//! a patch merger and a Qwen2 decoder with multimodal rotary positions.

mod processor;
mod vision;

use std::sync::Arc;

use candle_core::{Device, Tensor};

pub use processor::{smart_resize, Qwen2VlProcessor};
pub use vision::{QwenVisionTower, VisionFlavor};

use crate::config::ArchitectureConfig;
use crate::error::VlmError;
use crate::kv_cache::KvCache;
use crate::model::{ModelArchitecture, VisionLanguageModel};
use crate::processor::{MultimodalProcessor, VisualInput};
use crate::registry::{ModelRegistry, ProcessorRegistry};
use crate::rotary::{PositionIds, RopeIndexing};
use crate::text_model::{LanguageModel, TextStackOptions};
use crate::weights::{WeightInjector, WeightTable};

pub const ARCHITECTURES: &[&str] = &[
    "Qwen2VLForConditionalGeneration",
    "Qwen2_5_VLForConditionalGeneration",
];

pub const PROCESSORS: &[&str] = &["Qwen2VLProcessor", "Qwen2_5_VLProcessor"];

const PATCH_EMBED: &str = "visual.patch_embed.proj.weight";

pub struct Qwen2VlModel {
    config: ArchitectureConfig,
    visual: QwenVisionTower,
    text_model: LanguageModel,
    rope_indexing: RopeIndexing,
    device: Device,
}

impl Qwen2VlModel {
    pub fn load(
        config: ArchitectureConfig,
        flavor: VisionFlavor,
        w: &mut WeightInjector,
        device: &Device,
    ) -> Result<Self, VlmError> {
        let visual = QwenVisionTower::load(&config.vision, flavor, w, device)?;
        let text_model = LanguageModel::load(
            &config.text,
            &TextStackOptions {
                prefix: "model".to_string(),
                qkv_bias: true,
                mrope_section: config.mrope_section.clone(),
            },
            w,
            device,
        )?;
        let rope_indexing = RopeIndexing::Multimodal {
            spatial_merge: config.vision.spatial_merge_size,
            tokens_per_second: config.vision.tokens_per_second,
        };

        Ok(Self {
            config,
            visual,
            text_model,
            rope_indexing,
            device: device.clone(),
        })
    }
}

impl VisionLanguageModel for Qwen2VlModel {
    fn config(&self) -> &ArchitectureConfig {
        &self.config
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn num_layers(&self) -> usize {
        self.text_model.num_layers()
    }

    fn rope_indexing(&self) -> &RopeIndexing {
        &self.rope_indexing
    }

    fn placeholder_ids(&self) -> Vec<u32> {
        let mut ids = vec![self.config.image_token_id];
        ids.extend(self.config.video_token_id);
        ids
    }

    fn embed_tokens(&self, ids: &[u32]) -> Result<Tensor, VlmError> {
        Ok(self.text_model.embed(ids, &self.device)?)
    }

    fn encode_visual(&self, visual: &VisualInput) -> Result<Tensor, VlmError> {
        let pixels = visual.pixels.to_device(&self.device)?;
        Ok(self.visual.forward(&pixels, &visual.grid)?)
    }

    fn forward(
        &self,
        embeds: &Tensor,
        positions: &PositionIds,
        cache: &mut KvCache,
    ) -> Result<Tensor, VlmError> {
        Ok(self.text_model.forward(embeds, positions, cache)?)
    }
}

pub struct Qwen2VlArchitecture {
    config: ArchitectureConfig,
    flavor: VisionFlavor,
}

impl Qwen2VlArchitecture {
    pub fn new(config: &ArchitectureConfig) -> Result<Self, VlmError> {
        if config.mrope_section.is_none() {
            return Err(VlmError::InvalidConfiguration(format!(
                "{} needs `rope_scaling.mrope_section`",
                config.architecture
            )));
        }
        let v = &config.vision;
        if (v.hidden_size / v.num_attention_heads) % 4 != 0 {
            return Err(VlmError::InvalidConfiguration(format!(
                "vision head size {} must be a multiple of 4 for 2D rotary patches",
                v.hidden_size / v.num_attention_heads
            )));
        }
        let flavor = if config.architecture.starts_with("Qwen2_5") {
            VisionFlavor::Qwen2_5
        } else {
            VisionFlavor::Qwen2
        };
        Ok(Self {
            config: config.clone(),
            flavor,
        })
    }

    /// Split fused `attn.qkv` projections into separate query, key and value tensors.
    fn split_qkv(mut table: WeightTable) -> Result<WeightTable, VlmError> {
        let fused: Vec<String> = table
            .names()
            .into_iter()
            .filter(|name| name.contains(".attn.qkv."))
            .collect();
        for name in fused {
            let Some(tensor) = table.remove(&name) else {
                continue;
            };
            let rows = tensor.dim(0)?;
            if rows % 3 != 0 {
                let mut expected = tensor.dims().to_vec();
                expected[0] = rows.div_ceil(3) * 3;
                return Err(VlmError::WeightShapeMismatch {
                    name,
                    expected,
                    actual: tensor.dims().to_vec(),
                });
            }
            let parts = tensor.chunk(3, 0)?;
            for (part, proj) in parts.into_iter().zip(["q_proj", "k_proj", "v_proj"]) {
                table.insert(name.replace(".qkv.", &format!(".{proj}.")), part.contiguous()?);
            }
        }
        Ok(table)
    }
}

impl ModelArchitecture for Qwen2VlArchitecture {
    fn config(&self) -> &ArchitectureConfig {
        &self.config
    }

    fn sanitize(&self, table: WeightTable) -> Result<WeightTable, VlmError> {
        let mut table = table
            .rename_prefix("model.language_model.", "model.")
            .rename_prefix("model.visual.", "visual.")
            .drop_where(|name| name.ends_with("rotary_emb.inv_freq"));

        // the patch embedding is stored as a Conv3d kernel (out, C, T, P, P)
        if let Some(kernel) = table.remove(PATCH_EMBED) {
            let kernel = match kernel.rank() {
                2 => kernel,
                5 => kernel.flatten_from(1)?,
                _ => {
                    let v = &self.config.vision;
                    return Err(VlmError::WeightShapeMismatch {
                        name: PATCH_EMBED.to_string(),
                        expected: vec![
                            v.hidden_size,
                            v.num_channels,
                            v.temporal_patch_size,
                            v.patch_size,
                            v.patch_size,
                        ],
                        actual: kernel.dims().to_vec(),
                    });
                }
            };
            table.insert(PATCH_EMBED, kernel);
        }
        Self::split_qkv(table)
    }

    fn load(
        self: Box<Self>,
        weights: &mut WeightInjector,
        device: &Device,
    ) -> Result<Arc<dyn VisionLanguageModel>, VlmError> {
        let model = Qwen2VlModel::load(self.config, self.flavor, weights, device)?;
        Ok(Arc::new(model))
    }

    fn default_processor(&self) -> &str {
        match self.flavor {
            VisionFlavor::Qwen2 => "Qwen2VLProcessor",
            VisionFlavor::Qwen2_5 => "Qwen2_5_VLProcessor",
        }
    }
}

pub fn register_models(registry: &ModelRegistry) {
    for &id in ARCHITECTURES {
        registry.register(id, |config: &ArchitectureConfig| {
            Ok(Box::new(Qwen2VlArchitecture::new(config)?) as Box<dyn ModelArchitecture>)
        });
    }
}

pub fn register_processors(registry: &ProcessorRegistry) {
    for &id in PROCESSORS {
        registry.register(id, move |config, arch, tokenizer| {
            let processor = Qwen2VlProcessor::new(id, config, arch, tokenizer)?;
            Ok(Box::new(processor) as Box<dyn MultimodalProcessor>)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn arch(name: &str) -> ArchitectureConfig {
        ArchitectureConfig::from_json_str(&format!(
            r#"{{
                "architectures": ["{name}"],
                "image_token_id": 30, "video_token_id": 31,
                "vocab_size": 32, "hidden_size": 8, "intermediate_size": 16,
                "num_hidden_layers": 1, "num_attention_heads": 2,
                "rope_scaling": {{"type": "mrope", "mrope_section": [1, 1, 0]}},
                "vision_config": {{"embed_dim": 4, "hidden_size": 8, "depth": 1,
                    "num_heads": 1, "in_chans": 3, "patch_size": 2,
                    "spatial_merge_size": 2, "temporal_patch_size": 2}}
            }}"#
        ))
        .unwrap()
    }

    #[test]
    fn test_sanitize_flattens_and_splits() -> Result<(), VlmError> {
        let device = Device::Cpu;
        let architecture = Qwen2VlArchitecture::new(&arch("Qwen2VLForConditionalGeneration"))?;
        let mut table = WeightTable::new();
        table.insert(
            "model.visual.patch_embed.proj.weight",
            Tensor::zeros((4, 3, 2, 2, 2), DType::F32, &device)?,
        );
        table.insert(
            "model.visual.blocks.0.attn.qkv.weight",
            Tensor::arange(0f32, 48., &device)?.reshape((12, 4))?,
        );
        table.insert(
            "model.visual.blocks.0.attn.qkv.bias",
            Tensor::zeros(12, DType::F32, &device)?,
        );
        table.insert(
            "model.language_model.norm.weight",
            Tensor::ones(8, DType::F32, &device)?,
        );

        let table = architecture.sanitize(table)?;
        assert_eq!(table.get(PATCH_EMBED).unwrap().dims(), &[4, 24]);
        let k = table.get("visual.blocks.0.attn.k_proj.weight").unwrap();
        assert_eq!(k.dims(), &[4, 4]);
        assert_eq!(k.to_vec2::<f32>()?[0][0], 16.0);
        assert!(table.contains("visual.blocks.0.attn.v_proj.bias"));
        assert!(table.contains("model.norm.weight"));
        assert!(!table.names().iter().any(|n| n.contains("qkv")));

        let again = architecture.sanitize(table.clone())?;
        assert_eq!(again.names(), table.names());
        Ok(())
    }

    #[test]
    fn test_sanitize_rejects_uneven_qkv() -> Result<(), VlmError> {
        let architecture = Qwen2VlArchitecture::new(&arch("Qwen2_5_VLForConditionalGeneration"))?;
        let mut table = WeightTable::new();
        table.insert(
            "visual.blocks.0.attn.qkv.weight",
            Tensor::zeros((10, 4), DType::F32, &Device::Cpu)?,
        );
        assert!(matches!(
            architecture.sanitize(table),
            Err(VlmError::WeightShapeMismatch { .. })
        ));
        assert_eq!(architecture.default_processor(), "Qwen2_5_VLProcessor");
        Ok(())
    }
}
