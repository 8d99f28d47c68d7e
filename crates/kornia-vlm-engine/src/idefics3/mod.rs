//! Idefics3 and SmolVLM: a SigLIP tower, a pixel-shuffle connector and a Llama decoder.

mod model;
mod processor;

use std::sync::Arc;

use candle_core::Device;

pub use model::{Connector, Idefics3Model};
pub use processor::{resize_longest_edge, round_to_tiles, Idefics3Processor};

use crate::config::ArchitectureConfig;
use crate::error::VlmError;
use crate::model::{ModelArchitecture, VisionLanguageModel};
use crate::processor::MultimodalProcessor;
use crate::registry::{ModelRegistry, ProcessorRegistry};
use crate::weights::{WeightInjector, WeightTable};

pub const ARCHITECTURES: &[&str] = &[
    "Idefics3ForConditionalGeneration",
    "SmolVLMForConditionalGeneration",
];

pub const PROCESSORS: &[&str] = &["Idefics3Processor", "SmolVLMProcessor"];

const PATCH_KERNEL: &str = "model.vision_model.embeddings.patch_embedding.weight";

pub struct Idefics3Architecture {
    config: ArchitectureConfig,
}

impl Idefics3Architecture {
    pub fn new(config: &ArchitectureConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl ModelArchitecture for Idefics3Architecture {
    fn config(&self) -> &ArchitectureConfig {
        &self.config
    }

    fn sanitize(&self, table: WeightTable) -> Result<WeightTable, VlmError> {
        let mut table = table
            .rename_prefix("model.text_model.model.", "model.text_model.")
            .rename("model.text_model.lm_head.weight", "lm_head.weight")
            .drop_where(|name| name.ends_with("rotary_emb.inv_freq"));

        // channels-last exports store the patch kernel as (out, P, P, C)
        let channels = self.config.vision.num_channels;
        if let Some(kernel) = table.remove(PATCH_KERNEL) {
            let dims = kernel.dims().to_vec();
            let kernel = match dims.as_slice() {
                &[_, c, _, _] if c == channels => kernel,
                &[_, _, _, c] if c == channels => kernel.permute((0, 3, 1, 2))?.contiguous()?,
                _ => {
                    let p = self.config.vision.patch_size;
                    return Err(VlmError::WeightShapeMismatch {
                        name: PATCH_KERNEL.to_string(),
                        expected: vec![self.config.vision.hidden_size, channels, p, p],
                        actual: dims.clone(),
                    });
                }
            };
            table.insert(PATCH_KERNEL, kernel);
        }
        Ok(table)
    }

    fn load(
        self: Box<Self>,
        weights: &mut WeightInjector,
        device: &Device,
    ) -> Result<Arc<dyn VisionLanguageModel>, VlmError> {
        Ok(Arc::new(Idefics3Model::load(self.config, weights, device)?))
    }

    fn default_processor(&self) -> &str {
        if self.config.architecture.starts_with("SmolVLM") {
            "SmolVLMProcessor"
        } else {
            "Idefics3Processor"
        }
    }
}

pub fn register_models(registry: &ModelRegistry) {
    for &id in ARCHITECTURES {
        registry.register(id, |config: &ArchitectureConfig| {
            Ok(Box::new(Idefics3Architecture::new(config)) as Box<dyn ModelArchitecture>)
        });
    }
}

pub fn register_processors(registry: &ProcessorRegistry) {
    for &id in PROCESSORS {
        registry.register(id, move |config, arch, tokenizer| {
            let processor = Idefics3Processor::new(id, config, arch, tokenizer)?;
            Ok(Box::new(processor) as Box<dyn MultimodalProcessor>)
        });
    }
}
