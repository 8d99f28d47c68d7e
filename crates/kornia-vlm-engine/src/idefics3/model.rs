use candle_core::{Device, Result, Tensor};
use candle_nn::{Linear, Module};

use crate::config::ArchitectureConfig;
use crate::error::VlmError;
use crate::kv_cache::KvCache;
use crate::model::VisionLanguageModel;
use crate::processor::VisualInput;
use crate::rotary::{PositionIds, RopeIndexing};
use crate::text_model::{LanguageModel, TextStackOptions};
use crate::vision_model::SiglipVisionTower;
use crate::weights::WeightInjector;

/// Bridges the vision encoder and the language stack: pixel shuffle followed by a
/// linear projection.
pub struct Connector {
    modality_proj: Linear,
    scale_factor: usize,
}

impl Connector {
    /// Trade spatial resolution for channels.
    ///
    /// `B,P,E` → `B,H/S,S,W/S,S,E` → `B,H/S,W/S,S,S,E` → `B,P/S²,S²·E`
    fn pixel_shuffle(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, patches, embed_dim) = x.dims3()?;
        let side = (patches as f64).sqrt() as usize;
        let s = self.scale_factor;
        if side * side != patches || side % s != 0 {
            candle_core::bail!(
                "cannot pixel-shuffle {patches} patches with scale factor {s}"
            );
        }

        x.reshape((batch, side / s, s, side / s, s, embed_dim))?
            .permute([0, 1, 3, 2, 4, 5])?
            .reshape((batch, patches / (s * s), embed_dim * s * s))
    }

    pub fn forward(&self, image_hidden_states: &Tensor) -> Result<Tensor> {
        let image_hidden_states = self.pixel_shuffle(image_hidden_states)?;
        self.modality_proj.forward(&image_hidden_states)
    }
}

/// SigLIP encoder, pixel-shuffle connector and Llama-style decoder.
pub struct Idefics3Model {
    config: ArchitectureConfig,
    vision_model: SiglipVisionTower,
    connector: Connector,
    text_model: LanguageModel,
    rope_indexing: RopeIndexing,
    device: Device,
}

impl Idefics3Model {
    pub fn load(
        config: ArchitectureConfig,
        w: &mut WeightInjector,
        device: &Device,
    ) -> std::result::Result<Self, VlmError> {
        let vision_model = SiglipVisionTower::load(&config.vision, "model.vision_model", w)?;

        let s = config.scale_factor;
        let connector = Connector {
            modality_proj: Linear::new(
                w.take(
                    "model.connector.modality_projection.proj.weight",
                    (config.text.hidden_size, config.vision.hidden_size * s * s),
                )?,
                None,
            ),
            scale_factor: s,
        };

        let text_model = LanguageModel::load(
            &config.text,
            &TextStackOptions {
                prefix: "model.text_model".to_string(),
                qkv_bias: false,
                mrope_section: None,
            },
            w,
            device,
        )?;

        Ok(Self {
            config,
            vision_model,
            connector,
            text_model,
            rope_indexing: RopeIndexing::Sequential,
            device: device.clone(),
        })
    }
}

impl VisionLanguageModel for Idefics3Model {
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
        vec![self.config.image_token_id]
    }

    fn embed_tokens(&self, ids: &[u32]) -> std::result::Result<Tensor, VlmError> {
        Ok(self.text_model.embed(ids, &self.device)?)
    }

    fn encode_visual(&self, visual: &VisualInput) -> std::result::Result<Tensor, VlmError> {
        let pixels = visual.pixels.to_device(&self.device)?;
        let image_hidden_states = self.vision_model.forward(&pixels)?;
        let image_hidden_states = self.connector.forward(&image_hidden_states)?;
        Ok(image_hidden_states.flatten(0, 1)?)
    }

    fn forward(
        &self,
        embeds: &Tensor,
        positions: &PositionIds,
        cache: &mut KvCache,
    ) -> std::result::Result<Tensor, VlmError> {
        Ok(self.text_model.forward(embeds, positions, cache)?)
    }
}
