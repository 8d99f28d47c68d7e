use std::sync::Arc;

use candle_core::{Device, Tensor};

use crate::config::ArchitectureConfig;
use crate::error::VlmError;
use crate::kv_cache::KvCache;
use crate::processor::VisualInput;
use crate::rotary::{PositionIds, RopeIndexing};
use crate::weights::{WeightInjector, WeightTable};

/// A loaded network, shared read-only between generation sessions.
///
/// Every method takes `&self`; per-session state lives in the [`KvCache`] passed to
/// [`VisionLanguageModel::forward`].
pub trait VisionLanguageModel: Send + Sync {
    fn config(&self) -> &ArchitectureConfig;

    fn device(&self) -> &Device;

    /// Number of attention layers, i.e. cache slots per session.
    fn num_layers(&self) -> usize;

    /// Longest sequence a session may hold.
    fn max_context(&self) -> usize {
        self.config().text.max_position_embeddings
    }

    fn rope_indexing(&self) -> &RopeIndexing;

    /// Token ids that mark where visual features are substituted.
    fn placeholder_ids(&self) -> Vec<u32>;

    /// Token embeddings of shape `(seq, hidden)`.
    fn embed_tokens(&self, ids: &[u32]) -> Result<Tensor, VlmError>;

    /// Projected features of one visual item, shape `(placeholders, hidden)`.
    fn encode_visual(&self, visual: &VisualInput) -> Result<Tensor, VlmError>;

    /// Run embeddings through the language stack, appending to `cache`, and return
    /// the f32 next-token logits of the last position.
    fn forward(
        &self,
        embeds: &Tensor,
        positions: &PositionIds,
        cache: &mut KvCache,
    ) -> Result<Tensor, VlmError>;

    fn new_cache(&self) -> KvCache {
        KvCache::new(self.num_layers())
    }
}

/// An architecture resolved from the registry but not yet holding weights.
pub trait ModelArchitecture: Send {
    fn config(&self) -> &ArchitectureConfig;

    /// Rewrite checkpoint tensor names and layouts into this architecture's parameter
    /// convention. Applying it to its own output leaves the table unchanged.
    fn sanitize(&self, table: WeightTable) -> Result<WeightTable, VlmError>;

    /// Build the network, taking every parameter from `weights`.
    fn load(
        self: Box<Self>,
        weights: &mut WeightInjector,
        device: &Device,
    ) -> Result<Arc<dyn VisionLanguageModel>, VlmError>;

    /// Processor id used when the checkpoint does not name one.
    fn default_processor(&self) -> &str;
}
