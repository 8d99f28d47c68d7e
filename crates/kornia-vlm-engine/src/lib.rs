//! # Kornia VLM Engine
//!
//! Checkpoint loading and multimodal text generation for vision-language models.
//!
//! A checkpoint directory (or Hugging Face Hub repository) is turned into a [`Context`]
//! by the [`ModelFactory`]; the context prepares prompts with media and runs generation
//! sessions that stream tokens.
//!
//! Supported architectures:
//!
//! - **Idefics3 / SmolVLM**: SigLIP vision tower, pixel-shuffle connector, Llama decoder
//! - **Qwen2-VL / Qwen2.5-VL**: native-resolution vision tower with multimodal rotary positions
//!
//! Further architectures plug in through the [`ModelRegistry`] and [`ProcessorRegistry`].
//!
//! ```no_run
//! use kornia_vlm_engine::{GenerationParams, ModelFactory};
//!
//! let context = ModelFactory::new(std::path::PathBuf::from("/path/to/checkpoint")).load()?;
//! let input = context.process("Describe a sunset.", &[], &[])?;
//! for token in context.generate(input, GenerationParams::default())? {
//!     print!("{}", token?.text);
//! }
//! # Ok::<(), kornia_vlm_engine::VlmError>(())
//! ```

/// Chat message types and Jinja chat templates.
pub mod chat;

/// Resolving checkpoints on disk or on the Hugging Face Hub.
pub mod checkpoint;

/// Architecture and processor configuration decoding.
pub mod config;

/// Error types for loading and generation.
pub mod error;

/// Building a [`Context`] from a checkpoint.
pub mod factory;

/// Substituting visual features into prompt embeddings.
pub mod fusion;

/// Generation sessions and their parameters.
pub mod generation;

/// Idefics3 and SmolVLM.
pub mod idefics3;

/// Per-session attention caches.
pub mod kv_cache;

/// Shared network building blocks.
pub mod layers;

/// Capability traits implemented by every architecture.
pub mod model;

/// Prompt and media preparation.
pub mod processor;

/// Qwen2-VL and Qwen2.5-VL.
pub mod qwen2_vl;

/// Architecture and processor registries.
pub mod registry;

/// Rotary position embeddings and position indexing policies.
pub mod rotary;

/// Next-token selection.
pub mod sampling;

/// Decoder-only language stack.
pub mod text_model;

/// Tokenizer seam and incremental detokenization.
pub mod tokenizer;

/// SigLIP-style vision transformer.
pub mod vision_model;

/// Tensor stores, weight injection and adapters.
pub mod weights;

mod context;

pub use chat::{ChatTemplate, Line, Message, Role};
pub use checkpoint::CheckpointSource;
pub use config::{ArchitectureConfig, ProcessorConfig, ResolutionPolicy};
pub use context::Context;
pub use error::VlmError;
pub use factory::{FactoryConfig, LoadProgress, ModelFactory};
pub use generation::{GeneratedToken, GenerationOutput, GenerationParams, StopReason, TokenStream};
pub use model::{ModelArchitecture, VisionLanguageModel};
pub use processor::{ImageInput, LmInput, MediaKind, MediaSpec, MultimodalProcessor, VideoInput};
pub use registry::{ModelRegistry, ProcessorRegistry};
pub use tokenizer::TextTokenizer;
pub use weights::{LoadReport, LoraAdapter};
