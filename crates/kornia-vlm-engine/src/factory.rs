//! Loading a checkpoint into a ready-to-use [`Context`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{DType, Device};

use crate::chat::ChatTemplate;
use crate::checkpoint::CheckpointSource;
use crate::config::{ArchitectureConfig, ProcessorConfig};
use crate::context::Context;
use crate::error::VlmError;
use crate::registry::{ModelRegistry, ProcessorRegistry};
use crate::tokenizer::TextTokenizer;
use crate::weights::{LoraAdapter, TensorStore, WeightInjector};

const CONFIG_FILE: &str = "config.json";
const PREPROCESSOR_FILE: &str = "preprocessor_config.json";
const PROCESSOR_FILE: &str = "processor_config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";

/// Knobs of a load.
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    /// Device for every parameter; picked automatically when `None`.
    pub device: Option<Device>,
    /// Floating point type of the parameters; follows the device when `None`.
    pub dtype: Option<DType>,
    /// Hub revision used when the source does not name one.
    pub revision: Option<String>,
    /// Prompt tokens per prefill forward pass. `0` disables chunking.
    pub prefill_chunk_size: usize,
    /// Weight files read instead of the ones found in the checkpoint directory.
    pub weights_path: Option<Vec<PathBuf>>,
    /// Processor id used instead of the one the checkpoint names.
    pub processor: Option<String>,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            device: None,
            dtype: None,
            revision: None,
            prefill_chunk_size: 512,
            weights_path: None,
            processor: None,
        }
    }
}

/// Stage reached by a load, reported in this order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadProgress {
    Resolving,
    ConfigDecoded { architecture: String },
    WeightsRead { tensors: usize },
    WeightsSanitized,
    WeightsInjected { parameters: usize, unused: usize },
    ProcessorReady { processor: String },
}

pub type ProgressCallback = Arc<dyn Fn(&LoadProgress) + Send + Sync>;

/// Device and dtype used when the caller does not choose.
pub fn default_device() -> (Device, DType) {
    #[cfg(feature = "cuda")]
    let (device, dtype) = match Device::cuda_if_available(0) {
        Ok(device) if device.is_cuda() => (device, DType::BF16),
        Ok(device) => {
            log::warn!("CUDA not available, defaulting to CPU");
            (device, DType::F32)
        }
        Err(e) => {
            log::warn!("CUDA not available, defaulting to CPU: {e:?}");
            (Device::Cpu, DType::F32)
        }
    };

    #[cfg(not(feature = "cuda"))]
    let (device, dtype) = (Device::Cpu, DType::F32);

    (device, dtype)
}

/// Builds a [`Context`] from a checkpoint.
///
/// Every step maps its failures onto one load error:
///
/// 1. resolve the checkpoint directory (`CheckpointUnavailable`)
/// 2. decode `config.json` (`InvalidConfiguration`)
/// 3. look up the architecture (`UnknownArchitecture`)
/// 4. read the tensors (`WeightsUnreadable`)
/// 5. sanitize them (`WeightShapeMismatch`)
/// 6. inject them into the network (`MissingWeights`, `WeightShapeMismatch`)
/// 7. build the tokenizer and processor (`UnknownProcessor`, `TokenizationFailure`)
pub struct ModelFactory {
    source: CheckpointSource,
    config: FactoryConfig,
    progress: Option<ProgressCallback>,
    adapter: Option<LoraAdapter>,
    models: Option<Arc<ModelRegistry>>,
    processors: Option<Arc<ProcessorRegistry>>,
}

impl ModelFactory {
    pub fn new(source: impl Into<CheckpointSource>) -> Self {
        Self {
            source: source.into(),
            config: FactoryConfig::default(),
            progress: None,
            adapter: None,
            models: None,
            processors: None,
        }
    }

    pub fn with_config(mut self, config: FactoryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_progress(
        mut self,
        callback: impl Fn(&LoadProgress) + Send + Sync + 'static,
    ) -> Self {
        self.progress = Some(Arc::new(callback));
        self
    }

    /// Merge `adapter` into the base weights while loading.
    pub fn with_adapter(mut self, adapter: LoraAdapter) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Resolve through these registries instead of the process-wide ones.
    pub fn with_registries(
        mut self,
        models: Arc<ModelRegistry>,
        processors: Arc<ProcessorRegistry>,
    ) -> Self {
        self.models = Some(models);
        self.processors = Some(processors);
        self
    }

    fn report(&self, stage: LoadProgress) {
        log::info!("{stage:?}");
        if let Some(progress) = &self.progress {
            progress(&stage);
        }
    }

    fn source(&self) -> CheckpointSource {
        match (&self.source, &self.config.revision) {
            (CheckpointSource::Hub { repo_id, revision: None }, Some(revision)) => {
                CheckpointSource::Hub {
                    repo_id: repo_id.clone(),
                    revision: Some(revision.clone()),
                }
            }
            (source, _) => source.clone(),
        }
    }

    /// Run the whole load on the current thread.
    pub fn load(self) -> Result<Context, VlmError> {
        let models = self.models.clone();
        let processors = self.processors.clone();
        let models = models.as_deref().unwrap_or_else(|| ModelRegistry::global());
        let processors = processors
            .as_deref()
            .unwrap_or_else(|| ProcessorRegistry::global());

        let (device, dtype) = match (&self.config.device, self.config.dtype) {
            (Some(device), Some(dtype)) => (device.clone(), dtype),
            (Some(device), None) if device.is_cpu() => (device.clone(), DType::F32),
            (Some(device), None) => (device.clone(), DType::BF16),
            (None, dtype) => {
                let (device, default_dtype) = default_device();
                (device, dtype.unwrap_or(default_dtype))
            }
        };

        self.report(LoadProgress::Resolving);
        let dir = self.source().resolve()?;

        let arch = ArchitectureConfig::from_file(dir.join(CONFIG_FILE))?;
        self.report(LoadProgress::ConfigDecoded {
            architecture: arch.architecture.clone(),
        });
        let architecture = models.resolve(&arch)?;
        let default_processor = architecture.default_processor().to_string();

        let store = match &self.config.weights_path {
            Some(files) => TensorStore::from_files(files.clone()),
            None => TensorStore::discover(&dir)?,
        };
        let mut table = store.load(dtype, &device)?;
        self.report(LoadProgress::WeightsRead {
            tensors: table.len(),
        });

        if let Some(adapter) = &self.adapter {
            adapter.merge_into(&mut table)?;
        }
        let table = architecture.sanitize(table)?;
        self.report(LoadProgress::WeightsSanitized);

        let mut injector = WeightInjector::new(table);
        let model = architecture.load(&mut injector, &device)?;
        let report = injector.finish();
        self.report(LoadProgress::WeightsInjected {
            parameters: report.injected.len(),
            unused: report.unused.len(),
        });

        let tokenizer = load_tokenizer(&dir)?;
        let processor_config = ProcessorConfig::from_json_strs(
            read_optional(&dir.join(PREPROCESSOR_FILE))?.as_deref(),
            read_optional(&dir.join(PROCESSOR_FILE))?.as_deref(),
            &arch,
        )?;
        let processor_id = self
            .config
            .processor
            .clone()
            .or_else(|| processor_config.processor_class.clone())
            .unwrap_or(default_processor);
        let processor = processors.resolve(
            &processor_id,
            &processor_config,
            &arch,
            Arc::clone(&tokenizer),
        )?;
        self.report(LoadProgress::ProcessorReady {
            processor: processor_id,
        });

        let chat_template = ChatTemplate::from_checkpoint(&dir)?;
        Ok(Context::new(
            model,
            Arc::from(processor),
            tokenizer,
            chat_template.map(Arc::new),
            report,
            self.config.prefill_chunk_size,
        ))
    }

    /// Run the load on tokio's blocking pool so the caller's executor keeps running.
    pub async fn load_async(self) -> Result<Context, VlmError> {
        match tokio::task::spawn_blocking(move || self.load()).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(VlmError::CheckpointUnavailable(format!("load cancelled: {e}"))),
        }
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, VlmError> {
    if !path.is_file() {
        return Ok(None);
    }
    std::fs::read_to_string(path).map(Some).map_err(|e| {
        VlmError::InvalidConfiguration(format!("cannot read {}: {e}", path.display()))
    })
}

fn load_tokenizer(dir: &Path) -> Result<Arc<dyn TextTokenizer>, VlmError> {
    let path = dir.join(TOKENIZER_FILE);
    if !path.is_file() {
        return Err(VlmError::CheckpointUnavailable(format!(
            "{} has no {TOKENIZER_FILE}",
            dir.display()
        )));
    }
    let tokenizer = tokenizers::Tokenizer::from_file(&path)
        .map_err(|e| VlmError::TokenizationFailure(format!("{}: {e}", path.display())))?;
    Ok(Arc::new(tokenizer))
}
