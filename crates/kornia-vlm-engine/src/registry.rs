//! Process-wide lookup tables from checkpoint identifiers to constructors.
//!
//! Both registries are safe to read from many threads while registration happens; the
//! last registration of an identifier wins.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::config::{ArchitectureConfig, ProcessorConfig};
use crate::error::VlmError;
use crate::model::ModelArchitecture;
use crate::processor::MultimodalProcessor;
use crate::tokenizer::TextTokenizer;
use crate::{idefics3, qwen2_vl};

type ModelFn =
    dyn Fn(&ArchitectureConfig) -> Result<Box<dyn ModelArchitecture>, VlmError> + Send + Sync;

type ProcessorFn = dyn Fn(
        &ProcessorConfig,
        &ArchitectureConfig,
        Arc<dyn TextTokenizer>,
    ) -> Result<Box<dyn MultimodalProcessor>, VlmError>
    + Send
    + Sync;

pub type ModelConstructor = Arc<ModelFn>;

pub type ProcessorConstructor = Arc<ProcessorFn>;

struct Table<C: ?Sized> {
    kind: &'static str,
    entries: RwLock<HashMap<String, Arc<C>>>,
}

impl<C: ?Sized> Table<C> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn insert(&self, id: String, constructor: Arc<C>) -> Option<Arc<C>> {
        let previous = self.entries.write().insert(id.clone(), constructor);
        if previous.is_some() {
            log::debug!("replaced {} constructor `{id}`", self.kind);
        }
        previous
    }

    // the lock is released before the caller runs the constructor
    fn get(&self, id: &str) -> Option<Arc<C>> {
        self.entries.read().get(id).cloned()
    }

    fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Architecture identifiers (`config.json` `architectures[0]`) to model constructors.
pub struct ModelRegistry {
    table: Table<ModelFn>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            table: Table::new("model"),
        }
    }

    /// A registry holding every built-in architecture.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        idefics3::register_models(&registry);
        qwen2_vl::register_models(&registry);
        registry
    }

    /// Shared registry seeded with the built-ins on first use.
    pub fn global() -> &'static ModelRegistry {
        static GLOBAL: OnceLock<ModelRegistry> = OnceLock::new();
        GLOBAL.get_or_init(Self::with_builtins)
    }

    /// Associate `id` with `constructor`, returning the constructor it replaces.
    pub fn register<F>(&self, id: impl Into<String>, constructor: F) -> Option<ModelConstructor>
    where
        F: Fn(&ArchitectureConfig) -> Result<Box<dyn ModelArchitecture>, VlmError>
            + Send
            + Sync
            + 'static,
    {
        self.table.insert(id.into(), Arc::new(constructor))
    }

    pub fn constructor(&self, id: &str) -> Option<ModelConstructor> {
        self.table.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.table.get(id).is_some()
    }

    /// Registered identifiers, sorted.
    pub fn ids(&self) -> Vec<String> {
        self.table.ids()
    }

    /// Build the architecture registered for `config.architecture`.
    pub fn resolve(
        &self,
        config: &ArchitectureConfig,
    ) -> Result<Box<dyn ModelArchitecture>, VlmError> {
        let constructor = self
            .constructor(&config.architecture)
            .ok_or_else(|| VlmError::UnknownArchitecture(config.architecture.clone()))?;
        constructor(config)
    }
}

/// Processor class names to processor constructors.
pub struct ProcessorRegistry {
    table: Table<ProcessorFn>,
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self {
            table: Table::new("processor"),
        }
    }

    pub fn with_builtins() -> Self {
        let registry = Self::new();
        idefics3::register_processors(&registry);
        qwen2_vl::register_processors(&registry);
        registry
    }

    pub fn global() -> &'static ProcessorRegistry {
        static GLOBAL: OnceLock<ProcessorRegistry> = OnceLock::new();
        GLOBAL.get_or_init(Self::with_builtins)
    }

    pub fn register<F>(&self, id: impl Into<String>, constructor: F) -> Option<ProcessorConstructor>
    where
        F: Fn(
                &ProcessorConfig,
                &ArchitectureConfig,
                Arc<dyn TextTokenizer>,
            ) -> Result<Box<dyn MultimodalProcessor>, VlmError>
            + Send
            + Sync
            + 'static,
    {
        self.table.insert(id.into(), Arc::new(constructor))
    }

    pub fn constructor(&self, id: &str) -> Option<ProcessorConstructor> {
        self.table.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.table.get(id).is_some()
    }

    pub fn ids(&self) -> Vec<String> {
        self.table.ids()
    }

    pub fn resolve(
        &self,
        id: &str,
        config: &ProcessorConfig,
        arch: &ArchitectureConfig,
        tokenizer: Arc<dyn TextTokenizer>,
    ) -> Result<Box<dyn MultimodalProcessor>, VlmError> {
        let constructor = self
            .constructor(id)
            .ok_or_else(|| VlmError::UnknownProcessor(id.to_string()))?;
        constructor(config, arch, tokenizer)
    }
}
