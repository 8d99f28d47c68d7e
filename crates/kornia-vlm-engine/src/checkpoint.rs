//! Turning a checkpoint location into a local directory.

use std::path::{Path, PathBuf};

use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};

use crate::error::VlmError;

const CONFIG_FILE: &str = "config.json";
const SINGLE_WEIGHTS: &str = "model.safetensors";
const WEIGHTS_INDEX: &str = "model.safetensors.index.json";

/// Files fetched when present, skipped otherwise.
const OPTIONAL_FILES: &[&str] = &[
    "preprocessor_config.json",
    "processor_config.json",
    "tokenizer.json",
    "tokenizer_config.json",
    "chat_template.json",
];

/// Where a checkpoint lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointSource {
    /// A directory already on disk.
    Local(PathBuf),
    /// A Hugging Face Hub model repository, fetched into the local hub cache.
    Hub {
        repo_id: String,
        revision: Option<String>,
    },
}

impl CheckpointSource {
    pub fn hub(repo_id: impl Into<String>) -> Self {
        CheckpointSource::Hub {
            repo_id: repo_id.into(),
            revision: None,
        }
    }

    /// An existing directory is local, anything else is taken as a hub repo id.
    pub fn parse(location: &str) -> Self {
        let path = Path::new(location);
        if path.is_dir() {
            CheckpointSource::Local(path.to_path_buf())
        } else {
            Self::hub(location)
        }
    }

    /// Make every checkpoint file available locally and return the directory holding them.
    pub fn resolve(&self) -> Result<PathBuf, VlmError> {
        match self {
            CheckpointSource::Local(dir) => {
                if dir.join(CONFIG_FILE).is_file() {
                    Ok(dir.clone())
                } else {
                    Err(VlmError::CheckpointUnavailable(format!(
                        "{} has no {CONFIG_FILE}",
                        dir.display()
                    )))
                }
            }
            CheckpointSource::Hub { repo_id, revision } => {
                fetch_from_hub(repo_id, revision.as_deref())
            }
        }
    }
}

impl From<PathBuf> for CheckpointSource {
    fn from(dir: PathBuf) -> Self {
        CheckpointSource::Local(dir)
    }
}

impl From<&Path> for CheckpointSource {
    fn from(dir: &Path) -> Self {
        CheckpointSource::Local(dir.to_path_buf())
    }
}

fn fetch_from_hub(repo_id: &str, revision: Option<&str>) -> Result<PathBuf, VlmError> {
    let unavailable = |e: hf_hub::api::sync::ApiError| {
        VlmError::CheckpointUnavailable(format!("{repo_id}: {e}"))
    };

    let api = Api::new().map_err(unavailable)?;
    let repo = match revision {
        Some(revision) => api.repo(Repo::with_revision(
            repo_id.to_string(),
            RepoType::Model,
            revision.to_string(),
        )),
        None => api.model(repo_id.to_string()),
    };

    log::info!("fetching {repo_id} from the hub");
    let config = repo.get(CONFIG_FILE).map_err(unavailable)?;
    let dir = config.parent().map(Path::to_path_buf).ok_or_else(|| {
        VlmError::CheckpointUnavailable(format!("{repo_id}: no snapshot directory"))
    })?;

    match repo.get(WEIGHTS_INDEX) {
        Ok(index) => {
            let data = std::fs::read_to_string(&index).map_err(|e| {
                VlmError::CheckpointUnavailable(format!("{}: {e}", index.display()))
            })?;
            for shard in shard_names(&data)? {
                repo.get(&shard).map_err(unavailable)?;
            }
        }
        Err(_) => {
            repo.get(SINGLE_WEIGHTS).map_err(unavailable)?;
        }
    }

    for file in OPTIONAL_FILES {
        if let Err(e) = repo.get(file) {
            log::debug!("{repo_id} has no {file}: {e}");
        }
    }
    Ok(dir)
}

/// Distinct shard file names of a `model.safetensors.index.json`, sorted.
fn shard_names(index: &str) -> Result<Vec<String>, VlmError> {
    #[derive(serde::Deserialize)]
    struct Index {
        weight_map: std::collections::BTreeMap<String, String>,
    }

    let index: Index = serde_json::from_str(index)
        .map_err(|e| VlmError::CheckpointUnavailable(format!("weight index: {e}")))?;
    let mut shards: Vec<String> = index.weight_map.into_values().collect();
    shards.sort();
    shards.dedup();
    Ok(shards)
}
