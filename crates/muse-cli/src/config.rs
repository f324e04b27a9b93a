//! Configuration vault – reads/writes `~/.muse/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;
use zeroize::{Zeroize, ZeroizeOnDrop};

use muse_memory::{MemoryStoreConfig, QdrantConfig, RecallConfig};
use muse_runtime::LlmConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write config at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Where recall vectors live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    #[default]
    Qdrant,
    Sqlite,
}

impl std::fmt::Display for VectorBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VectorBackend::Qdrant => write!(f, "qdrant"),
            VectorBackend::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// API key, wiped from memory on drop and never printed.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.0.is_empty() { "<not set>" } else { "<redacted>" })
    }
}

/// Persisted user configuration stored in `~/.muse/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the OpenAI-compatible endpoint.
    pub llm_base_url: String,
    pub chat_model: String,
    pub summary_model: String,
    pub embedding_model: String,
    #[serde(skip_serializing_if = "ApiKey::is_empty")]
    pub api_key: ApiKey,

    /// SQLite file holding channel events and summaries.
    pub memory_db_path: String,
    /// SQLite file holding scraped forum posts.
    pub archive_db_path: String,

    pub vector_backend: VectorBackend,
    /// SQLite file for the `sqlite` vector backend.
    pub vector_db_path: String,
    pub qdrant_host: String,
    /// Qdrant REST port.
    pub qdrant_port: u16,
    pub collection: String,
    pub vector_size: usize,
    pub recall_top_k: usize,

    pub summary_batch_cap: usize,

    pub characters_dir: String,
    /// Directory of `<name>-best-posts.txt` sample writing.
    pub writing_dir: String,
    /// Character used until a user picks one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_character: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm_base_url: "https://api.openai.com".to_string(),
            chat_model: "gpt-4.1-nano".to_string(),
            summary_model: "gpt-4.1-nano".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            api_key: ApiKey::default(),
            memory_db_path: "data/memory.db".to_string(),
            archive_db_path: "data/docs.db".to_string(),
            vector_backend: VectorBackend::default(),
            vector_db_path: "data/vectors.db".to_string(),
            qdrant_host: "localhost".to_string(),
            qdrant_port: 6333,
            collection: muse_memory::recall::DEFAULT_COLLECTION.to_string(),
            vector_size: muse_memory::recall::DEFAULT_DIMENSIONALITY,
            recall_top_k: muse_memory::recall::DEFAULT_TOP_K,
            summary_batch_cap: muse_memory::memory_store::DEFAULT_BATCH_CAP,
            characters_dir: "data/characters".to_string(),
            writing_dir: "data/writing".to_string(),
            default_character: None,
        }
    }
}

impl Config {
    pub fn llm_config(&self) -> LlmConfig {
        LlmConfig {
            base_url: self.llm_base_url.clone(),
            chat_model: self.chat_model.clone(),
            summary_model: self.summary_model.clone(),
            embedding_model: self.embedding_model.clone(),
            api_key: (!self.api_key.is_empty()).then(|| self.api_key.expose().to_string()),
            ..LlmConfig::default()
        }
    }

    pub fn memory_config(&self) -> MemoryStoreConfig {
        MemoryStoreConfig {
            batch_cap: self.summary_batch_cap,
            ..MemoryStoreConfig::default()
        }
    }

    pub fn recall_config(&self) -> RecallConfig {
        RecallConfig {
            collection: self.collection.clone(),
            dimensionality: self.vector_size,
            top_k: self.recall_top_k,
            ..RecallConfig::default()
        }
    }

    pub fn qdrant_config(&self) -> QdrantConfig {
        QdrantConfig {
            host: self.qdrant_host.clone(),
            port: self.qdrant_port,
            api_key: None,
        }
    }
}

/// Return the path to `~/.muse/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".muse").join("config.toml")
}

/// Load the config from disk with environment overrides applied.
/// Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, ConfigError> {
    let Some(mut cfg) = load_from(&config_path())? else {
        return Ok(None);
    };
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(toml::from_str(&raw)?))
}

/// Apply `MUSE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `MUSE_LLM_URL` | `llm_base_url` |
/// | `MUSE_MODEL` | `chat_model` |
/// | `MUSE_API_KEY`, then `OPENAI_API_KEY` | `api_key` |
/// | `MUSE_QDRANT_HOST` | `qdrant_host` |
/// | `MUSE_QDRANT_PORT` | `qdrant_port` |
/// | `MUSE_COLLECTION` | `collection` |
///
/// A value that does not parse is logged at `warn` and leaves the field
/// unchanged.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |name| std::env::var(name).ok());
}

/// Apply overrides read through `var`; returns the names of the variables
/// whose values were rejected.
pub(crate) fn apply_overrides(
    cfg: &mut Config,
    var: impl Fn(&str) -> Option<String>,
) -> Vec<&'static str> {
    let mut rejected = Vec::new();
    if let Some(v) = var("MUSE_LLM_URL") {
        cfg.llm_base_url = v;
    }
    if let Some(v) = var("MUSE_MODEL") {
        cfg.chat_model = v;
    }
    if let Some(v) = var("MUSE_API_KEY").or_else(|| var("OPENAI_API_KEY")) {
        cfg.api_key = ApiKey::new(v);
    }
    if let Some(v) = var("MUSE_QDRANT_HOST") {
        cfg.qdrant_host = v;
    }
    if let Some(v) = var("MUSE_QDRANT_PORT") {
        match v.parse::<u16>() {
            Ok(port) => cfg.qdrant_port = port,
            Err(e) => {
                warn!(value = %v, error = %e, "ignoring MUSE_QDRANT_PORT; keeping port {}", cfg.qdrant_port);
                rejected.push("MUSE_QDRANT_PORT");
            }
        }
    }
    if let Some(v) = var("MUSE_COLLECTION") {
        cfg.collection = v;
    }
    rejected
}

/// Save the config to disk, creating `~/.muse/` if necessary.
pub fn save(cfg: &Config) -> Result<(), ConfigError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(write_err)?;
        }
    }
    let raw = toml::to_string_pretty(cfg)?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}
