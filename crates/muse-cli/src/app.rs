//! Wiring: opens the stores, starts the actors and loads characters.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use muse_memory::{
    ArchiveError, ForumArchive, MemoryStore, QdrantIndex, RecallActor, SqliteVectorIndex,
    VectorIndex, VectorIndexError,
};
use muse_runtime::{LlmDriver, MemoryCore, MemoryExtraction, SessionStore};
use muse_types::MuseError;

use crate::config::{Config, VectorBackend};

/// REPL user id; the CLI has a single local user.
pub const LOCAL_USER: &str = "local";
/// Channel the REPL conversation is logged under.
pub const LOCAL_CHANNEL: &str = "cli";

#[derive(Error, Debug)]
pub enum StartupError {
    #[error("{0}")]
    Store(#[from] MuseError),
    #[error("Forum archive: {0}")]
    Archive(#[from] ArchiveError),
    #[error("Vector index: {0}")]
    Index(#[from] VectorIndexError),
    #[error("Cannot create data directory for {path}: {source}")]
    DataDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub struct App {
    pub config: Config,
    pub core: MemoryCore,
    pub driver: Arc<LlmDriver>,
    pub index: Arc<dyn VectorIndex>,
    pub sessions: SessionStore,
    /// Shared with blocking-pool tasks; see [`ForumArchive::blocking`].
    pub archive: Arc<ForumArchive>,
}

fn ensure_parent(path: &str) -> Result<(), StartupError> {
    match Path::new(path).parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            std::fs::create_dir_all(dir).map_err(|source| StartupError::DataDir {
                path: path.to_string(),
                source,
            })
        }
        _ => Ok(()),
    }
}

impl App {
    /// Open everything `config` names. Failing to open the memory store or
    /// the archive is fatal; an unreachable vector index and missing
    /// character files are not.
    pub async fn build(config: Config) -> Result<Self, StartupError> {
        let driver = Arc::new(LlmDriver::new(config.llm_config()));

        ensure_parent(&config.memory_db_path)?;
        let store = MemoryStore::open(&config.memory_db_path, driver.clone(), config.memory_config())?;

        ensure_parent(&config.archive_db_path)?;
        let archive = Arc::new(ForumArchive::open(&config.archive_db_path)?);

        let index: Arc<dyn VectorIndex> = match config.vector_backend {
            VectorBackend::Qdrant => Arc::new(QdrantIndex::new(config.qdrant_config())),
            VectorBackend::Sqlite => {
                ensure_parent(&config.vector_db_path)?;
                Arc::new(SqliteVectorIndex::open(&config.vector_db_path)?)
            }
        };
        if let Err(e) = index.ensure_index(&config.collection, config.vector_size).await {
            warn!(error = %e, collection = %config.collection, "vector index not ready; recall will be empty");
        }

        let recall = RecallActor::spawn(driver.clone(), index.clone(), config.recall_config());

        let sessions = match &config.default_character {
            Some(name) => SessionStore::with_default_character(name.clone()),
            None => SessionStore::new(),
        };
        if let Err(e) = sessions
            .load_from(Path::new(&config.characters_dir), Path::new(&config.writing_dir))
            .await
        {
            warn!(error = %e, "no characters loaded");
        }

        info!(backend = %config.vector_backend, "muse ready");
        let extraction = MemoryExtraction::new(driver.clone(), driver.clone());
        Ok(Self {
            core: MemoryCore::new(store, recall).with_extraction(extraction),
            driver,
            index,
            sessions,
            archive,
            config,
        })
    }
}
