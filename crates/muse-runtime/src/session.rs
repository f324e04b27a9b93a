//! [`SessionStore`] – loaded characters and per-user chat state.
//!
//! Holds the character registry (name → profile and sample writing) and,
//! per user, the selected character and reply mode. All state sits behind a
//! single `tokio::sync::RwLock`; lookups take the read side and only
//! [`register_character`](SessionStore::register_character),
//! [`select_character`](SessionStore::select_character) and
//! [`set_mode`](SessionStore::set_mode) take the write side.
//!
//! # On-disk layout
//!
//! ```text
//! <characters_dir>/puck.json              # CharacterProfile
//! <writing_dir>/puck-best-posts.txt       # optional sample writing
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use muse_types::CharacterProfile;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Mode a user starts in.
pub const DEFAULT_MODE: &str = "chat";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid character sheet {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Character '{0}' is not loaded")]
    UnknownCharacter(String),
}

/// A playable character.
#[derive(Debug, Clone)]
pub struct Character {
    pub profile: Arc<CharacterProfile>,
    pub writing: Arc<str>,
}

/// File-name form of a character name: lowercase, spaces become `-`.
pub fn slug(name: &str) -> String {
    name.to_lowercase().replace(' ', "-")
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SessionError {
    let path = path.to_path_buf();
    move |source| SessionError::Io { path, source }
}

/// Read every `*.json` sheet in `dir`, pairing each with
/// `<writing_dir>/<stem>-best-posts.txt` when present.
///
/// Returned in file-name order. A sheet with an empty `name` takes its file
/// stem as the name.
pub fn load_characters(dir: &Path, writing_dir: &Path) -> Result<Vec<Character>, SessionError> {
    let mut sheets: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(io_err(dir))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    sheets.sort();

    let mut characters = Vec::with_capacity(sheets.len());
    for path in sheets {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let raw = std::fs::read_to_string(&path).map_err(io_err(&path))?;
        let mut profile: CharacterProfile =
            serde_json::from_str(&raw).map_err(|source| SessionError::Parse {
                path: path.clone(),
                source,
            })?;
        if profile.name.is_empty() {
            profile.name = stem.clone();
        }

        let writing_path = writing_dir.join(format!("{stem}-best-posts.txt"));
        let writing = match std::fs::read_to_string(&writing_path) {
            Ok(w) => w,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(character = %profile.name, "no sample writing");
                String::new()
            }
            Err(e) => return Err(io_err(&writing_path)(e)),
        };

        characters.push(Character {
            profile: Arc::new(profile),
            writing: writing.into(),
        });
    }
    Ok(characters)
}

#[derive(Default)]
struct Sessions {
    characters: BTreeMap<String, Character>,
    selected: HashMap<String, String>,
    modes: HashMap<String, String>,
}

/// Shared registry and per-user state. Cheap to wrap in an `Arc`.
#[derive(Default)]
pub struct SessionStore {
    default_character: Option<String>,
    inner: RwLock<Sessions>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Users without a selection get `name`.
    pub fn with_default_character(name: impl Into<String>) -> Self {
        Self {
            default_character: Some(name.into()),
            inner: RwLock::default(),
        }
    }

    /// Add or replace a character; returns its registry key.
    pub async fn register_character(&self, character: Character) -> String {
        let name = character.profile.name.clone();
        self.inner
            .write()
            .await
            .characters
            .insert(name.clone(), character);
        name
    }

    /// Load and register every character under `dir`.
    pub async fn load_from(&self, dir: &Path, writing_dir: &Path) -> Result<usize, SessionError> {
        let loaded = load_characters(dir, writing_dir)?;
        let count = loaded.len();
        let mut inner = self.inner.write().await;
        for character in loaded {
            inner
                .characters
                .insert(character.profile.name.clone(), character);
        }
        info!(count, dir = %dir.display(), "characters loaded");
        Ok(count)
    }

    pub async fn character(&self, name: &str) -> Option<Character> {
        self.inner.read().await.characters.get(name).cloned()
    }

    /// Registered names, sorted.
    pub async fn character_names(&self) -> Vec<String> {
        self.inner.read().await.characters.keys().cloned().collect()
    }

    /// Make `name` the active character for `user`.
    pub async fn select_character(&self, user: &str, name: &str) -> Result<Character, SessionError> {
        let mut inner = self.inner.write().await;
        let character = inner
            .characters
            .get(name)
            .cloned()
            .ok_or_else(|| SessionError::UnknownCharacter(name.to_string()))?;
        inner.selected.insert(user.to_string(), name.to_string());
        Ok(character)
    }

    /// The active character for `user`, falling back to the default one.
    pub async fn selected_character(&self, user: &str) -> Option<Character> {
        let inner = self.inner.read().await;
        let name = inner
            .selected
            .get(user)
            .or(self.default_character.as_ref())?;
        inner.characters.get(name).cloned()
    }

    pub async fn set_mode(&self, user: &str, mode: &str) {
        self.inner
            .write()
            .await
            .modes
            .insert(user.to_string(), mode.to_string());
    }

    pub async fn mode(&self, user: &str) -> String {
        self.inner
            .read()
            .await
            .modes
            .get(user)
            .cloned()
            .unwrap_or_else(|| DEFAULT_MODE.to_string())
    }
}
