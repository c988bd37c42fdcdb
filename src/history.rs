use std::path::PathBuf;
use std::sync::Mutex;

use serde_json::{Map, Value};

use crate::error::HistoryError;
use crate::protocol::ChatMessage;

pub const HISTORY_KEY: &str = "chat_history";

pub trait HistoryStore: Send + Sync {
    /// Stored messages, or an empty list when nothing was saved yet.
    fn load(&self) -> Result<Vec<ChatMessage>, HistoryError>;

    fn save(&self, messages: &[ChatMessage]) -> Result<(), HistoryError>;
}

/// Key-value document on disk holding the history under [`HISTORY_KEY`].
pub struct FileHistoryStore {
    path: PathBuf,
}

impl FileHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_document(&self) -> Result<Map<String, Value>, HistoryError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(source) => {
                return Err(HistoryError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        if raw.trim().is_empty() {
            return Ok(Map::new());
        }

        serde_json::from_str(&raw).map_err(|source| HistoryError::Json {
            path: self.path.clone(),
            source,
        })
    }

    fn io_error(&self, source: std::io::Error) -> HistoryError {
        HistoryError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl HistoryStore for FileHistoryStore {
    fn load(&self) -> Result<Vec<ChatMessage>, HistoryError> {
        let mut document = self.read_document()?;
        match document.remove(HISTORY_KEY) {
            Some(value) => serde_json::from_value(value).map_err(|source| HistoryError::Json {
                path: self.path.clone(),
                source,
            }),
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, messages: &[ChatMessage]) -> Result<(), HistoryError> {
        // Unreadable documents are replaced rather than blocking every save.
        let mut document = self.read_document().unwrap_or_default();
        let value = serde_json::to_value(messages).map_err(|source| HistoryError::Json {
            path: self.path.clone(),
            source,
        })?;
        document.insert(HISTORY_KEY.to_string(), value);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| self.io_error(err))?;
        }

        let raw = serde_json::to_string_pretty(&document).map_err(|source| HistoryError::Json {
            path: self.path.clone(),
            source,
        })?;
        std::fs::write(&self.path, raw).map_err(|err| self.io_error(err))
    }
}

/// In-process store used when history is not persisted.
#[derive(Default)]
pub struct MemoryHistoryStore {
    messages: Mutex<Vec<ChatMessage>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn load(&self) -> Result<Vec<ChatMessage>, HistoryError> {
        Ok(self
            .messages
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default())
    }

    fn save(&self, messages: &[ChatMessage]) -> Result<(), HistoryError> {
        if let Ok(mut stored) = self.messages.lock() {
            *stored = messages.to_vec();
        }
        Ok(())
    }
}

pub fn default_history_path() -> PathBuf {
    data_dir().join("history.json")
}

pub fn data_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        return PathBuf::from(home).join(".gemma-chat");
    }

    PathBuf::from(".gemma-chat")
}
