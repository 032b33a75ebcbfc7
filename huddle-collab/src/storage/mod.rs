//! File persistence collaborator.
//!
//! The collaboration core never stores CRDT state. It hands the final text
//! content of a document to a [`FileStore`], an idempotent upsert keyed by
//! [`DocumentKey`], and reads it back when a session is first created.
//!
//! ```text
//! DocumentSession ──(save: content)──► FileStore ──► MemoryFileStore
//!        ▲                                       └─► RocksFileStore (LZ4)
//!        └───────(load on first attach)──────────┘
//! ```

pub mod rocks;

pub use rocks::{RocksFileStore, StoreConfig};

use std::collections::HashMap;
use std::sync::RwLock;

use crate::protocol::DocumentKey;

/// Idempotent content store for documents.
pub trait FileStore: Send + Sync {
    /// Current content, or `None` if the file has never been saved.
    fn load(&self, key: &DocumentKey) -> Result<Option<String>, StoreError>;

    /// Upsert the full content of a file.
    fn save(&self, key: &DocumentKey, content: &str) -> Result<(), StoreError>;
}

/// Volatile store, the default when no storage path is configured.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: RwLock<HashMap<DocumentKey, String>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file's content.
    pub fn with_file(self, key: DocumentKey, content: impl Into<String>) -> Self {
        if let Ok(mut files) = self.files.write() {
            files.insert(key, content.into());
        }
        self
    }

    pub fn len(&self) -> usize {
        self.files.read().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FileStore for MemoryFileStore {
    fn load(&self, key: &DocumentKey) -> Result<Option<String>, StoreError> {
        let files = self.files.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(files.get(key).cloned())
    }

    fn save(&self, key: &DocumentKey, content: &str) -> Result<(), StoreError> {
        let mut files = self.files.write().map_err(|_| StoreError::LockPoisoned)?;
        files.insert(key.clone(), content.to_string());
        Ok(())
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Compression error
    CompressionError(String),
    /// Stored bytes are not valid UTF-8 text
    DecodingError(String),
    /// A store lock was poisoned by a panicking writer
    LockPoisoned,
    /// I/O error
    IoError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::DecodingError(e) => write!(f, "Decoding error: {e}"),
            StoreError::LockPoisoned => write!(f, "Store lock poisoned"),
            StoreError::IoError(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}
