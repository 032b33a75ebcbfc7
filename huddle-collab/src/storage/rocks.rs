//! RocksDB-backed file store.
//!
//! Column families:
//! - `files`: final text content per document (LZ4, size-prepended)
//! - `metadata`: per-file save bookkeeping (bincode)
//!
//! Keys are `project_id 0x00 file_path`, so a prefix scan over one
//! project's files stays contiguous.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{FileStore, StoreError};
use crate::protocol::DocumentKey;

const CF_FILES: &str = "files";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_FILES, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every save (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("huddle_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Save bookkeeping stored next to each file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Number of saves since the file was first written
    pub revision: u64,
    /// Uncompressed content size in bytes
    pub content_size: u64,
    /// Compressed size in bytes
    pub compressed_size: u64,
    /// Last save (seconds since epoch)
    pub updated_at: u64,
}

impl FileMetadata {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::DecodingError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DecodingError(e.to_string()))?;
        Ok(meta)
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Durable content store.
pub struct RocksFileStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksFileStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened file store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            // Values are already LZ4-compressed by us
            CF_FILES => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    /// Bookkeeping for a saved file.
    pub fn metadata(&self, key: &DocumentKey) -> Result<Option<FileMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        self.db
            .get_cf(cf, Self::key_bytes(key))?
            .map(|bytes| FileMetadata::decode(&bytes))
            .transpose()
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn key_bytes(key: &DocumentKey) -> Vec<u8> {
        let project = key.project_id.as_str().as_bytes();
        let path = key.file_path.as_bytes();
        let mut bytes = Vec::with_capacity(project.len() + 1 + path.len());
        bytes.extend_from_slice(project);
        bytes.push(0);
        bytes.extend_from_slice(path);
        bytes
    }
}

impl FileStore for RocksFileStore {
    fn load(&self, key: &DocumentKey) -> Result<Option<String>, StoreError> {
        let cf = self.cf(CF_FILES)?;
        let Some(compressed) = self.db.get_cf(cf, Self::key_bytes(key))? else {
            return Ok(None);
        };
        let raw = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        String::from_utf8(raw)
            .map(Some)
            .map_err(|e| StoreError::DecodingError(e.to_string()))
    }

    fn save(&self, key: &DocumentKey, content: &str) -> Result<(), StoreError> {
        let cf_files = self.cf(CF_FILES)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let key_bytes = Self::key_bytes(key);

        let compressed = lz4_flex::compress_prepend_size(content.as_bytes());
        let revision = self.metadata(key)?.map_or(0, |m| m.revision) + 1;
        let meta = FileMetadata {
            revision,
            content_size: content.len() as u64,
            compressed_size: compressed.len() as u64,
            updated_at: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_files, &key_bytes, &compressed);
        batch.put_cf(cf_meta, &key_bytes, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::debug!("Saved {key} (revision {revision}, {} bytes)", content.len());
        Ok(())
    }
}
