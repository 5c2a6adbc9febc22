//! RocksDB-backed [`KvStore`].
//!
//! Column family:
//! - `kv`: one entry per durable key; the value is a bincode
//!   [`StoredValue`] envelope holding an LZ4-compressed payload and a
//!   checksum verified on every read.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{KvStore, StoreError};

const CF_KV: &str = "kv";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true, autosave writes are rare)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size (default: 8MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("gli_data"),
            block_cache_size: 32 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 8 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// On-disk envelope for a single value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredValue {
    /// Monotonically increasing write sequence
    pub sequence: u64,
    /// Uncompressed payload length
    pub original_size: u32,
    /// LZ4-compressed payload (size-prepended)
    pub compressed: Vec<u8>,
    /// FNV-1a over key, sequence and compressed payload
    pub checksum: u32,
}

impl StoredValue {
    pub fn new(key: &str, sequence: u64, payload: &[u8]) -> Self {
        let compressed = lz4_flex::compress_prepend_size(payload);
        let checksum = Self::compute_checksum(key, sequence, &compressed);
        Self {
            sequence,
            original_size: payload.len() as u32,
            compressed,
            checksum,
        }
    }

    pub fn verify(&self, key: &str) -> bool {
        self.checksum == Self::compute_checksum(key, self.sequence, &self.compressed)
    }

    pub fn payload(&self) -> Result<Vec<u8>, StoreError> {
        lz4_flex::decompress_size_prepended(&self.compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))
    }

    fn compute_checksum(key: &str, sequence: u64, compressed: &[u8]) -> u32 {
        let mut hash: u32 = 0x811c_9dc5;
        let mut mix = |byte: u8| {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        };
        key.bytes().for_each(&mut mix);
        sequence.to_le_bytes().into_iter().for_each(&mut mix);
        compressed.iter().copied().for_each(&mut mix);
        hash
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(value)
    }
}

/// RocksDB-backed durable store.
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode, concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    sequence: AtomicU64,
}

impl RocksStore {
    /// Open the store, creating the database and column family if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let descriptor = ColumnFamilyDescriptor::new(CF_KV, Self::cf_options(&config));
        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![descriptor],
        )?;

        let sequence = Self::recover_sequence(&db)?;
        log::info!(
            "Opened durable store at {} (next sequence {sequence})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
        })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        // Values are already LZ4 framed
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    /// Highest stored sequence + 1.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let cf = db
            .cf_handle(CF_KV)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_KV}' not found")))?;
        let mut next = 0u64;
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            if let Ok(stored) = StoredValue::decode(&value) {
                next = next.max(stored.sequence + 1);
            }
        }
        Ok(next)
    }

    /// Force memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Next write sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_KV)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_KV}' not found")))
    }
}

impl KvStore for RocksStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf()?;
        match self.db.get_cf(cf, key.as_bytes())? {
            Some(bytes) => {
                let stored = StoredValue::decode(&bytes)?;
                if !stored.verify(key) {
                    log::error!("Checksum mismatch reading '{key}'");
                    return Err(StoreError::ChecksumMismatch { key: key.to_string() });
                }
                stored.payload().map(Some)
            }
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf()?;
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let stored = StoredValue::new(key, seq, value);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(cf, key.as_bytes(), stored.encode()?, &write_opts)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let cf = self.cf()?;
        self.db.delete_cf(cf, key.as_bytes())?;
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let cf = self.cf()?;
        let mut keys = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let key = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            keys.push(key);
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_put_get_roundtrip() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

        store.put("gli_recovery_data", b"{\"a\":1}").unwrap();
        assert_eq!(
            store.get("gli_recovery_data").unwrap(),
            Some(b"{\"a\":1}".to_vec())
        );
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn test_data_survives_reopen_and_sequence_resumes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.put("a", b"1").unwrap();
            store.put("b", b"2").unwrap();
            store.sync().unwrap();
        }
        let store = RocksStore::open(StoreConfig::for_testing(&path)).unwrap();
        assert_eq!(store.get("b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.sequence(), 2);
    }

    #[test]
    fn test_prefix_scan_stops_at_prefix_boundary() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        store.put("contract_backup_a", b"x").unwrap();
        store.put("contract_backup_b", b"x").unwrap();
        store.put("contract_history_a", b"x").unwrap();

        let keys = store.keys_with_prefix("contract_backup_").unwrap();
        assert_eq!(keys, vec!["contract_backup_a", "contract_backup_b"]);
    }

    #[test]
    fn test_delete() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        store.put("k", b"v").unwrap();
        store.delete("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn test_envelope_detects_tampering() {
        let mut stored = StoredValue::new("k", 7, b"payload");
        assert!(stored.verify("k"));
        assert!(!stored.verify("other"));
        stored.compressed[0] ^= 0xFF;
        assert!(!stored.verify("k"));
    }

    #[test]
    fn test_envelope_compresses_repetitive_payload() {
        let payload = "The quick brown fox jumps over the lazy dog. ".repeat(100);
        let stored = StoredValue::new("k", 0, payload.as_bytes());
        assert!(stored.compressed.len() < payload.len() / 4);
        assert_eq!(stored.payload().unwrap(), payload.as_bytes());
    }
}
