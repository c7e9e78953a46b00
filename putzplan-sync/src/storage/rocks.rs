//! RocksDB-backed [`Storage`].
//!
//! Column families:
//! - `snapshots`: cache and queue snapshots, keyed by `shopping/<household>/<kind>`
//!
//! Snapshots are already LZ4-compressed by the snapshot codec, so the column
//! family itself stores them uncompressed. Writes are fsynced by default: a
//! mutation only counts as persisted once it would survive a crash.

use std::path::PathBuf;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Options, SingleThreaded, WriteOptions,
};

use super::{Storage, StoreError};

const CF_SNAPSHOTS: &str = "snapshots";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 8MB, one list per client)
    pub block_cache_size: usize,
    /// fsync on every write (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 64)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("putzplan_data"),
            block_cache_size: 8 * 1024 * 1024,
            sync_writes: true,
            max_open_files: 64,
        }
    }
}

impl StoreConfig {
    /// Config for testing (tiny cache, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 1024 * 1024,
            sync_writes: false,
            max_open_files: 16,
        }
    }
}

pub struct RocksStorage {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStorage {
    /// Open (or create) the database at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(2);

        let mut cf_opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        cf_opts.set_block_based_table_factory(&block_opts);
        cf_opts.set_compression_type(DBCompressionType::None);
        cf_opts.optimize_for_point_lookup(config.block_cache_size as u64);

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![ColumnFamilyDescriptor::new(CF_SNAPSHOTS, cf_opts)],
        )?;

        log::info!("Opened snapshot store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf(&self) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_SNAPSHOTS)
            .ok_or_else(|| StoreError::Database(format!("missing column family {CF_SNAPSHOTS}")))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

impl Storage for RocksStorage {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf()?;
        Ok(self.db.get_cf(cf, key.as_bytes())?)
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf()?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.put_cf_opt(cf, key.as_bytes(), value, &write_opts)?;
        Ok(())
    }
}
