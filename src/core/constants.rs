/// Default value for `Config::data_dir`.
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Default value for `Config::wal_dir`.
pub const DEFAULT_WAL_DIR: &str = "./wal";

/// Default value for `Config::sync_writes`.
pub const DEFAULT_SYNC_WRITES: bool = true;

/// Default value for `Config::checkpoint_ops`.
pub const DEFAULT_CHECKPOINT_OPS: u64 = 1000;

/// Default value for `Config::checkpoint_interval_s`.
pub const DEFAULT_CHECKPOINT_INTERVAL_S: u64 = 300;

/// Default value for `Config::max_concurrent_transactions`.
pub const DEFAULT_MAX_CONCURRENT_TRANSACTIONS: usize = 100;

/// Collection metadata schema version written to every collection file.
pub const COLLECTION_SCHEMA_VERSION: u32 = 1;

/// Name of the WAL file under `wal_dir`.
pub const WAL_FILE_NAME: &str = "wal.log";
