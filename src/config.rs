use std::path::PathBuf;
use std::time::Duration;

/// Default upper bound on how long a single lock may be held, in seconds.
pub const DEFAULT_MAX_LEASE_SECS: u32 = 14_400;

const DEFAULT_FILE_POLL: Duration = Duration::from_millis(100);
const DEFAULT_DB_POLL: Duration = Duration::from_millis(300);
const DEFAULT_KV_POLL: Duration = Duration::from_millis(100);

/// Settings for the file-backed store: one tag file per mutex under `dir`.
#[derive(Debug, Clone)]
pub struct FileStoreConfig {
    pub dir: PathBuf,
    /// Extension given to tag files, without the leading dot.
    pub extension: String,
    pub max_lease_secs: u32,
    /// How long a waiter sleeps between two lock checks.
    pub poll_interval: Duration,
}

impl FileStoreConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileStoreConfig {
            dir: dir.into(),
            extension: "tag".to_string(),
            max_lease_secs: DEFAULT_MAX_LEASE_SECS,
            poll_interval: DEFAULT_FILE_POLL,
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn with_max_lease(mut self, secs: u32) -> Self {
        self.max_lease_secs = secs;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Settings for the relational store: one row per mutex in `table`.
#[derive(Debug, Clone)]
pub struct DbStoreConfig {
    /// Path to the SQLite database file.
    pub database: PathBuf,
    pub table: String,
    pub max_lease_secs: u32,
    pub poll_interval: Duration,
}

impl DbStoreConfig {
    pub fn new(database: impl Into<PathBuf>) -> Self {
        DbStoreConfig {
            database: database.into(),
            table: "mutex_tags".to_string(),
            max_lease_secs: DEFAULT_MAX_LEASE_SECS,
            poll_interval: DEFAULT_DB_POLL,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_max_lease(mut self, secs: u32) -> Self {
        self.max_lease_secs = secs;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Settings for the key-value store: one key per mutex under `prefix`.
#[derive(Debug, Clone)]
pub struct KvStoreConfig {
    /// Connection URL, e.g. `redis://127.0.0.1/`.
    pub url: String,
    pub prefix: String,
    pub max_lease_secs: u32,
    pub poll_interval: Duration,
}

impl KvStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        KvStoreConfig {
            url: url.into(),
            prefix: "mutex_tags".to_string(),
            max_lease_secs: DEFAULT_MAX_LEASE_SECS,
            poll_interval: DEFAULT_KV_POLL,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_max_lease(mut self, secs: u32) -> Self {
        self.max_lease_secs = secs;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}
