use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TagLockError {
    #[error("Method `acquire` has already been called on this mutex")]
    AlreadyAcquired,

    #[error("A mutex with the name `{name}` is already initialized")]
    AlreadyInitialized { name: String },

    #[error("A mutex with the name `{name}` has not been initialized (method `{method}`)")]
    NotInitialized { name: String, method: &'static str },

    #[error("Storage directory {path} is not usable: {source}")]
    StorageDirFailed { path: PathBuf, source: io::Error },

    #[error("Invalid table name `{0}`: only letters, digits and underscores are allowed")]
    InvalidTableName(String),

    #[error("Database failure: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("Key-value store failure: {0}")]
    Kv(#[from] redis::RedisError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("[mutex: {name}] {source}")]
    Named {
        name: String,
        #[source]
        source: Box<TagLockError>,
    },
}

impl TagLockError {
    /// Tag an error with the mutex name it occurred on.
    pub fn named(name: impl Into<String>, source: TagLockError) -> Self {
        match source {
            e @ TagLockError::Named { .. } => e,
            e => TagLockError::Named {
                name: name.into(),
                source: Box::new(e),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, TagLockError>;
