//! Named cross-process mutexes coordinated through shared storage.
//!
//! Lock state lives in an external store (plain files, a relational
//! table, or a key-value server) so unrelated processes can coordinate
//! access to a critical resource without OS lock primitives. None of the
//! media offers atomic test-and-set; the protocol writes a tentative
//! claim, settles briefly, then re-reads the slot to detect a lost race.
//! Leases bound how long a crashed holder can block everyone else, and a
//! randomized sweep removes abandoned claims.
//!
//! Waiters are served in no particular order.

pub mod clock;
pub mod config;
pub mod error;
pub mod mutex;
pub mod registry;
pub mod store;
pub mod tag;

pub use clock::{Clock, SharedClock, SystemClock};
pub use config::{DbStoreConfig, FileStoreConfig, KvStoreConfig};
pub use error::{Result, TagLockError};
pub use mutex::TagMutex;
pub use registry::{DbMutexRegistry, FileMutexRegistry, KvMutexRegistry, MutexRegistry};
pub use store::{
    DbContext, DbStoreProvider, FileStoreProvider, KvContext, KvStoreProvider, StoreProvider,
    TagStore,
};
pub use tag::Tag;
