//! Storage backends for mutex tags.
//!
//! Each backend implements the same low-level contract against one
//! physical medium. None of the media offers a native atomic
//! test-and-set; the protocol engine's double-check after a tentative
//! write is what resolves races, so the contract deliberately keeps
//! `lock_tag` unconditional.

mod db;
mod file;
mod kv;

pub use db::{DbContext, DbStoreProvider, DbTagManager, DbTagStore};
pub use file::{FileStoreProvider, FileTagManager, FileTagStore};
pub use kv::{KvContext, KvStoreProvider, KvTagManager, KvTagStore};

use crate::clock::SharedClock;
use crate::error::Result;
use std::time::Duration;

/// Low-level contract one storage medium implements for one mutex slot.
///
/// Contention is never resolved here: `lock_tag` overwrites whatever is
/// in the slot, and the caller re-reads with `locked_by_me` to detect a
/// lost race. Read paths are best-effort and report unusable state as
/// "not locked"; only write-path resource failures are fatal.
pub trait TagStore {
    /// Human-readable mutex name this store is bound to.
    fn name(&self) -> &str;

    /// Per-attempt owner token written into this store's tags.
    fn owner_id(&self) -> &str;

    fn max_lease_secs(&self) -> u32;

    fn poll_interval(&self) -> Duration;

    /// True iff a live tag currently occupies the slot, regardless of
    /// owner. Used only while waiting for a release.
    fn tag_exists(&mut self) -> Result<bool>;

    /// Unconditionally write a fresh tag for this attempt, after cheap
    /// randomized maintenance. `Ok(false)` means the write itself failed;
    /// `Err` means the medium is unusable (unwritable directory, dead
    /// connection).
    fn lock_tag(&mut self, lease_seconds: u32, expiry_time: i64) -> Result<bool>;

    /// True iff the slot holds a tag, live or not, written by this
    /// attempt. This is the race-detection primitive.
    fn locked_by_me(&mut self) -> Result<bool>;

    /// Remove the tag only if it still belongs to this attempt. A slot
    /// that is empty or owned by someone fresher is left alone and
    /// counts as success.
    fn unlock_tag(&mut self) -> Result<bool>;
}

/// Constructs one store per mutex name. Shared per-process resources
/// (connections, configuration) live on the provider and are handed to
/// each store it opens.
pub trait StoreProvider {
    type Store: TagStore;

    fn open(&self, name: &str, clock: &SharedClock) -> Result<Self::Store>;
}
