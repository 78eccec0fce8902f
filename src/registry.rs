use crate::clock::{system_clock, SharedClock};
use crate::error::{Result, TagLockError};
use crate::mutex::TagMutex;
use crate::store::{DbStoreProvider, FileStoreProvider, KvStoreProvider, StoreProvider};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Process-wide facade: one mutex instance per name.
///
/// A name may be acquired at most once per registry lifetime; repeated
/// acquisition of the same name is an error, not a re-entrant lock.
/// Dropping the registry force-unlocks every mutex that never reached a
/// terminal status; this covers normal exit and unwinding, while abrupt
/// termination (an unhandled signal) is covered only by lease expiry.
pub struct MutexRegistry<P: StoreProvider> {
    provider: P,
    clock: SharedClock,
    mutexes: HashMap<String, TagMutex<P::Store>>,
}

pub type FileMutexRegistry = MutexRegistry<FileStoreProvider>;
pub type DbMutexRegistry = MutexRegistry<DbStoreProvider>;
pub type KvMutexRegistry = MutexRegistry<KvStoreProvider>;

impl<P: StoreProvider> MutexRegistry<P> {
    pub fn new(provider: P) -> Self {
        Self::with_clock(provider, system_clock())
    }

    pub fn with_clock(provider: P, clock: SharedClock) -> Self {
        MutexRegistry {
            provider,
            clock,
            mutexes: HashMap::new(),
        }
    }

    /// Acquire the named mutex, constructing its store on first use.
    pub fn acquire(&mut self, name: &str, lease_seconds: Option<i64>) -> Result<bool> {
        if self.mutexes.contains_key(name) {
            return Err(TagLockError::AlreadyInitialized {
                name: name.to_string(),
            });
        }
        let store = self
            .provider
            .open(name, &self.clock)
            .map_err(|e| TagLockError::named(name, e))?;
        let mutex = self
            .mutexes
            .entry(name.to_string())
            .or_insert_with(|| TagMutex::new(store, self.clock.clone()));
        mutex
            .acquire(lease_seconds)
            .map_err(|e| TagLockError::named(name, e))
    }

    pub fn release(&mut self, name: &str) -> Result<bool> {
        self.lookup(name, "release")?
            .release()
            .map_err(|e| TagLockError::named(name, e))
    }

    pub fn unlock(&mut self, name: &str) -> Result<bool> {
        self.lookup(name, "unlock")?
            .unlock()
            .map_err(|e| TagLockError::named(name, e))
    }

    pub fn is_intercepted(&mut self, name: &str) -> Result<bool> {
        self.lookup(name, "is_intercepted")?
            .is_intercepted()
            .map_err(|e| TagLockError::named(name, e))
    }

    pub fn is_completed(&self, name: &str) -> Result<bool> {
        let mutex = self
            .mutexes
            .get(name)
            .ok_or_else(|| TagLockError::NotInitialized {
                name: name.to_string(),
                method: "is_completed",
            })?;
        Ok(mutex.is_completed())
    }

    /// The live mutex instance behind a name, if one was acquired.
    pub fn mutex(&self, name: &str) -> Option<&TagMutex<P::Store>> {
        self.mutexes.get(name)
    }

    fn lookup(&mut self, name: &str, method: &'static str) -> Result<&mut TagMutex<P::Store>> {
        self.mutexes
            .get_mut(name)
            .ok_or_else(|| TagLockError::NotInitialized {
                name: name.to_string(),
                method,
            })
    }
}

impl<P: StoreProvider> Drop for MutexRegistry<P> {
    fn drop(&mut self) {
        for (name, mutex) in &mut self.mutexes {
            if mutex.status().is_none() {
                match mutex.unlock() {
                    Ok(_) => debug!("Unlocked mutex `{}` at registry shutdown", name),
                    Err(e) => warn!("Shutdown unlock of mutex `{}` failed: {}", name, e),
                }
            }
        }
    }
}
