use crate::clock::SharedClock;
use crate::error::{Result, TagLockError};
use crate::store::TagStore;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::debug;

/// The settle pause grows with the observed wait cycle by this factor.
const SETTLE_TIME_FACTOR: i64 = 2;

/// Floor for the settle pause between the tentative write and the
/// verify read.
const MIN_SETTLE_PAUSE: Duration = Duration::from_micros(10);

/// Protocol engine for one named mutex.
///
/// Runs the wait/lock/settle/verify loop against a single backend store.
/// The store's slot is the only shared state; races with other processes
/// are detected after the fact by re-reading the slot, never prevented
/// up front.
///
/// `status` is write-once: the first terminal outcome of
/// `release`/`unlock` is cached and every later call returns it.
pub struct TagMutex<S: TagStore> {
    store: S,
    clock: SharedClock,
    lease_seconds: u32,
    expiry_time: i64,
    acquired: bool,
    status: Option<bool>,
    cycle_started: DateTime<Utc>,
}

impl<S: TagStore> TagMutex<S> {
    pub fn new(store: S, clock: SharedClock) -> Self {
        let cycle_started = clock.now();
        TagMutex {
            store,
            clock,
            lease_seconds: 0,
            expiry_time: 0,
            acquired: false,
            status: None,
            cycle_started,
        }
    }

    pub fn name(&self) -> &str {
        self.store.name()
    }

    /// Internal state: `None` while not yet terminal, then the cached
    /// outcome of the first `release`/`unlock`.
    pub fn status(&self) -> Option<bool> {
        self.status
    }

    /// Unix timestamp at which the current lease ends (0 before a lock
    /// was attempted).
    pub fn expiry_time(&self) -> i64 {
        self.expiry_time
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Acquire the lock, waiting out any current holder.
    ///
    /// `lease_seconds`: `None` or a value above the backend maximum
    /// clamps to that maximum; zero or negative disables locking for
    /// this instance entirely: the call reports success, storage is
    /// never contacted, and every later method short-circuits.
    ///
    /// Returns `Ok(false)` when the backend failed mid-protocol;
    /// `Err(AlreadyAcquired)` when this instance already reached a
    /// terminal status.
    pub fn acquire(&mut self, lease_seconds: Option<i64>) -> Result<bool> {
        let max = i64::from(self.store.max_lease_secs());
        let resolved = match lease_seconds {
            Some(requested) if requested < 0 => 0,
            Some(requested) => requested.min(max),
            None => max,
        };
        if self.status.is_some() {
            return Err(TagLockError::AlreadyAcquired);
        }
        self.lease_seconds = resolved as u32;
        if self.lease_seconds == 0 {
            debug!("Locking disabled for mutex `{}`", self.store.name());
            return Ok(true);
        }
        let acquired = self.wait_and_lock()?;
        self.acquired = acquired;
        Ok(acquired)
    }

    /// Release the lock and report the outcome.
    ///
    /// A release after the lease has already elapsed still cleans up
    /// storage, but reports failure: past the lease window there is no
    /// guarantee the lock was held.
    pub fn release(&mut self) -> Result<bool> {
        if self.lease_seconds == 0 {
            return Ok(true);
        }
        if let Some(status) = self.status {
            return Ok(status);
        }
        if self.is_completed() {
            self.close()?;
            self.status = Some(false);
            return Ok(false);
        }
        let released = self.close()?;
        self.status = Some(released);
        Ok(released)
    }

    /// Force the unlock regardless of lease timing; otherwise identical
    /// to `release`.
    pub fn unlock(&mut self) -> Result<bool> {
        if self.lease_seconds == 0 {
            return Ok(true);
        }
        if let Some(status) = self.status {
            return Ok(status);
        }
        let released = self.close()?;
        self.status = Some(released);
        Ok(released)
    }

    /// True when another attempt has taken over the slot since this one
    /// last held it.
    pub fn is_intercepted(&mut self) -> Result<bool> {
        if self.lease_seconds == 0 {
            return Ok(false);
        }
        if let Some(status) = self.status {
            return Ok(!status);
        }
        Ok(!self.store.locked_by_me()?)
    }

    /// Pure time check: has the lease window elapsed? Independent of
    /// `status`.
    pub fn is_completed(&self) -> bool {
        self.clock.unix_secs() > self.expiry_time
    }

    /// One pass of the wait queue: poll until no live tag occupies the
    /// slot. A storage error aborts the acquisition.
    fn wait(&mut self) -> bool {
        loop {
            self.cycle_started = self.clock.now();
            match self.store.tag_exists() {
                Ok(false) => return true,
                Ok(true) => self.clock.sleep(self.store.poll_interval()),
                Err(e) => {
                    debug!(
                        "Wait for mutex `{}` aborted by storage error: {}",
                        self.store.name(),
                        e
                    );
                    return false;
                }
            }
        }
    }

    /// Sleep between the tentative write and the verify read,
    /// proportionally to the last observed wait cycle: the slower the
    /// polling under contention, the longer competing writes take to
    /// land.
    fn settle(&self) {
        let elapsed = self
            .clock
            .now()
            .signed_duration_since(self.cycle_started)
            .num_microseconds()
            .unwrap_or(0)
            .max(0);
        let pause = Duration::from_micros((elapsed * SETTLE_TIME_FACTOR) as u64);
        self.clock.sleep(pause.max(MIN_SETTLE_PAUSE));
    }

    fn wait_and_lock(&mut self) -> Result<bool> {
        loop {
            if !self.wait() {
                return Ok(false);
            }
            self.expiry_time = self.clock.unix_secs() + i64::from(self.lease_seconds);
            if !self
                .store
                .lock_tag(self.lease_seconds, self.expiry_time)?
            {
                return Ok(false);
            }
            self.settle();
            if self.store.locked_by_me()? {
                debug!("Mutex `{}` acquired", self.store.name());
                return Ok(true);
            }
            // Another attempt clobbered the slot between our write and
            // the re-read; back into the queue.
            debug!(
                "Mutex `{}` lost the race after a tentative write, retrying",
                self.store.name()
            );
        }
    }

    /// Physical unlock shared by `release` and `unlock`: never removes a
    /// slot that no longer belongs to this attempt.
    fn close(&mut self) -> Result<bool> {
        if !self.acquired {
            return Ok(false);
        }
        if self.store.locked_by_me()? {
            self.store.unlock_tag()
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex as StdMutex};

    #[derive(Default)]
    struct Counters {
        exists: usize,
        lock: usize,
        mine: usize,
        unlock: usize,
    }

    /// Scripted store: each call pops the next result from its queue and
    /// falls back to an uncontended default when the queue runs dry.
    struct MockStore {
        max_lease: u32,
        poll: Duration,
        exists_script: VecDeque<Result<bool>>,
        lock_script: VecDeque<Result<bool>>,
        mine_script: VecDeque<Result<bool>>,
        unlock_script: VecDeque<Result<bool>>,
        calls: Counters,
    }

    impl MockStore {
        fn free() -> Self {
            MockStore {
                max_lease: 14_400,
                poll: Duration::from_millis(100),
                exists_script: VecDeque::new(),
                lock_script: VecDeque::new(),
                mine_script: VecDeque::new(),
                unlock_script: VecDeque::new(),
                calls: Counters::default(),
            }
        }

        fn total_calls(&self) -> usize {
            self.calls.exists + self.calls.lock + self.calls.mine + self.calls.unlock
        }
    }

    fn io_err() -> TagLockError {
        TagLockError::Io(io::Error::new(io::ErrorKind::Other, "backend down"))
    }

    impl TagStore for MockStore {
        fn name(&self) -> &str {
            "test-mutex"
        }

        fn owner_id(&self) -> &str {
            "mock-owner"
        }

        fn max_lease_secs(&self) -> u32 {
            self.max_lease
        }

        fn poll_interval(&self) -> Duration {
            self.poll
        }

        fn tag_exists(&mut self) -> Result<bool> {
            self.calls.exists += 1;
            self.exists_script.pop_front().unwrap_or(Ok(false))
        }

        fn lock_tag(&mut self, _lease_seconds: u32, _expiry_time: i64) -> Result<bool> {
            self.calls.lock += 1;
            self.lock_script.pop_front().unwrap_or(Ok(true))
        }

        fn locked_by_me(&mut self) -> Result<bool> {
            self.calls.mine += 1;
            self.mine_script.pop_front().unwrap_or(Ok(true))
        }

        fn unlock_tag(&mut self) -> Result<bool> {
            self.calls.unlock += 1;
            self.unlock_script.pop_front().unwrap_or(Ok(true))
        }
    }

    /// Clock whose time only moves when something sleeps.
    #[derive(Clone)]
    struct ManualClock {
        now: Arc<StdMutex<DateTime<Utc>>>,
        slept: Arc<StdMutex<Vec<Duration>>>,
    }

    impl ManualClock {
        fn new() -> Self {
            ManualClock {
                now: Arc::new(StdMutex::new(Utc::now())),
                slept: Arc::new(StdMutex::new(Vec::new())),
            }
        }

        fn advance_secs(&self, secs: i64) {
            let mut now = self.now.lock().unwrap();
            *now += chrono::Duration::seconds(secs);
        }

        fn sleeps(&self) -> Vec<Duration> {
            self.slept.lock().unwrap().clone()
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }

        fn sleep(&self, period: Duration) {
            self.slept.lock().unwrap().push(period);
            let mut now = self.now.lock().unwrap();
            *now += chrono::Duration::from_std(period).unwrap_or_default();
        }
    }

    fn mutex_with(store: MockStore) -> (TagMutex<MockStore>, ManualClock) {
        let clock = ManualClock::new();
        let mutex = TagMutex::new(store, Arc::new(clock.clone()));
        (mutex, clock)
    }

    #[test]
    fn disabled_lease_never_touches_storage() {
        for lease in [Some(0), Some(-5)] {
            let (mut mutex, _clock) = mutex_with(MockStore::free());
            assert!(mutex.acquire(lease).unwrap());
            assert!(!mutex.is_intercepted().unwrap());
            assert!(mutex.release().unwrap());
            assert!(mutex.unlock().unwrap());
            assert_eq!(mutex.store().total_calls(), 0);
        }
    }

    #[test]
    fn uncontended_acquire_release() {
        let (mut mutex, _clock) = mutex_with(MockStore::free());
        assert!(mutex.acquire(None).unwrap());
        assert_eq!(mutex.status(), None);
        assert!(!mutex.is_completed());
        assert!(!mutex.is_intercepted().unwrap());

        assert!(mutex.release().unwrap());
        assert_eq!(mutex.status(), Some(true));
        assert!(!mutex.is_intercepted().unwrap());

        let calls = &mutex.store().calls;
        assert_eq!(calls.exists, 1);
        assert_eq!(calls.lock, 1);
        assert_eq!(calls.unlock, 1);
    }

    #[test]
    fn release_is_idempotent_after_terminal_status() {
        let (mut mutex, _clock) = mutex_with(MockStore::free());
        assert!(mutex.acquire(Some(60)).unwrap());
        let first = mutex.release().unwrap();
        let unlocks = mutex.store().calls.unlock;
        assert_eq!(mutex.release().unwrap(), first);
        assert_eq!(mutex.unlock().unwrap(), first);
        // Cached outcome, no further storage traffic.
        assert_eq!(mutex.store().calls.unlock, unlocks);
    }

    #[test]
    fn acquire_after_terminal_status_fails_loudly() {
        let (mut mutex, _clock) = mutex_with(MockStore::free());
        assert!(mutex.acquire(Some(60)).unwrap());
        assert!(mutex.release().unwrap());
        assert!(matches!(
            mutex.acquire(Some(60)),
            Err(TagLockError::AlreadyAcquired)
        ));
    }

    #[test]
    fn waits_out_a_live_tag() {
        let mut store = MockStore::free();
        store.exists_script = VecDeque::from([Ok(true), Ok(true), Ok(false)]);
        let (mut mutex, clock) = mutex_with(store);
        assert!(mutex.acquire(Some(30)).unwrap());

        let sleeps = clock.sleeps();
        let polls = sleeps
            .iter()
            .filter(|d| **d == Duration::from_millis(100))
            .count();
        assert_eq!(polls, 2);
        assert_eq!(mutex.store().calls.exists, 3);
    }

    #[test]
    fn settle_pause_has_a_floor() {
        let (mut mutex, clock) = mutex_with(MockStore::free());
        assert!(mutex.acquire(Some(30)).unwrap());
        assert!(clock.sleeps().iter().any(|d| *d >= MIN_SETTLE_PAUSE));
    }

    #[test]
    fn lost_race_retries_until_verified() {
        let mut store = MockStore::free();
        store.mine_script = VecDeque::from([Ok(false), Ok(true)]);
        let (mut mutex, _clock) = mutex_with(store);
        assert!(mutex.acquire(Some(30)).unwrap());
        assert_eq!(mutex.store().calls.lock, 2);
        assert_eq!(mutex.store().calls.mine, 2);
    }

    #[test]
    fn storage_error_during_wait_aborts_as_failed() {
        let mut store = MockStore::free();
        store.exists_script = VecDeque::from([Err(io_err())]);
        let (mut mutex, _clock) = mutex_with(store);
        assert!(!mutex.acquire(Some(30)).unwrap());
        assert_eq!(mutex.store().calls.lock, 0);
    }

    #[test]
    fn failed_write_aborts_as_failed() {
        let mut store = MockStore::free();
        store.lock_script = VecDeque::from([Ok(false)]);
        let (mut mutex, _clock) = mutex_with(store);
        assert!(!mutex.acquire(Some(30)).unwrap());
        // A failed acquisition releases nothing later.
        assert!(!mutex.release().unwrap());
        assert_eq!(mutex.store().calls.unlock, 0);
    }

    #[test]
    fn fatal_write_error_propagates() {
        let mut store = MockStore::free();
        store.lock_script = VecDeque::from([Err(io_err())]);
        let (mut mutex, _clock) = mutex_with(store);
        assert!(mutex.acquire(Some(30)).is_err());
    }

    #[test]
    fn release_after_elapsed_lease_reports_false_but_cleans_up() {
        let (mut mutex, clock) = mutex_with(MockStore::free());
        assert!(mutex.acquire(Some(1)).unwrap());
        clock.advance_secs(2);
        assert!(mutex.is_completed());
        assert!(!mutex.release().unwrap());
        // Storage was still cleaned up.
        assert_eq!(mutex.store().calls.unlock, 1);
        assert!(mutex.is_intercepted().unwrap());
    }

    #[test]
    fn unlock_ignores_elapsed_lease() {
        let (mut mutex, clock) = mutex_with(MockStore::free());
        assert!(mutex.acquire(Some(1)).unwrap());
        clock.advance_secs(2);
        assert!(mutex.unlock().unwrap());
        assert_eq!(mutex.status(), Some(true));
    }

    #[test]
    fn release_when_slot_moved_on_leaves_it_alone() {
        let mut store = MockStore::free();
        // Verify succeeds at acquire time, but by release time another
        // attempt owns the slot.
        store.mine_script = VecDeque::from([Ok(true), Ok(false)]);
        let (mut mutex, _clock) = mutex_with(store);
        assert!(mutex.acquire(Some(30)).unwrap());
        assert!(!mutex.release().unwrap());
        assert_eq!(mutex.store().calls.unlock, 0);
    }

    #[test]
    fn interception_reflects_slot_ownership() {
        let mut store = MockStore::free();
        store.mine_script = VecDeque::from([Ok(true), Ok(true), Ok(false)]);
        let (mut mutex, _clock) = mutex_with(store);
        assert!(mutex.acquire(Some(30)).unwrap());
        assert!(!mutex.is_intercepted().unwrap());
        assert!(mutex.is_intercepted().unwrap());
    }

    #[test]
    fn lease_clamps_to_backend_maximum() {
        let (mut mutex, clock) = mutex_with(MockStore::free());
        let before = clock.now().timestamp();
        assert!(mutex.acquire(Some(1_000_000)).unwrap());
        assert!(mutex.expiry_time() <= before + 14_400 + 1);
        assert!(mutex.expiry_time() >= before + 14_400);
    }
}
