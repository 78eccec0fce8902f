use crate::clock::SharedClock;
use crate::config::KvStoreConfig;
use crate::error::Result;
use crate::store::{StoreProvider, TagStore};
use crate::tag::{owner_token, tag_id, Tag, FIELD_DELIMITER};
use rand::seq::SliceRandom;
use rand::Rng;
use redis::{Commands, Connection, RedisResult};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

/// Number of randomly chosen keys every sweep leaves untouched.
const SWEEP_KEEP_HEAD: usize = 5;

/// One sweep runs per this many lock attempts, on average. Rarer than
/// the other backends: the key scan touches the whole prefix.
const SWEEP_DICE: u32 = 21;

/// Shared key-value connection, one per process. Established eagerly:
/// an unreachable server fails construction, not individual reads.
#[derive(Clone)]
pub struct KvContext {
    conn: Arc<Mutex<Connection>>,
    config: KvStoreConfig,
}

impl KvContext {
    pub fn open(config: KvStoreConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = client.get_connection()?;
        Ok(KvContext {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    pub fn config(&self) -> &KvStoreConfig {
        &self.config
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Key-level access to the mutex slots. Read paths swallow connection
/// hiccups and report "nothing found"; the sweep is best-effort.
#[derive(Clone)]
pub struct KvTagManager {
    ctx: KvContext,
    clock: SharedClock,
}

impl KvTagManager {
    pub fn new(ctx: KvContext, clock: SharedClock) -> Self {
        KvTagManager { ctx, clock }
    }

    fn key(&self, tag_id: &str) -> String {
        format!("{}-{}", self.ctx.config.prefix, tag_id)
    }

    /// Serialize a tag to its stored form: 5 colon-delimited fields with
    /// the id first and the name last, so the name may contain the
    /// delimiter.
    pub fn encode(tag_id: &str, tag: &Tag) -> String {
        let d = FIELD_DELIMITER;
        format!(
            "{tag_id}{d}{}{d}{}{d}{}{d}{}",
            tag.expiry_time(),
            tag.lease_seconds(),
            tag.owner_id(),
            tag.name()
        )
    }

    /// Parse the stored form back into a tag. Trailing fields are
    /// rejoined into the name.
    pub fn decode(data: &str) -> Option<Tag> {
        let mut parts = data.splitn(5, FIELD_DELIMITER);
        let _tag_id = parts.next()?;
        let expiry = parts.next()?.parse::<i64>().ok()?;
        let lease = parts.next()?.parse::<u32>().ok()?;
        let owner = parts.next()?;
        let name = parts.next()?;
        Some(Tag::new(expiry, lease, owner, name))
    }

    pub fn get_tag(&self, tag_id: &str) -> Option<Tag> {
        let key = self.key(tag_id);
        let mut conn = self.ctx.lock_conn();
        let data: RedisResult<Option<String>> = conn.get(&key);
        match data {
            Ok(Some(data)) => Self::decode(&data),
            Ok(None) => None,
            Err(e) => {
                debug!("Read of key {} failed: {}", key, e);
                None
            }
        }
    }

    /// Unconditionally overwrite the slot with a fresh tag.
    pub fn save_tag(&self, tag_id: &str, tag: &Tag) -> bool {
        let key = self.key(tag_id);
        let data = Self::encode(tag_id, tag);
        let mut conn = self.ctx.lock_conn();
        let res: RedisResult<()> = conn.set(&key, data);
        match res {
            Ok(()) => true,
            Err(e) => {
                warn!("Write of key {} failed: {}", key, e);
                false
            }
        }
    }

    pub fn delete_tag(&self, tag_id: &str) -> bool {
        let key = self.key(tag_id);
        let mut conn = self.ctx.lock_conn();
        let res: RedisResult<()> = conn.del(&key);
        match res {
            Ok(()) => true,
            Err(e) => {
                debug!("Delete of key {} failed: {}", key, e);
                false
            }
        }
    }

    /// Delete the slot only while it still carries this attempt's owner
    /// id; an empty slot or someone fresher's tag counts as success.
    pub fn delete_owned_tag(&self, tag_id: &str, owner_id: &str) -> bool {
        match self.get_tag(tag_id) {
            Some(tag) if tag.owner_id() == owner_id => self.delete_tag(tag_id),
            _ => true,
        }
    }

    /// Remove abandoned keys under the mutex prefix. A shuffled head of
    /// the sample always survives; the rest is dropped when its value is
    /// missing or unparsable, or its tag expired beyond the grace window
    /// of one full maximum lease.
    pub fn sweep_expired(&self) {
        let pattern = format!("{}-*", self.ctx.config.prefix);
        let keys: Vec<String> = {
            let mut conn = self.ctx.lock_conn();
            match conn.keys(&pattern) {
                Ok(keys) => keys,
                Err(e) => {
                    debug!("Key scan {} failed: {}", pattern, e);
                    return;
                }
            }
        };
        let mut keys = keys;
        keys.shuffle(&mut rand::thread_rng());
        let now = self.clock.unix_secs();
        let grace = i64::from(self.ctx.config.max_lease_secs);
        for key in keys.into_iter().skip(SWEEP_KEEP_HEAD) {
            let mut conn = self.ctx.lock_conn();
            let data: RedisResult<Option<String>> = conn.get(&key);
            let stale = match data {
                Ok(Some(data)) => match Self::decode(&data) {
                    Some(tag) => tag.expiry_time() < now && tag.expiry_time() + grace < now,
                    None => true,
                },
                Ok(None) => true,
                Err(_) => false,
            };
            if stale {
                debug!("Removing stale mutex key: {}", key);
                let _: RedisResult<()> = conn.del(&key);
            }
        }
    }

    pub fn find_tag(&self, name: &str) -> Option<Tag> {
        self.get_tag(&tag_id(name))
    }

    /// All stored tags under the prefix, live or not.
    pub fn all_tags(&self) -> Vec<Tag> {
        let pattern = format!("{}-*", self.ctx.config.prefix);
        let keys: Vec<String> = {
            let mut conn = self.ctx.lock_conn();
            match conn.keys(&pattern) {
                Ok(keys) => keys,
                Err(e) => {
                    debug!("Key scan {} failed: {}", pattern, e);
                    return Vec::new();
                }
            }
        };
        keys.iter()
            .filter_map(|key| {
                let mut conn = self.ctx.lock_conn();
                let data: RedisResult<Option<String>> = conn.get(key);
                data.ok().flatten().as_deref().and_then(Self::decode)
            })
            .collect()
    }
}

/// Key-value store: one key per mutex id under a configurable prefix.
pub struct KvTagStore {
    name: String,
    tag_id: String,
    owner_id: String,
    manager: KvTagManager,
    clock: SharedClock,
}

impl KvTagStore {
    pub fn new(name: impl Into<String>, ctx: KvContext, clock: SharedClock) -> Self {
        let name = name.into();
        KvTagStore {
            tag_id: tag_id(&name),
            owner_id: owner_token(clock.as_ref()),
            manager: KvTagManager::new(ctx, clock.clone()),
            clock,
            name,
        }
    }

    pub fn manager(&self) -> &KvTagManager {
        &self.manager
    }

    fn prepare_resources(&self) {
        if rand::thread_rng().gen_range(0..SWEEP_DICE) == 1 {
            self.manager.sweep_expired();
        }
    }
}

impl TagStore for KvTagStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn owner_id(&self) -> &str {
        &self.owner_id
    }

    fn max_lease_secs(&self) -> u32 {
        self.manager.ctx.config.max_lease_secs
    }

    fn poll_interval(&self) -> Duration {
        self.manager.ctx.config.poll_interval
    }

    fn tag_exists(&mut self) -> Result<bool> {
        let now = self.clock.unix_secs();
        Ok(self
            .manager
            .get_tag(&self.tag_id)
            .map(|tag| tag.is_live(now))
            .unwrap_or(false))
    }

    fn lock_tag(&mut self, lease_seconds: u32, expiry_time: i64) -> Result<bool> {
        self.prepare_resources();
        let tag = Tag::new(
            expiry_time,
            lease_seconds,
            self.owner_id.clone(),
            self.name.clone(),
        );
        Ok(self.manager.save_tag(&self.tag_id, &tag))
    }

    fn locked_by_me(&mut self) -> Result<bool> {
        Ok(self
            .manager
            .get_tag(&self.tag_id)
            .map(|tag| tag.owner_id() == self.owner_id)
            .unwrap_or(false))
    }

    fn unlock_tag(&mut self) -> Result<bool> {
        Ok(self.manager.delete_owned_tag(&self.tag_id, &self.owner_id))
    }
}

/// Builds one `KvTagStore` per mutex name over a shared connection.
#[derive(Clone)]
pub struct KvStoreProvider {
    ctx: KvContext,
}

impl KvStoreProvider {
    pub fn new(ctx: KvContext) -> Self {
        KvStoreProvider { ctx }
    }

    pub fn connect(config: KvStoreConfig) -> Result<Self> {
        Ok(KvStoreProvider {
            ctx: KvContext::open(config)?,
        })
    }

    pub fn context(&self) -> &KvContext {
        &self.ctx
    }
}

impl StoreProvider for KvStoreProvider {
    type Store = KvTagStore;

    fn open(&self, name: &str, clock: &SharedClock) -> Result<KvTagStore> {
        Ok(KvTagStore::new(name, self.ctx.clone(), clock.clone()))
    }
}
