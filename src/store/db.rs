use crate::clock::SharedClock;
use crate::config::DbStoreConfig;
use crate::error::{Result, TagLockError};
use crate::store::{StoreProvider, TagStore};
use crate::tag::{owner_token, tag_id, Tag};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

/// One sweep runs per this many lock attempts, on average.
const SWEEP_DICE: u32 = 6;

/// Full scans are capped; external tooling never needs more.
const ALL_TAGS_LIMIT: u32 = 10_000;

/// Shared database handle, one per process. Stores clone the context and
/// serialize their statements through the inner connection.
#[derive(Clone)]
pub struct DbContext {
    conn: Arc<Mutex<Connection>>,
    config: DbStoreConfig,
}

impl DbContext {
    pub fn open(config: DbStoreConfig) -> Result<Self> {
        validate_table_name(&config.table)?;
        let conn = Connection::open(&config.database)?;
        // Another process may hold the write lock briefly during its own
        // delete-then-insert; wait it out instead of failing fast.
        conn.busy_timeout(Duration::from_secs(1))?;
        Ok(DbContext {
            conn: Arc::new(Mutex::new(conn)),
            config,
        })
    }

    pub fn config(&self) -> &DbStoreConfig {
        &self.config
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn validate_table_name(table: &str) -> Result<()> {
    let ok = !table.is_empty()
        && !table.starts_with(|c: char| c.is_ascii_digit())
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if ok {
        Ok(())
    } else {
        Err(TagLockError::InvalidTableName(table.to_string()))
    }
}

/// Statement-level access to the mutex table. Read paths swallow missing
/// table/busy errors and report "nothing found"; only inserts are fatal.
#[derive(Clone)]
pub struct DbTagManager {
    ctx: DbContext,
    clock: SharedClock,
}

impl DbTagManager {
    pub fn new(ctx: DbContext, clock: SharedClock) -> Self {
        DbTagManager { ctx, clock }
    }

    fn table(&self) -> &str {
        &self.ctx.config.table
    }

    /// Create the table on first use. Returns true when it was created by
    /// this call, false when it already existed.
    pub fn ensure_table(&self) -> Result<bool> {
        let conn = self.ctx.lock_conn();
        let existed = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![self.table()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if existed {
            return Ok(false);
        }
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                tag_id        TEXT NOT NULL PRIMARY KEY,
                title         TEXT NOT NULL UNIQUE,
                owner_id      TEXT NOT NULL,
                lease_seconds INTEGER NOT NULL,
                expiry_time   INTEGER NOT NULL,
                created_at    TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
            self.table()
        ))?;
        debug!("Created mutex table `{}`", self.table());
        Ok(true)
    }

    /// Replace whatever row occupies the slot with a fresh tag. The
    /// delete and insert are two separate statements; the race window
    /// between them is resolved by the caller's double-check.
    pub fn save_tag(&self, tag_id: &str, tag: &Tag) -> Result<bool> {
        if !self.delete_tag(tag_id) {
            return Ok(false);
        }
        let conn = self.ctx.lock_conn();
        conn.execute(
            &format!(
                "INSERT INTO {} (tag_id, title, owner_id, lease_seconds, expiry_time)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                self.table()
            ),
            params![
                tag_id,
                tag.name(),
                tag.owner_id(),
                tag.lease_seconds(),
                tag.expiry_time()
            ],
        )?;
        Ok(true)
    }

    pub fn delete_tag(&self, tag_id: &str) -> bool {
        let conn = self.ctx.lock_conn();
        match conn.execute(
            &format!("DELETE FROM {} WHERE tag_id = ?1", self.table()),
            params![tag_id],
        ) {
            Ok(_) => true,
            Err(e) => {
                debug!("Delete of tag {} failed: {}", tag_id, e);
                false
            }
        }
    }

    /// Delete the row only while it still carries this attempt's owner
    /// id. A slot owned by someone fresher is left alone.
    pub fn delete_owned_tag(&self, tag_id: &str, owner_id: &str) -> bool {
        let conn = self.ctx.lock_conn();
        match conn.execute(
            &format!(
                "DELETE FROM {} WHERE tag_id = ?1 AND owner_id = ?2",
                self.table()
            ),
            params![tag_id, owner_id],
        ) {
            Ok(_) => true,
            Err(e) => {
                debug!("Owned delete of tag {} failed: {}", tag_id, e);
                false
            }
        }
    }

    pub fn expiry_time_of(&self, tag_id: &str) -> Option<i64> {
        let conn = self.ctx.lock_conn();
        conn.query_row(
            &format!("SELECT expiry_time FROM {} WHERE tag_id = ?1", self.table()),
            params![tag_id],
            |row| row.get(0),
        )
        .optional()
        .unwrap_or_default()
    }

    pub fn owned_tag_exists(&self, tag_id: &str, owner_id: &str) -> bool {
        let conn = self.ctx.lock_conn();
        conn.query_row(
            &format!(
                "SELECT 1 FROM {} WHERE tag_id = ?1 AND owner_id = ?2",
                self.table()
            ),
            params![tag_id, owner_id],
            |_| Ok(()),
        )
        .optional()
        .unwrap_or_default()
        .is_some()
    }

    /// Bulk-remove rows whose lease ran out more than one full maximum
    /// lease ago.
    pub fn sweep_expired(&self) {
        let cutoff = self.clock.unix_secs() - i64::from(self.ctx.config.max_lease_secs);
        let conn = self.ctx.lock_conn();
        match conn.execute(
            &format!("DELETE FROM {} WHERE expiry_time < ?1", self.table()),
            params![cutoff],
        ) {
            Ok(0) => {}
            Ok(removed) => debug!("Swept {} expired mutex rows", removed),
            Err(e) => warn!("Sweep of expired mutex rows failed: {}", e),
        }
    }

    pub fn get_tag(&self, tag_id: &str) -> Option<Tag> {
        let conn = self.ctx.lock_conn();
        conn.query_row(
            &format!(
                "SELECT expiry_time, lease_seconds, owner_id, title FROM {} WHERE tag_id = ?1",
                self.table()
            ),
            params![tag_id],
            row_to_tag,
        )
        .optional()
        .unwrap_or_default()
    }

    pub fn find_tag(&self, name: &str) -> Option<Tag> {
        let conn = self.ctx.lock_conn();
        conn.query_row(
            &format!(
                "SELECT expiry_time, lease_seconds, owner_id, title FROM {} WHERE title = ?1",
                self.table()
            ),
            params![name],
            row_to_tag,
        )
        .optional()
        .unwrap_or_default()
    }

    /// All stored tags, live or not, capped for full scans.
    pub fn all_tags(&self) -> Vec<Tag> {
        let conn = self.ctx.lock_conn();
        let mut stmt = match conn.prepare(&format!(
            "SELECT expiry_time, lease_seconds, owner_id, title FROM {} LIMIT {}",
            self.table(),
            ALL_TAGS_LIMIT
        )) {
            Ok(stmt) => stmt,
            Err(e) => {
                debug!("Tag listing unavailable: {}", e);
                return Vec::new();
            }
        };
        let result = match stmt.query_map([], row_to_tag) {
            Ok(rows) => rows.filter_map(|row| row.ok()).collect(),
            Err(e) => {
                debug!("Tag listing unavailable: {}", e);
                Vec::new()
            }
        };
        result
    }
}

fn row_to_tag(row: &Row<'_>) -> rusqlite::Result<Tag> {
    Ok(Tag::new(
        row.get::<_, i64>(0)?,
        row.get::<_, u32>(1)?,
        row.get::<_, String>(2)?,
        row.get::<_, String>(3)?,
    ))
}

/// Relational store: one row per mutex id, lazily created table.
pub struct DbTagStore {
    name: String,
    tag_id: String,
    owner_id: String,
    manager: DbTagManager,
    clock: SharedClock,
}

impl DbTagStore {
    pub fn new(name: impl Into<String>, ctx: DbContext, clock: SharedClock) -> Self {
        let name = name.into();
        DbTagStore {
            tag_id: tag_id(&name),
            owner_id: owner_token(clock.as_ref()),
            manager: DbTagManager::new(ctx, clock.clone()),
            clock,
            name,
        }
    }

    pub fn manager(&self) -> &DbTagManager {
        &self.manager
    }

    fn prepare_resources(&self) -> Result<()> {
        let created = self.manager.ensure_table()?;
        if !created && rand::thread_rng().gen_range(0..SWEEP_DICE) == 1 {
            self.manager.sweep_expired();
        }
        Ok(())
    }
}

impl TagStore for DbTagStore {
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
            .expiry_time_of(&self.tag_id)
            .map(|expiry| expiry >= now)
            .unwrap_or(false))
    }

    fn lock_tag(&mut self, lease_seconds: u32, expiry_time: i64) -> Result<bool> {
        self.prepare_resources()?;
        let tag = Tag::new(
            expiry_time,
            lease_seconds,
            self.owner_id.clone(),
            self.name.clone(),
        );
        self.manager.save_tag(&self.tag_id, &tag)
    }

    fn locked_by_me(&mut self) -> Result<bool> {
        Ok(self.manager.owned_tag_exists(&self.tag_id, &self.owner_id))
    }

    fn unlock_tag(&mut self) -> Result<bool> {
        Ok(self.manager.delete_owned_tag(&self.tag_id, &self.owner_id))
    }
}

/// Builds one `DbTagStore` per mutex name over a shared connection.
#[derive(Clone)]
pub struct DbStoreProvider {
    ctx: DbContext,
}

impl DbStoreProvider {
    pub fn new(ctx: DbContext) -> Self {
        DbStoreProvider { ctx }
    }

    pub fn open_database(config: DbStoreConfig) -> Result<Self> {
        Ok(DbStoreProvider {
            ctx: DbContext::open(config)?,
        })
    }

    pub fn context(&self) -> &DbContext {
        &self.ctx
    }
}

impl StoreProvider for DbStoreProvider {
    type Store = DbTagStore;

    fn open(&self, name: &str, clock: &SharedClock) -> Result<DbTagStore> {
        Ok(DbTagStore::new(name, self.ctx.clone(), clock.clone()))
    }
}
