use crate::clock::SharedClock;
use crate::config::FileStoreConfig;
use crate::error::{Result, TagLockError};
use crate::store::{StoreProvider, TagStore};
use crate::tag::{owner_token, tag_id, Tag, FIELD_DELIMITER};
use fs2::FileExt;
use rand::seq::SliceRandom;
use rand::Rng;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Number of randomly chosen tag files every sweep leaves untouched.
const SWEEP_KEEP_HEAD: usize = 3;

/// One sweep runs per this many lock attempts, on average.
const SWEEP_DICE: u32 = 6;

/// Reads, writes and garbage-collects the tag files themselves. Shared
/// between the store and external listing/statistics tooling.
#[derive(Clone)]
pub struct FileTagManager {
    config: FileStoreConfig,
    clock: SharedClock,
}

impl FileTagManager {
    pub fn new(config: FileStoreConfig, clock: SharedClock) -> Self {
        FileTagManager { config, clock }
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    pub fn tag_path(&self, tag_id: &str) -> PathBuf {
        self.config
            .dir
            .join(format!("{}.{}", tag_id, self.config.extension))
    }

    /// Serialize a tag to its on-disk form: 4 colon-delimited fields,
    /// name last so it may contain the delimiter.
    pub fn encode(tag: &Tag) -> String {
        let d = FIELD_DELIMITER;
        format!(
            "{}{d}{}{d}{}{d}{}",
            tag.expiry_time(),
            tag.lease_seconds(),
            tag.owner_id(),
            tag.name()
        )
    }

    /// Parse the on-disk form back into a tag. Trailing fields are
    /// rejoined into the name.
    pub fn decode(content: &str) -> Option<Tag> {
        let mut parts = content.splitn(4, FIELD_DELIMITER);
        let expiry = parts.next()?.parse::<i64>().ok()?;
        let lease = parts.next()?.parse::<u32>().ok()?;
        let owner = parts.next()?;
        let name = parts.next()?;
        Some(Tag::new(expiry, lease, owner, name))
    }

    pub fn read_tag(&self, path: &Path) -> Option<Tag> {
        Self::decode(&read_first_line(path)?)
    }

    /// Look up a single tag by mutex name, raw file name, or tag id.
    pub fn find_tag(&self, name: &str) -> Option<Tag> {
        let candidates = [
            self.tag_path(&tag_id(name)),
            self.config
                .dir
                .join(format!("{}.{}", name, self.config.extension)),
            self.config.dir.join(name),
        ];
        candidates
            .iter()
            .find(|path| path.is_file())
            .and_then(|path| self.read_tag(path))
    }

    /// All parsable tags currently on disk, live or not.
    pub fn all_tags(&self) -> Vec<Tag> {
        self.tag_files()
            .iter()
            .filter_map(|path| self.read_tag(path))
            .collect()
    }

    /// Remove abandoned tag files. A shuffled head of the candidate list
    /// always survives, so a file being written concurrently is unlikely
    /// to be inspected.
    pub fn sweep_expired(&self) {
        let mut files = self.tag_files();
        if files.is_empty() {
            return;
        }
        files.shuffle(&mut rand::thread_rng());
        for path in files.into_iter().skip(SWEEP_KEEP_HEAD) {
            self.remove_if_stale(&path);
        }
    }

    /// Delete one tag file if it is expired beyond the grace window of a
    /// full maximum lease, or unreadable and older than one maximum
    /// lease. Live tags and freshly expired tags are never touched.
    pub fn remove_if_stale(&self, path: &Path) {
        if !path.exists() {
            return;
        }
        let now = self.clock.unix_secs();
        let grace = i64::from(self.config.max_lease_secs);
        match read_first_line(path).as_deref().map(Self::decode) {
            Some(Some(tag)) => {
                if tag.expiry_time() < now && tag.expiry_time() + grace < now {
                    debug!("Removing expired tag file: {}", path.display());
                    self.delete_file(path);
                }
            }
            // Garbage or empty content: only the file's age can tell us
            // it is abandoned rather than mid-write.
            _ => {
                if file_older_than(path, self.config.max_lease_secs) {
                    debug!("Removing unreadable tag file: {}", path.display());
                    self.delete_file(path);
                }
            }
        }
    }

    /// Standardized file deletion; a file already gone counts as removed.
    pub fn delete_file(&self, path: &Path) -> bool {
        match fs::remove_file(path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                warn!("Failed to remove tag file {}: {}", path.display(), e);
                false
            }
        }
    }

    fn tag_files(&self) -> Vec<PathBuf> {
        let entries = match fs::read_dir(&self.config.dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(
                    "Cannot list tag directory {}: {}",
                    self.config.dir.display(),
                    e
                );
                return Vec::new();
            }
        };
        let mut files = Vec::new();
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            // Symlinks are never tag files; skip without following.
            if !file_type.is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some(self.config.extension.as_str()) {
                files.push(path);
            }
        }
        files
    }
}

fn read_first_line(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    let line = content.lines().next()?.trim();
    if line.is_empty() {
        None
    } else {
        Some(line.to_string())
    }
}

fn file_older_than(path: &Path, max_secs: u32) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    let Ok(mtime) = metadata.modified() else {
        return false;
    };
    match SystemTime::now().duration_since(mtime) {
        Ok(elapsed) => elapsed.as_secs() > u64::from(max_secs),
        Err(_) => false,
    }
}

/// File-backed store: one tag file per mutex id. An advisory exclusive
/// lock is held on the handle between `lock_tag` and `unlock_tag` as a
/// best-effort atomicity aid; where advisory locks are unsupported, the
/// parsed tag content is the sole locking signal.
pub struct FileTagStore {
    name: String,
    tag_id: String,
    owner_id: String,
    manager: FileTagManager,
    clock: SharedClock,
    handle: Option<File>,
}

impl FileTagStore {
    pub fn new(name: impl Into<String>, config: FileStoreConfig, clock: SharedClock) -> Self {
        let name = name.into();
        FileTagStore {
            tag_id: tag_id(&name),
            owner_id: owner_token(clock.as_ref()),
            manager: FileTagManager::new(config, clock.clone()),
            clock,
            name,
            handle: None,
        }
    }

    pub fn manager(&self) -> &FileTagManager {
        &self.manager
    }

    fn path(&self) -> PathBuf {
        self.manager.tag_path(&self.tag_id)
    }

    /// Ensure the tag directory exists; when it already did, roll the
    /// dice for an opportunistic sweep.
    fn prepare_resources(&self) -> Result<()> {
        let dir = self.manager.dir();
        if dir.is_dir() {
            if rand::thread_rng().gen_range(0..SWEEP_DICE) == 1 {
                self.manager.sweep_expired();
            }
        } else {
            fs::create_dir_all(dir).map_err(|e| TagLockError::StorageDirFailed {
                path: dir.to_path_buf(),
                source: e,
            })?;
        }
        Ok(())
    }

    fn write_tag(&mut self, lease_seconds: u32, expiry_time: i64) -> bool {
        let tag = Tag::new(
            expiry_time,
            lease_seconds,
            self.owner_id.clone(),
            self.name.clone(),
        );
        let content = FileTagManager::encode(&tag);
        let ok = match self.handle.as_mut() {
            Some(file) => overwrite(file, &content).is_ok(),
            None => false,
        };
        if !ok {
            self.unblock_handle();
        }
        ok
    }

    /// Truncate, drop the advisory lock and close the handle.
    fn unblock_handle(&mut self) {
        if let Some(file) = self.handle.take() {
            let _ = file.set_len(0);
            let _ = FileExt::unlock(&file);
        }
    }

    fn delete_if_mine(&self) -> bool {
        let path = self.path();
        if !path.exists() {
            return true;
        }
        match self.manager.read_tag(&path) {
            // A fresher holder's tag: leave it in place.
            Some(tag) if tag.owner_id() != self.owner_id => true,
            _ => self.manager.delete_file(&path),
        }
    }
}

impl TagStore for FileTagStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn owner_id(&self) -> &str {
        &self.owner_id
    }

    fn max_lease_secs(&self) -> u32 {
        self.manager.config.max_lease_secs
    }

    fn poll_interval(&self) -> Duration {
        self.manager.config.poll_interval
    }

    fn tag_exists(&mut self) -> Result<bool> {
        let now = self.clock.unix_secs();
        Ok(self
            .manager
            .read_tag(&self.path())
            .map(|tag| tag.is_live(now))
            .unwrap_or(false))
    }

    fn lock_tag(&mut self, lease_seconds: u32, expiry_time: i64) -> Result<bool> {
        self.prepare_resources()?;
        let path = self.path();
        let file = match open_tag_file(&path) {
            Ok(file) => file,
            Err(e) => {
                debug!("Cannot open tag file {}: {}", path.display(), e);
                return Ok(false);
            }
        };
        if let Err(e) = file.lock_exclusive() {
            // Advisory locks unsupported here; tag content takes over as
            // the locking signal.
            debug!("Advisory lock unavailable on {}: {}", path.display(), e);
        }
        self.handle = Some(file);
        Ok(self.write_tag(lease_seconds, expiry_time))
    }

    fn locked_by_me(&mut self) -> Result<bool> {
        Ok(self
            .manager
            .read_tag(&self.path())
            .map(|tag| tag.owner_id() == self.owner_id)
            .unwrap_or(false))
    }

    fn unlock_tag(&mut self) -> Result<bool> {
        self.unblock_handle();
        Ok(self.delete_if_mine())
    }
}

fn open_tag_file(path: &Path) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.create(true).read(true).write(true);

    // On Unix, reject symlinked tag files at the OS level.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.custom_flags(libc::O_NOFOLLOW);
    }

    opts.open(path)
}

fn overwrite(file: &mut File, content: &str) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(content.as_bytes())?;
    file.sync_data()
}

/// Builds one `FileTagStore` per mutex name.
#[derive(Debug, Clone)]
pub struct FileStoreProvider {
    config: FileStoreConfig,
}

impl FileStoreProvider {
    pub fn new(config: FileStoreConfig) -> Self {
        FileStoreProvider { config }
    }
}

impl StoreProvider for FileStoreProvider {
    type Store = FileTagStore;

    fn open(&self, name: &str, clock: &SharedClock) -> Result<FileTagStore> {
        Ok(FileTagStore::new(name, self.config.clone(), clock.clone()))
    }
}
