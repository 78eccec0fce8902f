use filetime::FileTime;
use std::fs;
use std::path::PathBuf;
use taglock::clock::system_clock;
use taglock::store::FileTagManager;
use taglock::tag::{tag_id, Tag};
use taglock::FileStoreConfig;
use tempfile::TempDir;

const MAX_LEASE: u32 = 60;

fn manager(dir: &TempDir) -> FileTagManager {
    let config = FileStoreConfig::new(dir.path()).with_max_lease(MAX_LEASE);
    FileTagManager::new(config, system_clock())
}

fn plant_tag(dir: &TempDir, name: &str, expiry: i64, lease: u32) -> PathBuf {
    let path = dir.path().join(format!("{}.tag", tag_id(name)));
    let tag = Tag::new(expiry, lease, "gc-test-owner", name);
    fs::write(&path, FileTagManager::encode(&tag)).unwrap();
    path
}

fn backdate(path: &PathBuf, age_secs: i64) {
    let now = chrono::Utc::now().timestamp();
    filetime::set_file_mtime(path, FileTime::from_unix_time(now - age_secs, 0)).unwrap();
}

#[test]
fn test_live_tag_survives() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    let now = chrono::Utc::now().timestamp();

    let path = plant_tag(&dir, "live", now + 100, 30);
    manager.remove_if_stale(&path);
    assert!(path.exists());
}

#[test]
fn test_expired_tag_inside_grace_window_survives() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    let now = chrono::Utc::now().timestamp();

    // Expired half a max-lease ago: still inside the grace window.
    let path = plant_tag(&dir, "in-grace", now - i64::from(MAX_LEASE) / 2, 30);
    manager.remove_if_stale(&path);
    assert!(path.exists());
}

#[test]
fn test_expired_tag_beyond_grace_window_is_removed() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    let now = chrono::Utc::now().timestamp();

    let path = plant_tag(&dir, "stale", now - i64::from(MAX_LEASE) - 10, 30);
    manager.remove_if_stale(&path);
    assert!(!path.exists());
}

#[test]
fn test_recent_garbage_survives() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);

    let path = dir.path().join("garbage.tag");
    fs::write(&path, "not a tag at all").unwrap();
    manager.remove_if_stale(&path);
    assert!(path.exists(), "a file being written must not be swept");
}

#[test]
fn test_old_garbage_is_removed() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);

    let path = dir.path().join("garbage.tag");
    fs::write(&path, "not a tag at all").unwrap();
    backdate(&path, i64::from(MAX_LEASE) * 2);
    manager.remove_if_stale(&path);
    assert!(!path.exists());
}

#[test]
fn test_old_empty_file_is_removed() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);

    let path = dir.path().join("empty.tag");
    fs::write(&path, "").unwrap();
    backdate(&path, i64::from(MAX_LEASE) * 2);
    manager.remove_if_stale(&path);
    assert!(!path.exists());
}

#[test]
fn test_sweep_never_removes_live_tags() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    let now = chrono::Utc::now().timestamp();

    let paths: Vec<_> = (0..10)
        .map(|i| plant_tag(&dir, &format!("live-{}", i), now + 100, 30))
        .collect();

    for _ in 0..5 {
        manager.sweep_expired();
    }
    for path in paths {
        assert!(path.exists());
    }
}

#[test]
fn test_sweep_removes_most_stale_tags_but_spares_a_head() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    let now = chrono::Utc::now().timestamp();

    let paths: Vec<_> = (0..10)
        .map(|i| plant_tag(&dir, &format!("stale-{}", i), now - i64::from(MAX_LEASE) - 10, 30))
        .collect();

    manager.sweep_expired();
    let remaining = paths.iter().filter(|p| p.exists()).count();
    // A shuffled 3-file head survives each sweep.
    assert!(remaining <= 3, "expected at most 3 survivors, got {}", remaining);
}

#[test]
fn test_only_configured_extension_is_considered() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);

    let other = dir.path().join("unrelated.txt");
    fs::write(&other, "keep me").unwrap();
    backdate(&other, i64::from(MAX_LEASE) * 3);

    for _ in 0..5 {
        manager.sweep_expired();
    }
    assert!(other.exists());
}

#[test]
fn test_find_tag_and_listing() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    let now = chrono::Utc::now().timestamp();

    plant_tag(&dir, "queue:emails", now + 50, 50);
    plant_tag(&dir, "queue:sms", now + 50, 50);

    let found = manager.find_tag("queue:emails").unwrap();
    assert_eq!(found.name(), "queue:emails");
    assert_eq!(found.lease_seconds(), 50);

    let mut names: Vec<_> = manager
        .all_tags()
        .into_iter()
        .map(|tag| tag.name().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["queue:emails", "queue:sms"]);
}
