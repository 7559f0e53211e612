//! Build cache and cross-process build locks.
//!
//! Builders of the same content hash serialize on a lock per `(hash, tag)`: the first caller
//! of [`BuildCache::have_hash`] gets `true` and builds, the others block in
//! [`BuildCache::wait_for_hash`] and then find the finished artifacts in [`BuildCache::hash_dir`].

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::error::{OffloadError, OffloadResult};
use crate::hashing::ContentHash;

pub trait BuildCache: Send + Sync {
    /// Directory holding the artifacts of `hash`.
    fn hash_dir(&self, hash: &ContentHash) -> PathBuf;

    /// Tries to take the build lock; `true` means the caller now holds it.
    fn have_hash(&self, hash: &ContentHash, tag: &str) -> OffloadResult<bool>;

    /// Blocks until no one holds the build lock.
    fn wait_for_hash(&self, hash: &ContentHash, tag: &str) -> OffloadResult<()>;

    fn release_hash(&self, hash: &ContentHash, tag: &str) -> OffloadResult<()>;
}

/// Held build lock, released on drop.
pub struct HashLock<'a> {
    cache: &'a dyn BuildCache,
    hash: ContentHash,
    tag: String,
}

impl<'a> HashLock<'a> {
    /// Takes the lock, waiting out other builders.
    pub fn acquire(cache: &'a dyn BuildCache, hash: &ContentHash, tag: &str) -> OffloadResult<Self> {
        while !cache.have_hash(hash, tag)? {
            debug!(hash = %hash.short_hex(), tag, "waiting for concurrent build");
            cache.wait_for_hash(hash, tag)?;
        }
        Ok(Self {
            cache,
            hash: *hash,
            tag: tag.to_string(),
        })
    }
}

impl Drop for HashLock<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.cache.release_hash(&self.hash, &self.tag) {
            warn!(hash = %self.hash.short_hex(), tag = %self.tag, "failed to release build lock: {err}");
        }
    }
}

/// On-disk cache under `root`: artifacts in `<root>/<hash>/`, locks as directories in
/// `<root>/locks/`. Directory creation is atomic, which makes it usable as a cross-process
/// mutex. Locks older than `stale_after` are assumed abandoned and broken.
pub struct FileBuildCache {
    root: PathBuf,
    poll_interval: Duration,
    stale_after: Duration,
    held: Mutex<HashSet<PathBuf>>,
}

impl FileBuildCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            poll_interval: Duration::from_millis(20),
            stale_after: Duration::from_secs(600),
            held: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_path(&self, hash: &ContentHash, tag: &str) -> PathBuf {
        self.root
            .join("locks")
            .join(format!("{}_{}", hash.short_hex(), sanitize(tag)))
    }

    fn is_stale(&self, lock: &Path) -> bool {
        let age = fs::metadata(lock)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok());
        age.is_some_and(|age| age > self.stale_after)
    }

    fn break_stale(&self, lock: &Path) -> bool {
        if self.is_stale(lock) {
            warn!(lock = %lock.display(), "breaking stale build lock");
            return fs::remove_dir(lock).is_ok();
        }
        false
    }
}

fn sanitize(tag: &str) -> String {
    tag.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

impl BuildCache for FileBuildCache {
    fn hash_dir(&self, hash: &ContentHash) -> PathBuf {
        self.root.join(hash.short_hex())
    }

    fn have_hash(&self, hash: &ContentHash, tag: &str) -> OffloadResult<bool> {
        let lock = self.lock_path(hash, tag);
        if let Some(parent) = lock.parent() {
            fs::create_dir_all(parent).map_err(|err| OffloadError::io("have_hash", err))?;
        }
        for _ in 0..2 {
            match fs::create_dir(&lock) {
                Ok(()) => {
                    self.held
                        .lock()
                        .expect("build lock set poisoned")
                        .insert(lock);
                    return Ok(true);
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if !self.break_stale(&lock) {
                        return Ok(false);
                    }
                }
                Err(err) => return Err(OffloadError::io("have_hash", err)),
            }
        }
        Ok(false)
    }

    fn wait_for_hash(&self, hash: &ContentHash, tag: &str) -> OffloadResult<()> {
        let lock = self.lock_path(hash, tag);
        while lock.exists() {
            if self.break_stale(&lock) {
                break;
            }
            thread::sleep(self.poll_interval);
        }
        Ok(())
    }

    fn release_hash(&self, hash: &ContentHash, tag: &str) -> OffloadResult<()> {
        let lock = self.lock_path(hash, tag);
        self.held
            .lock()
            .expect("build lock set poisoned")
            .remove(&lock);
        match fs::remove_dir(&lock) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(OffloadError::io("release_hash", err)),
        }
    }
}

impl Drop for FileBuildCache {
    fn drop(&mut self) {
        let held = match self.held.get_mut() {
            Ok(held) => held,
            Err(poisoned) => poisoned.into_inner(),
        };
        for lock in held.drain() {
            let _ = fs::remove_dir(lock);
        }
    }
}
