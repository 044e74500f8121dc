//! Content-addressed cache of separation results.
//!
//! # Design
//! - A key is the SHA-256 of the input bytes plus model, device, and output format,
//!   so changing any of them produces a different entry.
//! - Each entry is a directory `<root>/<key>/` holding the stems and an `entry.json`
//!   manifest. Entries are assembled in a temporary sibling and renamed into place,
//!   so a reader never observes a half-written entry.
//! - The in-memory index is rebuilt from disk on open. Its lock guards map updates
//!   only; copies and deletions happen outside it.
//! - Every operation is synchronous; async callers run it on the blocking pool.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use demix_config::{CacheConfig, Device, OutputFormat};
use demix_workspace::StemFile;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{CacheError, CacheResult};

const MANIFEST_FILE: &str = "entry.json";
const TMP_PREFIX: &str = ".tmp-";
const KEY_LEN: usize = 64;

/// Identity of a cached result.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for separating `bytes` with the given engine settings.
    #[must_use]
    pub fn compute(bytes: &[u8], model: &str, device: Device, format: OutputFormat) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        for part in [model, device.as_str(), format.extension()] {
            hasher.update([0_u8]);
            hasher.update(part.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Parse a key rendered by [`CacheKey::compute`].
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let valid = value.len() == KEY_LEN
            && value
                .bytes()
                .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte));
        valid.then(|| Self(value.to_string()))
    }

    /// Hex rendering of the key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheManifest {
    key: String,
    stored_at: DateTime<Utc>,
    model: String,
    format: OutputFormat,
    files: Vec<String>,
}

/// A live cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResult {
    /// Entry key.
    pub key: CacheKey,
    /// Directory holding the cached stems.
    pub dir: PathBuf,
    /// When the entry was stored.
    pub stored_at: DateTime<Utc>,
    /// Stem file names, sorted.
    pub files: Vec<String>,
}

/// On-disk result cache with a time-to-live and an entry cap.
#[derive(Debug)]
pub struct ResultCache {
    root: PathBuf,
    ttl: TimeDelta,
    max_entries: usize,
    index: Mutex<HashMap<CacheKey, CacheManifest>>,
}

impl ResultCache {
    /// Open the cache at `root`, creating it if needed and loading existing entries.
    ///
    /// Unreadable entries are removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be created or listed.
    pub fn open(root: impl Into<PathBuf>, ttl: Duration, max_entries: usize) -> CacheResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| CacheError::io("cache.create_root", &root, source))?;
        let cache = Self {
            index: Mutex::new(load_index(&root)?),
            root,
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
            max_entries: max_entries.max(1),
        };
        debug!(
            root = %cache.root.display(),
            entries = cache.len(),
            "result cache opened"
        );
        Ok(cache)
    }

    /// Open the cache described by `config`, or `None` when caching is disabled.
    ///
    /// # Errors
    ///
    /// Returns an error if an enabled cache cannot be opened.
    pub fn from_config(config: &CacheConfig) -> CacheResult<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        Self::open(&config.root, config.ttl(), config.max_entries).map(Some)
    }

    /// Cache root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of indexed entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_index().len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_index().is_empty()
    }

    /// Return the live entry for `key`. An expired entry is dropped and reported as a miss.
    ///
    /// # Errors
    ///
    /// Returns an error if an expired entry cannot be deleted.
    pub fn lookup(&self, key: &CacheKey) -> CacheResult<Option<CachedResult>> {
        let now = Utc::now();
        let mut index = self.lock_index();
        let Some(manifest) = index.get(key) else {
            return Ok(None);
        };
        if !self.is_expired(manifest, now) {
            return Ok(Some(self.cached_result(key, manifest)));
        }
        index.remove(key);
        drop(index);
        debug!(key = %key, "expired cache entry dropped on lookup");
        remove_entry_dir(&self.entry_dir(key))?;
        Ok(None)
    }

    /// Store the stems of a completed job under `key`.
    ///
    /// Returns `false` when a live entry already exists or a concurrent store won the
    /// race; the duplicate is discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the stems cannot be copied or the entry cannot be published.
    pub fn store(
        &self,
        key: &CacheKey,
        model: &str,
        format: OutputFormat,
        stems: &[StemFile],
    ) -> CacheResult<bool> {
        let now = Utc::now();
        let stale = {
            let mut index = self.lock_index();
            match index.get(key) {
                Some(manifest) if !self.is_expired(manifest, now) => return Ok(false),
                Some(_) => index.remove(key).is_some(),
                None => false,
            }
        };
        if stale {
            remove_entry_dir(&self.entry_dir(key))?;
        }

        let mut files: Vec<String> = stems.iter().map(|stem| stem.name.clone()).collect();
        files.sort();
        let manifest = CacheManifest {
            key: key.to_string(),
            stored_at: now,
            model: model.to_string(),
            format,
            files,
        };

        let tmp_dir = self
            .root
            .join(format!("{TMP_PREFIX}{key}-{:016x}", rand::random::<u64>()));
        if let Err(err) = write_entry(&tmp_dir, &manifest, stems) {
            discard(&tmp_dir);
            return Err(err);
        }

        let entry_dir = self.entry_dir(key);
        if let Err(source) = fs::rename(&tmp_dir, &entry_dir) {
            discard(&tmp_dir);
            if entry_dir.exists() {
                debug!(key = %key, "concurrent cache store detected; discarding duplicate");
                return Ok(false);
            }
            return Err(CacheError::io("cache.publish", &entry_dir, source));
        }

        let evicted = {
            let mut index = self.lock_index();
            index.insert(key.clone(), manifest);
            self.select_evictions(&mut index)
        };
        for victim in &evicted {
            debug!(key = %victim, "evicting cache entry over capacity");
            remove_entry_dir(&self.entry_dir(victim))?;
        }
        info!(key = %key, evicted = evicted.len(), "separation result cached");
        Ok(true)
    }

    /// Copy the stems of `hit` into `dest`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if a cached stem is missing or cannot be copied.
    pub fn restore(&self, hit: &CachedResult, dest: &Path) -> CacheResult<()> {
        fs::create_dir_all(dest).map_err(|source| CacheError::io("cache.restore_dir", dest, source))?;
        for name in &hit.files {
            let from = hit.dir.join(name);
            fs::copy(&from, dest.join(name))
                .map_err(|source| CacheError::io("cache.restore_copy", &from, source))?;
        }
        debug!(key = %hit.key, dest = %dest.display(), files = hit.files.len(), "cache entry restored");
        Ok(())
    }

    /// Drop the entry for `key`; returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry directory cannot be deleted.
    pub fn invalidate(&self, key: &CacheKey) -> CacheResult<bool> {
        let existed = self.lock_index().remove(key).is_some();
        let dir = self.entry_dir(key);
        let on_disk = dir.exists();
        remove_entry_dir(&dir)?;
        Ok(existed || on_disk)
    }

    /// Drop every expired entry; returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry directory cannot be deleted.
    pub fn purge_expired(&self) -> CacheResult<usize> {
        let now = Utc::now();
        let expired: Vec<CacheKey> = {
            let mut index = self.lock_index();
            let keys: Vec<CacheKey> = index
                .iter()
                .filter(|(_, manifest)| self.is_expired(manifest, now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                index.remove(key);
            }
            keys
        };
        for key in &expired {
            remove_entry_dir(&self.entry_dir(key))?;
        }
        if !expired.is_empty() {
            info!(removed = expired.len(), "expired cache entries purged");
        }
        Ok(expired.len())
    }

    /// Drop every entry, including abandoned temporary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be listed or an entry cannot be deleted.
    pub fn clear(&self) -> CacheResult<usize> {
        let indexed = std::mem::take(&mut *self.lock_index()).len();
        let entries = fs::read_dir(&self.root)
            .map_err(|source| CacheError::io("cache.list", &self.root, source))?;
        let mut removed = 0_usize;
        for entry in entries {
            let entry = entry.map_err(|source| CacheError::io("cache.entry", &self.root, source))?;
            let path = entry.path();
            if path.is_dir() {
                remove_entry_dir(&path)?;
                removed += 1;
            }
        }
        info!(removed, indexed, "result cache cleared");
        Ok(removed)
    }

    fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    fn is_expired(&self, manifest: &CacheManifest, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(manifest.stored_at) >= self.ttl
    }

    fn cached_result(&self, key: &CacheKey, manifest: &CacheManifest) -> CachedResult {
        CachedResult {
            key: key.clone(),
            dir: self.entry_dir(key),
            stored_at: manifest.stored_at,
            files: manifest.files.clone(),
        }
    }

    fn select_evictions(&self, index: &mut HashMap<CacheKey, CacheManifest>) -> Vec<CacheKey> {
        let excess = index.len().saturating_sub(self.max_entries);
        if excess == 0 {
            return Vec::new();
        }
        let mut by_age: Vec<(DateTime<Utc>, CacheKey)> = index
            .iter()
            .map(|(key, manifest)| (manifest.stored_at, key.clone()))
            .collect();
        by_age.sort();
        let victims: Vec<CacheKey> = by_age.into_iter().take(excess).map(|(_, key)| key).collect();
        for key in &victims {
            index.remove(key);
        }
        victims
    }

    fn lock_index(&self) -> MutexGuard<'_, HashMap<CacheKey, CacheManifest>> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn load_index(root: &Path) -> CacheResult<HashMap<CacheKey, CacheManifest>> {
    let mut index = HashMap::new();
    let entries = fs::read_dir(root).map_err(|source| CacheError::io("cache.list", root, source))?;
    for entry in entries {
        let entry = entry.map_err(|source| CacheError::io("cache.entry", root, source))?;
        let name = entry.file_name();
        let Some(key) = name.to_str().and_then(CacheKey::parse) else {
            continue;
        };
        let path = entry.path();
        match read_manifest(&path) {
            Ok(manifest) if manifest.key == key.as_str() => {
                index.insert(key, manifest);
            }
            Ok(_) => {
                warn!(path = %path.display(), "cache manifest key mismatch; removing entry");
                discard(&path);
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable cache entry; removing");
                discard(&path);
            }
        }
    }
    Ok(index)
}

fn read_manifest(entry_dir: &Path) -> CacheResult<CacheManifest> {
    let path = entry_dir.join(MANIFEST_FILE);
    let raw = fs::read_to_string(&path).map_err(|source| CacheError::io("cache.manifest_read", &path, source))?;
    serde_json::from_str(&raw).map_err(|source| CacheError::manifest("cache.manifest_parse", &path, source))
}

fn write_entry(dir: &Path, manifest: &CacheManifest, stems: &[StemFile]) -> CacheResult<()> {
    fs::create_dir(dir).map_err(|source| CacheError::io("cache.tmp_dir", dir, source))?;
    for stem in stems {
        fs::copy(&stem.path, dir.join(&stem.name))
            .map_err(|source| CacheError::io("cache.copy", &stem.path, source))?;
    }
    let path = dir.join(MANIFEST_FILE);
    let serialised = serde_json::to_vec_pretty(manifest)
        .map_err(|source| CacheError::manifest("cache.manifest_serialize", &path, source))?;
    fs::write(&path, serialised).map_err(|source| CacheError::io("cache.manifest_write", &path, source))
}

fn remove_entry_dir(dir: &Path) -> CacheResult<()> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(CacheError::io("cache.remove", dir, source)),
    }
}

fn discard(dir: &Path) {
    if let Err(err) = remove_entry_dir(dir) {
        warn!(path = %dir.display(), error = %err, "failed to discard cache directory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn stems_in(dir: &Path, names: &[&str]) -> Result<Vec<StemFile>> {
        fs::create_dir_all(dir)?;
        names
            .iter()
            .map(|name| {
                let path = dir.join(name);
                fs::write(&path, name.as_bytes())?;
                Ok(StemFile {
                    name: (*name).to_string(),
                    path,
                    media_type: OutputFormat::Mp3.media_type(),
                })
            })
            .collect()
    }

    fn key_for(seed: &[u8]) -> CacheKey {
        CacheKey::compute(seed, "mdx_extra", Device::Cpu, OutputFormat::Mp3)
    }

    #[test]
    fn keys_depend_on_every_setting() {
        let base = key_for(b"mix");
        assert_eq!(base, key_for(b"mix"));
        assert_eq!(base.as_str().len(), KEY_LEN);
        assert_ne!(base, key_for(b"other mix"));
        assert_ne!(
            base,
            CacheKey::compute(b"mix", "htdemucs", Device::Cpu, OutputFormat::Mp3)
        );
        assert_ne!(
            base,
            CacheKey::compute(b"mix", "mdx_extra", Device::Gpu, OutputFormat::Mp3)
        );
        assert_ne!(
            base,
            CacheKey::compute(b"mix", "mdx_extra", Device::Cpu, OutputFormat::Flac)
        );
        assert_eq!(CacheKey::parse(base.as_str()), Some(base));
        assert!(CacheKey::parse("not-a-key").is_none());
    }

    #[test]
    fn store_lookup_restore() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = ResultCache::open(dir.path().join("cache"), Duration::from_secs(60), 4)?;
        let stems = stems_in(&dir.path().join("out"), &["vocals.mp3", "drums.mp3"])?;
        let key = key_for(b"mix");

        assert!(cache.lookup(&key)?.is_none());
        assert!(cache.store(&key, "mdx_extra", OutputFormat::Mp3, &stems)?);
        assert!(!cache.store(&key, "mdx_extra", OutputFormat::Mp3, &stems)?);

        let hit = cache.lookup(&key)?.ok_or_else(|| anyhow::anyhow!("expected hit"))?;
        assert_eq!(hit.files, vec!["drums.mp3", "vocals.mp3"]);

        let dest = dir.path().join("restored");
        cache.restore(&hit, &dest)?;
        assert_eq!(fs::read(dest.join("vocals.mp3"))?, b"vocals.mp3");
        Ok(())
    }

    #[test]
    fn expired_entries_are_not_served() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = ResultCache::open(dir.path().join("cache"), Duration::ZERO, 4)?;
        let stems = stems_in(&dir.path().join("out"), &["bass.mp3"])?;
        let key = key_for(b"stale");
        assert!(cache.store(&key, "mdx_extra", OutputFormat::Mp3, &stems)?);
        assert!(cache.lookup(&key)?.is_none());
        assert!(!cache.root().join(key.as_str()).exists());
        Ok(())
    }

    #[test]
    fn index_survives_reopen_and_purges_old_entries() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().join("cache");
        let stems = stems_in(&dir.path().join("out"), &["other.mp3"])?;
        let fresh = key_for(b"fresh");
        let old = key_for(b"old");
        {
            let cache = ResultCache::open(&root, Duration::from_secs(3600), 4)?;
            cache.store(&fresh, "mdx_extra", OutputFormat::Mp3, &stems)?;
            cache.store(&old, "mdx_extra", OutputFormat::Mp3, &stems)?;
        }

        let manifest_path = root.join(old.as_str()).join(MANIFEST_FILE);
        let mut manifest: CacheManifest = serde_json::from_str(&fs::read_to_string(&manifest_path)?)?;
        manifest.stored_at -= TimeDelta::hours(2);
        fs::write(&manifest_path, serde_json::to_vec(&manifest)?)?;
        fs::create_dir(root.join(old.as_str()[..8].to_string()))?;

        let cache = ResultCache::open(&root, Duration::from_secs(3600), 4)?;
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.purge_expired()?, 1);
        assert!(cache.lookup(&old)?.is_none());
        assert!(cache.lookup(&fresh)?.is_some());
        Ok(())
    }

    #[test]
    fn oldest_entries_are_evicted_past_capacity() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = ResultCache::open(dir.path().join("cache"), Duration::from_secs(60), 2)?;
        let stems = stems_in(&dir.path().join("out"), &["vocals.mp3"])?;
        let keys: Vec<CacheKey> = [b"a", b"b", b"c"].iter().map(|seed| key_for(*seed)).collect();
        for key in &keys {
            cache.store(key, "mdx_extra", OutputFormat::Mp3, &stems)?;
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.lookup(&keys[0])?.is_none());
        assert!(cache.lookup(&keys[2])?.is_some());
        Ok(())
    }

    #[test]
    fn invalidate_and_clear() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = ResultCache::open(dir.path().join("cache"), Duration::from_secs(60), 4)?;
        let stems = stems_in(&dir.path().join("out"), &["vocals.mp3"])?;
        let first = key_for(b"first");
        let second = key_for(b"second");
        cache.store(&first, "mdx_extra", OutputFormat::Mp3, &stems)?;
        cache.store(&second, "mdx_extra", OutputFormat::Mp3, &stems)?;

        assert!(cache.invalidate(&first)?);
        assert!(!cache.invalidate(&first)?);
        assert!(cache.lookup(&first)?.is_none());

        assert_eq!(cache.clear()?, 1);
        assert!(cache.is_empty());
        assert!(cache.lookup(&second)?.is_none());
        Ok(())
    }
}
