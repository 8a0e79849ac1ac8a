use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::constants::{MIN_SIGNATURE_LENGTH, SIGNATURE_CACHE_FILE};
use crate::models::SignatureCacheConfig;

const CLEANUP_INTERVAL_SECS: u64 = 30 * 60;
const FILE_VERSION: &str = "1.0";

/// One cached signature. `thinking_text` and `tool_ids` are only carried on
/// the per-session "last thinking" record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignatureEntry {
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    value: SignatureEntry,
    /// Unix ms at store time. Drives both TTLs.
    timestamp: i64,
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
struct CacheStatistics {
    stores: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
struct CacheFile {
    version: String,
    memory_ttl_seconds: u64,
    disk_ttl_seconds: u64,
    entries: std::collections::HashMap<String, StoredEntry>,
    #[serde(default)]
    statistics: CacheStatistics,
}

/// Claude thinking models reject resubmitted thinking blocks unless the
/// block carries the opaque signature the upstream issued with it. Hosts
/// routinely strip or truncate those signatures between turns, so this cache
/// remembers `(session, verbatim thinking text) -> signature` long enough to
/// re-attach them: one short TTL in memory, a longer one on disk so a plugin
/// restart inside a conversation still recovers.
pub struct SignatureCache {
    config: SignatureCacheConfig,
    path: PathBuf,
    memory: DashMap<String, StoredEntry>,
    /// Mirror of the last on-disk state, consulted on memory misses.
    disk: DashMap<String, StoredEntry>,
    dirty: AtomicBool,
    stores: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    task: tokio::sync::Mutex<Option<(tokio::task::JoinHandle<()>, CancellationToken)>>,
}

fn text_fingerprint(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    format!("{:x}", digest)[..16].to_string()
}

fn text_key(session_key: &str, text: &str) -> String {
    format!("sig:{}:{}", session_key, text_fingerprint(text))
}

fn last_key(session_key: &str) -> String {
    format!("last:{}", session_key)
}

impl SignatureCache {
    pub fn new(config: SignatureCacheConfig, dir: PathBuf) -> Self {
        let cache = Self {
            config,
            path: dir.join(SIGNATURE_CACHE_FILE),
            memory: DashMap::new(),
            disk: DashMap::new(),
            dirty: AtomicBool::new(false),
            stores: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            task: tokio::sync::Mutex::new(None),
        };
        cache.load_disk();
        cache
    }

    pub fn at_default_location(config: SignatureCacheConfig) -> Result<Self, String> {
        Ok(Self::new(config, crate::utils::paths::config_dir()?))
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn memory_ttl_ms(&self) -> i64 {
        (self.config.memory_ttl_seconds as i64) * 1000
    }

    fn disk_ttl_ms(&self) -> i64 {
        (self.config.disk_ttl_seconds as i64) * 1000
    }

    /// Remember a signature for a verbatim thinking text.
    pub fn store(&self, session_key: &str, thinking_text: &str, signature: &str) {
        if !self.config.enabled || signature.len() < MIN_SIGNATURE_LENGTH {
            return;
        }
        let entry = StoredEntry {
            value: SignatureEntry {
                signature: signature.to_string(),
                thinking_text: None,
                tool_ids: None,
            },
            timestamp: Self::now_ms(),
        };
        self.memory.insert(text_key(session_key, thinking_text), entry);
        self.dirty.store(true, Ordering::Relaxed);
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    /// Look a signature up by verbatim thinking text. Memory first, then the
    /// on-disk mirror; a disk hit is promoted back into memory.
    pub fn get(&self, session_key: &str, thinking_text: &str) -> Option<String> {
        if !self.config.enabled {
            return None;
        }
        self.lookup(&text_key(session_key, thinking_text))
            .map(|entry| entry.signature)
    }

    /// Record the session's most recent thinking block, used to synthesize a
    /// signed block when the host dropped the original.
    pub fn store_last(
        &self,
        session_key: &str,
        thinking_text: &str,
        signature: &str,
        tool_ids: Vec<String>,
    ) {
        if !self.config.enabled || signature.len() < MIN_SIGNATURE_LENGTH {
            return;
        }
        let entry = StoredEntry {
            value: SignatureEntry {
                signature: signature.to_string(),
                thinking_text: Some(thinking_text.to_string()),
                tool_ids: (!tool_ids.is_empty()).then_some(tool_ids),
            },
            timestamp: Self::now_ms(),
        };
        self.memory.insert(last_key(session_key), entry);
        self.dirty.store(true, Ordering::Relaxed);
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_last(&self, session_key: &str) -> Option<SignatureEntry> {
        if !self.config.enabled {
            return None;
        }
        self.lookup(&last_key(session_key))
    }

    /// Forget the session's "last thinking" record (crash-and-restart wipes
    /// the turn it came from).
    pub fn clear_last(&self, session_key: &str) {
        let key = last_key(session_key);
        self.memory.remove(&key);
        self.disk.remove(&key);
        self.dirty.store(true, Ordering::Relaxed);
    }

    fn lookup(&self, key: &str) -> Option<SignatureEntry> {
        let now = Self::now_ms();

        if let Some(entry) = self.memory.get(key) {
            if now - entry.timestamp <= self.memory_ttl_ms() {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
        }

        if let Some(entry) = self.disk.get(key) {
            if now - entry.timestamp <= self.disk_ttl_ms() {
                let value = entry.value.clone();
                drop(entry);
                // Promote with a fresh timestamp so it survives in memory.
                self.memory.insert(
                    key.to_string(),
                    StoredEntry {
                        value: value.clone(),
                        timestamp: now,
                    },
                );
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(value);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Evict memory entries past the memory TTL. Disk entries are pruned at
    /// flush time against the disk TTL.
    pub fn cleanup_memory(&self) {
        let now = Self::now_ms();
        let ttl = self.memory_ttl_ms();
        let before = self.memory.len();
        self.memory.retain(|_, entry| now - entry.timestamp <= ttl);
        let evicted = before.saturating_sub(self.memory.len());
        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            tracing::debug!(
                "[SignatureCache] memory cleanup: {} -> {} entries",
                before,
                self.memory.len()
            );
        }
    }

    /// Merge memory into the on-disk file and write it atomically. Existing
    /// disk entries younger than the disk TTL are kept; memory wins on key
    /// collisions.
    pub fn flush(&self) -> Result<(), String> {
        if !self.config.enabled {
            return Ok(());
        }
        let now = Self::now_ms();
        let disk_ttl = self.disk_ttl_ms();

        let mut entries: std::collections::HashMap<String, StoredEntry> = self
            .read_disk_file()
            .map(|file| file.entries)
            .unwrap_or_default();
        entries.retain(|_, entry| now - entry.timestamp <= disk_ttl);
        for pair in self.memory.iter() {
            entries.insert(pair.key().clone(), pair.value().clone());
        }

        let file = CacheFile {
            version: FILE_VERSION.to_string(),
            memory_ttl_seconds: self.config.memory_ttl_seconds,
            disk_ttl_seconds: self.config.disk_ttl_seconds,
            entries,
            statistics: CacheStatistics {
                stores: self.stores.load(Ordering::Relaxed),
                hits: self.hits.load(Ordering::Relaxed),
                misses: self.misses.load(Ordering::Relaxed),
                evictions: self.evictions.load(Ordering::Relaxed),
            },
        };

        let content = serde_json::to_string_pretty(&file)
            .map_err(|e| format!("failed_to_serialize_signature_cache: {}", e))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed_to_create_cache_dir: {}", e))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)
            .map_err(|e| format!("failed_to_write_signature_cache: {}", e))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| format!("failed_to_commit_signature_cache: {}", e))?;

        self.disk.clear();
        for (key, entry) in file.entries {
            self.disk.insert(key, entry);
        }
        self.dirty.store(false, Ordering::Relaxed);
        Ok(())
    }

    pub fn flush_if_dirty(&self) {
        if self.dirty.load(Ordering::Relaxed) {
            if let Err(e) = self.flush() {
                tracing::warn!("[SignatureCache] flush failed: {}", e);
            }
        }
    }

    fn read_disk_file(&self) -> Option<CacheFile> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<CacheFile>(&content) {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::warn!("[SignatureCache] ignoring unreadable cache file: {}", e);
                None
            }
        }
    }

    fn load_disk(&self) {
        if !self.config.enabled {
            return;
        }
        let Some(file) = self.read_disk_file() else {
            return;
        };
        let now = Self::now_ms();
        let disk_ttl = self.disk_ttl_ms();
        let mut kept = 0usize;
        for (key, entry) in file.entries {
            if now - entry.timestamp <= disk_ttl {
                self.disk.insert(key, entry);
                kept += 1;
            }
        }
        if kept > 0 {
            tracing::info!("[SignatureCache] loaded {} entries from disk", kept);
        }
    }

    /// Spawn the periodic flush and memory-cleanup tasks. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            return;
        }
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();
        let cache = self.clone();
        let write_interval = self.config.write_interval_seconds.max(1);
        let handle = tokio::spawn(async move {
            let mut flush_tick =
                tokio::time::interval(std::time::Duration::from_secs(write_interval));
            flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut cleanup_tick =
                tokio::time::interval(std::time::Duration::from_secs(CLEANUP_INTERVAL_SECS));
            cleanup_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first interval tick fires immediately; swallow both.
            flush_tick.tick().await;
            cleanup_tick.tick().await;
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => return,
                    _ = flush_tick.tick() => cache.flush_if_dirty(),
                    _ = cleanup_tick.tick() => cache.cleanup_memory(),
                }
            }
        });
        *task = Some((handle, cancel));
    }

    /// Stop the background tasks and do a final flush.
    pub async fn stop(&self) {
        let taken = self.task.lock().await.take();
        if let Some((handle, cancel)) = taken {
            cancel.cancel();
            let _ = handle.await;
        }
        self.flush_if_dirty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            ".antigravity-sigcache-{}-{}",
            std::process::id(),
            tag
        ));
        let _ = std::fs::create_dir_all(&dir);
        let _ = std::fs::remove_file(dir.join(SIGNATURE_CACHE_FILE));
        dir
    }

    fn sig(len: usize) -> String {
        "s".repeat(len)
    }

    #[test]
    fn round_trip_within_memory_ttl() {
        let cache = SignatureCache::new(SignatureCacheConfig::default(), test_dir("roundtrip"));
        let signature = sig(64);
        cache.store("sess-1", "thinking about code", &signature);
        assert_eq!(
            cache.get("sess-1", "thinking about code"),
            Some(signature)
        );
        assert_eq!(cache.get("sess-1", "different text"), None);
        assert_eq!(cache.get("sess-2", "thinking about code"), None);
    }

    #[test]
    fn short_signatures_are_never_cached() {
        let cache = SignatureCache::new(SignatureCacheConfig::default(), test_dir("short"));
        cache.store("sess-1", "text", &sig(MIN_SIGNATURE_LENGTH - 1));
        assert_eq!(cache.get("sess-1", "text"), None);
        cache.store_last("sess-1", "text", &sig(10), vec![]);
        assert!(cache.get_last("sess-1").is_none());
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let config = SignatureCacheConfig {
            enabled: false,
            ..Default::default()
        };
        let cache = SignatureCache::new(config, test_dir("disabled"));
        cache.store("sess-1", "text", &sig(64));
        assert_eq!(cache.get("sess-1", "text"), None);
    }

    #[test]
    fn expired_memory_entry_survives_on_disk_until_disk_ttl() {
        // Zero memory TTL: everything ages out of memory instantly, but the
        // 48h disk TTL keeps flushed entries retrievable.
        let config = SignatureCacheConfig {
            memory_ttl_seconds: 0,
            ..Default::default()
        };
        let dir = test_dir("diskfallback");
        let cache = SignatureCache::new(config, dir);
        let signature = sig(64);
        cache.store("sess-1", "long thought", &signature);
        cache.flush().expect("flush");
        std::thread::sleep(std::time::Duration::from_millis(5));
        cache.cleanup_memory();

        assert_eq!(cache.get("sess-1", "long thought"), Some(signature));
    }

    #[test]
    fn flush_merges_and_reload_restores() {
        let dir = test_dir("reload");
        let signature = sig(80);
        {
            let cache =
                SignatureCache::new(SignatureCacheConfig::default(), dir.clone());
            cache.store("sess-1", "alpha", &signature);
            cache.store_last("sess-1", "alpha", &signature, vec!["tool-1".into()]);
            cache.flush().expect("flush");
        }

        let cache = SignatureCache::new(SignatureCacheConfig::default(), dir);
        assert_eq!(cache.get("sess-1", "alpha"), Some(signature.clone()));
        let last = cache.get_last("sess-1").expect("last entry");
        assert_eq!(last.signature, signature);
        assert_eq!(last.thinking_text.as_deref(), Some("alpha"));
        assert_eq!(last.tool_ids, Some(vec!["tool-1".to_string()]));
    }

    #[test]
    fn memory_wins_over_disk_on_collision() {
        let dir = test_dir("collision");
        let cache = SignatureCache::new(SignatureCacheConfig::default(), dir);
        let old = sig(60);
        let new = format!("{}{}", sig(60), "-v2");
        cache.store("sess-1", "beta", &old);
        cache.flush().expect("flush");
        cache.store("sess-1", "beta", &new);
        cache.flush().expect("flush again");
        assert_eq!(cache.get("sess-1", "beta"), Some(new));
    }

    #[test]
    fn clear_last_removes_both_layers() {
        let dir = test_dir("clearlast");
        let cache = SignatureCache::new(SignatureCacheConfig::default(), dir);
        cache.store_last("sess-1", "gamma", &sig(64), vec![]);
        cache.flush().expect("flush");
        cache.clear_last("sess-1");
        assert!(cache.get_last("sess-1").is_none());
    }

    #[tokio::test]
    async fn background_tasks_start_once_and_stop_flushes() {
        let dir = test_dir("tasks");
        let cache = Arc::new(SignatureCache::new(
            SignatureCacheConfig::default(),
            dir.clone(),
        ));
        cache.start().await;
        cache.start().await;
        cache.store("sess-1", "delta", &sig(64));
        cache.stop().await;

        // stop() flushed the dirty entry to disk.
        let reloaded = SignatureCache::new(SignatureCacheConfig::default(), dir);
        assert_eq!(reloaded.get("sess-1", "delta"), Some(sig(64)));
    }
}
