//! File-backed section cache.
//!
//! One file per section, region and monitored host: the first line is the
//! fetch timestamp (epoch seconds), the rest is the JSON payload. Validity is
//! decided by comparing timestamps, never content. A sibling config-hash file
//! detects CLI-argument changes between polls; on a mismatch the whole cache
//! is bypassed for that run and the hash is rewritten.
//!
//! The agent runs as one process per poll, so no cross-process locking is
//! done; concurrent invocations against the same cache path are not supported.

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

/// A cache entry read back from disk.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: Value,
    pub timestamp: i64,
}

impl CacheEntry {
    /// Valid while the entry is younger than the section's cache interval.
    pub fn is_valid(&self, interval_secs: u64) -> bool {
        let age = Utc::now().timestamp() - self.timestamp;
        age >= 0 && (age as u64) < interval_secs
    }
}

pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// Cache root for one monitored host: `<base>/<hostname>/`.
    pub fn new(base: &Path, hostname: &str) -> Self {
        Self {
            root: base.join(hostname),
        }
    }

    /// Default base directory under the user cache dir.
    pub fn default_base() -> PathBuf {
        directories::ProjectDirs::from("com", "", "awsagent")
            .map(|dirs| dirs.cache_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".awsagent-cache"))
    }

    fn entry_path(&self, section: &str, region: &str) -> PathBuf {
        self.root.join(region).join(section)
    }

    pub fn read(&self, section: &str, region: &str) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(section, region);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read cache file {}", path.display()))?;
        let Some((first, rest)) = text.split_once('\n') else {
            debug!(section, region, "cache file truncated, ignoring");
            return Ok(None);
        };
        let Ok(timestamp) = first.trim().parse::<i64>() else {
            debug!(section, region, "cache file has no timestamp, ignoring");
            return Ok(None);
        };
        let payload: Value = match serde_json::from_str(rest) {
            Ok(v) => v,
            Err(err) => {
                debug!(section, region, %err, "cache payload unparseable, ignoring");
                return Ok(None);
            }
        };
        Ok(Some(CacheEntry { payload, timestamp }))
    }

    pub fn write(&self, section: &str, region: &str, payload: &Value, timestamp: i64) -> Result<()> {
        let path = self.entry_path(section, region);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create cache dir {}", parent.display()))?;
        }
        let body = format!("{}\n{}", timestamp, serde_json::to_string(payload)?);
        fs::write(&path, body)
            .with_context(|| format!("failed to write cache file {}", path.display()))?;
        debug!(section, region, timestamp, "cache entry written");
        Ok(())
    }

    /// Compare the stored config hash against `current`; returns true when the
    /// configuration changed (or no hash was stored) and the cache must be
    /// bypassed. The new hash is persisted either way.
    pub fn config_changed(&self, current: u64) -> Result<bool> {
        let path = self.root.join("agent-config.hash");
        let stored = fs::read_to_string(&path)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok());
        if stored == Some(current) {
            return Ok(false);
        }
        if stored.is_some() {
            info!("agent configuration changed, bypassing caches for this run");
        }
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create cache dir {}", self.root.display()))?;
        fs::write(&path, current.to_string())
            .with_context(|| format!("failed to write config hash {}", path.display()))?;
        Ok(true)
    }
}

/// Stable-enough hash of the CLI arguments for change detection.
pub fn config_hash(parts: &[String]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for part in parts {
        part.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> (tempfile::TempDir, CacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path(), "testhost");
        (dir, store)
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let (_dir, store) = store();
        let payload = serde_json::json!([{"InstanceId": "i-0001"}]);
        store.write("ec2_summary", "eu-west-1", &payload, 1234).unwrap();

        let entry = store.read("ec2_summary", "eu-west-1").unwrap().unwrap();
        assert_eq!(entry.timestamp, 1234);
        assert_eq!(entry.payload, payload);
    }

    #[test]
    fn test_missing_entry_reads_none() {
        let (_dir, store) = store();
        assert!(store.read("ec2_summary", "eu-west-1").unwrap().is_none());
    }

    #[test]
    fn test_entries_are_scoped_per_region() {
        let (_dir, store) = store();
        store
            .write("ec2_summary", "eu-west-1", &serde_json::json!([1]), 1)
            .unwrap();
        assert!(store.read("ec2_summary", "us-east-1").unwrap().is_none());
    }

    #[test]
    fn test_validity_by_age() {
        let now = Utc::now().timestamp();
        let entry = CacheEntry {
            payload: Value::Null,
            timestamp: now - 30,
        };
        assert!(entry.is_valid(60));
        assert!(!entry.is_valid(10));
    }

    #[test]
    fn test_config_hash_change_detection() {
        let (_dir, store) = store();
        let first = config_hash(&["--regions".into(), "eu-west-1".into()]);
        // First run: nothing stored yet, caches bypassed.
        assert!(store.config_changed(first).unwrap());
        // Same config again: caches usable.
        assert!(!store.config_changed(first).unwrap());
        // Config changed: bypass again.
        let second = config_hash(&["--regions".into(), "us-east-1".into()]);
        assert!(store.config_changed(second).unwrap());
    }

    #[test]
    fn test_corrupt_cache_file_is_ignored() {
        let (_dir, store) = store();
        let path = store.entry_path("ec2_summary", "eu-west-1");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "not a timestamp\n{]").unwrap();
        assert!(store.read("ec2_summary", "eu-west-1").unwrap().is_none());
    }
}
