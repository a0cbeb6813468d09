//! # Eviction
//!
//! Keeps the cache directory under the registry's size budget. Files are
//! ranked by modification time, newest first; everything past the point
//! where the running total crosses the budget is deleted.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::fs;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cache::registry::CacheRegistry;
use crate::cache::types::Entry;
use crate::error::CacheResult;

/// Outcome of one eviction sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Files found in the cache directory
    pub files_scanned: usize,
    /// Total size of those files before the sweep
    pub bytes_used: u64,
    pub files_deleted: usize,
    pub bytes_deleted: u64,
    /// Files past the budget that were kept because a download or a reader
    /// still holds them
    pub files_skipped: usize,
    /// Budget the sweep enforced
    pub max_cache_size: u64,
}

struct CacheFile {
    path: PathBuf,
    len: u64,
    modified: SystemTime,
}

impl CacheRegistry {
    /// Run one sweep over the cache directory.
    pub async fn evict(&self) -> CacheResult<SweepReport> {
        let mut files = Vec::new();
        let mut dir = fs::read_dir(&self.cache_dir).await?;

        while let Some(item) = dir.next_entry().await? {
            let metadata = match item.metadata().await {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(path = ?item.path(), error = %e, "Failed to read cache file metadata");
                    continue;
                }
            };

            if !metadata.is_file() {
                continue;
            }

            files.push(CacheFile {
                path: item.path(),
                len: metadata.len(),
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }

        files.sort_by(|a, b| b.modified.cmp(&a.modified));

        let registered = self.entries_by_path();
        let mut report = SweepReport {
            files_scanned: files.len(),
            max_cache_size: self.max_cache_size,
            ..SweepReport::default()
        };

        for file in files {
            report.bytes_used += file.len;
            if report.bytes_used <= self.max_cache_size {
                continue;
            }

            if let Some((key, entry)) = registered.get(&file.path) {
                // checked under the registry lock so no `get` can hand the entry out in between
                let mut entries = self.entries.lock();
                if entry.is_downloading() || entry.is_in_use() {
                    debug!(key = %key, path = ?file.path, "Skipping file that is still in use");
                    report.files_skipped += 1;
                    continue;
                }
                if entries.get(key).is_some_and(|current| Arc::ptr_eq(current, entry)) {
                    entries.remove(key);
                }
            }

            debug!(path = ?file.path, size = file.len, "Deleting cached file");
            match fs::remove_file(&file.path).await {
                Ok(()) => {
                    report.files_deleted += 1;
                    report.bytes_deleted += file.len;
                }
                Err(e) => {
                    warn!(path = ?file.path, error = %e, "Failed to remove cache file");
                }
            }
        }

        info!(
            files_scanned = report.files_scanned,
            bytes_used = report.bytes_used,
            files_deleted = report.files_deleted,
            bytes_deleted = report.bytes_deleted,
            files_skipped = report.files_skipped,
            max_cache_size = report.max_cache_size,
            "Cache sweep finished"
        );

        Ok(report)
    }

    /// Start the periodic sweep on the registry's runtime. The task only
    /// holds a weak reference and ends once the registry is dropped.
    pub fn start_eviction_task(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let initial_delay = self.config.sweep_initial_delay;
        let period = self.config.sweep_interval.max(Duration::from_millis(1));

        self.context.runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + initial_delay, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                let Some(registry) = registry.upgrade() else {
                    debug!("Cache registry dropped, stopping eviction task");
                    break;
                };

                if let Err(e) = registry.evict().await {
                    warn!(error = %e, "Cache eviction failed");
                }
            }
        })
    }

    fn entries_by_path(&self) -> HashMap<PathBuf, (String, Arc<dyn Entry>)> {
        self.entries
            .lock()
            .iter()
            .map(|(key, entry)| {
                (
                    entry.file_path().to_path_buf(),
                    (key.clone(), entry.clone()),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CacheConfig;
    use crate::cache::test_util::{Behavior, ScriptedFetcher, payload, test_runtime};
    use std::fs::File;
    use std::path::Path;

    fn registry(dir: &Path, budget: u64, runtime: &tokio::runtime::Runtime) -> CacheRegistry {
        let fetcher = Arc::new(
            ScriptedFetcher::new(payload(2000), Behavior::Partial)
                .with_chunks(10, Duration::from_millis(20)),
        );
        let config = CacheConfig::builder()
            .with_cache_dir(dir)
            .with_max_cache_size(budget)
            .with_poll_interval(Duration::from_millis(10))
            .with_sweep_schedule(Duration::ZERO, Duration::from_millis(20))
            .build();
        CacheRegistry::new(config, fetcher, runtime.handle().clone()).unwrap()
    }

    fn write_aged(path: &Path, len: usize, age_secs: u64) {
        std::fs::write(path, vec![7u8; len]).unwrap();
        let modified = SystemTime::now() - Duration::from_secs(age_secs);
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(modified)
            .unwrap();
    }

    #[test]
    fn test_sweep_deletes_oldest_past_budget() {
        let runtime = test_runtime();
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 250, &runtime);

        let handle = registry.get("https://media.example.com/old.mp4").unwrap();
        let registered_path = handle.file_path().to_path_buf();
        handle.close();

        let cache_dir = registry.cache_dir().to_path_buf();
        write_aged(&cache_dir.join("newest"), 100, 10);
        write_aged(&cache_dir.join("newer"), 100, 20);
        write_aged(&cache_dir.join("older"), 100, 30);
        write_aged(&registered_path, 100, 40);
        assert_eq!(registry.len(), 1);

        let report = runtime.block_on(registry.evict()).unwrap();

        assert_eq!(report.files_scanned, 4);
        assert_eq!(report.bytes_used, 400);
        assert_eq!(report.files_deleted, 2);
        assert_eq!(report.bytes_deleted, 200);
        assert_eq!(report.files_skipped, 0);
        assert_eq!(report.max_cache_size, 250);

        assert!(cache_dir.join("newest").exists());
        assert!(cache_dir.join("newer").exists());
        assert!(!cache_dir.join("older").exists());
        assert!(!registered_path.exists());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_sweep_within_budget_keeps_everything() {
        let runtime = test_runtime();
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 1000, &runtime);

        write_aged(&registry.cache_dir().join("a"), 300, 10);
        write_aged(&registry.cache_dir().join("b"), 300, 20);

        let report = runtime.block_on(registry.evict()).unwrap();
        assert_eq!(report.files_scanned, 2);
        assert_eq!(report.files_deleted, 0);
        assert_eq!(report.bytes_used, 600);
    }

    #[test]
    fn test_sweep_skips_active_downloads() {
        let runtime = test_runtime();
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 0, &runtime);

        let handle = registry.get("https://media.example.com/live.mp4").unwrap();
        assert_eq!(handle.total_size().unwrap(), 2000);
        assert!(handle.is_downloading());

        write_aged(&registry.cache_dir().join("stale"), 100, 60);

        let report = runtime.block_on(registry.evict()).unwrap();
        assert_eq!(report.files_skipped, 1);
        assert_eq!(report.files_deleted, 1);
        assert!(handle.file_path().exists());
        assert!(!registry.cache_dir().join("stale").exists());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_sweep_keeps_files_with_open_handles() {
        let runtime = test_runtime();
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), 50, &runtime);

        let handle = registry.get("https://media.example.com/paused.mp4").unwrap();
        let path = handle.file_path().to_path_buf();
        write_aged(&path, 100, 60);
        assert!(!handle.is_downloading());

        let report = runtime.block_on(registry.evict()).unwrap();
        assert_eq!(report.files_skipped, 1);
        assert_eq!(report.files_deleted, 0);
        assert!(path.exists());
        assert_eq!(registry.len(), 1);

        handle.close();
        let report = runtime.block_on(registry.evict()).unwrap();
        assert_eq!(report.files_deleted, 1);
        assert!(!path.exists());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_eviction_task_stops_with_registry() {
        let runtime = test_runtime();
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(registry(dir.path(), 50, &runtime));

        let stale = registry.cache_dir().join("stale");
        write_aged(&stale, 100, 60);

        let task = registry.start_eviction_task();
        std::thread::sleep(Duration::from_millis(200));
        assert!(!stale.exists());

        drop(registry);
        runtime
            .block_on(async { tokio::time::timeout(Duration::from_secs(2), task).await })
            .unwrap()
            .unwrap();
    }
}
