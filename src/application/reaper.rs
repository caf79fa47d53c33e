//! Age-based removal of scratch space that no run will clean up: job
//! directories of killed workers and upload spools of dropped requests.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Entries whose mtime is older than this are removed.
    pub max_age: Duration,
    pub interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(24 * 60 * 60),
            interval: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    pub scanned: usize,
    pub removed: usize,
    pub errors: usize,
}

/// A directory whose entries starting with `prefix` belong to us. Anything
/// else in it is left alone, so the system temp dir is a valid root.
#[derive(Debug, Clone)]
struct ScratchRoot {
    dir: PathBuf,
    prefix: String,
}

pub struct ScratchReaper {
    roots: Vec<ScratchRoot>,
    config: ReaperConfig,
}

impl ScratchReaper {
    pub fn new(config: ReaperConfig) -> Self {
        Self {
            roots: Vec::new(),
            config,
        }
    }

    pub fn watch(mut self, dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        self.roots.push(ScratchRoot {
            dir: dir.into(),
            prefix: prefix.into(),
        });
        self
    }

    pub async fn reap(&self) -> ReapReport {
        let mut report = ReapReport::default();
        let now = SystemTime::now();
        for root in &self.roots {
            if let Err(e) = self.reap_root(root, now, &mut report).await {
                warn!(dir = %root.dir.display(), error = %e, "could not scan scratch root");
                report.errors += 1;
            }
        }
        report
    }

    async fn reap_root(
        &self,
        root: &ScratchRoot,
        now: SystemTime,
        report: &mut ReapReport,
    ) -> std::io::Result<()> {
        let mut entries = match tokio::fs::read_dir(&root.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_name().to_string_lossy().starts_with(&root.prefix) {
                continue;
            }
            report.scanned += 1;

            let path = entry.path();
            let meta = match tokio::fs::symlink_metadata(&path).await {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "could not stat scratch entry");
                    report.errors += 1;
                    continue;
                }
            };
            let age = meta
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age <= self.config.max_age {
                continue;
            }

            let removed = if meta.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match removed {
                Ok(()) => {
                    info!(path = %path.display(), age_secs = age.as_secs(), "removed stale scratch");
                    report.removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "could not remove stale scratch");
                    report.errors += 1;
                }
            }
        }
        Ok(())
    }

    /// Reap once right away, then every interval until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.reap().await;
                    debug!(scanned = report.scanned, removed = report.removed, errors = report.errors, "scratch reap done");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::path::Path;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn age(path: &Path, by: Duration) {
        File::open(path)
            .unwrap()
            .set_modified(SystemTime::now() - by)
            .unwrap();
    }

    fn job_dir(root: &Path, name: &str) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir_all(dir.join("hls")).unwrap();
        std::fs::write(dir.join("source"), b"mp4").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_only_old_prefixed_entries_are_removed() {
        let scratch = tempfile::tempdir().unwrap();
        let spool = scratch.path().join("spool");
        std::fs::create_dir_all(&spool).unwrap();

        let abandoned = job_dir(scratch.path(), "reelforge-v1-abc");
        let running = job_dir(scratch.path(), "reelforge-v2-def");
        let foreign = job_dir(scratch.path(), "someone-else");
        let dropped_upload = spool.join("upload-x1");
        let live_upload = spool.join("upload-x2");
        std::fs::write(&dropped_upload, b"partial").unwrap();
        std::fs::write(&live_upload, b"partial").unwrap();

        age(&abandoned, 2 * DAY);
        age(&foreign, 2 * DAY);
        age(&dropped_upload, 2 * DAY);

        let reaper = ScratchReaper::new(ReaperConfig::default())
            .watch(scratch.path(), "reelforge-")
            .watch(&spool, "upload-");
        let report = reaper.reap().await;

        assert_eq!(report.removed, 2);
        assert_eq!(report.errors, 0);
        assert!(!abandoned.exists());
        assert!(!dropped_upload.exists());
        assert!(running.exists());
        assert!(foreign.exists());
        assert!(live_upload.exists());
        assert!(spool.exists());
    }

    #[tokio::test]
    async fn test_missing_root_is_not_an_error() {
        let scratch = tempfile::tempdir().unwrap();
        let reaper = ScratchReaper::new(ReaperConfig::default())
            .watch(scratch.path().join("never-created"), "reelforge-");
        assert_eq!(reaper.reap().await, ReapReport::default());
    }

    #[tokio::test]
    async fn test_run_reaps_at_start_and_stops() {
        let scratch = tempfile::tempdir().unwrap();
        let abandoned = job_dir(scratch.path(), "reelforge-old");
        age(&abandoned, 2 * DAY);

        let reaper = ScratchReaper::new(ReaperConfig::default()).watch(scratch.path(), "reelforge-");
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { reaper.run(rx).await });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while abandoned.exists() {
            assert!(tokio::time::Instant::now() < deadline, "scratch was not reaped");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
