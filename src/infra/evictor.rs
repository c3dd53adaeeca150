//! Capacity-bounded eviction of whole cache entries, oldest first.
//!
//! A pass lists the top-level entries of the cache root, and while their total
//! size is at or above the target it deletes the entry with the oldest
//! modification time and rescans. Passes are serialized in-process by a mutex
//! and across processes by a lock file in the cache root.
//!
//! Entries pinned through [`EntryPins`] are skipped. Each pass also clears
//! staging directories abandoned by crashed or interrupted writes.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use metrics::{counter, gauge};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use super::file_cache::STAGING_DIR;
use super::pins::EntryPins;
use crate::config::CacheSettings;
use crate::util::bytes::format_bytes;

const SOURCE: &str = "infra::evictor";
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub const DEFAULT_RATIO: f64 = 0.7;
pub const DEFAULT_LOCK_STALE: Duration = Duration::from_secs(600);
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);
pub const LOCK_FILE_NAME: &str = "file-cache.lock";

pub const METRIC_EVICTED_TOTAL: &str = "docgen_file_cache_evicted_total";
pub const METRIC_EVICTED_BYTES_TOTAL: &str = "docgen_file_cache_evicted_bytes_total";
pub const METRIC_SIZE_BYTES: &str = "docgen_file_cache_size_bytes";

#[derive(Debug, Error)]
pub enum EvictionError {
    #[error("failed to acquire cache lock {}: {source}", .path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cache lock {} still held after {waited:?}", .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },
    #[error("failed to scan cache directory {}: {source}", .path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("eviction scan task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Size bounds applied by a cleanup pass.
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionPolicy {
    /// Configured ceiling; `None` disables eviction.
    pub max_size: Option<u64>,
    /// Floor for the target size.
    pub min_retain: u64,
    /// Fraction of `max_size` to prune down to.
    pub ratio: f64,
    pub lock_stale: Duration,
    pub lock_wait: Duration,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            max_size: None,
            min_retain: 0,
            ratio: DEFAULT_RATIO,
            lock_stale: DEFAULT_LOCK_STALE,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }
}

impl EvictionPolicy {
    pub fn from_settings(cache: &CacheSettings) -> Self {
        Self {
            max_size: cache.max_size,
            min_retain: cache.min_retain,
            ratio: cache.ratio,
            lock_stale: cache.lock_stale,
            lock_wait: cache.lock_wait,
        }
    }

    /// `max(max_size * ratio, min_retain)`, or `None` when disabled.
    pub fn target_size(&self) -> Option<u64> {
        self.max_size.map(|max| {
            let scaled = (max as f64 * self.ratio).ceil() as u64;
            scaled.max(self.min_retain)
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No maximum size configured.
    Disabled,
    /// The cache directory is the shared OS temp directory.
    TempDir,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedEntry {
    pub name: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub skipped: Option<SkipReason>,
    pub target_bytes: u64,
    pub initial_bytes: u64,
    pub final_bytes: u64,
    /// Entries deleted, oldest first.
    pub removed: Vec<RemovedEntry>,
    /// Entries whose deletion failed.
    pub failed: Vec<String>,
    /// Abandoned staging directories cleared before the size check.
    pub staging_swept: Vec<String>,
}

impl CleanupReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }

    pub fn removed_bytes(&self) -> u64 {
        self.removed.iter().map(|entry| entry.size_bytes).sum()
    }
}

/// One evictable top-level cache entry.
#[derive(Debug, Clone)]
struct Candidate {
    name: String,
    path: PathBuf,
    is_dir: bool,
    size_bytes: u64,
    modified: SystemTime,
}

/// Deletes one top-level cache entry.
#[async_trait]
pub trait EntryRemover: Send + Sync {
    async fn remove(&self, path: &Path, is_dir: bool) -> io::Result<()>;
}

/// Removes entries from the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsRemover;

#[async_trait]
impl EntryRemover for FsRemover {
    async fn remove(&self, path: &Path, is_dir: bool) -> io::Result<()> {
        if is_dir {
            fs::remove_dir_all(path).await
        } else {
            fs::remove_file(path).await
        }
    }
}

pub struct CacheEvictor {
    dir: PathBuf,
    policy: EvictionPolicy,
    pins: EntryPins,
    remover: Arc<dyn EntryRemover>,
    running: Mutex<()>,
}

impl CacheEvictor {
    pub fn new(dir: impl Into<PathBuf>, policy: EvictionPolicy) -> Self {
        Self {
            dir: dir.into(),
            policy,
            pins: EntryPins::default(),
            remover: Arc::new(FsRemover),
            running: Mutex::new(()),
        }
    }

    /// Share the in-use registry consulted before each deletion.
    pub fn with_pins(mut self, pins: EntryPins) -> Self {
        self.pins = pins;
        self
    }

    pub fn with_remover(mut self, remover: Arc<dyn EntryRemover>) -> Self {
        self.remover = remover;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }

    /// Run one eviction pass. Safe to call concurrently; passes queue up.
    pub async fn run_cleanup(&self) -> Result<CleanupReport, EvictionError> {
        let Some(target) = self.policy.target_size() else {
            debug!(
                target = SOURCE,
                directory = %self.dir.display(),
                "maximum cache size not defined; skipping cleanup"
            );
            return Ok(CleanupReport::skipped(SkipReason::Disabled));
        };

        if is_os_temp_dir(&self.dir) {
            info!(
                target = SOURCE,
                directory = %self.dir.display(),
                "cache points to OS temp directory; skipping cleanup"
            );
            return Ok(CleanupReport::skipped(SkipReason::TempDir));
        }

        let _running = self.running.lock().await;
        let _lock = CacheLock::acquire(&self.dir, self.policy.lock_stale, self.policy.lock_wait)
            .await?;

        let mut report = CleanupReport {
            target_bytes: target,
            staging_swept: sweep_staging(self.dir.clone(), self.policy.lock_stale).await?,
            ..CleanupReport::default()
        };
        let mut failed = HashSet::new();
        let mut first_scan = true;

        loop {
            let candidates = scan_entries(self.dir.clone()).await?;
            let total: u64 = candidates.iter().map(|entry| entry.size_bytes).sum();
            gauge!(METRIC_SIZE_BYTES).set(total as f64);

            if first_scan {
                report.initial_bytes = total;
                first_scan = false;
                let status = if total < target { "below" } else { "above" };
                info!(
                    target = SOURCE,
                    directory = %self.dir.display(),
                    size = %format_bytes(total),
                    threshold = %format_bytes(target),
                    status,
                    "cache size checked"
                );
            }
            report.final_bytes = total;

            if total < target {
                break;
            }

            let mut progressed = false;
            for candidate in &candidates {
                if failed.contains(&candidate.name) {
                    continue;
                }
                let Some(_claim) = self.pins.claim(&candidate.name) else {
                    debug!(
                        target = SOURCE,
                        entry = %candidate.name,
                        "cache entry in use; skipping"
                    );
                    continue;
                };
                match self.remove_candidate(candidate).await {
                    Ok(()) => {
                        counter!(METRIC_EVICTED_TOTAL).increment(1);
                        counter!(METRIC_EVICTED_BYTES_TOTAL).increment(candidate.size_bytes);
                        debug!(
                            target = SOURCE,
                            entry = %candidate.name,
                            size_bytes = candidate.size_bytes,
                            "evicted cache entry"
                        );
                        report.removed.push(RemovedEntry {
                            name: candidate.name.clone(),
                            size_bytes: candidate.size_bytes,
                        });
                        progressed = true;
                        break;
                    }
                    Err(err) => {
                        warn!(
                            target = SOURCE,
                            entry = %candidate.name,
                            error = %err,
                            "failed to evict cache entry; trying next oldest"
                        );
                        failed.insert(candidate.name.clone());
                        report.failed.push(candidate.name.clone());
                    }
                }
            }

            if !progressed {
                break;
            }
        }

        info!(
            target = SOURCE,
            removed = report.removed.len(),
            freed = %format_bytes(report.removed_bytes()),
            size = %format_bytes(report.final_bytes),
            failed = report.failed.len(),
            "cache cleanup complete"
        );
        Ok(report)
    }

    async fn remove_candidate(&self, candidate: &Candidate) -> io::Result<()> {
        match self
            .remover
            .remove(&candidate.path, candidate.is_dir)
            .await
        {
            // Removed by someone else in the meantime.
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Remove staging directories whose newest file is older than `grace`.
///
/// Writes in progress keep touching their payload file, so only abandoned
/// directories age past the grace period.
async fn sweep_staging(dir: PathBuf, grace: Duration) -> Result<Vec<String>, EvictionError> {
    let swept = tokio::task::spawn_blocking(move || sweep_staging_blocking(&dir, grace)).await?;
    if !swept.is_empty() {
        info!(
            target = SOURCE,
            count = swept.len(),
            "removed abandoned staging directories"
        );
    }
    Ok(swept)
}

fn sweep_staging_blocking(dir: &Path, grace: Duration) -> Vec<String> {
    let staging = dir.join(STAGING_DIR);
    let mut swept = Vec::new();
    for entry in WalkDir::new(&staging).min_depth(1).max_depth(1) {
        let Ok(entry) = entry else {
            continue;
        };
        let Ok((_, newest)) = measure(entry.path()) else {
            continue;
        };
        let modified = newest.or_else(|| {
            entry
                .metadata()
                .ok()
                .and_then(|metadata| metadata.modified().ok())
        });
        let abandoned = modified
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age > grace);
        if !abandoned {
            continue;
        }

        let removed = if entry.file_type().is_dir() {
            std::fs::remove_dir_all(entry.path())
        } else {
            std::fs::remove_file(entry.path())
        };
        match removed {
            Ok(()) => swept.push(entry.file_name().to_string_lossy().into_owned()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                target = SOURCE,
                path = %entry.path().display(),
                error = %err,
                "failed to remove abandoned staging directory"
            ),
        }
    }
    swept
}

/// List evictable top-level entries, oldest first.
async fn scan_entries(dir: PathBuf) -> Result<Vec<Candidate>, EvictionError> {
    tokio::task::spawn_blocking(move || scan_entries_blocking(&dir)).await?
}

fn scan_entries_blocking(dir: &Path) -> Result<Vec<Candidate>, EvictionError> {
    let scan_error = |source| EvictionError::Scan {
        path: dir.to_path_buf(),
        source,
    };

    let mut candidates = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(scan_error)?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == LOCK_FILE_NAME || name == STAGING_DIR || name.starts_with('.') {
            continue;
        }

        let (size_bytes, newest) = measure(entry.path()).map_err(scan_error)?;

        let modified = match newest {
            Some(modified) => modified,
            None => entry
                .metadata()
                .ok()
                .and_then(|metadata| metadata.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH),
        };

        candidates.push(Candidate {
            name,
            path: entry.path().to_path_buf(),
            is_dir: entry.file_type().is_dir(),
            size_bytes,
            modified,
        });
    }

    candidates.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.name.cmp(&b.name)));
    Ok(candidates)
}

/// Total file size under `path` and the newest file modification time.
fn measure(path: &Path) -> Result<(u64, Option<SystemTime>), walkdir::Error> {
    let mut size_bytes = 0_u64;
    let mut newest: Option<SystemTime> = None;
    for item in WalkDir::new(path) {
        let item = match item {
            Ok(item) => item,
            // Entry vanished mid-scan.
            Err(err) if err.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) => {
                continue;
            }
            Err(err) => return Err(err),
        };
        if !item.file_type().is_file() {
            continue;
        }
        let Ok(metadata) = item.metadata() else {
            continue;
        };
        size_bytes += metadata.len();
        if let Ok(modified) = metadata.modified() {
            newest = Some(newest.map_or(modified, |seen| seen.max(modified)));
        }
    }
    Ok((size_bytes, newest))
}

/// Whether `dir` resolves to the OS temp directory itself.
pub fn is_os_temp_dir(dir: &Path) -> bool {
    match (
        std::fs::canonicalize(dir),
        std::fs::canonicalize(std::env::temp_dir()),
    ) {
        (Ok(dir), Ok(temp)) => dir == temp,
        _ => false,
    }
}

/// Cross-process exclusive lock backed by a file in the cache root.
///
/// The file is removed when the lock is dropped. A lock file older than the
/// stale threshold is assumed to belong to a crashed process and is replaced.
#[derive(Debug)]
pub struct CacheLock {
    path: PathBuf,
}

impl CacheLock {
    pub async fn acquire(
        dir: &Path,
        stale_after: Duration,
        wait: Duration,
    ) -> Result<Self, EvictionError> {
        let path = dir.join(LOCK_FILE_NAME);
        let started = Instant::now();

        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    let owner = format!("{}\n", std::process::id());
                    if let Err(err) = file.write_all(owner.as_bytes()).await {
                        debug!(target = SOURCE, error = %err, "failed to record lock owner");
                    }
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path, stale_after).await {
                        warn!(
                            target = SOURCE,
                            path = %path.display(),
                            "removing stale cache lock"
                        );
                        if let Err(source) = fs::remove_file(&path).await
                            && source.kind() != io::ErrorKind::NotFound
                        {
                            return Err(EvictionError::Lock { path, source });
                        }
                        continue;
                    }

                    let waited = started.elapsed();
                    if waited >= wait {
                        return Err(EvictionError::LockTimeout { path, waited });
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                Err(source) => return Err(EvictionError::Lock { path, source }),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path)
            && err.kind() != io::ErrorKind::NotFound
        {
            error!(
                target = SOURCE,
                path = %self.path.display(),
                error = %err,
                "failed to release cache lock"
            );
        }
    }
}

async fn lock_is_stale(path: &Path, stale_after: Duration) -> bool {
    let Ok(metadata) = fs::metadata(path).await else {
        return false;
    };
    metadata
        .modified()
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > stale_after)
}

/// Post-response hook: schedules a background pass, coalescing bursts.
#[derive(Clone)]
pub struct EvictionTrigger {
    evictor: Arc<CacheEvictor>,
    pending: Arc<AtomicBool>,
}

impl EvictionTrigger {
    pub fn new(evictor: Arc<CacheEvictor>) -> Self {
        Self {
            evictor,
            pending: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request a pass. Returns the spawned task, or `None` when one is
    /// already queued.
    pub fn notify(&self) -> Option<JoinHandle<()>> {
        if self.pending.swap(true, Ordering::AcqRel) {
            return None;
        }

        let evictor = Arc::clone(&self.evictor);
        let pending = Arc::clone(&self.pending);
        Some(tokio::spawn(async move {
            pending.store(false, Ordering::Release);
            log_outcome(evictor.run_cleanup().await);
        }))
    }
}

/// Run a pass every `every`, skipping the immediate first tick.
pub fn spawn_periodic_cleanup(evictor: Arc<CacheEvictor>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            log_outcome(evictor.run_cleanup().await);
        }
    })
}

fn log_outcome(outcome: Result<CleanupReport, EvictionError>) {
    if let Err(err) = outcome {
        error!(target = SOURCE, error = %err, "cache cleanup failed");
    }
}
