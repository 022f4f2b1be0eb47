//! Segment files on disk: naming, retention and hourly snapshots.
//!
//! Raw segments live in a date-partitioned cache and are evicted as a sliding
//! window; merged recordings go to a date-partitioned archive.

use crate::config::StorageConfig;
use crate::frame::Frame;
use chrono::{DateTime, Local, NaiveDate, Timelike};
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors writing store files.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to create directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write snapshot {path}: {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Directory layout of segments, recordings and snapshots.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    cache_dir: PathBuf,
    archive_dir: PathBuf,
    image_dir: PathBuf,
}

impl From<&StorageConfig> for StorageLayout {
    fn from(config: &StorageConfig) -> Self {
        Self::new(&config.cache_dir, &config.archive_dir, &config.image_dir)
    }
}

impl StorageLayout {
    pub fn new(cache_dir: &Path, archive_dir: &Path, image_dir: &Path) -> Self {
        Self {
            cache_dir: cache_dir.to_path_buf(),
            archive_dir: archive_dir.to_path_buf(),
            image_dir: image_dir.to_path_buf(),
        }
    }

    /// `cache/<date>/<date>_<time>-<millis>.mts`
    pub fn segment_path(&self, now: DateTime<Local>) -> PathBuf {
        self.cache_dir
            .join(now.format("%Y-%m-%d").to_string())
            .join(format!("{}.mts", now.format("%Y-%m-%d_%H-%M-%S-%3f")))
    }

    /// `archive/<date>/<date>_<time>.mp4`
    pub fn recording_path(&self, now: DateTime<Local>) -> PathBuf {
        self.archive_dir
            .join(now.format("%Y-%m-%d").to_string())
            .join(format!("{}.mp4", now.format("%Y-%m-%d_%H-%M-%S")))
    }

    /// `images/<date>_<time>.png`
    pub fn snapshot_path(&self, now: DateTime<Local>) -> PathBuf {
        self.image_dir
            .join(format!("{}.png", now.format("%Y-%m-%d_%H-%M-%S")))
    }

    /// Create the parent directory of `path`.
    pub fn prepare(path: &Path) -> Result<(), StoreError> {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                fs::create_dir_all(parent).map_err(|source| StoreError::Directory {
                    path: parent.to_path_buf(),
                    source,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Sliding window over emitted segment files.
///
/// Once more than `high` segments are queued, the oldest are deleted until
/// `low` remain.
#[derive(Debug)]
pub struct RetentionQueue {
    entries: VecDeque<PathBuf>,
    high: usize,
    low: usize,
    delete_files: bool,
}

impl RetentionQueue {
    pub fn new(high: usize, low: usize, delete_files: bool) -> Self {
        Self {
            entries: VecDeque::new(),
            high,
            low: low.min(high),
            delete_files,
        }
    }

    pub fn push(&mut self, path: PathBuf) {
        self.entries.push_back(path);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict down to the low watermark if the high watermark is exceeded.
    ///
    /// Returns the evicted paths, oldest first.
    pub fn evict(&mut self) -> Vec<PathBuf> {
        if self.entries.len() <= self.high {
            return Vec::new();
        }

        let count = self.entries.len() - self.low;
        let evicted: Vec<PathBuf> = self.entries.drain(..count).collect();

        if self.delete_files {
            for path in &evicted {
                match fs::remove_file(path) {
                    Ok(()) => debug!(segment = %path.display(), "Segment evicted"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        debug!(segment = %path.display(), "Evicted segment already gone")
                    }
                    Err(e) => {
                        warn!(segment = %path.display(), error = %e, "Failed to delete segment")
                    }
                }
            }
        }

        info!(
            evicted = evicted.len(),
            retained = self.entries.len(),
            "Segment cache trimmed"
        );
        evicted
    }
}

/// Allows at most one full-frame snapshot per wall-clock hour.
#[derive(Debug, Default)]
pub struct SnapshotSchedule {
    last: Option<(NaiveDate, u32)>,
}

impl SnapshotSchedule {
    /// Whether a snapshot is due at `now`; marks the hour as taken if so.
    pub fn claim(&mut self, now: DateTime<Local>) -> bool {
        let hour = (now.date_naive(), now.hour());
        if self.last == Some(hour) {
            return false;
        }
        self.last = Some(hour);
        true
    }
}

/// Write a frame as PNG.
pub fn write_snapshot(frame: &Frame, path: &Path) -> Result<(), StoreError> {
    StorageLayout::prepare(path)?;
    image::save_buffer(
        path,
        &frame.data,
        frame.width,
        frame.height,
        image::ColorType::Rgb8,
    )
    .map_err(|source| StoreError::Snapshot {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 11, 20, h, m, s).unwrap()
    }

    #[test]
    fn test_layout_paths_are_date_partitioned() {
        let layout = StorageLayout::new(
            Path::new("/cache"),
            Path::new("/archive"),
            Path::new("/images"),
        );
        let now = at(5, 55, 30);

        assert_eq!(
            layout.segment_path(now),
            PathBuf::from("/cache/2025-11-20/2025-11-20_05-55-30-000.mts")
        );
        assert_eq!(
            layout.recording_path(now),
            PathBuf::from("/archive/2025-11-20/2025-11-20_05-55-30.mp4")
        );
        assert_eq!(
            layout.snapshot_path(now),
            PathBuf::from("/images/2025-11-20_05-55-30.png")
        );
    }

    #[test]
    fn test_retention_below_high_watermark_keeps_everything() {
        let mut queue = RetentionQueue::new(5, 2, false);
        for i in 0..5 {
            queue.push(PathBuf::from(format!("{}.mts", i)));
        }
        assert!(queue.evict().is_empty());
        assert_eq!(queue.len(), 5);
    }

    #[test]
    fn test_retention_evicts_to_low_watermark_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let mut queue = RetentionQueue::new(5, 2, true);
        let paths: Vec<PathBuf> = (0..6)
            .map(|i| {
                let path = dir.path().join(format!("{}.mts", i));
                fs::write(&path, b"ts").unwrap();
                path
            })
            .collect();
        for path in &paths {
            queue.push(path.clone());
        }

        let evicted = queue.evict();

        assert_eq!(evicted, paths[..4].to_vec());
        assert_eq!(queue.len(), 2);
        assert!(paths[..4].iter().all(|p| !p.exists()));
        assert!(paths[4..].iter().all(|p| p.exists()));

        // Nothing more until the high watermark is exceeded again.
        assert!(queue.evict().is_empty());
    }

    #[test]
    fn test_retention_tolerates_missing_files() {
        let mut queue = RetentionQueue::new(1, 0, true);
        queue.push(PathBuf::from("/nonexistent/a.mts"));
        queue.push(PathBuf::from("/nonexistent/b.mts"));
        assert_eq!(queue.evict().len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_snapshot_once_per_hour() {
        let mut schedule = SnapshotSchedule::default();
        assert!(schedule.claim(at(5, 0, 10)));
        assert!(!schedule.claim(at(5, 30, 0)));
        assert!(!schedule.claim(at(5, 59, 59)));
        assert!(schedule.claim(at(6, 0, 0)));
    }

    #[test]
    fn test_write_snapshot_creates_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("images").join("snap.png");
        write_snapshot(&Frame::filled(8, 4, [10, 20, 30]), &path).unwrap();
        assert!(path.exists());
    }
}
