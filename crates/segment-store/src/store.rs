// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Append-only rotating segment files with bounded disk usage.
//!
//! ```text
//!   write(bytes)
//!       │
//!       v
//!   ┌──────────────┐   would exceed    ┌──────────────┐   ┌──────────────┐
//!   │ open segment ├──────────────────>│ evict oldest ├──>│ open suffix+1│
//!   └──────┬───────┘  max_file_size    └──────────────┘   └──────┬───────┘
//!          │ fits                                                │
//!          v                                                     v
//!      append bytes <────────────────────────────────────────────┘
//! ```
//!
//! A store is a single writer. Running two stores against the same directory and name
//! is unsupported and not guarded against.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::errors::StoreError;
use crate::suffix::{segment_suffix, sort_by_suffix, trailing_suffix};

/// 50MB
pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;
pub const DEFAULT_MAX_FILE_COUNT: usize = 10;

/// Configuration for a [`RotatingStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Segment name prefix; files are named `<name>_<suffix>`
    pub name: String,
    /// Directory holding the segments. It must already exist.
    pub directory: PathBuf,
    /// Soft per-segment size bound, in bytes
    pub max_file_size: u64,
    /// Maximum number of segments kept after a rotation
    pub max_file_count: usize,
}

impl StoreConfig {
    pub fn new(name: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            directory: directory.into(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_file_count: DEFAULT_MAX_FILE_COUNT,
        }
    }

    #[must_use]
    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    #[must_use]
    pub fn with_max_file_count(mut self, max_file_count: usize) -> Self {
        self.max_file_count = max_file_count;
        self
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.name.is_empty() {
            return Err(StoreError::InvalidConfig("name must not be empty".to_string()));
        }
        if self.name.contains(std::path::is_separator) {
            return Err(StoreError::InvalidConfig(format!(
                "name must not contain a path separator, got: '{}'",
                self.name
            )));
        }
        if self.max_file_size == 0 {
            return Err(StoreError::InvalidConfig(
                "max_file_size must be greater than 0".to_string(),
            ));
        }
        if self.max_file_count == 0 {
            return Err(StoreError::InvalidConfig(
                "max_file_count must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

struct Segment {
    file: File,
    path: PathBuf,
    size: u64,
}

/// Rotating, size and count bounded append-only store.
pub struct RotatingStore {
    config: StoreConfig,
    /// Suffix of the segment that is (or will lazily become) open
    cursor: u64,
    current: Option<Segment>,
}

impl RotatingStore {
    /// Scans `config.directory` for existing segments and resumes numbering from the
    /// highest suffix found, or 0 when there are none. No file is created until the first
    /// write.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;

        let segments = list_segments_in(&config.directory, &config.name)?;
        let cursor = segments.last().map_or(0, |name| trailing_suffix(name));

        debug!(
            "Opened store '{}' in {} with {} existing segments, resuming at suffix {}",
            config.name,
            config.directory.display(),
            segments.len(),
            cursor
        );

        Ok(Self {
            config,
            cursor,
            current: None,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Appends `data` to the current segment.
    ///
    /// The segment rotates when it already holds data and `data` would push it past
    /// `max_file_size`. A single write larger than `max_file_size` still lands whole in a
    /// fresh segment, so the size bound is soft.
    pub fn write(&mut self, data: &[u8]) -> Result<(), StoreError> {
        let needs_rotation = match &self.current {
            Some(segment) => self.would_overflow(segment, data.len()),
            None => {
                let segment = self.open_segment(self.cursor)?;
                let overflow = self.would_overflow(&segment, data.len());
                self.current = Some(segment);
                overflow
            }
        };

        if needs_rotation {
            self.rotate()?;
        }

        let Some(segment) = self.current.as_mut() else {
            // rotate() always leaves a segment open when it succeeds
            return Err(StoreError::Write {
                path: self.segment_path(self.cursor),
                source: std::io::Error::new(std::io::ErrorKind::Other, "no open segment"),
            });
        };

        segment
            .file
            .write_all(data)
            .map_err(|source| StoreError::Write {
                path: segment.path.clone(),
                source,
            })?;
        segment.size += data.len() as u64;

        Ok(())
    }

    /// Syncs the open segment's data to disk. Does nothing before the first write.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        if let Some(segment) = self.current.as_mut() {
            segment
                .file
                .sync_data()
                .map_err(|source| StoreError::Write {
                    path: segment.path.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Segment file names sorted ascending by numeric suffix.
    pub fn list_segments(&self) -> Result<Vec<String>, StoreError> {
        list_segments_in(&self.config.directory, &self.config.name)
    }

    /// Path of the open segment, `None` before the first write.
    pub fn current_segment(&self) -> Option<&Path> {
        self.current.as_ref().map(|segment| segment.path.as_path())
    }

    fn would_overflow(&self, segment: &Segment, incoming: usize) -> bool {
        segment.size > 0 && segment.size.saturating_add(incoming as u64) > self.config.max_file_size
    }

    fn rotate(&mut self) -> Result<(), StoreError> {
        // Close before evicting so the open segment can be removed when max_file_count is 1
        if let Some(segment) = self.current.take() {
            debug!("Closing segment {} at {} bytes", segment.path.display(), segment.size);
        }

        self.enforce_retention()?;

        let next = self.cursor + 1;
        let segment = self.open_segment(next)?;
        self.cursor = next;
        self.current = Some(segment);
        Ok(())
    }

    /// Deletes the oldest segments until `max_file_count - 1` remain, leaving room for the
    /// segment about to be created.
    fn enforce_retention(&self) -> Result<(), StoreError> {
        let segments = self.list_segments()?;
        let keep = self.config.max_file_count - 1;
        if segments.len() <= keep {
            return Ok(());
        }

        let evict = segments.len() - keep;
        for name in &segments[..evict] {
            let path = self.config.directory.join(name);
            fs::remove_file(&path).map_err(|source| StoreError::Write {
                path: path.clone(),
                source,
            })?;
            info!("Evicted segment {}", path.display());
        }
        Ok(())
    }

    fn open_segment(&self, suffix: u64) -> Result<Segment, StoreError> {
        let path = self.segment_path(suffix);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| StoreError::Write {
                path: path.clone(),
                source,
            })?;
        let size = file
            .metadata()
            .map_err(|source| StoreError::Write {
                path: path.clone(),
                source,
            })?
            .len();

        debug!("Opened segment {} at {} bytes", path.display(), size);
        Ok(Segment { file, path, size })
    }

    fn segment_path(&self, suffix: u64) -> PathBuf {
        self.config
            .directory
            .join(format!("{}_{}", self.config.name, suffix))
    }
}

fn list_segments_in(directory: &Path, name: &str) -> Result<Vec<String>, StoreError> {
    let unreadable = |source| StoreError::DirectoryUnreadable {
        path: directory.to_path_buf(),
        source,
    };

    let mut files = Vec::new();
    for entry in fs::read_dir(directory).map_err(unreadable)? {
        let entry = entry.map_err(unreadable)?;
        if !entry.file_type().map_err(unreadable)?.is_file() {
            continue;
        }
        let Ok(file_name) = entry.file_name().into_string() else {
            continue;
        };
        if segment_suffix(&file_name, name).is_some() {
            files.push(file_name);
        }
    }

    sort_by_suffix(&mut files);
    Ok(files)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tracing_test::traced_test;

    const RECORD: &[u8] = b"0123456789\n";

    fn store(dir: &TempDir, max_file_size: u64, max_file_count: usize) -> RotatingStore {
        RotatingStore::open(
            StoreConfig::new("events", dir.path())
                .with_max_file_size(max_file_size)
                .with_max_file_count(max_file_count),
        )
        .unwrap()
    }

    fn size_of(dir: &TempDir, name: &str) -> u64 {
        fs::metadata(dir.path().join(name)).unwrap().len()
    }

    #[test]
    fn test_no_segment_before_first_write() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 50, 6);

        assert!(store.current_segment().is_none());
        assert!(store.list_segments().unwrap().is_empty());
    }

    #[test]
    fn test_first_write_creates_segment_zero() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir, 50, 6);

        store.write(RECORD).unwrap();

        assert_eq!(store.list_segments().unwrap(), vec!["events_0"]);
        assert_eq!(store.current_segment(), Some(dir.path().join("events_0").as_path()));
        assert_eq!(size_of(&dir, "events_0"), 11);
    }

    #[test]
    fn test_rotation_happens_before_the_overflowing_write() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir, 50, 6);

        for _ in 0..5 {
            store.write(RECORD).unwrap();
        }

        assert_eq!(store.list_segments().unwrap(), vec!["events_0", "events_1"]);
        assert_eq!(size_of(&dir, "events_0"), 44);
        assert_eq!(size_of(&dir, "events_1"), 11);
    }

    #[test]
    fn test_oversized_write_lands_whole_in_fresh_segment() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir, 50, 6);

        store.write(RECORD).unwrap();
        store.write(&[b'x'; 120]).unwrap();
        store.write(RECORD).unwrap();

        assert_eq!(
            store.list_segments().unwrap(),
            vec!["events_0", "events_1", "events_2"]
        );
        assert_eq!(size_of(&dir, "events_0"), 11);
        assert_eq!(size_of(&dir, "events_1"), 120);
        assert_eq!(size_of(&dir, "events_2"), 11);
    }

    #[test]
    fn test_retention_keeps_newest_contiguous_segments() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir, 50, 6);

        // 4 records per segment, 21 segments means 20 rotations
        for _ in 0..84 {
            store.write(RECORD).unwrap();
        }

        let segments = store.list_segments().unwrap();
        let suffixes: Vec<u64> = segments.iter().map(|s| trailing_suffix(s)).collect();
        assert_eq!(suffixes, (15..=20).collect::<Vec<u64>>());
    }

    #[test]
    fn test_retention_with_single_segment() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir, 10, 1);

        store.write(RECORD).unwrap();
        store.write(RECORD).unwrap();
        store.write(RECORD).unwrap();

        assert_eq!(store.list_segments().unwrap(), vec!["events_2"]);
    }

    #[test]
    fn test_restart_appends_to_highest_segment() {
        let dir = TempDir::new().unwrap();
        for suffix in 0..7 {
            fs::write(dir.path().join(format!("events_{suffix}")), b"old\n").unwrap();
        }
        fs::write(dir.path().join("events_7"), b"0123456789").unwrap();

        let mut store = store(&dir, 50, 10);
        store.write(RECORD).unwrap();

        assert_eq!(store.current_segment(), Some(dir.path().join("events_7").as_path()));
        assert_eq!(size_of(&dir, "events_7"), 21);
        let contents = fs::read(dir.path().join("events_7")).unwrap();
        assert!(contents.starts_with(b"0123456789"));
    }

    #[test]
    fn test_restart_rotates_past_full_segment() {
        let dir = TempDir::new().unwrap();
        for suffix in 0..7 {
            fs::write(dir.path().join(format!("events_{suffix}")), b"old\n").unwrap();
        }
        fs::write(dir.path().join("events_7"), [b'x'; 44]).unwrap();

        let mut store = store(&dir, 50, 10);
        store.write(RECORD).unwrap();

        assert_eq!(store.current_segment(), Some(dir.path().join("events_8").as_path()));
        assert_eq!(size_of(&dir, "events_7"), 44);
        assert_eq!(size_of(&dir, "events_8"), 11);
        assert_eq!(store.list_segments().unwrap().len(), 9);
    }

    #[test]
    fn test_other_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("audit_99"), b"not ours").unwrap();
        fs::write(dir.path().join("events.lock"), b"").unwrap();
        fs::create_dir(dir.path().join("events_50")).unwrap();

        let mut store = store(&dir, 50, 6);
        store.write(RECORD).unwrap();

        assert_eq!(store.list_segments().unwrap(), vec!["events_0"]);
        assert!(dir.path().join("audit_99").exists());
    }

    #[test]
    #[traced_test]
    fn test_foreign_files_survive_rotation() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("events_v2_40"), b"other store\n").unwrap();
        fs::write(dir.path().join("events_backup"), b"manual copy\n").unwrap();

        let mut store = store(&dir, 10, 2);
        for _ in 0..3 {
            store.write(RECORD).unwrap();
        }

        assert_eq!(store.current_segment(), Some(dir.path().join("events_2").as_path()));
        assert_eq!(store.list_segments().unwrap(), vec!["events_1", "events_2"]);
        assert!(dir.path().join("events_v2_40").exists());
        assert!(dir.path().join("events_backup").exists());
        assert!(logs_contain("Evicted segment"));
        assert!(!logs_contain("events_v2_40"));
    }

    #[test]
    fn test_unreadable_directory() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("missing");

        let result = RotatingStore::open(StoreConfig::new("events", &missing));
        assert!(matches!(
            result,
            Err(StoreError::DirectoryUnreadable { path, .. }) if path == missing
        ));
    }

    #[test]
    fn test_invalid_config() {
        let dir = TempDir::new().unwrap();

        for config in [
            StoreConfig::new("", dir.path()),
            StoreConfig::new("a/b", dir.path()),
            StoreConfig::new("events", dir.path()).with_max_file_size(0),
            StoreConfig::new("events", dir.path()).with_max_file_count(0),
        ] {
            assert!(matches!(
                RotatingStore::open(config),
                Err(StoreError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_flush_before_first_write_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir, 50, 6);

        store.flush().unwrap();
        assert!(store.list_segments().unwrap().is_empty());
    }
}
