// 📌 Checkpoint Store - which units finished today
//
// On disk: one line per finished unit, `<unit>|<YYYY-MM-DD>|<HH:MM:SS>`.
// A log whose first line carries another date belongs to a previous run
// and is discarded. An unreadable log is treated as absent.
// A unit is recorded only after all of its rows are durably written.

use chrono::{Local, NaiveDate};
use std::collections::{BTreeSet, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

use crate::error::{Result, SyncError};
use crate::snapshot::sync_file;

pub trait CheckpointStore: Send + Sync {
    fn is_finished(&self, unit: &str) -> bool;

    /// Record a unit as finished. Idempotent.
    fn mark_finished(&self, unit: &str) -> Result<()>;

    fn finished_count(&self) -> usize;

    fn finished_units(&self) -> BTreeSet<String>;

    /// Forget everything (after a clean stage completion).
    fn clear(&self) -> Result<()>;
}

/// Units of `all` not yet finished, in input order
pub fn pending_units(store: &dyn CheckpointStore, all: &[String]) -> Vec<String> {
    all.iter()
        .filter(|unit| !store.is_finished(unit))
        .cloned()
        .collect()
}

fn validate_unit(unit: &str) -> Result<()> {
    if unit.trim().is_empty() || unit.contains(|c: char| matches!(c, '|' | '\n' | '\r')) {
        return Err(SyncError::Checkpoint(format!("invalid unit key {:?}", unit)));
    }
    Ok(())
}

// ============================================================================
// FILE STORE
// ============================================================================

struct FileState {
    finished: HashSet<String>,
    file: Option<File>,
}

pub struct FileCheckpointStore {
    path: PathBuf,
    today: NaiveDate,
    state: Mutex<FileState>,
}

impl FileCheckpointStore {
    /// Open the log for `today`, discarding a stale or unreadable one.
    pub fn open(path: &Path, today: NaiveDate) -> Result<Self> {
        let finished = match fs::read_to_string(path) {
            Ok(content) => Self::parse_log(path, &content, today)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashSet::new(),
            Err(e) => {
                warn!("Checkpoint {} unreadable ({}), starting fresh", path.display(), e);
                let _ = fs::remove_file(path);
                HashSet::new()
            }
        };

        if !finished.is_empty() {
            info!("📌 Resuming: {} units already finished today", finished.len());
        }

        Ok(FileCheckpointStore {
            path: path.to_path_buf(),
            today,
            state: Mutex::new(FileState { finished, file: None }),
        })
    }

    fn parse_log(path: &Path, content: &str, today: NaiveDate) -> Result<HashSet<String>> {
        let today_text = today.format("%Y-%m-%d").to_string();

        let Some(first_line) = content.lines().find(|line| !line.trim().is_empty()) else {
            return Ok(HashSet::new());
        };

        match first_line.split('|').nth(1).map(str::trim) {
            Some(date) if date == today_text => {}
            Some(date) => {
                info!("Checkpoint {} is from {}, starting a new run", path.display(), date);
                fs::remove_file(path)?;
                return Ok(HashSet::new());
            }
            None => {
                warn!(
                    "Checkpoint {} starts with undated line {:?}, starting fresh",
                    path.display(),
                    first_line
                );
                fs::remove_file(path)?;
                return Ok(HashSet::new());
            }
        }

        let mut finished = HashSet::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let mut parts = line.split('|').map(str::trim);
            match (parts.next(), parts.next()) {
                (Some(unit), Some(date)) if !unit.is_empty() && date == today_text => {
                    finished.insert(unit.to_string());
                }
                _ => warn!("Skipping malformed checkpoint line {:?}", line),
            }
        }

        // Torn last append: terminate it so the next line starts clean
        if !content.ends_with('\n') {
            OpenOptions::new().append(true).open(path)?.write_all(b"\n")?;
        }
        Ok(finished)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn is_finished(&self, unit: &str) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finished
            .contains(unit)
    }

    fn mark_finished(&self, unit: &str) -> Result<()> {
        validate_unit(unit)?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.finished.contains(unit) {
            return Ok(());
        }

        if state.file.is_none() {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            state.file = Some(file);
        }

        let line = format!(
            "{}|{}|{}\n",
            unit,
            self.today.format("%Y-%m-%d"),
            Local::now().format("%H:%M:%S")
        );
        if let Some(file) = state.file.as_mut() {
            file.write_all(line.as_bytes())?;
            sync_file(file)?;
        }
        state.finished.insert(unit.to_string());
        Ok(())
    }

    fn finished_count(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).finished.len()
    }

    fn finished_units(&self) -> BTreeSet<String> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finished
            .iter()
            .cloned()
            .collect()
    }

    fn clear(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.file = None;
        state.finished.clear();
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

// ============================================================================
// MEMORY STORE
// ============================================================================

/// In-process store for tests and dry runs
#[derive(Default)]
pub struct MemoryCheckpointStore {
    finished: Mutex<HashSet<String>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn is_finished(&self, unit: &str) -> bool {
        self.finished.lock().unwrap_or_else(PoisonError::into_inner).contains(unit)
    }

    fn mark_finished(&self, unit: &str) -> Result<()> {
        validate_unit(unit)?;
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(unit.to_string());
        Ok(())
    }

    fn finished_count(&self) -> usize {
        self.finished.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn finished_units(&self) -> BTreeSet<String> {
        self.finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn clear(&self) -> Result<()> {
        self.finished.lock().unwrap_or_else(PoisonError::into_inner).clear();
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn units(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn test_resume_dispatches_only_unfinished_units() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resume.log");

        let store = FileCheckpointStore::open(&path, day(2)).unwrap();
        store.mark_finished("K1").unwrap();
        store.mark_finished("K2").unwrap();
        drop(store);

        // Restart on the same day
        let store = FileCheckpointStore::open(&path, day(2)).unwrap();
        assert_eq!(store.finished_count(), 2);
        assert_eq!(pending_units(&store, &units(&["K1", "K2", "K3"])), units(&["K3"]));
        println!("✅ Resume test PASSED");
    }

    #[test]
    fn test_log_line_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("resume.log");
        let store = FileCheckpointStore::open(&path, day(2)).unwrap();
        store.mark_finished("K-USA-A").unwrap();
        store.mark_finished("K-USA-A").unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1, "marking twice writes once");
        let parts: Vec<&str> = lines[0].split('|').collect();
        assert_eq!(parts[0], "K-USA-A");
        assert_eq!(parts[1], "2024-05-02");
        assert_eq!(parts[2].len(), 8);
    }

    #[test]
    fn test_previous_day_log_is_discarded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resume.log");
        fs::write(&path, "K1|2024-05-01|23:59:01\nK2|2024-05-01|23:59:30\n").unwrap();

        let store = FileCheckpointStore::open(&path, day(2)).unwrap();
        assert_eq!(store.finished_count(), 0);
        assert!(!path.exists());
        assert_eq!(pending_units(&store, &units(&["K1", "K2"])).len(), 2);
    }

    #[test]
    fn test_undated_first_line_is_discarded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resume.log");
        fs::write(&path, "K1\n").unwrap();

        let store = FileCheckpointStore::open(&path, day(2)).unwrap();
        assert_eq!(store.finished_count(), 0);
        assert!(!path.exists());
        store.mark_finished("K2").unwrap();
        store.mark_finished("K3").unwrap();
        drop(store);

        // Restart the same day keeps what was marked after the bad line
        let store = FileCheckpointStore::open(&path, day(2)).unwrap();
        let expected: BTreeSet<String> = ["K2", "K3"].iter().map(|k| k.to_string()).collect();
        assert_eq!(store.finished_units(), expected);
    }

    #[test]
    fn test_torn_last_line_does_not_swallow_next_append() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resume.log");
        fs::write(&path, "K1|2024-05-02|09:00:00\nK2|2024-05-0").unwrap();

        let store = FileCheckpointStore::open(&path, day(2)).unwrap();
        assert!(store.is_finished("K1"));
        assert!(!store.is_finished("K2"), "half-written line does not count");
        store.mark_finished("K3").unwrap();
        drop(store);

        let store = FileCheckpointStore::open(&path, day(2)).unwrap();
        assert!(store.is_finished("K1"));
        assert!(store.is_finished("K3"));
    }

    #[test]
    fn test_unreadable_log_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resume.log");
        fs::write(&path, [0xff, 0xfe, 0x00, 0x7c]).unwrap();

        let store = FileCheckpointStore::open(&path, day(2)).unwrap();
        assert_eq!(store.finished_count(), 0);
        store.mark_finished("K1").unwrap();
        assert!(store.is_finished("K1"));
    }

    #[test]
    fn test_keys_with_separators_are_rejected() {
        let store = MemoryCheckpointStore::new();
        assert!(store.mark_finished("A|B").is_err());
        assert!(store.mark_finished("A\nB").is_err());
        assert!(store.mark_finished("  ").is_err());
        assert_eq!(store.finished_count(), 0);
    }

    #[test]
    fn test_clear_removes_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resume.log");
        let store = FileCheckpointStore::open(&path, day(2)).unwrap();
        store.mark_finished("K1").unwrap();
        store.clear().unwrap();

        assert!(!path.exists());
        assert!(!store.is_finished("K1"));
        assert_eq!(store.finished_units(), BTreeSet::new());
    }
}
