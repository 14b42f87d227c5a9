// ⚙️ Pipeline Configuration - JSON file, every field optional
//
// Missing fields take the defaults below. Relative paths are resolved
// against the working directory unless rebased with `with_root`.

use anyhow::{Context, Result};
use chrono::Weekday;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::arbitration::{SourceArbitrator, DEFAULT_NAV_EPSILON, DEFAULT_STALE_AFTER_DAYS};
use crate::error::SyncError;
use crate::records::Source;
use crate::retry::{BackoffKind, RetryConfig};

// ============================================================================
// SECTIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Crawler output, one folder per source
    pub raw_dir: PathBuf,
    /// Append-only per-table files of the running merge
    pub work_dir: PathBuf,
    /// Finished merged snapshots (input of the sync stage)
    pub merged_dir: PathBuf,
    /// Last successfully synced snapshots
    pub baseline_dir: PathBuf,
    pub changeset_dir: PathBuf,
    pub checkpoint_file: PathBuf,
    pub database: PathBuf,
    pub log_dir: PathBuf,
    /// Lookup CSV `holding_code,type,sector,symbol`; optional
    pub holding_types: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            raw_dir: PathBuf::from("data/raw"),
            work_dir: PathBuf::from("data/work"),
            merged_dir: PathBuf::from("data/merged"),
            baseline_dir: PathBuf::from("data/baseline"),
            changeset_dir: PathBuf::from("data/changesets"),
            checkpoint_file: PathBuf::from("data/work/resume.log"),
            database: PathBuf::from("data/funds.db"),
            log_dir: PathBuf::from("Logs"),
            holding_types: PathBuf::from("data/holding_types.csv"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolitenessConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for PolitenessConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 1000,
            max_delay_ms: 2000,
        }
    }
}

impl PolitenessConfig {
    /// Uniform random delay in [min, max]
    pub fn jittered_delay(&self) -> Duration {
        let (low, high) = (self.min_delay_ms, self.max_delay_ms.max(self.min_delay_ms));
        Duration::from_millis(fastrand::u64(low..=high))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff: BackoffKind,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 20,
            max_retries: 3,
            backoff: BackoffKind::Linear,
            backoff_base_ms: 3000,
            backoff_max_ms: 10_000,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_config(&self) -> RetryConfig {
        if self.max_retries == 0 {
            return RetryConfig::no_retry();
        }
        RetryConfig::new(
            self.backoff,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
            self.max_retries,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbitrationConfig {
    pub default_source: Source,
    pub stale_after_days: i64,
    pub nav_epsilon: f64,
}

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self {
            default_source: Source::Finnomena,
            stale_after_days: DEFAULT_STALE_AFTER_DAYS,
            nav_epsilon: DEFAULT_NAV_EPSILON,
        }
    }
}

impl ArbitrationConfig {
    pub fn arbitrator(&self) -> SourceArbitrator {
        SourceArbitrator::with_thresholds(self.default_source, self.stale_after_days, self.nav_epsilon)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Weekday names ("Sat", "sunday", ...) on which stages do nothing
    pub skip_weekdays: Vec<String>,
}

impl ScheduleConfig {
    pub fn weekdays(&self) -> Result<Vec<Weekday>, SyncError> {
        self.skip_weekdays
            .iter()
            .map(|day| {
                day.trim()
                    .parse::<Weekday>()
                    .map_err(|_| SyncError::Config(format!("unknown weekday {:?}", day)))
            })
            .collect()
    }

    pub fn skips(&self, weekday: Weekday) -> Result<bool, SyncError> {
        Ok(self.weekdays()?.contains(&weekday))
    }
}

// ============================================================================
// PIPELINE CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub paths: PathsConfig,
    pub workers: usize,
    pub politeness: PolitenessConfig,
    pub fetch: FetchConfig,
    pub arbitration: ArbitrationConfig,
    pub schedule: ScheduleConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            workers: 3,
            politeness: PolitenessConfig::default(),
            fetch: FetchConfig::default(),
            arbitration: ArbitrationConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load config from JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: PipelineConfig =
            serde_json::from_str(&content).context("Failed to parse config JSON")?;

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given and present, defaults otherwise
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }

    /// Config as a stage binary runs with it: loaded, rebased on `root`, validated
    pub fn load_for_stage(path: &Path, root: Option<&Path>) -> Result<Self> {
        let mut config = Self::load(Some(path))?;
        if let Some(root) = root {
            config = config.with_root(root);
        }
        config.validate()?;
        Ok(config)
    }

    /// Where a stage writes its error log when the config itself failed to load
    pub fn fallback_log_dir(root: Option<&Path>) -> PathBuf {
        let log_dir = PathsConfig::default().log_dir;
        match root {
            Some(root) => root.join(log_dir),
            None => log_dir,
        }
    }

    /// Resolve every relative path against `root`
    pub fn with_root(mut self, root: &Path) -> Self {
        let paths = &mut self.paths;
        for path in [
            &mut paths.raw_dir,
            &mut paths.work_dir,
            &mut paths.merged_dir,
            &mut paths.baseline_dir,
            &mut paths.changeset_dir,
            &mut paths.checkpoint_file,
            &mut paths.database,
            &mut paths.log_dir,
            &mut paths.holding_types,
        ] {
            if path.is_relative() {
                *path = root.join(&*path);
            }
        }
        self
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.workers == 0 {
            return Err(SyncError::Config("workers must be at least 1".to_string()));
        }
        if self.politeness.min_delay_ms > self.politeness.max_delay_ms {
            return Err(SyncError::Config(format!(
                "politeness min_delay_ms {} exceeds max_delay_ms {}",
                self.politeness.min_delay_ms, self.politeness.max_delay_ms
            )));
        }
        if !(self.arbitration.nav_epsilon >= 0.0) {
            return Err(SyncError::Config(format!(
                "nav_epsilon must be non-negative, got {}",
                self.arbitration.nav_epsilon
            )));
        }
        if self.arbitration.stale_after_days < 0 {
            return Err(SyncError::Config("stale_after_days must be non-negative".to_string()));
        }
        self.schedule.weekdays()?;
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

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.workers, 3);
        assert_eq!(config.arbitration.stale_after_days, 60);
        assert_eq!(config.arbitration.default_source, Source::Finnomena);
        assert_eq!(config.fetch.timeout(), Duration::from_secs(20));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pipeline.json");
        fs::write(
            &path,
            r#"{ "workers": 5, "arbitration": { "default_source": "wealthmagik" },
                 "schedule": { "skip_weekdays": ["Sat", "sunday"] } }"#,
        )
        .unwrap();

        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.workers, 5);
        assert_eq!(config.arbitration.default_source, Source::WealthMagik);
        assert_eq!(config.arbitration.nav_epsilon, 0.0001);
        assert_eq!(config.politeness.max_delay_ms, 2000);
        assert!(config.schedule.skips(Weekday::Sun).unwrap());
        assert!(!config.schedule.skips(Weekday::Mon).unwrap());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.workers = 0;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.politeness.min_delay_ms = 3000;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.arbitration.nav_epsilon = -0.1;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.schedule.skip_weekdays = vec!["Funday".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_means_defaults() {
        let config = PipelineConfig::load(Some(Path::new("/nonexistent/pipeline.json"))).unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_with_root_rebases_relative_paths() {
        let config = PipelineConfig::default().with_root(Path::new("/srv/funds"));
        assert_eq!(config.paths.database, PathBuf::from("/srv/funds/data/funds.db"));
        assert_eq!(config.paths.log_dir, PathBuf::from("/srv/funds/Logs"));
    }

    #[test]
    fn test_stage_load_rejects_broken_file_and_keeps_log_dir() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pipeline.json");

        fs::write(&path, r#"{ "workers": 0 }"#).unwrap();
        assert!(PipelineConfig::load_for_stage(&path, Some(dir.path())).is_err());

        fs::write(&path, "{ not json").unwrap();
        assert!(PipelineConfig::load_for_stage(&path, Some(dir.path())).is_err());
        assert_eq!(
            PipelineConfig::fallback_log_dir(Some(dir.path())),
            dir.path().join("Logs")
        );
        assert_eq!(PipelineConfig::fallback_log_dir(None), PathBuf::from("Logs"));

        fs::write(&path, r#"{ "workers": 4 }"#).unwrap();
        let config = PipelineConfig::load_for_stage(&path, Some(dir.path())).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.paths.log_dir, dir.path().join("Logs"));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let politeness = PolitenessConfig {
            min_delay_ms: 10,
            max_delay_ms: 20,
        };
        for _ in 0..50 {
            let delay = politeness.jittered_delay().as_millis();
            assert!((10..=20).contains(&delay));
        }
    }
}
