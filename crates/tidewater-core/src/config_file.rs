use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Config;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not determine config directory")]
    NoConfigDir,
    #[error("failed to read or write config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// On-disk TOML configuration structure.
/// All fields are optional so partial configs work (merge with defaults).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub refresh: Option<RefreshSection>,
    pub schedule: Option<ScheduleSection>,
    pub tasks: Option<TasksSection>,
    pub memo: Option<MemoSection>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshSection {
    pub base_interval_secs: Option<u64>,
    pub max_interval_secs: Option<u64>,
    pub force_interval_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub max_retry_attempts: Option<u32>,
    pub retry_delay_secs: Option<u64>,
    pub stale_if_error: Option<bool>,
    pub probe_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleSection {
    /// `HH:MM` or `HH:MM:SS`, UTC.
    pub expected_update_time: Option<String>,
    pub update_window_secs: Option<u64>,
    pub import_null_threshold: Option<u32>,
    pub suppress_during_import: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TasksSection {
    pub max_concurrent: Option<usize>,
    pub max_age_minutes: Option<u64>,
    pub cleanup_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoSection {
    pub ttl_secs: Option<u64>,
    pub capacity: Option<usize>,
}

/// Platform config directory path: `<config_dir>/tidewater/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("tidewater").join("config.toml"))
}

/// Load config by cascading CWD `.tidewater.toml` over platform config.
/// CWD values override platform values.
pub fn load_config() -> ConfigFile {
    let platform = config_path().and_then(|p| load_from_path(&p));
    let cwd = load_from_path(Path::new(".tidewater.toml"));

    match (platform, cwd) {
        (None, None) => ConfigFile::default(),
        (Some(p), None) => p,
        (None, Some(c)) => c,
        (Some(p), Some(c)) => merge(p, c),
    }
}

/// Load a config from a specific path. Returns `None` if the file doesn't
/// exist or can't be parsed.
pub fn load_from_path(path: &Path) -> Option<ConfigFile> {
    match read_from_path(path) {
        Ok(config) => Some(config),
        Err(ConfigError::Io(_)) => None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable config");
            None
        }
    }
}

/// Strict variant of [`load_from_path`] for explicitly requested files.
pub fn read_from_path(path: &Path) -> Result<ConfigFile, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Merge two configs: `overlay` values take precedence over `base`.
pub fn merge(base: ConfigFile, overlay: ConfigFile) -> ConfigFile {
    let refresh = {
        let b = base.refresh.unwrap_or_default();
        let o = overlay.refresh.unwrap_or_default();
        RefreshSection {
            base_interval_secs: o.base_interval_secs.or(b.base_interval_secs),
            max_interval_secs: o.max_interval_secs.or(b.max_interval_secs),
            force_interval_secs: o.force_interval_secs.or(b.force_interval_secs),
            timeout_secs: o.timeout_secs.or(b.timeout_secs),
            max_retry_attempts: o.max_retry_attempts.or(b.max_retry_attempts),
            retry_delay_secs: o.retry_delay_secs.or(b.retry_delay_secs),
            stale_if_error: o.stale_if_error.or(b.stale_if_error),
            probe_interval_secs: o.probe_interval_secs.or(b.probe_interval_secs),
        }
    };
    let schedule = {
        let b = base.schedule.unwrap_or_default();
        let o = overlay.schedule.unwrap_or_default();
        ScheduleSection {
            expected_update_time: o.expected_update_time.or(b.expected_update_time),
            update_window_secs: o.update_window_secs.or(b.update_window_secs),
            import_null_threshold: o.import_null_threshold.or(b.import_null_threshold),
            suppress_during_import: o.suppress_during_import.or(b.suppress_during_import),
        }
    };
    let tasks = {
        let b = base.tasks.unwrap_or_default();
        let o = overlay.tasks.unwrap_or_default();
        TasksSection {
            max_concurrent: o.max_concurrent.or(b.max_concurrent),
            max_age_minutes: o.max_age_minutes.or(b.max_age_minutes),
            cleanup_interval_secs: o.cleanup_interval_secs.or(b.cleanup_interval_secs),
        }
    };
    let memo = {
        let b = base.memo.unwrap_or_default();
        let o = overlay.memo.unwrap_or_default();
        MemoSection {
            ttl_secs: o.ttl_secs.or(b.ttl_secs),
            capacity: o.capacity.or(b.capacity),
        }
    };

    ConfigFile {
        refresh: Some(refresh),
        schedule: Some(schedule),
        tasks: Some(tasks),
        memo: Some(memo),
    }
}

/// Parse `HH:MM` or `HH:MM:SS`.
pub fn parse_time_of_day(value: &str) -> Option<NaiveTime> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M"))
        .ok()
}

impl ConfigFile {
    /// Resolve into a runtime [`Config`], falling back to defaults for
    /// missing or invalid values.
    pub fn resolve(&self) -> Config {
        let mut config = Config::default();
        let secs = Duration::from_secs;

        if let Some(r) = &self.refresh {
            if let Some(v) = r.base_interval_secs {
                config.base_refresh_interval = secs(v);
            }
            if let Some(v) = r.max_interval_secs {
                config.max_refresh_interval = secs(v);
            }
            if let Some(v) = r.force_interval_secs {
                config.force_refresh_interval = secs(v);
            }
            if let Some(v) = r.timeout_secs {
                config.refresh_timeout = secs(v);
            }
            match r.max_retry_attempts {
                Some(0) => {
                    tracing::warn!("max_retry_attempts must be at least 1, using 1");
                    config.max_retry_attempts = 1;
                }
                Some(v) => config.max_retry_attempts = v,
                None => {}
            }
            if let Some(v) = r.retry_delay_secs {
                config.retry_delay = secs(v);
            }
            if let Some(v) = r.stale_if_error {
                config.stale_if_error = v;
            }
            if let Some(v) = r.probe_interval_secs {
                config.probe_interval = secs(v);
            }
        }

        if let Some(s) = &self.schedule {
            if let Some(raw) = &s.expected_update_time {
                match parse_time_of_day(raw) {
                    Some(t) => config.expected_update_time = t,
                    None => tracing::warn!(value = %raw, "invalid expected_update_time, using default"),
                }
            }
            if let Some(v) = s.update_window_secs {
                config.update_window = secs(v);
            }
            if let Some(v) = s.import_null_threshold {
                config.import_null_threshold = v.max(1);
            }
            if let Some(v) = s.suppress_during_import {
                config.suppress_refresh_during_import = v;
            }
        }

        if let Some(t) = &self.tasks {
            match t.max_concurrent {
                Some(0) => {
                    tracing::warn!("max_concurrent must be at least 1, using 1");
                    config.max_concurrent_tasks = 1;
                }
                Some(v) => config.max_concurrent_tasks = v,
                None => {}
            }
            if let Some(v) = t.max_age_minutes {
                config.task_max_age_minutes = v;
            }
            if let Some(v) = t.cleanup_interval_secs {
                config.task_cleanup_interval = secs(v.max(1));
            }
        }

        if let Some(m) = &self.memo {
            if let Some(v) = m.ttl_secs {
                config.memo_ttl = secs(v);
            }
            if let Some(v) = m.capacity {
                config.memo_capacity = v.max(1);
            }
        }

        config
    }
}

/// Save the current config to the platform config directory.
pub fn save_config(config: &ConfigFile) -> Result<PathBuf, ConfigError> {
    let path = config_path().ok_or(ConfigError::NoConfigDir)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(&path, content)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_parses() {
        let toml_str = "[refresh]\nbase_interval_secs = 120\n\n[schedule]\nexpected_update_time = \"06:30\"\n";
        let parsed: ConfigFile = toml::from_str(toml_str).unwrap();
        assert_eq!(parsed.refresh.as_ref().unwrap().base_interval_secs, Some(120));
        assert!(parsed.tasks.is_none());

        let config = parsed.resolve();
        assert_eq!(config.base_refresh_interval, Duration::from_secs(120));
        assert_eq!(
            config.expected_update_time,
            NaiveTime::from_hms_opt(6, 30, 0).unwrap()
        );
        // Untouched values keep their defaults
        assert_eq!(config.max_concurrent_tasks, 2);
    }

    #[test]
    fn merge_overlay_wins() {
        let base = ConfigFile {
            tasks: Some(TasksSection {
                max_concurrent: Some(4),
                max_age_minutes: Some(30),
                ..Default::default()
            }),
            ..Default::default()
        };
        let overlay = ConfigFile {
            tasks: Some(TasksSection {
                max_concurrent: Some(8),
                ..Default::default()
            }),
            ..Default::default()
        };
        let merged = merge(base, overlay);
        let tasks = merged.tasks.unwrap();
        assert_eq!(tasks.max_concurrent, Some(8));
        assert_eq!(tasks.max_age_minutes, Some(30));
    }

    #[test]
    fn merge_base_preserved_when_overlay_absent() {
        let base = ConfigFile {
            refresh: Some(RefreshSection {
                stale_if_error: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };
        let merged = merge(base, ConfigFile::default());
        assert_eq!(merged.refresh.unwrap().stale_if_error, Some(false));
    }

    #[test]
    fn invalid_values_fall_back() {
        let file = ConfigFile {
            refresh: Some(RefreshSection {
                max_retry_attempts: Some(0),
                ..Default::default()
            }),
            schedule: Some(ScheduleSection {
                expected_update_time: Some("25:99".into()),
                ..Default::default()
            }),
            tasks: Some(TasksSection {
                max_concurrent: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config = file.resolve();
        assert_eq!(config.max_retry_attempts, 1);
        assert_eq!(config.max_concurrent_tasks, 1);
        assert_eq!(config.expected_update_time, Config::default().expected_update_time);
    }

    #[test]
    fn time_of_day_formats() {
        assert_eq!(
            parse_time_of_day("07:15:30"),
            NaiveTime::from_hms_opt(7, 15, 30)
        );
        assert_eq!(parse_time_of_day(" 23:05 "), NaiveTime::from_hms_opt(23, 5, 0));
        assert_eq!(parse_time_of_day("noon"), None);
    }

    #[test]
    fn missing_file_is_none() {
        let path = std::env::temp_dir().join(format!(
            "tidewater_missing_{}.toml",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        assert!(load_from_path(&path).is_none());
        assert!(matches!(read_from_path(&path), Err(ConfigError::Io(_))));
    }
}
