use chrono::NaiveTime;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from `config.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Process names to track, matched case-insensitively.
    pub processes: Vec<String>,
    pub quota: QuotaConfig,
    pub warning: WarningConfig,
    pub enforcement: EnforcementConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub daily_limit_mins: u32,
    /// Local wall-clock time of the daily reset, `HH:MM`.
    pub reset_time: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WarningConfig {
    pub first_threshold_mins: u32,
    pub final_threshold_mins: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnforcementConfig {
    pub tick_interval_secs: u64,
    pub save_interval_secs: u64,
    pub terminate_attempts: u32,
    pub terminate_retry_delay_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Defaults to `state.json` in the data directory.
    pub state_file: Option<PathBuf>,
    /// Log destination; stderr when unset.
    pub log_file: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            processes: vec!["steam".to_string(), "minecraft-launcher".to_string()],
            quota: QuotaConfig::default(),
            warning: WarningConfig::default(),
            enforcement: EnforcementConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit_mins: 120,
            reset_time: "08:00".to_string(),
        }
    }
}

impl Default for WarningConfig {
    fn default() -> Self {
        Self {
            first_threshold_mins: 15,
            final_threshold_mins: 5,
        }
    }
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 5,
            save_interval_secs: 60,
            terminate_attempts: 3,
            terminate_retry_delay_ms: 1000,
        }
    }
}

impl EnforcementConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval_secs)
    }

    pub fn terminate_retry_delay(&self) -> Duration {
        Duration::from_millis(self.terminate_retry_delay_ms)
    }
}

/// Parse a `HH:MM` reset time.
pub fn parse_reset_time(value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|e| ConfigError::ResetTime {
        value: value.to_string(),
        source: e,
    })
}

impl WardenConfig {
    /// Check every value the daemon depends on. Enforcement must not start
    /// with a config that fails here.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.quota.daily_limit_mins == 0 {
            return Err(ConfigError::Invalid(
                "quota.daily_limit_mins must be greater than 0".to_string(),
            ));
        }

        parse_reset_time(&self.quota.reset_time)?;

        if self.processes.iter().all(|p| p.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "processes must name at least one process".to_string(),
            ));
        }

        if self.warning.final_threshold_mins > self.warning.first_threshold_mins {
            return Err(ConfigError::Invalid(format!(
                "warning.final_threshold_mins ({}) must not exceed warning.first_threshold_mins ({})",
                self.warning.final_threshold_mins, self.warning.first_threshold_mins
            )));
        }

        if self.enforcement.tick_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "enforcement.tick_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.enforcement.terminate_attempts == 0 {
            return Err(ConfigError::Invalid(
                "enforcement.terminate_attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Tracked process names with blanks dropped.
    pub fn tracked_processes(&self) -> Vec<String> {
        self.processes
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    }
}

/// Load config from `path`. A missing file yields the defaults; a file that
/// exists but does not parse is an error.
pub fn load_config(path: &Path) -> Result<WardenConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(WardenConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };

    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Errors from loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    ResetTime {
        value: String,
        source: chrono::ParseError,
    },
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::ResetTime { value, source } => {
                write!(f, "invalid quota.reset_time {value:?}, expected HH:MM: {source}")
            }
            ConfigError::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::ResetTime { source, .. } => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = WardenConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.quota.daily_limit_mins, 120);
        assert_eq!(cfg.warning.first_threshold_mins, 15);
        assert_eq!(cfg.warning.final_threshold_mins, 5);
        assert_eq!(cfg.enforcement.tick_interval(), Duration::from_secs(5));
        assert_eq!(cfg.enforcement.save_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let cfg = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.quota.reset_time, "08:00");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "processes = [\"factorio\"]\n\n[quota]\ndaily_limit_mins = 45\n",
        )
        .unwrap();

        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.processes, vec!["factorio"]);
        assert_eq!(cfg.quota.daily_limit_mins, 45);
        assert_eq!(cfg.quota.reset_time, "08:00");
        assert_eq!(cfg.enforcement.terminate_attempts, 3);
        assert!(cfg.storage.state_file.is_none());
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[quota\ndaily_limit_mins = ").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("failed to parse config"));
    }

    #[test]
    fn test_zero_daily_limit_rejected() {
        let mut cfg = WardenConfig::default();
        cfg.quota.daily_limit_mins = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_bad_reset_time_rejected() {
        let mut cfg = WardenConfig::default();
        cfg.quota.reset_time = "25:99".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, ConfigError::ResetTime { .. }));
        assert!(err.to_string().contains("HH:MM"));
    }

    #[test]
    fn test_final_above_first_rejected() {
        let mut cfg = WardenConfig::default();
        cfg.warning.first_threshold_mins = 5;
        cfg.warning.final_threshold_mins = 10;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("final_threshold_mins"));
    }

    #[test]
    fn test_equal_thresholds_allowed() {
        let mut cfg = WardenConfig::default();
        cfg.warning.first_threshold_mins = 5;
        cfg.warning.final_threshold_mins = 5;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_empty_process_list_rejected() {
        let mut cfg = WardenConfig::default();
        cfg.processes = vec!["  ".to_string()];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_tick_interval_rejected() {
        let mut cfg = WardenConfig::default();
        cfg.enforcement.tick_interval_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_terminate_attempts_rejected() {
        let mut cfg = WardenConfig::default();
        cfg.enforcement.terminate_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_parse_reset_time() {
        let t = parse_reset_time("07:30").unwrap();
        assert_eq!(t, NaiveTime::from_hms_opt(7, 30, 0).unwrap());
        assert!(parse_reset_time("7am").is_err());
    }

    #[test]
    fn test_storage_section_partial() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[storage]\nlog_file = \"/var/log/warden.log\"\n").unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.storage.log_file, Some(PathBuf::from("/var/log/warden.log")));
        assert!(cfg.storage.state_file.is_none());
        assert!(WardenConfig::default().storage.log_file.is_none());
    }

    #[test]
    fn test_tracked_processes_drops_blanks() {
        let mut cfg = WardenConfig::default();
        cfg.processes = vec![" steam ".to_string(), String::new()];
        assert_eq!(cfg.tracked_processes(), vec!["steam"]);
    }
}
