/// Daily quota ledger: accumulated time, reset scheduling, and the one-shot
/// notification flags for the current reset cycle.
///
/// The record is persisted as JSON and written atomically (temp file in the
/// same directory, then rename) so a crash mid-save never leaves a torn file.
use crate::config::{parse_reset_time, ConfigError, WardenConfig};
use chrono::{DateTime, Local, NaiveDateTime, NaiveTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Limits and thresholds the ledger is evaluated against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaPolicy {
    pub daily_limit_mins: u32,
    pub first_threshold_mins: u32,
    pub final_threshold_mins: u32,
    pub reset_time: NaiveTime,
}

impl QuotaPolicy {
    pub fn from_config(config: &WardenConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            daily_limit_mins: config.quota.daily_limit_mins,
            first_threshold_mins: config.warning.first_threshold_mins,
            final_threshold_mins: config.warning.final_threshold_mins,
            reset_time: parse_reset_time(&config.quota.reset_time)?,
        })
    }
}

/// The persisted record. Every field defaults when absent so older or
/// partial files still load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaRecord {
    /// Seconds attributed to tracked processes since the last reset.
    pub accumulated_secs: i64,
    /// Unix timestamp of the last reset.
    pub last_reset: i64,
    /// Unix timestamp of the next scheduled reset.
    pub next_reset: i64,
    pub first_warning_fired: bool,
    pub final_warning_fired: bool,
    pub limit_fired: bool,
}

impl QuotaRecord {
    pub fn accumulated_mins(&self) -> i64 {
        self.accumulated_secs / 60
    }

    pub fn remaining_mins(&self, daily_limit_mins: u32) -> i64 {
        (i64::from(daily_limit_mins) - self.accumulated_mins()).max(0)
    }

    pub fn is_exceeded(&self, daily_limit_mins: u32) -> bool {
        self.accumulated_mins() >= i64::from(daily_limit_mins)
    }

    /// Seconds from `now` until `next_reset`, zero once it is due.
    pub fn secs_until_reset(&self, now: i64) -> u64 {
        u64::try_from(self.next_reset - now).unwrap_or(0)
    }
}

/// Next occurrence of `reset_time` strictly after `now`, in `now`'s zone.
///
/// A reset time that falls in a DST gap is pushed forward by an hour; an
/// ambiguous one resolves to its earlier instant.
pub fn next_reset_after<Tz: TimeZone>(now: &DateTime<Tz>, reset_time: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let mut date = now.date_naive();
    for _ in 0..3 {
        if let Some(candidate) = resolve_local(&tz, date.and_time(reset_time)) {
            if candidate > *now {
                return candidate;
            }
        }
        match date.succ_opt() {
            Some(next) => date = next,
            None => break,
        }
    }
    now.clone() + chrono::Duration::hours(24)
}

fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + chrono::Duration::hours(1))).earliest())
}

/// Thread-safe quota ledger bound to a state file.
#[derive(Debug)]
pub struct QuotaState {
    policy: QuotaPolicy,
    path: PathBuf,
    record: Mutex<QuotaRecord>,
}

impl QuotaState {
    /// Fresh ledger: nothing accumulated, next reset computed from now.
    pub fn new(policy: QuotaPolicy, path: impl Into<PathBuf>) -> Self {
        Self::fresh_at(policy, path, Local::now())
    }

    fn fresh_at(policy: QuotaPolicy, path: impl Into<PathBuf>, now: DateTime<Local>) -> Self {
        let record = QuotaRecord {
            accumulated_secs: 0,
            last_reset: now.timestamp(),
            next_reset: next_reset_after(&now, policy.reset_time).timestamp(),
            ..QuotaRecord::default()
        };
        Self::from_record(policy, path, record)
    }

    pub fn from_record(policy: QuotaPolicy, path: impl Into<PathBuf>, record: QuotaRecord) -> Self {
        Self {
            policy,
            path: path.into(),
            record: Mutex::new(record),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QuotaRecord> {
        // Every mutation is a single field assignment, so a poisoned record
        // is still consistent.
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consistent copy of the record.
    pub fn snapshot(&self) -> QuotaRecord {
        self.lock().clone()
    }

    /// Add accrued seconds. Exceeding the limit is an expected state.
    pub fn add_time(&self, secs: u64) {
        let secs = i64::try_from(secs).unwrap_or(i64::MAX);
        let mut record = self.lock();
        record.accumulated_secs = record.accumulated_secs.saturating_add(secs);
    }

    pub fn accumulated_minutes(&self) -> i64 {
        self.lock().accumulated_mins()
    }

    pub fn remaining_minutes(&self) -> i64 {
        self.lock().remaining_mins(self.policy.daily_limit_mins)
    }

    /// True once whole accrued minutes reach the daily limit.
    pub fn is_limit_exceeded(&self) -> bool {
        self.lock().is_exceeded(self.policy.daily_limit_mins)
    }

    pub fn should_reset(&self) -> bool {
        self.should_reset_at(Local::now().timestamp())
    }

    fn should_reset_at(&self, now: i64) -> bool {
        now >= self.lock().next_reset
    }

    /// Time left until the scheduled reset, zero when it is already due.
    pub fn time_until_next_reset(&self) -> Duration {
        Duration::from_secs(self.lock().secs_until_reset(Local::now().timestamp()))
    }

    /// Start a new cycle: zero the ledger, clear all flags, and schedule the
    /// next reset strictly after now.
    pub fn reset(&self) {
        self.reset_at(Local::now());
    }

    fn reset_at(&self, now: DateTime<Local>) {
        let next = next_reset_after(&now, self.policy.reset_time);
        let mut record = self.lock();
        *record = QuotaRecord {
            accumulated_secs: 0,
            last_reset: now.timestamp(),
            next_reset: next.timestamp(),
            first_warning_fired: false,
            final_warning_fired: false,
            limit_fired: false,
        };
    }

    /// Returns `(first, final)`, each true only on the call that flips its
    /// flag. At or below the final threshold only the final warning is
    /// considered; the first warning covers `(final, first]`.
    pub fn consume_warning_notifications(&self) -> (bool, bool) {
        let mut record = self.lock();
        let remaining = record.remaining_mins(self.policy.daily_limit_mins);
        let first_threshold = i64::from(self.policy.first_threshold_mins);
        let final_threshold = i64::from(self.policy.final_threshold_mins);

        if remaining <= final_threshold {
            if record.final_warning_fired {
                return (false, false);
            }
            record.final_warning_fired = true;
            return (false, true);
        }

        if remaining <= first_threshold && !record.first_warning_fired {
            record.first_warning_fired = true;
            return (true, false);
        }

        (false, false)
    }

    /// True only on the first call in this cycle that sees the limit exceeded.
    pub fn consume_limit_notification(&self) -> bool {
        let mut record = self.lock();
        if !record.is_exceeded(self.policy.daily_limit_mins) || record.limit_fired {
            return false;
        }
        record.limit_fired = true;
        true
    }

    /// Structural check for records that came from disk.
    pub fn validate(&self) -> Result<(), StateError> {
        validate_record(&self.lock())
    }

    /// Atomically write the current record to the state file.
    pub fn save(&self) -> Result<(), StateError> {
        let record = self.snapshot();
        write_record(&self.path, &record)
    }

    /// Load the record at `path`. `Ok(None)` means no state file exists;
    /// a file that exists but does not parse is an error.
    pub fn load(policy: QuotaPolicy, path: impl Into<PathBuf>) -> Result<Option<Self>, StateError> {
        let path = path.into();
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StateError::Read { path, source: e }),
        };

        let record: QuotaRecord = serde_json::from_str(&contents).map_err(|e| StateError::Parse {
            path: path.clone(),
            source: e,
        })?;

        Ok(Some(Self::from_record(policy, path, record)))
    }

    /// Load the state file, falling back to a fresh ledger when it is
    /// missing, malformed, or fails validation.
    pub fn load_or_fresh(policy: QuotaPolicy, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::load(policy.clone(), &path) {
            Ok(Some(state)) => match state.validate() {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "loaded quota state");
                    state
                }
                Err(e) => {
                    tracing::warn!(error = %e, "quota state failed validation, starting fresh");
                    Self::new(policy, path)
                }
            },
            Ok(None) => {
                tracing::info!(path = %path.display(), "no quota state found, starting fresh");
                Self::new(policy, path)
            }
            Err(e) => {
                tracing::warn!(error = %e, "discarding unreadable quota state, starting fresh");
                Self::new(policy, path)
            }
        }
    }
}

fn validate_record(record: &QuotaRecord) -> Result<(), StateError> {
    if record.accumulated_secs < 0 {
        return Err(StateError::Invalid(format!(
            "accumulated_secs is negative ({})",
            record.accumulated_secs
        )));
    }
    if record.last_reset <= 0 {
        return Err(StateError::Invalid("last_reset is not set".to_string()));
    }
    if record.next_reset <= 0 {
        return Err(StateError::Invalid("next_reset is not set".to_string()));
    }
    if record.next_reset <= record.last_reset {
        return Err(StateError::Invalid(format!(
            "next_reset ({}) is not after last_reset ({})",
            record.next_reset, record.last_reset
        )));
    }
    Ok(())
}

fn write_record(path: &Path, record: &QuotaRecord) -> Result<(), StateError> {
    let json =
        serde_json::to_string_pretty(record).map_err(|e| StateError::Serialize { source: e })?;

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StateError::Write {
        path: dir.to_path_buf(),
        source: e,
    })?;
    tmp.write_all(json.as_bytes())
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| StateError::Write {
            path: tmp.path().to_path_buf(),
            source: e,
        })?;

    tmp.persist(path).map_err(|e| StateError::Rename {
        to: path.to_path_buf(),
        source: e.error,
    })?;

    Ok(())
}

/// Errors from quota state persistence and validation.
#[derive(Debug)]
pub enum StateError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        to: PathBuf,
        source: std::io::Error,
    },
    Invalid(String),
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateError::Read { path, source } => {
                write!(f, "failed to read state file {}: {source}", path.display())
            }
            StateError::Parse { path, source } => {
                write!(f, "malformed state file {}: {source}", path.display())
            }
            StateError::Serialize { source } => write!(f, "failed to serialize state: {source}"),
            StateError::Write { path, source } => {
                write!(f, "failed to write temp state file in {}: {source}", path.display())
            }
            StateError::Rename { to, source } => {
                write!(f, "failed to replace state file {}: {source}", to.display())
            }
            StateError::Invalid(msg) => write!(f, "invalid quota state: {msg}"),
        }
    }
}

impl std::error::Error for StateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StateError::Read { source, .. } => Some(source),
            StateError::Parse { source, .. } => Some(source),
            StateError::Serialize { source } => Some(source),
            StateError::Write { source, .. } => Some(source),
            StateError::Rename { source, .. } => Some(source),
            StateError::Invalid(_) => None,
        }
    }
}
