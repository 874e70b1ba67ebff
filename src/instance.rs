/// Host-wide single-instance guard backed by a marker file.
///
/// The marker is created with `O_CREAT | O_EXCL`, so two processes racing to
/// acquire can never both succeed. It records `"<pid>\n<unix-ts>\n"`; a later
/// acquire reclaims it when the recorded owner is dead or the marker is older
/// than [`STALE_AFTER`]. Reclaims are serialized with an `fs2` lock so two
/// acquirers judging the same stale marker cannot both replace it.
use crate::process::is_process_alive;
use chrono::Utc;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

/// Markers older than this are abandoned even if their pid looks alive.
pub const STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// An unparsable marker younger than this is assumed to belong to an
/// acquirer that has not finished writing it.
const WRITE_GRACE: Duration = Duration::from_secs(5);

/// Held exclusivity for one named instance. Dropping it releases the marker.
#[derive(Debug)]
pub struct InstanceGuard {
    path: PathBuf,
    pid: u32,
    released: AtomicBool,
}

/// What the marker on disk says about its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerStatus {
    Held,
    Abandoned,
}

/// Acquire the guard for `name` in the system temp directory.
pub fn acquire(name: &str) -> Result<InstanceGuard, InstanceError> {
    acquire_with(&std::env::temp_dir(), name, is_process_alive)
}

/// Acquire the guard for `name` with its marker in `dir`, probing owner
/// liveness with `is_alive`.
///
/// Reclaiming an abandoned marker happens under an exclusive lock on a
/// sibling `<marker>.reclaim` file, and only if the marker still holds the
/// exact contents that were judged abandoned.
pub fn acquire_with(
    dir: &Path,
    name: &str,
    is_alive: impl Fn(u32) -> bool,
) -> Result<InstanceGuard, InstanceError> {
    let path = marker_path(dir, name);
    let pid = std::process::id();
    // Held until this function returns so the recreate is covered too.
    let mut _reclaim_lock: Option<File> = None;

    for attempt in 0..2 {
        match create_marker(&path, pid, write_marker) {
            Ok(true) => {
                tracing::debug!(path = %path.display(), pid, "acquired instance marker");
                return Ok(InstanceGuard {
                    path,
                    pid,
                    released: AtomicBool::new(false),
                });
            }
            Ok(false) => {}
            Err(e) => return Err(InstanceError::Io { path, source: e }),
        }

        if attempt == 1 {
            break;
        }

        let seen = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            // Released between our create attempt and now.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(InstanceError::Io { path, source: e }),
        };
        if inspect_marker(&path, &seen, &is_alive) == MarkerStatus::Held {
            return Err(InstanceError::AlreadyRunning { path });
        }

        _reclaim_lock = Some(reclaim_marker(&path, &seen)?);
    }

    Err(InstanceError::AlreadyRunning { path })
}

/// Create the marker exclusively and fill it with `write`. `Ok(false)`
/// means a marker already exists. A marker that cannot be written is
/// removed again so it never blocks other acquirers.
fn create_marker(
    path: &Path,
    pid: u32,
    write: impl FnOnce(&mut File, u32) -> std::io::Result<()>,
) -> std::io::Result<bool> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(e),
    };
    if let Err(e) = write(&mut file, pid) {
        drop(file);
        if let Err(rm) = std::fs::remove_file(path) {
            tracing::warn!(path = %path.display(), error = %rm, "failed to remove partial instance marker");
        }
        return Err(e);
    }
    Ok(true)
}

/// Remove an abandoned marker whose contents were `seen`, holding the
/// reclaim lock. Returns the lock, which must stay open until the new
/// marker is created.
fn reclaim_marker(path: &Path, seen: &str) -> Result<File, InstanceError> {
    let lock_path = reclaim_lock_path(path);
    let io_err = |p: &Path, e| InstanceError::Io {
        path: p.to_path_buf(),
        source: e,
    };

    let lock = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| io_err(lock_path.as_path(), e))?;
    match FileExt::try_lock_exclusive(&lock) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            tracing::debug!(path = %path.display(), "another acquirer is reclaiming the marker");
            return Err(InstanceError::AlreadyRunning {
                path: path.to_path_buf(),
            });
        }
        Err(e) => return Err(io_err(lock_path.as_path(), e)),
    }

    match std::fs::read_to_string(path) {
        Ok(current) if current == seen => {}
        Ok(_) => {
            tracing::debug!(path = %path.display(), "instance marker changed while reclaiming");
            return Err(InstanceError::AlreadyRunning {
                path: path.to_path_buf(),
            });
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(lock),
        Err(e) => return Err(io_err(path, e)),
    }

    tracing::warn!(path = %path.display(), "reclaiming stale instance marker");
    match std::fs::remove_file(path) {
        Ok(()) => Ok(lock),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(lock),
        Err(e) => Err(io_err(path, e)),
    }
}

fn reclaim_lock_path(marker: &Path) -> PathBuf {
    let mut name = marker.as_os_str().to_os_string();
    name.push(".reclaim");
    PathBuf::from(name)
}

impl InstanceGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the marker timestamp so a long-lived owner never crosses the
    /// staleness bound.
    pub fn touch(&self) -> Result<(), InstanceError> {
        if self.released.load(Ordering::SeqCst) {
            return Ok(());
        }
        let io_err = |e| InstanceError::Io {
            path: self.path.clone(),
            source: e,
        };
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(io_err)?;
        write_marker(&mut file, self.pid).map_err(io_err)
    }

    /// Remove the marker. Idempotent; a marker that is already gone or now
    /// names another process is left alone.
    pub fn release(&self) -> Result<(), InstanceError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match std::fs::read_to_string(&self.path) {
            Ok(contents) if parse_marker(&contents).0 != Some(self.pid) => {
                tracing::warn!(path = %self.path.display(), "instance marker was taken over, not removing");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(InstanceError::Io {
                    path: self.path.clone(),
                    source: e,
                })
            }
        }

        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "released instance marker");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(InstanceError::Io {
                path: self.path.clone(),
                source: e,
            }),
        }
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            tracing::warn!(error = %e, "failed to release instance marker");
        }
    }
}

/// `<dir>/<name>.lock` with path separators and spaces flattened.
fn marker_path(dir: &Path, name: &str) -> PathBuf {
    let safe: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' || c.is_whitespace() { '_' } else { c })
        .collect();
    let safe = if safe.is_empty() {
        env!("CARGO_PKG_NAME").to_string()
    } else {
        safe
    };
    dir.join(format!("{safe}.lock"))
}

fn write_marker(file: &mut File, pid: u32) -> std::io::Result<()> {
    write!(file, "{pid}\n{}\n", Utc::now().timestamp())?;
    file.sync_all()
}

/// Parse `(pid, timestamp)` from marker contents; either may be absent.
fn parse_marker(contents: &str) -> (Option<u32>, Option<i64>) {
    let mut lines = contents.lines().map(str::trim);
    let pid = lines
        .next()
        .and_then(|l| l.parse::<u32>().ok())
        .filter(|pid| *pid > 0);
    let ts = lines.next().and_then(|l| l.parse::<i64>().ok());
    (pid, ts)
}

/// Judge a marker whose contents were just read.
fn inspect_marker(
    path: &Path,
    contents: &str,
    is_alive: &impl Fn(u32) -> bool,
) -> MarkerStatus {
    let modified = match std::fs::metadata(path).and_then(|m| m.modified()) {
        Ok(t) => Some(t),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return MarkerStatus::Abandoned,
        Err(_) => None,
    };
    let mtime_age = modified.and_then(|t| SystemTime::now().duration_since(t).ok());

    let (pid, ts) = parse_marker(contents);

    let Some(pid) = pid else {
        return match mtime_age {
            Some(age) if age < WRITE_GRACE => MarkerStatus::Held,
            _ => MarkerStatus::Abandoned,
        };
    };

    let age = match ts {
        Some(ts) => Some(Duration::from_secs(
            u64::try_from(Utc::now().timestamp() - ts).unwrap_or(0),
        )),
        None => mtime_age,
    };
    if age.is_some_and(|age| age > STALE_AFTER) {
        tracing::debug!(pid, "instance marker exceeded staleness bound");
        return MarkerStatus::Abandoned;
    }

    if is_alive(pid) {
        MarkerStatus::Held
    } else {
        tracing::debug!(pid, "instance marker owner is not running");
        MarkerStatus::Abandoned
    }
}

/// Errors from acquiring or releasing the instance guard.
#[derive(Debug)]
pub enum InstanceError {
    /// Another live instance holds the marker.
    AlreadyRunning { path: PathBuf },
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for InstanceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceError::AlreadyRunning { path } => {
                write!(f, "another instance is already running (marker {})", path.display())
            }
            InstanceError::Io { path, source } => {
                write!(f, "instance marker {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for InstanceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InstanceError::Io { source, .. } => Some(source),
            InstanceError::AlreadyRunning { .. } => None,
        }
    }
}
