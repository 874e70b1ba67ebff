/// Process enumeration, liveness probing, and termination of tracked processes.
///
/// The production scanner reads `/proc`; the controller only sees the
/// `Scanner` trait so tests can substitute a double.
use crate::retry::{RetryDecision, RetryPolicy};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How long to wait after signalling before re-checking the process.
const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// A running process that matched a tracked name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
}

/// Finds and terminates tracked processes.
pub trait Scanner: Send + Sync {
    /// Every running process whose name matches one of `names`.
    fn find_tracked(&self, names: &[String]) -> Result<Vec<ProcessInfo>, ScanError>;

    /// Terminate `pid`, re-checking after each attempt. Errors only when
    /// the process is still present after `max_attempts`.
    fn terminate_with_retry(
        &self,
        pid: u32,
        max_attempts: u32,
        delay: Duration,
    ) -> Result<(), ScanError>;
}

/// Whether `pid` is alive, probed with `kill(pid, 0)`.
///
/// `EPERM` means the process exists but belongs to someone else, so it
/// counts as alive. Only `ESRCH` proves the process is gone.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

/// `Scanner` backed by the Linux `/proc` filesystem.
pub struct ProcScanner {
    proc_root: PathBuf,
}

impl Default for ProcScanner {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcScanner {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    /// Every pid under the proc root with its candidate names. Processes
    /// that exit mid-scan simply yield no names.
    fn entries(&self) -> Result<Vec<(u32, Vec<String>)>, ScanError> {
        let entries = std::fs::read_dir(&self.proc_root).map_err(|e| ScanError::ListProcesses {
            path: self.proc_root.clone(),
            source: e,
        })?;

        Ok(entries
            .flatten()
            .filter_map(|entry| {
                let pid = entry.file_name().to_str()?.parse::<u32>().ok()?;
                Some((pid, process_names(&entry.path())))
            })
            .collect())
    }

    /// Running and not a zombie.
    fn is_running(&self, pid: u32) -> bool {
        let stat = self.proc_root.join(pid.to_string()).join("stat");
        match std::fs::read_to_string(stat) {
            Ok(contents) => process_state(&contents).is_some_and(|state| state != 'Z'),
            Err(_) => false,
        }
    }

    fn signal(pid: u32, attempt: u32) -> Result<(), ScanError> {
        let raw = i32::try_from(pid).map_err(|_| ScanError::InvalidPid(pid))?;
        if raw <= 0 {
            return Err(ScanError::InvalidPid(pid));
        }
        // Polite first, forceful after that.
        let signal = if attempt <= 1 {
            Signal::SIGTERM
        } else {
            Signal::SIGKILL
        };
        match kill(Pid::from_raw(raw), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(ScanError::Signal { pid, signal, errno }),
        }
    }
}

impl Scanner for ProcScanner {
    fn find_tracked(&self, names: &[String]) -> Result<Vec<ProcessInfo>, ScanError> {
        let mut tracked: Vec<ProcessInfo> = self
            .entries()?
            .into_iter()
            .filter_map(|(pid, candidates)| {
                matching_name(&candidates, names).map(|name| ProcessInfo {
                    pid,
                    name: name.to_string(),
                })
            })
            .collect();

        tracked.sort_by_key(|p| p.pid);
        tracing::debug!(count = tracked.len(), "scanned tracked processes");
        Ok(tracked)
    }

    fn terminate_with_retry(
        &self,
        pid: u32,
        max_attempts: u32,
        delay: Duration,
    ) -> Result<(), ScanError> {
        let mut policy = RetryPolicy::new(max_attempts, delay);
        let mut last_error = None;
        let mut attempt = 1;

        loop {
            if let Err(e) = Self::signal(pid, attempt) {
                tracing::warn!(pid, attempt, error = %e, "failed to signal process");
                last_error = Some(e);
            }
            std::thread::sleep(SETTLE_DELAY);

            match policy.evaluate(pid, self.is_running(pid)) {
                RetryDecision::Done => {
                    tracing::info!(pid, attempt, "terminated tracked process");
                    return Ok(());
                }
                RetryDecision::Retry { attempt: next } => {
                    tracing::debug!(pid, next_attempt = next, "process still running");
                    std::thread::sleep(policy.delay());
                    attempt = next;
                }
                RetryDecision::GiveUp => {
                    return Err(ScanError::StillRunning {
                        pid,
                        attempts: policy.current_attempt(),
                        last_error: last_error.map(Box::new),
                    })
                }
            }
        }
    }
}

/// Candidate names for the process at `dir`: `comm` first, then the
/// basename of argv[0] (`comm` is truncated to 15 bytes by the kernel).
fn process_names(dir: &Path) -> Vec<String> {
    let mut names = Vec::with_capacity(2);
    if let Ok(comm) = std::fs::read_to_string(dir.join("comm")) {
        let comm = comm.trim_end_matches('\n');
        if !comm.is_empty() {
            names.push(comm.to_string());
        }
    }
    if let Ok(cmdline) = std::fs::read(dir.join("cmdline")) {
        if let Some(argv0) = cmdline.split(|b| *b == 0).next() {
            let argv0 = String::from_utf8_lossy(argv0);
            if let Some(base) = Path::new(argv0.as_ref()).file_name() {
                let base = base.to_string_lossy().to_string();
                if !base.is_empty() && !names.contains(&base) {
                    names.push(base);
                }
            }
        }
    }
    names
}

/// The first candidate equal (ignoring ASCII case) to a tracked name.
fn matching_name<'a>(candidates: &'a [String], tracked: &[String]) -> Option<&'a str> {
    candidates
        .iter()
        .find(|c| tracked.iter().any(|t| t.eq_ignore_ascii_case(c)))
        .map(String::as_str)
}

/// Process state letter from `/proc/<pid>/stat`. The comm field may itself
/// contain spaces or parens, so parse from the last `)`.
fn process_state(stat: &str) -> Option<char> {
    let after = &stat[stat.rfind(')')? + 1..];
    after.split_whitespace().next()?.chars().next()
}

/// Errors from scanning or terminating processes.
#[derive(Debug)]
pub enum ScanError {
    ListProcesses {
        path: PathBuf,
        source: std::io::Error,
    },
    InvalidPid(u32),
    Signal {
        pid: u32,
        signal: Signal,
        errno: Errno,
    },
    StillRunning {
        pid: u32,
        attempts: u32,
        last_error: Option<Box<ScanError>>,
    },
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::ListProcesses { path, source } => {
                write!(f, "failed to list processes in {}: {source}", path.display())
            }
            ScanError::InvalidPid(pid) => write!(f, "invalid pid {pid}"),
            ScanError::Signal { pid, signal, errno } => {
                write!(f, "failed to send {signal} to pid {pid}: {errno}")
            }
            ScanError::StillRunning {
                pid,
                attempts,
                last_error,
            } => {
                write!(f, "pid {pid} still running after {attempts} termination attempts")?;
                if let Some(e) = last_error {
                    write!(f, " (last error: {e})")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ScanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScanError::ListProcesses { source, .. } => Some(source),
            ScanError::Signal { errno, .. } => Some(errno),
            ScanError::StillRunning { last_error, .. } => last_error
                .as_deref()
                .map(|e| e as &(dyn std::error::Error + 'static)),
            ScanError::InvalidPid(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::Command;
    use tempfile::tempdir;

    fn fake_proc(root: &Path, pid: u32, comm: &str, argv0: &str, state: char) {
        let dir = root.join(pid.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("comm"), format!("{comm}\n")).unwrap();
        std::fs::write(dir.join("cmdline"), format!("{argv0}\0--flag\0")).unwrap();
        std::fs::write(dir.join("stat"), format!("{pid} ({comm}) {state} 1 2 3")).unwrap();
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_find_tracked_matches_case_insensitively() {
        let dir = tempdir().unwrap();
        fake_proc(dir.path(), 10, "Steam", "/usr/bin/Steam", 'S');
        fake_proc(dir.path(), 11, "bash", "/bin/bash", 'S');
        fake_proc(dir.path(), 12, "steam", "steam", 'R');
        std::fs::create_dir_all(dir.path().join("self")).unwrap();

        let scanner = ProcScanner::new(dir.path());
        let found = scanner.find_tracked(&names(&["STEAM"])).unwrap();
        assert_eq!(
            found,
            vec![
                ProcessInfo {
                    pid: 10,
                    name: "Steam".to_string()
                },
                ProcessInfo {
                    pid: 12,
                    name: "steam".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_find_tracked_uses_argv0_for_long_names() {
        let dir = tempdir().unwrap();
        fake_proc(
            dir.path(),
            20,
            "minecraft-launc",
            "/opt/minecraft/minecraft-launcher",
            'S',
        );

        let scanner = ProcScanner::new(dir.path());
        let found = scanner
            .find_tracked(&names(&["minecraft-launcher"]))
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "minecraft-launcher");
    }

    #[test]
    fn test_find_tracked_none_running() {
        let dir = tempdir().unwrap();
        fake_proc(dir.path(), 30, "bash", "/bin/bash", 'S');
        let scanner = ProcScanner::new(dir.path());
        assert!(scanner.find_tracked(&names(&["steam"])).unwrap().is_empty());
    }

    #[test]
    fn test_find_tracked_missing_proc_root_is_error() {
        let scanner = ProcScanner::new("/nonexistent/proc");
        let err = scanner.find_tracked(&names(&["steam"])).unwrap_err();
        assert!(matches!(err, ScanError::ListProcesses { .. }));
    }

    #[test]
    fn test_entries_skips_non_pid_dirs() {
        let dir = tempdir().unwrap();
        fake_proc(dir.path(), 1, "init", "/sbin/init", 'S');
        fake_proc(dir.path(), 2, "kthreadd", "", 'S');
        std::fs::write(dir.path().join("uptime"), "1 2").unwrap();
        std::fs::create_dir_all(dir.path().join("sys")).unwrap();
        let scanner = ProcScanner::new(dir.path());
        let mut all = scanner.entries().unwrap();
        all.sort_by_key(|(pid, _)| *pid);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], (1, vec!["init".to_string()]));
        assert_eq!(all[1], (2, vec!["kthreadd".to_string()]));
    }

    #[test]
    fn test_zombie_is_not_running() {
        let dir = tempdir().unwrap();
        fake_proc(dir.path(), 40, "game", "game", 'Z');
        fake_proc(dir.path(), 41, "game", "game", 'S');
        let scanner = ProcScanner::new(dir.path());
        assert!(!scanner.is_running(40));
        assert!(scanner.is_running(41));
        assert!(!scanner.is_running(42));
    }

    #[test]
    fn test_process_state_handles_parens_in_comm() {
        assert_eq!(process_state("7 (a) b (c)) R 1 2"), Some('R'));
        assert_eq!(process_state("garbage"), None);
    }

    #[test]
    fn test_is_process_alive() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(u32::MAX));
    }

    #[test]
    fn test_terminate_with_retry_kills_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();

        // Reap in the background so the child does not linger as a zombie.
        let reaper = std::thread::spawn(move || child.wait());

        let scanner = ProcScanner::default();
        scanner
            .terminate_with_retry(pid, 3, Duration::from_millis(50))
            .unwrap();
        reaper.join().unwrap().unwrap();
        assert!(!scanner.is_running(pid));
    }

    #[test]
    fn test_terminate_escalates_when_sigterm_ignored() {
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; exec sleep 30"])
            .spawn()
            .unwrap();
        let pid = child.id();
        // Let the shell install the trap before the first signal.
        std::thread::sleep(Duration::from_millis(200));
        let reaper = std::thread::spawn(move || child.wait());

        let scanner = ProcScanner::default();
        scanner
            .terminate_with_retry(pid, 3, Duration::from_millis(10))
            .unwrap();
        let status = reaper.join().unwrap().unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
    }

    #[test]
    fn test_terminate_gone_process_succeeds() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let scanner = ProcScanner::default();
        assert!(scanner
            .terminate_with_retry(pid, 2, Duration::from_millis(10))
            .is_ok());
    }

    #[test]
    fn test_still_running_error_display() {
        let err = ScanError::StillRunning {
            pid: 77,
            attempts: 3,
            last_error: Some(Box::new(ScanError::InvalidPid(77))),
        };
        let msg = err.to_string();
        assert!(msg.contains("pid 77 still running after 3"));
        assert!(msg.contains("invalid pid 77"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
