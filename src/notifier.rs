/// User-visible notifications for quota thresholds.
use std::process::Command;

/// Delivers quota notifications to the user.
pub trait Notifier: Send + Sync {
    fn notify_first_warning(&self, remaining_mins: i64) -> Result<(), NotifyError>;
    fn notify_final_warning(&self, remaining_mins: i64) -> Result<(), NotifyError>;
    fn notify_limit_exceeded(&self) -> Result<(), NotifyError>;
}

/// Desktop notifications through `notify-send`.
pub struct DesktopNotifier {
    command: String,
}

impl Default for DesktopNotifier {
    fn default() -> Self {
        Self::new("notify-send")
    }
}

impl DesktopNotifier {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    fn show(&self, urgency: &str, title: &str, body: &str) -> Result<(), NotifyError> {
        let output = Command::new(&self.command)
            .args(["--app-name", env!("CARGO_PKG_NAME"), "--urgency", urgency, title, body])
            .output()
            .map_err(|e| NotifyError::Spawn {
                command: self.command.clone(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(NotifyError::Failed {
                command: self.command.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

impl Notifier for DesktopNotifier {
    fn notify_first_warning(&self, remaining_mins: i64) -> Result<(), NotifyError> {
        self.show(
            "normal",
            "Playtime running low",
            &format!("{remaining_mins} minutes of playtime left today."),
        )
    }

    fn notify_final_warning(&self, remaining_mins: i64) -> Result<(), NotifyError> {
        self.show(
            "critical",
            "Playtime almost over",
            &format!("Last reminder: only {remaining_mins} minutes left. Save your progress."),
        )
    }

    fn notify_limit_exceeded(&self) -> Result<(), NotifyError> {
        self.show(
            "critical",
            "Playtime is up",
            "Today's limit has been reached. Tracked programs will be closed.",
        )
    }
}

/// Errors from delivering a notification.
#[derive(Debug)]
pub enum NotifyError {
    Spawn {
        command: String,
        source: std::io::Error,
    },
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::Spawn { command, source } => {
                write!(f, "failed to run {command}: {source}")
            }
            NotifyError::Failed {
                command,
                code,
                stderr,
            } => {
                write!(f, "{command} exited with {code:?}")?;
                if !stderr.is_empty() {
                    write!(f, ": {stderr}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for NotifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NotifyError::Spawn { source, .. } => Some(source),
            NotifyError::Failed { .. } => None,
        }
    }
}
