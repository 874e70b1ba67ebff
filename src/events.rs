/// Structured events emitted by the control loop.
///
/// The controller receives an `EventLog` at construction instead of reaching
/// for a global logger; production forwards everything to `tracing`.
use chrono::{DateTime, Local};

/// Which notification a tick dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notice {
    FirstWarning { remaining_mins: i64 },
    FinalWarning { remaining_mins: i64 },
    LimitExceeded,
}

impl Notice {
    pub fn kind(&self) -> &'static str {
        match self {
            Notice::FirstWarning { .. } => "first_warning",
            Notice::FinalWarning { .. } => "final_warning",
            Notice::LimitExceeded => "limit_exceeded",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuotaEvent {
    Started {
        daily_limit_mins: u32,
        tracked: Vec<String>,
    },
    QuotaReset {
        next_reset: DateTime<Local>,
    },
    PlayStarted {
        names: Vec<String>,
    },
    PlayStopped,
    LimitExceeded {
        accumulated_mins: i64,
        active: usize,
    },
    NoticeSent(Notice),
    NoticeFailed {
        notice: Notice,
        error: String,
    },
    ScanFailed {
        error: String,
    },
    TerminateFailed {
        pid: u32,
        name: String,
        error: String,
    },
    Saved,
    SaveFailed {
        error: String,
    },
    Stopped,
}

/// Fire-and-forget sink for control loop events.
pub trait EventLog: Send + Sync {
    fn record(&self, event: QuotaEvent);
}

/// `EventLog` that emits each event through `tracing` with an `event` field.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventLog;

impl EventLog for TracingEventLog {
    fn record(&self, event: QuotaEvent) {
        match event {
            QuotaEvent::Started {
                daily_limit_mins,
                tracked,
            } => tracing::info!(
                event = "started",
                daily_limit_mins,
                tracked = ?tracked,
                "quota enforcement started"
            ),
            QuotaEvent::QuotaReset { next_reset } => tracing::info!(
                event = "quota_reset",
                next_reset = %next_reset.format("%Y-%m-%d %H:%M"),
                "daily quota reset"
            ),
            QuotaEvent::PlayStarted { names } => {
                tracing::info!(event = "play_started", processes = ?names, "tracked process running")
            }
            QuotaEvent::PlayStopped => {
                tracing::info!(event = "play_stopped", "no tracked process running")
            }
            QuotaEvent::LimitExceeded {
                accumulated_mins,
                active,
            } => tracing::warn!(
                event = "limit_exceeded",
                accumulated_mins,
                active,
                "daily limit exceeded, terminating tracked processes"
            ),
            QuotaEvent::NoticeSent(notice) => match notice {
                Notice::FirstWarning { remaining_mins } | Notice::FinalWarning { remaining_mins } => {
                    tracing::warn!(event = notice.kind(), remaining_mins, "playtime warning sent")
                }
                Notice::LimitExceeded => {
                    tracing::warn!(event = notice.kind(), "limit notification sent")
                }
            },
            QuotaEvent::NoticeFailed { notice, error } => tracing::error!(
                event = "notify_failed",
                kind = notice.kind(),
                error = %error,
                "failed to deliver notification"
            ),
            QuotaEvent::ScanFailed { error } => {
                tracing::error!(event = "scan_failed", error = %error, "process scan failed")
            }
            QuotaEvent::TerminateFailed { pid, name, error } => tracing::error!(
                event = "terminate_failed",
                pid,
                name = %name,
                error = %error,
                "failed to terminate tracked process"
            ),
            QuotaEvent::Saved => tracing::debug!(event = "saved", "quota state saved"),
            QuotaEvent::SaveFailed { error } => {
                tracing::error!(event = "save_failed", error = %error, "failed to save quota state")
            }
            QuotaEvent::Stopped => tracing::info!(event = "stopped", "quota enforcement stopped"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Captures events for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingLog {
        pub(crate) events: Mutex<Vec<QuotaEvent>>,
    }

    impl RecordingLog {
        pub(crate) fn take(&self) -> Vec<QuotaEvent> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    impl EventLog for RecordingLog {
        fn record(&self, event: QuotaEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[test]
    fn test_notice_kinds() {
        assert_eq!(Notice::FirstWarning { remaining_mins: 3 }.kind(), "first_warning");
        assert_eq!(Notice::FinalWarning { remaining_mins: 1 }.kind(), "final_warning");
        assert_eq!(Notice::LimitExceeded.kind(), "limit_exceeded");
    }

    #[test]
    fn test_tracing_log_accepts_every_event() {
        let log = TracingEventLog;
        log.record(QuotaEvent::Started {
            daily_limit_mins: 120,
            tracked: vec!["steam".to_string()],
        });
        log.record(QuotaEvent::QuotaReset {
            next_reset: Local::now(),
        });
        log.record(QuotaEvent::NoticeSent(Notice::FinalWarning { remaining_mins: 4 }));
        log.record(QuotaEvent::Stopped);
    }

    #[test]
    fn test_recording_log_collects_in_order() {
        let log = RecordingLog::default();
        log.record(QuotaEvent::PlayStopped);
        log.record(QuotaEvent::Saved);
        assert_eq!(log.take(), vec![QuotaEvent::PlayStopped, QuotaEvent::Saved]);
        assert!(log.take().is_empty());
    }
}
