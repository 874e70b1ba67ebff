/// The control loop: one tick per interval, each running
/// reset check → scan → accrue → enforce → warn → persist, in that order.
///
/// Ticks never overlap. A tick runs to completion inside the `select!` arm,
/// so shutdown is only observed between ticks; a slow scan or terminate
/// simply delays the next tick. `run` needs the multi-threaded runtime.
use crate::config::WardenConfig;
use crate::events::{EventLog, Notice, QuotaEvent};
use crate::notifier::Notifier;
use crate::process::{ProcessInfo, Scanner};
use crate::quota::QuotaState;
use crate::status::StatusReport;
use chrono::{Local, TimeZone};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;

/// Timing and targeting for the loop.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub tracked: Vec<String>,
    /// Time between ticks; also the amount accrued per active tick.
    pub tick_interval: Duration,
    /// Minimum time between periodic saves.
    pub save_interval: Duration,
    pub terminate_attempts: u32,
    pub terminate_retry_delay: Duration,
}

impl LoopSettings {
    pub fn from_config(config: &WardenConfig) -> Self {
        Self {
            tracked: config.tracked_processes(),
            tick_interval: config.enforcement.tick_interval(),
            save_interval: config.enforcement.save_interval(),
            terminate_attempts: config.enforcement.terminate_attempts,
            terminate_retry_delay: config.enforcement.terminate_retry_delay(),
        }
    }
}

/// What one completed tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub reset: bool,
    /// Tracked processes observed this tick.
    pub active: usize,
    pub exceeded: bool,
    pub notice: Option<Notice>,
    pub terminate_failures: usize,
    pub saved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Scan failed; nothing after the reset check ran.
    ScanFailed { reset: bool },
    Completed(TickSummary),
}

pub struct Controller {
    settings: LoopSettings,
    quota: Arc<QuotaState>,
    scanner: Arc<dyn Scanner>,
    notifier: Arc<dyn Notifier>,
    events: Arc<dyn EventLog>,
    last_save: Instant,
    was_active: bool,
}

impl Controller {
    pub fn new(
        settings: LoopSettings,
        quota: Arc<QuotaState>,
        scanner: Arc<dyn Scanner>,
        notifier: Arc<dyn Notifier>,
        events: Arc<dyn EventLog>,
    ) -> Self {
        Self {
            settings,
            quota,
            scanner,
            notifier,
            events,
            last_save: Instant::now(),
            was_active: false,
        }
    }

    /// Run one full evaluation cycle.
    pub fn tick(&mut self) -> TickOutcome {
        let reset = self.check_reset();

        let processes = match self.scanner.find_tracked(&self.settings.tracked) {
            Ok(p) => p,
            Err(e) => {
                self.events.record(QuotaEvent::ScanFailed {
                    error: e.to_string(),
                });
                return TickOutcome::ScanFailed { reset };
            }
        };
        self.track_presence(&processes);

        if !processes.is_empty() {
            self.quota.add_time(self.settings.tick_interval.as_secs());
        }

        let mut summary = TickSummary {
            reset,
            active: processes.len(),
            ..TickSummary::default()
        };

        if self.quota.is_limit_exceeded() {
            summary.exceeded = true;
            let first_time = self.quota.consume_limit_notification();
            if first_time || !processes.is_empty() {
                self.events.record(QuotaEvent::LimitExceeded {
                    accumulated_mins: self.quota.accumulated_minutes(),
                    active: processes.len(),
                });
            }
            if first_time {
                summary.notice = Some(self.dispatch(Notice::LimitExceeded));
            }
            summary.terminate_failures = self.terminate_all(&processes);
        } else {
            let (first, last) = self.quota.consume_warning_notifications();
            let remaining_mins = self.quota.remaining_minutes();
            let notice = if last {
                Some(Notice::FinalWarning { remaining_mins })
            } else if first {
                Some(Notice::FirstWarning { remaining_mins })
            } else {
                None
            };
            summary.notice = notice.map(|n| self.dispatch(n));
        }

        summary.saved = self.persist(false);
        TickOutcome::Completed(summary)
    }

    fn check_reset(&self) -> bool {
        if !self.quota.should_reset() {
            return false;
        }
        self.quota.reset();
        let next = self.quota.snapshot().next_reset;
        if let Some(next_reset) = Local.timestamp_opt(next, 0).single() {
            self.events.record(QuotaEvent::QuotaReset { next_reset });
        }
        true
    }

    fn track_presence(&mut self, processes: &[ProcessInfo]) {
        let active = !processes.is_empty();
        if active && !self.was_active {
            let mut names: Vec<String> = processes.iter().map(|p| p.name.clone()).collect();
            names.sort();
            names.dedup();
            self.events.record(QuotaEvent::PlayStarted { names });
        } else if !active && self.was_active {
            self.events.record(QuotaEvent::PlayStopped);
        }
        self.was_active = active;
    }

    /// Deliver a notice; failures are logged and never abort the tick.
    fn dispatch(&self, notice: Notice) -> Notice {
        let result = match notice {
            Notice::FirstWarning { remaining_mins } => {
                self.notifier.notify_first_warning(remaining_mins)
            }
            Notice::FinalWarning { remaining_mins } => {
                self.notifier.notify_final_warning(remaining_mins)
            }
            Notice::LimitExceeded => self.notifier.notify_limit_exceeded(),
        };
        match result {
            Ok(()) => self.events.record(QuotaEvent::NoticeSent(notice)),
            Err(e) => self.events.record(QuotaEvent::NoticeFailed {
                notice,
                error: e.to_string(),
            }),
        }
        notice
    }

    /// Attempt to terminate every scanned process. Returns the failure count.
    fn terminate_all(&self, processes: &[ProcessInfo]) -> usize {
        let mut failures = 0;
        for p in processes {
            if let Err(e) = self.scanner.terminate_with_retry(
                p.pid,
                self.settings.terminate_attempts,
                self.settings.terminate_retry_delay,
            ) {
                failures += 1;
                self.events.record(QuotaEvent::TerminateFailed {
                    pid: p.pid,
                    name: p.name.clone(),
                    error: e.to_string(),
                });
            }
        }
        failures
    }

    /// Save when forced or when `save_interval` has passed since the last
    /// successful save. A failed save leaves the marker alone so the next
    /// tick retries.
    fn persist(&mut self, force: bool) -> bool {
        if !force && self.last_save.elapsed() < self.settings.save_interval {
            return false;
        }
        match self.quota.save() {
            Ok(()) => {
                self.last_save = Instant::now();
                self.events.record(QuotaEvent::Saved);
                true
            }
            Err(e) => {
                self.events.record(QuotaEvent::SaveFailed {
                    error: e.to_string(),
                });
                false
            }
        }
    }

    /// Unconditional save, used on shutdown.
    pub fn flush(&mut self) -> bool {
        self.persist(true)
    }

    /// Current status without running a tick. A failed scan reports the
    /// active count as unknown.
    pub fn status(&self) -> StatusReport {
        let active = self
            .scanner
            .find_tracked(&self.settings.tracked)
            .map(|p| p.len())
            .ok();
        StatusReport::from_quota(&self.quota, active)
    }

    /// Tick on a fixed interval until `shutdown` resolves, then flush.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        self.events.record(QuotaEvent::Started {
            daily_limit_mins: self.quota.policy().daily_limit_mins,
            tracked: self.settings.tracked.clone(),
        });

        let period = self.settings.tick_interval.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => break,
                _ = interval.tick() => {
                    // Scans and terminate retries block this worker.
                    tokio::task::block_in_place(|| self.tick());
                }
            }
        }

        self.flush();
        self.events.record(QuotaEvent::Stopped);
    }
}
