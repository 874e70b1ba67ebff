/// Point-in-time quota status, rendered for humans or as JSON.
use crate::quota::{QuotaPolicy, QuotaRecord, QuotaState};
use chrono::{DateTime, Local, TimeZone, Utc};
use serde::Serialize;
use std::time::Duration;

/// Overall quota condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaCondition {
    Available,
    FirstWarning,
    FinalWarning,
    Exceeded,
}

/// The JSON payload printed by `status --json`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub condition: QuotaCondition,
    pub accumulated_mins: i64,
    pub remaining_mins: i64,
    pub daily_limit_mins: u32,
    /// `None` when the process scan failed.
    pub active_processes: Option<usize>,
    pub next_reset: Option<DateTime<Utc>>,
    pub secs_until_reset: u64,
}

impl StatusReport {
    /// Build a report from one consistent snapshot of the ledger and the
    /// last scan result.
    pub fn from_quota(quota: &QuotaState, active_processes: Option<usize>) -> Self {
        Self::from_record(
            quota.policy(),
            &quota.snapshot(),
            active_processes,
            Local::now().timestamp(),
        )
    }

    fn from_record(
        policy: &QuotaPolicy,
        record: &QuotaRecord,
        active_processes: Option<usize>,
        now: i64,
    ) -> Self {
        let remaining_mins = record.remaining_mins(policy.daily_limit_mins);
        let condition = if record.is_exceeded(policy.daily_limit_mins) {
            QuotaCondition::Exceeded
        } else if remaining_mins <= i64::from(policy.final_threshold_mins) {
            QuotaCondition::FinalWarning
        } else if remaining_mins <= i64::from(policy.first_threshold_mins) {
            QuotaCondition::FirstWarning
        } else {
            QuotaCondition::Available
        };

        Self {
            condition,
            accumulated_mins: record.accumulated_mins(),
            remaining_mins,
            daily_limit_mins: policy.daily_limit_mins,
            active_processes,
            next_reset: Utc.timestamp_opt(record.next_reset, 0).single(),
            secs_until_reset: record.secs_until_reset(now),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Multi-line human-readable summary.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("=== playtime status ===\n");
        out.push_str(&format!("Used today:      {} min\n", self.accumulated_mins));
        out.push_str(&format!("Remaining:       {} min\n", self.remaining_mins));
        out.push_str(&format!("Daily limit:     {} min\n", self.daily_limit_mins));
        out.push_str(&format!("Condition:       {}\n", condition_label(self.condition)));

        match self.active_processes {
            Some(0) => out.push_str("Tracked running: none\n"),
            Some(n) => out.push_str(&format!("Tracked running: {n}\n")),
            None => out.push_str("Tracked running: unknown (scan failed)\n"),
        }

        let until = format_duration(Duration::from_secs(self.secs_until_reset));
        match self.next_reset {
            Some(at) => out.push_str(&format!(
                "Next reset:      {} (in {until})\n",
                at.with_timezone(&Local).format("%Y-%m-%d %H:%M")
            )),
            None => out.push_str(&format!("Next reset:      in {until}\n")),
        }
        out
    }
}

fn condition_label(condition: QuotaCondition) -> &'static str {
    match condition {
        QuotaCondition::Available => "available",
        QuotaCondition::FirstWarning => "running low",
        QuotaCondition::FinalWarning => "almost out",
        QuotaCondition::Exceeded => "limit reached",
    }
}

/// `Xh Ym`, dropping the hour part when zero.
fn format_duration(d: Duration) -> String {
    let mins = d.as_secs() / 60;
    let (h, m) = (mins / 60, mins % 60);
    if h == 0 {
        format!("{m}m")
    } else {
        format!("{h}h {m}m")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::tests::policy;

    fn quota_with(mins: u64) -> QuotaState {
        let q = QuotaState::new(policy(120, 15, 5), "unused.json");
        q.add_time(mins * 60);
        q
    }

    #[test]
    fn test_report_fields() {
        let q = quota_with(1);
        let report = StatusReport::from_quota(&q, Some(2));
        assert_eq!(report.accumulated_mins, 1);
        assert_eq!(report.remaining_mins, 119);
        assert_eq!(report.daily_limit_mins, 120);
        assert_eq!(report.active_processes, Some(2));
        assert_eq!(report.condition, QuotaCondition::Available);
        assert!(report.next_reset.is_some());
        assert!(report.secs_until_reset <= 24 * 60 * 60);
    }

    #[test]
    fn test_conditions_follow_thresholds() {
        let cases = [
            (104, QuotaCondition::Available),
            (105, QuotaCondition::FirstWarning),
            (115, QuotaCondition::FinalWarning),
            (120, QuotaCondition::Exceeded),
            (500, QuotaCondition::Exceeded),
        ];
        for (mins, expected) in cases {
            let report = StatusReport::from_quota(&quota_with(mins), Some(0));
            assert_eq!(report.condition, expected, "at {mins} minutes");
        }
    }

    #[test]
    fn test_json_shape() {
        let report = StatusReport::from_quota(&quota_with(30), None);
        let parsed: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(parsed["condition"], "available");
        assert_eq!(parsed["accumulated_mins"], 30);
        assert_eq!(parsed["remaining_mins"], 90);
        assert!(parsed["active_processes"].is_null());
        assert!(parsed["next_reset"].is_string());
    }

    #[test]
    fn test_all_conditions_serialize() {
        let states = vec![
            (QuotaCondition::Available, "available"),
            (QuotaCondition::FirstWarning, "first_warning"),
            (QuotaCondition::FinalWarning, "final_warning"),
            (QuotaCondition::Exceeded, "exceeded"),
        ];
        for (state, expected_str) in states {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", expected_str));
        }
    }

    #[test]
    fn test_render_text() {
        let text = StatusReport::from_quota(&quota_with(120), Some(0)).render();
        assert!(text.contains("Used today:      120 min"));
        assert!(text.contains("Remaining:       0 min"));
        assert!(text.contains("limit reached"));
        assert!(text.contains("Tracked running: none"));
        assert!(text.contains("Next reset:"));

        let text = StatusReport::from_quota(&quota_with(0), None).render();
        assert!(text.contains("unknown (scan failed)"));
    }

    #[test]
    fn test_report_reads_one_record() {
        let record = QuotaRecord {
            accumulated_secs: 110 * 60 + 30,
            last_reset: 1_000,
            next_reset: 1_000 + 3_600,
            ..QuotaRecord::default()
        };
        let report = StatusReport::from_record(&policy(120, 15, 5), &record, Some(1), 1_600);
        assert_eq!(report.accumulated_mins, 110);
        assert_eq!(report.remaining_mins, 10);
        assert_eq!(report.condition, QuotaCondition::FirstWarning);
        assert_eq!(report.secs_until_reset, 3_000);
        assert_eq!(report.next_reset.unwrap().timestamp(), 4_600);

        let overdue = StatusReport::from_record(&policy(120, 15, 5), &record, None, 9_999);
        assert_eq!(overdue.secs_until_reset, 0);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(59)), "0m");
        assert_eq!(format_duration(Duration::from_secs(45 * 60)), "45m");
        assert_eq!(format_duration(Duration::from_secs(3 * 3600 + 5 * 60)), "3h 5m");
    }
}
