//! Run reports.
//!
//! A [`RunReport`] lists one outcome per input device, in input order, with
//! aggregate counts. It renders as JSON for machines ([`RunReport::to_json`])
//! or as coloured text with unified diffs for people
//! ([`RunReport::render_human`]).

use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::Serialize;

use crate::diff::ChangeSummary;
use crate::outcome::{DeviceOutcome, DeviceState, DeviceStatus, OutcomeError, SkipReason};

/// Number of outcomes per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub total: usize,
    pub succeeded: usize,
    pub no_change: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunCounts {
    fn tally(outcomes: &[DeviceOutcome]) -> Self {
        let mut counts = Self {
            total: outcomes.len(),
            ..Self::default()
        };
        for outcome in outcomes {
            match outcome.status {
                DeviceStatus::Succeeded => counts.succeeded += 1,
                DeviceStatus::SucceededNoChange => counts.no_change += 1,
                DeviceStatus::Failed => counts.failed += 1,
                DeviceStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }
}

/// Result of one orchestrated run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// One outcome per input device, in input order.
    pub outcomes: Vec<DeviceOutcome>,
    pub counts: RunCounts,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Whether the run was cancelled (signal or deadline).
    pub cancelled: bool,
    pub dry_run: bool,
}

/// Serialized form of one outcome.
#[derive(Debug, Serialize)]
pub struct ReportRecord<'a> {
    pub device_id: &'a str,
    pub address: &'a str,
    pub status: DeviceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_summary: Option<ChangeSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'a OutcomeError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DeviceState>,
    #[serde(skip_serializing_if = "is_empty")]
    pub warnings: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_snapshot: Option<&'a str>,
    pub elapsed_ms: u128,
}

impl<'a> From<&'a DeviceOutcome> for ReportRecord<'a> {
    fn from(outcome: &'a DeviceOutcome) -> Self {
        let changes = outcome.changes.as_ref();
        Self {
            device_id: &outcome.device_id,
            address: &outcome.address,
            status: outcome.status,
            skip_reason: outcome.skip_reason,
            change_summary: changes.map(|c| c.summary()),
            diff: changes.filter(|c| !c.is_empty()).map(|c| c.unified(3)),
            error: outcome.error.as_ref(),
            failed_at: outcome.failed_at,
            warnings: &outcome.warnings,
            backup: outcome.backup.as_ref().map(|h| h.location.as_str()),
            applied_snapshot: outcome.applied_snapshot.as_ref().map(|h| h.location.as_str()),
            elapsed_ms: outcome.elapsed.as_millis(),
        }
    }
}

fn is_empty(warnings: &&[String]) -> bool {
    warnings.is_empty()
}

#[derive(Serialize)]
struct ReportDocument<'a> {
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    cancelled: bool,
    dry_run: bool,
    counts: RunCounts,
    devices: Vec<ReportRecord<'a>>,
}

impl RunReport {
    /// Build a report, computing the counts from `outcomes`.
    pub fn new(
        outcomes: Vec<DeviceOutcome>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        cancelled: bool,
        dry_run: bool,
    ) -> Self {
        Self {
            counts: RunCounts::tally(&outcomes),
            outcomes,
            started_at,
            finished_at,
            cancelled,
            dry_run,
        }
    }

    /// Whether any device failed.
    pub fn has_failures(&self) -> bool {
        self.counts.failed > 0
    }

    /// Process exit code: 0 when no device failed, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        if self.has_failures() { 1 } else { 0 }
    }

    /// Outcomes of failed devices, in input order.
    pub fn failures(&self) -> impl Iterator<Item = &DeviceOutcome> {
        self.outcomes.iter().filter(|o| o.is_failed())
    }

    pub fn records(&self) -> Vec<ReportRecord<'_>> {
        self.outcomes.iter().map(ReportRecord::from).collect()
    }

    /// Pretty-printed JSON document.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&ReportDocument {
            started_at: self.started_at,
            finished_at: self.finished_at,
            cancelled: self.cancelled,
            dry_run: self.dry_run,
            counts: self.counts,
            devices: self.records(),
        })
    }

    /// Human-readable summary with coloured unified diffs.
    pub fn render_human(&self) -> String {
        let mut out = String::new();

        for outcome in &self.outcomes {
            let status = match outcome.status {
                DeviceStatus::Succeeded => "changed".green().bold(),
                DeviceStatus::SucceededNoChange => "ok".green(),
                DeviceStatus::Failed => "FAILED".red().bold(),
                DeviceStatus::Skipped => "skipped".yellow(),
            };
            let _ = write!(out, "{:<8} {}", status, outcome.device_id.bold());
            if outcome.device_id != outcome.address {
                let _ = write!(out, " ({})", outcome.address);
            }
            if let Some(changes) = outcome.changes.as_ref().filter(|c| !c.is_empty()) {
                let _ = write!(out, " [{}]", changes.summary());
            }
            if let Some(reason) = outcome.skip_reason {
                let _ = write!(out, " {}", reason.to_string().dimmed());
            }
            out.push('\n');

            if let Some(error) = &outcome.error {
                let _ = writeln!(out, "    {}", error.to_string().red());
            }
            for warning in &outcome.warnings {
                let _ = writeln!(out, "    {} {}", "warning:".yellow(), warning);
            }
            if let Some(backup) = &outcome.backup {
                let _ = writeln!(out, "    backup: {}", backup.location.dimmed());
            }
            if let Some(changes) = outcome.changes.as_ref().filter(|c| !c.is_empty()) {
                for line in changes.unified(3).lines() {
                    let line = match line.chars().next() {
                        Some('+') => line.green(),
                        Some('-') => line.red(),
                        Some('@') => line.cyan(),
                        _ => line.normal(),
                    };
                    let _ = writeln!(out, "    {line}");
                }
            }
        }

        let c = &self.counts;
        let _ = write!(
            out,
            "\n{} devices: {} changed, {} unchanged, {} failed, {} skipped",
            c.total, c.succeeded, c.no_change, c.failed, c.skipped
        );
        if self.dry_run {
            let _ = write!(out, " {}", "(dry run)".yellow());
        }
        if self.cancelled {
            let _ = write!(out, " {}", "(cancelled)".red());
        }
        out.push('\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::diff::diff;
    use crate::error::{DeviceError, SessionError};

    fn report() -> RunReport {
        let changed = DeviceOutcome {
            changes: Some(diff("hostname old", "hostname r1")),
            elapsed: Duration::from_millis(1200),
            ..DeviceOutcome::new("r1", "10.0.0.1", DeviceStatus::Succeeded)
        };
        let unchanged = DeviceOutcome {
            changes: Some(diff("hostname r2", "hostname r2")),
            ..DeviceOutcome::new("10.0.0.2", "10.0.0.2", DeviceStatus::SucceededNoChange)
        };
        let failed = DeviceOutcome {
            failed_at: Some(DeviceState::Init),
            ..DeviceOutcome::failed(
                "10.0.0.3",
                "10.0.0.3",
                &DeviceError::Connection {
                    address: "10.0.0.3".into(),
                    source: SessionError::Timeout(Duration::from_secs(30)),
                },
            )
        };
        let skipped = DeviceOutcome::skipped("10.0.0.4", "10.0.0.4", SkipReason::Cancelled);

        let now = Utc::now();
        RunReport::new(vec![changed, unchanged, failed, skipped], now, now, true, false)
    }

    #[test]
    fn test_counts_and_exit_code() {
        let report = report();
        assert_eq!(
            report.counts,
            RunCounts {
                total: 4,
                succeeded: 1,
                no_change: 1,
                failed: 1,
                skipped: 1
            }
        );
        assert!(report.has_failures());
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.failures().count(), 1);

        let now = Utc::now();
        let empty = RunReport::new(Vec::new(), now, now, false, false);
        assert_eq!(empty.counts, RunCounts::default());
        assert_eq!(empty.exit_code(), 0);
    }

    #[test]
    fn test_json_report() {
        let json: serde_json::Value = serde_json::from_str(&report().to_json().unwrap()).unwrap();

        assert_eq!(json["counts"]["total"], 4);
        assert_eq!(json["cancelled"], true);
        let devices = json["devices"].as_array().unwrap();
        let ids: Vec<_> = devices.iter().map(|d| d["device_id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["r1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]);

        assert_eq!(devices[0]["status"], "Succeeded");
        assert_eq!(devices[0]["change_summary"]["added"], 1);
        assert_eq!(devices[0]["change_summary"]["removed"], 1);
        assert!(devices[0]["diff"].as_str().unwrap().contains("+hostname r1"));
        assert_eq!(devices[0]["elapsed_ms"], 1200);

        assert!(devices[1].get("diff").is_none());
        assert_eq!(devices[2]["error"]["kind"], "connection");
        assert_eq!(devices[2]["failed_at"], "init");
        assert_eq!(devices[3]["skip_reason"], "cancelled");
        assert!(devices[3].get("warnings").is_none());
    }

    #[test]
    fn test_human_report() {
        colored::control::set_override(false);
        let text = report().render_human();

        assert!(text.contains("changed  r1 (10.0.0.1) [+1 -1]"));
        assert!(text.contains("    -hostname old\n    +hostname r1\n"));
        assert!(text.contains("FAILED   10.0.0.3\n    ConnectionError: "));
        assert!(text.contains("skipped  10.0.0.4 cancelled"));
        assert!(text.ends_with("4 devices: 1 changed, 1 unchanged, 1 failed, 1 skipped (cancelled)\n"));
    }
}
