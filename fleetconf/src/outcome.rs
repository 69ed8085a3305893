//! Per-device outcome records.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::backup::SnapshotHandle;
use crate::diff::ChangeSet;
use crate::error::{DeviceError, ErrorKind};

/// Lifecycle states of one device, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Init,
    Connected,
    BackedUp,
    Rendered,
    Diffed,
    Applying,
    Verified,
    Closed,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Connected => "connected",
            Self::BackedUp => "backed_up",
            Self::Rendered => "rendered",
            Self::Diffed => "diffed",
            Self::Applying => "applying",
            Self::Verified => "verified",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Terminal status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceStatus {
    Succeeded,
    SucceededNoChange,
    Failed,
    Skipped,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Succeeded => "Succeeded",
            Self::SucceededNoChange => "SucceededNoChange",
            Self::Failed => "Failed",
            Self::Skipped => "Skipped",
        };
        f.write_str(name)
    }
}

/// Why a device was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Changes were computed but not applied.
    DryRun,
    /// The run was cancelled before the device started.
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DryRun => f.write_str("dry run"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Error detail recorded in a failed outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutcomeError {
    pub kind: ErrorKind,
    pub message: String,
    /// Index of the first rejected batch command (apply errors only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_index: Option<usize>,
    /// Text of the command that failed (apply errors only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_command: Option<String>,
}

impl From<&DeviceError> for OutcomeError {
    fn from(err: &DeviceError) -> Self {
        let (failed_index, failed_command) = match err {
            DeviceError::Apply(batch) => (batch.failed_index(), Some(batch.command().to_string())),
            _ => (None, None),
        };
        Self {
            kind: err.kind(),
            message: err.to_string(),
            failed_index,
            failed_command,
        }
    }
}

impl fmt::Display for OutcomeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Result of one device lifecycle. Created once, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceOutcome {
    pub device_id: String,
    pub address: String,
    pub status: DeviceStatus,
    pub skip_reason: Option<SkipReason>,
    pub changes: Option<ChangeSet>,
    pub backup: Option<SnapshotHandle>,
    pub applied_snapshot: Option<SnapshotHandle>,
    pub error: Option<OutcomeError>,
    /// Last state reached before a failure.
    pub failed_at: Option<DeviceState>,
    pub warnings: Vec<String>,
    pub elapsed: Duration,
}

impl DeviceOutcome {
    pub(crate) fn new(device_id: &str, address: &str, status: DeviceStatus) -> Self {
        Self {
            device_id: device_id.to_string(),
            address: address.to_string(),
            status,
            skip_reason: None,
            changes: None,
            backup: None,
            applied_snapshot: None,
            error: None,
            failed_at: None,
            warnings: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    /// Outcome for a device the run never started.
    pub(crate) fn skipped(device_id: &str, address: &str, reason: SkipReason) -> Self {
        Self {
            skip_reason: Some(reason),
            ..Self::new(device_id, address, DeviceStatus::Skipped)
        }
    }

    /// Failed outcome for an error raised outside the state machine.
    pub(crate) fn failed(device_id: &str, address: &str, error: &DeviceError) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(device_id, address, DeviceStatus::Failed)
        }
    }

    /// Kind of the recorded error, if the device failed.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn is_failed(&self) -> bool {
        self.status == DeviceStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BatchError, SessionError};

    #[test]
    fn test_outcome_error_from_apply() {
        let err = DeviceError::Apply(BatchError::Rejected {
            index: 1,
            command: "ip route 0.0.0.0 0.0.0.0 bogus".into(),
            source: SessionError::CommandRejected {
                command: "ip route 0.0.0.0 0.0.0.0 bogus".into(),
                message: "% Invalid input".into(),
            },
        });
        let detail = OutcomeError::from(&err);
        assert_eq!(detail.kind, ErrorKind::Apply);
        assert_eq!(detail.failed_index, Some(1));
        assert_eq!(detail.failed_command.as_deref(), Some("ip route 0.0.0.0 0.0.0.0 bogus"));
        assert!(detail.to_string().starts_with("ApplyError: "));
    }

    #[test]
    fn test_outcome_error_without_index() {
        let detail = OutcomeError::from(&DeviceError::Cancelled);
        assert_eq!(detail.kind, ErrorKind::Cancelled);
        assert_eq!(detail.failed_index, None);
        assert_eq!(detail.failed_command, None);
    }

    #[test]
    fn test_skipped_outcome() {
        let outcome = DeviceOutcome::skipped("r1", "10.0.0.1", SkipReason::Cancelled);
        assert_eq!(outcome.status, DeviceStatus::Skipped);
        assert_eq!(outcome.skip_reason, Some(SkipReason::Cancelled));
        assert!(!outcome.is_failed());
        assert_eq!(outcome.error_kind(), None);
    }

    #[test]
    fn test_state_order() {
        assert!(DeviceState::Init < DeviceState::Connected);
        assert!(DeviceState::Diffed < DeviceState::Applying);
        assert_eq!(DeviceState::BackedUp.to_string(), "backed_up");
    }
}
