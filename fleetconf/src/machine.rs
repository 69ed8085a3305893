//! Single-device lifecycle.
//!
//! A [`DeviceMachine`] drives one device through
//!
//! ```text
//! Init → Connected → BackedUp → Rendered → Diffed → Applying → Verified → Closed
//! ```
//!
//! and folds whatever happens into a [`DeviceOutcome`]. It never returns an
//! error: failures are recorded with the state they happened in. Once a
//! session is open it is closed on every path out of the lifecycle.
//!
//! A panic inside the lifecycle is caught, recorded as an internal failure
//! and the session is still closed.
//!
//! Cancellation is cooperative. The run token is checked before each
//! transition up to `Applying`; a lifecycle that sees it aborts with
//! `Cancelled`. A batch that has started is never interrupted.

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::backup::{BackupStore, SnapshotHandle};
use crate::diff::{ChangeSet, diff};
use crate::error::DeviceError;
use crate::inventory::{DeviceDescriptor, Variables};
use crate::outcome::{DeviceOutcome, DeviceState, DeviceStatus, SkipReason};
use crate::render::{RenderContext, Renderer};
use crate::session::{Connector, DeviceSession};

/// What a run is allowed to do to devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    /// Persist the running configuration before applying (default: on).
    pub backup: bool,

    /// Re-read the running configuration after applying (default: off).
    pub verify: bool,

    /// Compute changes without applying them (default: off).
    pub dry_run: bool,

    /// Cancel the run after this long.
    pub deadline: Option<Duration>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            backup: true,
            verify: false,
            dry_run: false,
            deadline: None,
        }
    }
}

impl Policy {
    pub fn backup(mut self, enabled: bool) -> Self {
        self.backup = enabled;
        self
    }

    pub fn verify(mut self, enabled: bool) -> Self {
        self.verify = enabled;
        self
    }

    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Split rendered text into the commands sent to the device.
///
/// Blank lines are dropped and trailing whitespace removed; indentation is
/// kept because some CLIs use it for hierarchy.
pub fn command_batch(rendered: &str) -> Vec<String> {
    rendered
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// The text a configuration is compared as: the command lines of `text`
/// joined back together, so a diff never reports what an apply would not send.
fn comparable(text: &str) -> String {
    command_batch(text).join("\n")
}

/// Best-effort message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

enum Completion {
    Applied,
    NoChange,
    DryRun,
}

/// Everything learned about a device so far.
struct Progress {
    device_id: String,
    state: DeviceState,
    backup: Option<SnapshotHandle>,
    applied_snapshot: Option<SnapshotHandle>,
    changes: Option<ChangeSet>,
    warnings: Vec<String>,
}

impl Progress {
    fn new(device: &DeviceDescriptor) -> Self {
        Self {
            device_id: device.id().to_string(),
            state: DeviceState::Init,
            backup: None,
            applied_snapshot: None,
            changes: None,
            warnings: Vec::new(),
        }
    }

    fn advance(&mut self, state: DeviceState) {
        debug!("{}: {} -> {}", self.device_id, self.state, state);
        self.state = state;
    }

    fn warn(&mut self, message: String) {
        warn!("{}: {}", self.device_id, message);
        self.warnings.push(message);
    }

    fn finish(
        self,
        device: &DeviceDescriptor,
        result: Result<Completion, DeviceError>,
        elapsed: Duration,
    ) -> DeviceOutcome {
        let (status, skip_reason, error, failed_at) = match result {
            Ok(Completion::Applied) => (DeviceStatus::Succeeded, None, None, None),
            Ok(Completion::NoChange) => (DeviceStatus::SucceededNoChange, None, None, None),
            Ok(Completion::DryRun) => (DeviceStatus::Skipped, Some(SkipReason::DryRun), None, None),
            Err(e) => {
                warn!("{}: failed in state {}: {}", self.device_id, self.state, e);
                (DeviceStatus::Failed, None, Some((&e).into()), Some(self.state))
            }
        };

        info!("{}: {} in {:?}", self.device_id, status, elapsed);
        DeviceOutcome {
            device_id: self.device_id,
            address: device.address.clone(),
            status,
            skip_reason,
            changes: self.changes,
            backup: self.backup,
            applied_snapshot: self.applied_snapshot,
            error,
            failed_at,
            warnings: self.warnings,
            elapsed,
        }
    }
}

/// Runs device lifecycles against shared collaborators.
pub struct DeviceMachine<C, R, B> {
    connector: Arc<C>,
    renderer: Arc<R>,
    store: Arc<B>,
    policy: Policy,
    cancel: CancellationToken,
}

impl<C, R, B> Clone for DeviceMachine<C, R, B> {
    fn clone(&self) -> Self {
        Self {
            connector: Arc::clone(&self.connector),
            renderer: Arc::clone(&self.renderer),
            store: Arc::clone(&self.store),
            policy: self.policy.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<C, R, B> DeviceMachine<C, R, B>
where
    C: Connector,
    R: Renderer,
    B: BackupStore,
{
    pub fn new(
        connector: Arc<C>,
        renderer: Arc<R>,
        store: Arc<B>,
        policy: Policy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connector,
            renderer,
            store,
            policy,
            cancel,
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Drive `device` through its lifecycle and record the outcome.
    pub async fn run(
        &self,
        device: &DeviceDescriptor,
        template: &str,
        globals: &Variables,
    ) -> DeviceOutcome {
        let started = Instant::now();

        if self.cancel.is_cancelled() {
            debug!("{}: cancelled before start", device.id());
            return DeviceOutcome::skipped(device.id(), &device.address, SkipReason::Cancelled);
        }

        let mut progress = Progress::new(device);
        let result = match self.connector.open(device).await {
            Err(source) => Err(DeviceError::Connection {
                address: device.address.clone(),
                source,
            }),
            Ok(mut session) => {
                progress.advance(DeviceState::Connected);
                let driven = AssertUnwindSafe(self.drive(
                    &mut session,
                    device,
                    template,
                    globals,
                    &mut progress,
                ))
                .catch_unwind()
                .await;
                let result = driven.unwrap_or_else(|payload| {
                    let message = panic_message(payload.as_ref());
                    error!("{}: lifecycle panicked: {}", device.id(), message);
                    Err(DeviceError::Internal(message))
                });
                if let Err(e) = session.close().await {
                    progress.warn(format!("session did not close cleanly: {e}"));
                }
                debug!("{}: closed", device.id());
                result
            }
        };

        progress.finish(device, result, started.elapsed())
    }

    fn checkpoint(&self) -> Result<(), DeviceError> {
        if self.cancel.is_cancelled() {
            return Err(DeviceError::Cancelled);
        }
        Ok(())
    }

    async fn drive(
        &self,
        session: &mut C::Session,
        device: &DeviceDescriptor,
        template: &str,
        globals: &Variables,
        progress: &mut Progress,
    ) -> Result<Completion, DeviceError> {
        self.checkpoint()?;
        let running = session
            .running_config()
            .await
            .map_err(DeviceError::Backup)?;
        if self.policy.backup {
            progress.backup = Some(self.store.save(device.id(), &running).await?);
        }
        progress.advance(DeviceState::BackedUp);

        self.checkpoint()?;
        let context = RenderContext::for_device(globals, device);
        let rendered = self.renderer.render(template, &context)?;
        progress.advance(DeviceState::Rendered);

        let commands = command_batch(&rendered);
        let changes = diff(&comparable(&running), &commands.join("\n"));
        let unchanged = changes.is_empty();
        debug!("{}: changes {}", device.id(), changes.summary());
        progress.changes = Some(changes);
        progress.advance(DeviceState::Diffed);

        if unchanged {
            return Ok(Completion::NoChange);
        }
        if self.policy.dry_run {
            return Ok(Completion::DryRun);
        }

        self.checkpoint()?;
        progress.advance(DeviceState::Applying);
        session.execute_batch(&commands).await?;

        if self.policy.verify {
            self.verify(session, device, &commands, progress).await;
        }
        progress.advance(DeviceState::Verified);
        Ok(Completion::Applied)
    }

    /// Check the applied commands against a fresh capture. Never fails.
    async fn verify(
        &self,
        session: &mut C::Session,
        device: &DeviceDescriptor,
        commands: &[String],
        progress: &mut Progress,
    ) {
        let after = match session.running_config().await {
            Ok(text) => text,
            Err(e) => {
                progress.warn(format!("verification skipped, running configuration unavailable: {e}"));
                return;
            }
        };

        if self.policy.backup {
            match self.store.save_applied(device.id(), &after).await {
                Ok(handle) => progress.applied_snapshot = Some(handle),
                Err(e) => progress.warn(format!("applied snapshot not stored: {e}")),
            }
        }

        let present: HashSet<&str> = after.lines().map(str::trim).collect();
        let missing: Vec<&str> = commands
            .iter()
            .map(|c| c.trim())
            .filter(|c| !present.contains(c))
            .collect();

        if let Some(first) = missing.first() {
            progress.warn(format!(
                "verification: {} of {} commands not in running configuration (first: '{}')",
                missing.len(),
                commands.len(),
                first
            ));
        }
    }
}
