//! Bounded concurrent runs over many devices.
//!
//! The orchestrator starts `concurrency` workers that pull devices from a
//! shared queue and run each one's full lifecycle before taking the next.
//! Outcomes come back over a channel tagged with the device's input index
//! and are placed into slots, so the report follows input order whatever
//! the completion order. A failing or panicking device never affects the
//! others.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures_util::FutureExt;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backup::BackupStore;
use crate::error::{ConfigError, DeviceError};
use crate::inventory::{DeviceDescriptor, Variables};
use crate::machine::{DeviceMachine, Policy, panic_message};
use crate::outcome::DeviceOutcome;
use crate::render::Renderer;
use crate::report::RunReport;
use crate::session::Connector;

/// Runs a template against a device list.
///
/// # Example
///
/// ```rust,no_run
/// use fleetconf::{
///     FileBackupStore, Inventory, Orchestrator, Policy, SshConnector, SshOptions, TeraRenderer,
/// };
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let inventory = Inventory::load("devices.toml")?;
/// let orchestrator = Orchestrator::new(
///     SshConnector::new(inventory.credentials, SshOptions::default()),
///     TeraRenderer::new(),
///     FileBackupStore::new("backups"),
/// )
/// .with_policy(Policy::default().verify(true));
///
/// let report = orchestrator
///     .run(&inventory.devices, "hostname {{ name }}", &inventory.vars, 5)
///     .await?;
/// println!("{}", report.render_human());
/// # Ok(())
/// # }
/// ```
pub struct Orchestrator<C, R, B> {
    connector: Arc<C>,
    renderer: Arc<R>,
    store: Arc<B>,
    policy: Policy,
}

type Queue = Arc<Mutex<VecDeque<(usize, DeviceDescriptor)>>>;

impl<C, R, B> Orchestrator<C, R, B>
where
    C: Connector,
    R: Renderer,
    B: BackupStore,
{
    pub fn new(connector: C, renderer: R, store: B) -> Self {
        Self {
            connector: Arc::new(connector),
            renderer: Arc::new(renderer),
            store: Arc::new(store),
            policy: Policy::default(),
        }
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Shared backup store.
    pub fn store(&self) -> &Arc<B> {
        &self.store
    }

    /// Run `template` against every device with at most `concurrency`
    /// lifecycles in flight.
    pub async fn run(
        &self,
        devices: &[DeviceDescriptor],
        template: &str,
        globals: &Variables,
        concurrency: usize,
    ) -> Result<RunReport, ConfigError> {
        self.run_with_cancel(devices, template, globals, concurrency, CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run), stopping at the next checkpoint of every
    /// lifecycle once `cancel` fires.
    pub async fn run_with_cancel(
        &self,
        devices: &[DeviceDescriptor],
        template: &str,
        globals: &Variables,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Result<RunReport, ConfigError> {
        if concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency(concurrency));
        }

        let started_at = Utc::now();
        if devices.is_empty() {
            return Ok(RunReport::new(
                Vec::new(),
                started_at,
                Utc::now(),
                false,
                self.policy.dry_run,
            ));
        }

        let token = cancel.child_token();
        let deadline = self.policy.deadline.map(|limit| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                warn!("Run deadline of {:?} reached, cancelling", limit);
                token.cancel();
            })
        });

        let machine = DeviceMachine::new(
            Arc::clone(&self.connector),
            Arc::clone(&self.renderer),
            Arc::clone(&self.store),
            self.policy.clone(),
            token.clone(),
        );
        let template: Arc<str> = Arc::from(template);
        let globals = Arc::new(globals.clone());
        let queue: Queue = Arc::new(Mutex::new(devices.iter().cloned().enumerate().collect()));
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, DeviceOutcome)>();

        let workers = concurrency.min(devices.len());
        info!(
            "Running {} devices with {} workers{}",
            devices.len(),
            workers,
            if self.policy.dry_run { " (dry run)" } else { "" }
        );

        let mut pool = JoinSet::new();
        for worker in 0..workers {
            let machine = machine.clone();
            let queue = Arc::clone(&queue);
            let template = Arc::clone(&template);
            let globals = Arc::clone(&globals);
            let tx = tx.clone();

            pool.spawn(async move {
                while let Some((index, device)) = next_device(&queue) {
                    let outcome = run_contained(&machine, &device, &template, &globals).await;
                    if tx.send((index, outcome)).is_err() {
                        break;
                    }
                }
                debug!("worker {} idle", worker);
            });
        }
        drop(tx);

        let mut slots: Vec<Option<DeviceOutcome>> = vec![None; devices.len()];
        while let Some((index, outcome)) = rx.recv().await {
            slots[index] = Some(outcome);
        }
        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                error!("Worker task failed: {}", e);
            }
        }
        if let Some(timer) = deadline {
            timer.abort();
        }

        let outcomes = slots
            .into_iter()
            .zip(devices)
            .map(|(slot, device)| {
                slot.unwrap_or_else(|| {
                    let err = DeviceError::Internal("no outcome recorded".into());
                    DeviceOutcome::failed(device.id(), &device.address, &err)
                })
            })
            .collect();

        let report = RunReport::new(
            outcomes,
            started_at,
            Utc::now(),
            token.is_cancelled(),
            self.policy.dry_run,
        );
        info!(
            "Run finished: {} succeeded, {} unchanged, {} failed, {} skipped",
            report.counts.succeeded,
            report.counts.no_change,
            report.counts.failed,
            report.counts.skipped
        );
        Ok(report)
    }
}

fn next_device(queue: &Queue) -> Option<(usize, DeviceDescriptor)> {
    // A poisoned queue only means another worker panicked mid-pop
    let mut queue = match queue.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    queue.pop_front()
}

/// Run one lifecycle, turning a panic the machine could not contain (one
/// while opening the session) into a failed outcome.
async fn run_contained<C, R, B>(
    machine: &DeviceMachine<C, R, B>,
    device: &DeviceDescriptor,
    template: &str,
    globals: &Variables,
) -> DeviceOutcome
where
    C: Connector,
    R: Renderer,
    B: BackupStore,
{
    match AssertUnwindSafe(machine.run(device, template, globals))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("{}: lifecycle panicked: {}", device.id(), message);
            DeviceOutcome::failed(device.id(), &device.address, &DeviceError::Internal(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_test::assert_ok;

    use super::*;
    use crate::backup::MemoryBackupStore;
    use crate::error::{ErrorKind, TemplateError};
    use crate::outcome::{DeviceState, DeviceStatus, SkipReason};
    use crate::render::{RenderContext, TeraRenderer};
    use crate::session::fake::{FakeConnector, FakeDevice, FakeFleet};

    type FakeOrchestrator = Orchestrator<FakeConnector, TeraRenderer, MemoryBackupStore>;

    fn orchestrator(fleet: &FakeFleet) -> FakeOrchestrator {
        Orchestrator::new(fleet.connector(), TeraRenderer::new(), MemoryBackupStore::new())
    }

    fn device(address: &str) -> DeviceDescriptor {
        DeviceDescriptor::new(address, "cisco_ios", "lab")
    }

    const TEMPLATE: &str = "hostname {{ device_id }}";

    #[tokio::test]
    async fn test_zero_concurrency_is_rejected() {
        let fleet = FakeFleet::new();
        let result = orchestrator(&fleet)
            .run(&[device("10.0.0.1")], TEMPLATE, &Variables::new(), 0)
            .await;
        assert!(matches!(result, Err(ConfigError::InvalidConcurrency(0))));
        assert_eq!(fleet.opens(), 0);
    }

    #[tokio::test]
    async fn test_empty_device_list() {
        let fleet = FakeFleet::new();
        let report = assert_ok!(
            orchestrator(&fleet)
                .run(&[], TEMPLATE, &Variables::new(), 5)
                .await
        );
        assert!(report.outcomes.is_empty());
        assert_eq!(report.counts.total, 0);
        assert_eq!(report.exit_code(), 0);
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn test_outcomes_follow_input_order() {
        let fleet = FakeFleet::new();
        for (address, delay) in [("10.0.0.1", 90), ("10.0.0.2", 45), ("10.0.0.3", 0)] {
            fleet.add(
                address,
                FakeDevice {
                    connect_delay: Duration::from_millis(delay),
                    ..FakeDevice::with_running("hostname old")
                },
            );
        }
        let devices = vec![device("10.0.0.1"), device("10.0.0.2"), device("10.0.0.3")];

        let report = orchestrator(&fleet)
            .run(&devices, TEMPLATE, &Variables::new(), 3)
            .await
            .unwrap();

        let ids: Vec<_> = report.outcomes.iter().map(|o| o.device_id.as_str()).collect();
        assert_eq!(ids, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        assert_eq!(report.counts.succeeded, 3);
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let fleet = FakeFleet::new();
        let devices: Vec<_> = (1..=5).map(|i| device(&format!("10.0.0.{i}"))).collect();
        for d in &devices {
            fleet.add(&d.address, FakeDevice::with_running("hostname old"));
        }
        fleet.add(
            "10.0.0.2",
            FakeDevice {
                fail_fetch: true,
                ..FakeDevice::default()
            },
        );

        let report = orchestrator(&fleet)
            .run(&devices, TEMPLATE, &Variables::new(), 2)
            .await
            .unwrap();

        assert_eq!(report.counts.failed, 1);
        assert_eq!(report.counts.succeeded, 4);
        assert_eq!(report.outcomes[1].error_kind(), Some(ErrorKind::Backup));
        assert_eq!(report.exit_code(), 1);
        assert_eq!(fleet.opens(), 5);
        assert_eq!(fleet.closes(), fleet.opens());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let fleet = FakeFleet::new();
        let devices: Vec<_> = (1..=8).map(|i| device(&format!("10.0.1.{i}"))).collect();
        for d in &devices {
            fleet.add(
                &d.address,
                FakeDevice {
                    command_delay: Duration::from_millis(20),
                    ..FakeDevice::with_running("hostname old")
                },
            );
        }

        let report = orchestrator(&fleet)
            .run(&devices, TEMPLATE, &Variables::new(), 3)
            .await
            .unwrap();

        assert_eq!(report.counts.succeeded, 8);
        assert!(fleet.peak_open() <= 3, "peak {}", fleet.peak_open());
        assert!(fleet.peak_open() >= 2);
        assert_eq!(fleet.closes(), 8);
    }

    #[tokio::test]
    async fn test_duplicate_devices_are_kept() {
        let fleet = FakeFleet::new();
        fleet.add("10.0.0.1", FakeDevice::with_running("hostname 10.0.0.1"));
        let devices = vec![device("10.0.0.1"), device("10.0.0.1")];

        let report = orchestrator(&fleet)
            .run(&devices, TEMPLATE, &Variables::new(), 2)
            .await
            .unwrap();

        assert_eq!(report.outcomes.len(), 2);
        assert!(report.outcomes.iter().all(|o| o.device_id == "10.0.0.1"));
        assert_eq!(report.counts.no_change, 2);
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let fleet = FakeFleet::new();
        fleet.add("10.0.0.1", FakeDevice::with_running("hostname old"));
        fleet.add(
            "10.0.0.2",
            FakeDevice {
                panic_on_open: true,
                ..FakeDevice::default()
            },
        );
        fleet.add("10.0.0.3", FakeDevice::with_running("hostname old"));
        let devices = vec![device("10.0.0.1"), device("10.0.0.2"), device("10.0.0.3")];

        let report = orchestrator(&fleet)
            .run(&devices, TEMPLATE, &Variables::new(), 1)
            .await
            .unwrap();

        assert_eq!(report.outcomes[1].status, DeviceStatus::Failed);
        assert_eq!(report.outcomes[1].error_kind(), Some(ErrorKind::Internal));
        assert!(report.outcomes[1].error.as_ref().unwrap().message.contains("scripted panic"));
        assert_eq!(report.counts.succeeded, 2);
    }

    /// Panics while rendering one device, renders the rest normally.
    struct PanicsFor(&'static str);

    impl Renderer for PanicsFor {
        fn render(&self, template: &str, context: &RenderContext) -> Result<String, TemplateError> {
            if context.get("device_id") == Some(self.0) {
                panic!("render blew up for {}", self.0);
            }
            TeraRenderer::new().render(template, context)
        }
    }

    #[tokio::test]
    async fn test_panic_mid_lifecycle_closes_session() {
        let fleet = FakeFleet::new();
        let devices = vec![device("10.0.0.1"), device("10.0.0.2"), device("10.0.0.3")];
        for d in &devices {
            fleet.add(&d.address, FakeDevice::with_running("hostname old"));
        }
        let orchestrator = Orchestrator::new(
            fleet.connector(),
            PanicsFor("10.0.0.2"),
            MemoryBackupStore::new(),
        );

        let report = orchestrator
            .run(&devices, TEMPLATE, &Variables::new(), 2)
            .await
            .unwrap();

        assert_eq!(report.outcomes[1].error_kind(), Some(ErrorKind::Internal));
        assert_eq!(report.outcomes[1].failed_at, Some(DeviceState::BackedUp));
        assert_eq!(report.counts.succeeded, 2);
        assert_eq!(fleet.opens(), 3);
        assert_eq!(fleet.closes(), fleet.opens());
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_everything() {
        let fleet = FakeFleet::new();
        let devices = vec![device("10.0.0.1"), device("10.0.0.2")];
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = orchestrator(&fleet)
            .run_with_cancel(&devices, TEMPLATE, &Variables::new(), 2, cancel)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.counts.skipped, 2);
        assert!(
            report
                .outcomes
                .iter()
                .all(|o| o.skip_reason == Some(SkipReason::Cancelled))
        );
        assert_eq!(report.exit_code(), 0);
        assert_eq!(fleet.opens(), 0);
    }

    #[tokio::test]
    async fn test_deadline_cancels_at_checkpoint() {
        let fleet = FakeFleet::new();
        let devices: Vec<_> = (1..=3).map(|i| device(&format!("10.0.2.{i}"))).collect();
        for d in &devices {
            fleet.add(
                &d.address,
                FakeDevice {
                    connect_delay: Duration::from_millis(300),
                    ..FakeDevice::with_running("hostname old")
                },
            );
        }
        let orchestrator = orchestrator(&fleet)
            .with_policy(Policy::default().deadline(Duration::from_millis(50)));

        let report = orchestrator
            .run(&devices, TEMPLATE, &Variables::new(), 1)
            .await
            .unwrap();

        assert!(report.cancelled);
        let first = &report.outcomes[0];
        assert_eq!(first.error_kind(), Some(ErrorKind::Cancelled));
        assert_eq!(first.failed_at, Some(DeviceState::Connected));
        assert_eq!(report.outcomes[1].skip_reason, Some(SkipReason::Cancelled));
        assert_eq!(report.outcomes[2].skip_reason, Some(SkipReason::Cancelled));
        // The in-flight session was still released
        assert_eq!(fleet.opens(), 1);
        assert_eq!(fleet.closes(), 1);
        assert!(fleet.batches("10.0.2.1").is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_report() {
        let fleet = FakeFleet::new();
        fleet.add("10.0.0.1", FakeDevice::with_running("hostname old"));
        fleet.add("10.0.0.2", FakeDevice::with_running("hostname 10.0.0.2"));
        let devices = vec![device("10.0.0.1"), device("10.0.0.2")];

        let report = orchestrator(&fleet)
            .with_policy(Policy::default().dry_run(true))
            .run(&devices, TEMPLATE, &Variables::new(), 2)
            .await
            .unwrap();

        assert!(report.dry_run);
        assert_eq!(report.outcomes[0].skip_reason, Some(SkipReason::DryRun));
        assert_eq!(report.outcomes[1].status, DeviceStatus::SucceededNoChange);
        assert!(fleet.batches("10.0.0.1").is_empty());
        assert_eq!(fleet.closes(), 2);
    }
}
