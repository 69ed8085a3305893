//! # fleetconf
//!
//! Templated configuration rollout for fleets of network devices.
//!
//! For every device in an inventory, fleetconf opens a session, backs up the
//! running configuration, renders a template with the device's variables,
//! diffs the two and applies only when something changed. Devices run
//! concurrently up to a limit; each one ends with exactly one
//! [`DeviceOutcome`], and a [`RunReport`] lists them in inventory order.
//!
//! ## Features
//!
//! - Async SSH sessions via russh with per-platform prompt handling
//! - Timestamped, collision-free configuration backups
//! - Line-level diffs and idempotent applies (no change, no push)
//! - Bounded worker pool with failure and panic isolation per device
//! - Cooperative cancellation (Ctrl-C or run deadline)
//! - Dry runs, post-apply verification and subnet discovery
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fleetconf::{FileBackupStore, Inventory, Orchestrator, SshConnector, SshOptions, TeraRenderer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), fleetconf::Error> {
//!     let inventory = Inventory::load("devices.toml")?;
//!     let orchestrator = Orchestrator::new(
//!         SshConnector::new(inventory.credentials, SshOptions::default()),
//!         TeraRenderer::new(),
//!         FileBackupStore::new("backups"),
//!     );
//!
//!     let report = orchestrator
//!         .run(&inventory.devices, "hostname {{ name }}\n", &inventory.vars, 5)
//!         .await?;
//!     print!("{}", report.render_human());
//!     Ok(())
//! }
//! ```

pub mod backup;
pub mod diff;
pub mod discovery;
pub mod error;
pub mod inventory;
pub mod machine;
pub mod orchestrator;
pub mod outcome;
pub mod render;
pub mod report;
pub mod session;

// Re-export main types for convenience
pub use backup::{BackupStore, FileBackupStore, MemoryBackupStore, SnapshotHandle, SnapshotKind};
pub use diff::{ChangeSet, EditKind, LineEdit, diff};
pub use error::{Error, ErrorKind, Result};
pub use inventory::{AuthMethod, Credential, CredentialStore, DeviceDescriptor, Inventory, Variables};
pub use machine::{DeviceMachine, Policy};
pub use orchestrator::Orchestrator;
pub use outcome::{DeviceOutcome, DeviceState, DeviceStatus, SkipReason};
pub use render::{RenderContext, Renderer, TeraRenderer};
pub use report::{RunCounts, RunReport};
pub use session::{
    Connector, DeviceSession, HostKeyVerification, SshConnector, SshOptions, SshSession,
};
