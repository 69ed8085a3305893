//! Remote command sessions.
//!
//! The state machine talks to devices only through [`Connector`] and
//! [`DeviceSession`]. [`ssh`] provides the implementation used by the CLI.

pub mod ssh;

#[cfg(test)]
pub(crate) mod fake;

use std::future::Future;

use crate::error::{BatchError, SessionError};
use crate::inventory::DeviceDescriptor;

pub use ssh::{HostKeyVerification, SshConnector, SshOptions, SshSession};

/// Command used to read the running configuration when a session does not
/// provide its own.
pub const DEFAULT_SHOW_CONFIG: &str = "show running-config";

/// Opens sessions to devices.
pub trait Connector: Send + Sync + 'static {
    /// Session type produced by this connector.
    type Session: DeviceSession + 'static;

    /// Open a session to `device`, authenticating with its credential reference.
    fn open(
        &self,
        device: &DeviceDescriptor,
    ) -> impl Future<Output = Result<Self::Session, SessionError>> + Send;
}

/// A live command session to one device.
///
/// A session is owned by exactly one device lifecycle and must be released
/// with [`close`](DeviceSession::close), which consumes it.
pub trait DeviceSession: Send {
    /// Send a command and return its output.
    fn execute(&mut self, command: &str) -> impl Future<Output = Result<String, SessionError>> + Send;

    /// Send commands in order, stopping at the first failure.
    ///
    /// Commands after the failing one are never sent. Implementations that
    /// need a configuration mode enter and leave it around the batch.
    fn execute_batch(
        &mut self,
        commands: &[String],
    ) -> impl Future<Output = Result<Vec<String>, BatchError>> + Send {
        async move {
            let mut outputs = Vec::with_capacity(commands.len());
            for (index, command) in commands.iter().enumerate() {
                let output = self
                    .execute(command)
                    .await
                    .map_err(|source| BatchError::Rejected {
                        index,
                        command: command.clone(),
                        source,
                    })?;
                outputs.push(output);
            }
            Ok(outputs)
        }
    }

    /// Retrieve the device's running configuration.
    fn running_config(&mut self) -> impl Future<Output = Result<String, SessionError>> + Send {
        self.execute(DEFAULT_SHOW_CONFIG)
    }

    /// Release the session.
    fn close(self) -> impl Future<Output = Result<(), SessionError>> + Send;
}
