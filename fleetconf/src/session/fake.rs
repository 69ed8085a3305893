//! Scripted in-memory sessions for tests.
//!
//! A [`FakeFleet`] holds one [`FakeDevice`] per address and records every
//! open, close, command and batch so tests can assert on session hygiene.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Connector, DEFAULT_SHOW_CONFIG, DeviceSession};
use crate::error::{BatchError, SessionError};
use crate::inventory::DeviceDescriptor;

/// Behaviour of one simulated device.
#[derive(Debug, Clone, Default)]
pub struct FakeDevice {
    pub running: String,
    pub refuse_connect: bool,
    pub fail_fetch: bool,
    /// Fail every configuration fetch after this many have succeeded.
    pub fail_fetch_after: Option<usize>,
    /// Fetches served so far.
    pub fetches: usize,
    pub reject_at: Option<usize>,
    /// Accept batches without changing the running configuration.
    pub ignore_apply: bool,
    pub panic_on_open: bool,
    pub connect_delay: Duration,
    /// Time every command takes.
    pub command_delay: Duration,
}

impl FakeDevice {
    pub fn with_running(running: impl Into<String>) -> Self {
        Self {
            running: running.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct FleetState {
    devices: HashMap<String, FakeDevice>,
    opens: usize,
    closes: usize,
    open_now: usize,
    peak_open: usize,
    commands: Vec<(String, String)>,
    batches: Vec<(String, Vec<String>)>,
}

/// Shared view of all simulated devices.
#[derive(Debug, Clone, Default)]
pub struct FakeFleet {
    state: Arc<Mutex<FleetState>>,
}

impl FakeFleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, address: &str, device: FakeDevice) -> &Self {
        self.state
            .lock()
            .unwrap()
            .devices
            .insert(address.to_string(), device);
        self
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            fleet: self.clone(),
        }
    }

    pub fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    /// Highest number of sessions open at the same time.
    pub fn peak_open(&self) -> usize {
        self.state.lock().unwrap().peak_open
    }

    pub fn running(&self, address: &str) -> String {
        self.state.lock().unwrap().devices[address].running.clone()
    }

    /// Batches sent to `address`, each holding only the commands actually sent.
    pub fn batches(&self, address: &str) -> Vec<Vec<String>> {
        self.state
            .lock()
            .unwrap()
            .batches
            .iter()
            .filter(|(a, _)| a == address)
            .map(|(_, b)| b.clone())
            .collect()
    }

    pub fn commands(&self, address: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|(a, _)| a == address)
            .map(|(_, c)| c.clone())
            .collect()
    }
}

pub struct FakeConnector {
    fleet: FakeFleet,
}

impl Connector for FakeConnector {
    type Session = FakeSession;

    async fn open(&self, device: &DeviceDescriptor) -> Result<FakeSession, SessionError> {
        let script = self
            .fleet
            .state
            .lock()
            .unwrap()
            .devices
            .get(&device.address)
            .cloned()
            .unwrap_or_default();

        if !script.connect_delay.is_zero() {
            tokio::time::sleep(script.connect_delay).await;
        }

        if script.panic_on_open {
            panic!("scripted panic opening {}", device.address);
        }

        if script.refuse_connect {
            return Err(SessionError::ConnectionFailed {
                host: device.address.clone(),
                port: 22,
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
            });
        }

        {
            let mut state = self.fleet.state.lock().unwrap();
            state.opens += 1;
            state.open_now += 1;
            state.peak_open = state.peak_open.max(state.open_now);
        }
        Ok(FakeSession {
            address: device.address.clone(),
            fleet: self.fleet.clone(),
        })
    }
}

pub struct FakeSession {
    address: String,
    fleet: FakeFleet,
}

impl DeviceSession for FakeSession {
    async fn execute(&mut self, command: &str) -> Result<String, SessionError> {
        let delay = self
            .fleet
            .state
            .lock()
            .unwrap()
            .devices
            .get(&self.address)
            .map(|d| d.command_delay)
            .unwrap_or_default();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.fleet.state.lock().unwrap();
        state
            .commands
            .push((self.address.clone(), command.to_string()));
        let device = state.devices.entry(self.address.clone()).or_default();

        if command == DEFAULT_SHOW_CONFIG {
            let exhausted = device.fail_fetch_after.is_some_and(|n| device.fetches >= n);
            if device.fail_fetch || exhausted {
                return Err(SessionError::Timeout(Duration::from_secs(1)));
            }
            device.fetches += 1;
            return Ok(device.running.clone());
        }
        Ok(String::new())
    }

    async fn execute_batch(&mut self, commands: &[String]) -> Result<Vec<String>, BatchError> {
        let mut state = self.fleet.state.lock().unwrap();
        let device = state.devices.entry(self.address.clone()).or_default();

        if let Some(index) = device.reject_at.filter(|i| *i < commands.len()) {
            let sent = commands[..=index].to_vec();
            state.batches.push((self.address.clone(), sent));
            return Err(BatchError::Rejected {
                index,
                command: commands[index].clone(),
                source: SessionError::CommandRejected {
                    command: commands[index].clone(),
                    message: "% Invalid input detected at '^' marker.".into(),
                },
            });
        }

        if !device.ignore_apply {
            device.running = commands.join("\n");
        }
        state.batches.push((self.address.clone(), commands.to_vec()));
        Ok(vec![String::new(); commands.len()])
    }

    async fn close(self) -> Result<(), SessionError> {
        let mut state = self.fleet.state.lock().unwrap();
        state.closes += 1;
        state.open_now -= 1;
        Ok(())
    }
}
