//! SSH sessions over an interactive PTY shell, using russh.
//!
//! Network CLIs are driven the way an operator would drive them: open a
//! shell, wait for the prompt, type a command, read until the prompt comes
//! back. [`SshConnector`] resolves the device's platform and credential,
//! connects, authenticates and disables paging; [`SshSession`] runs
//! commands and configuration batches on the resulting shell.

mod buffer;
mod handler;
pub mod platform;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, trace, warn};
use regex::bytes::Regex;
use russh::client::{self, Handle, Msg};
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key};
use russh::{Channel, ChannelMsg, Disconnect};
use secrecy::ExposeSecret;
use tokio::time::Instant;

pub use buffer::PromptBuffer;
use handler::{HostKeyError, SshHandler};
pub use platform::Platform;

use super::{Connector, DeviceSession};
use crate::error::{BatchError, SessionError};
use crate::inventory::{AuthMethod, Credential, CredentialStore, DeviceDescriptor};

/// Host key verification mode, analogous to OpenSSH's `StrictHostKeyChecking`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HostKeyVerification {
    /// Reject unknown and changed keys.
    Strict,

    /// Learn unknown keys, reject changed ones.
    #[default]
    AcceptNew,

    /// Accept any key. For lab use only.
    Disabled,
}

/// Connection settings shared by every session a connector opens.
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// SSH port (default: 22).
    pub port: u16,

    /// Timeout for connecting and for each command.
    pub timeout: Duration,

    /// Terminal width for the PTY.
    pub terminal_width: u32,

    /// Terminal height for the PTY.
    pub terminal_height: u32,

    /// Host key verification mode.
    pub host_key_verification: HostKeyVerification,

    /// known_hosts file; the user's default file when unset.
    pub known_hosts_path: Option<PathBuf>,

    /// Bytes from the end of the output searched for the prompt.
    pub search_depth: usize,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            port: 22,
            timeout: Duration::from_secs(30),
            terminal_width: 511,
            terminal_height: 24,
            host_key_verification: HostKeyVerification::default(),
            known_hosts_path: None,
            search_depth: 1000,
        }
    }
}

impl SshOptions {
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn host_key_verification(mut self, verification: HostKeyVerification) -> Self {
        self.host_key_verification = verification;
        self
    }

    pub fn known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_path = Some(path.into());
        self
    }
}

/// Opens [`SshSession`]s, resolving credential references from its store.
pub struct SshConnector {
    credentials: CredentialStore,
    options: SshOptions,
}

impl SshConnector {
    pub fn new(credentials: CredentialStore, options: SshOptions) -> Self {
        Self {
            credentials,
            options,
        }
    }

    pub fn options(&self) -> &SshOptions {
        &self.options
    }

    async fn connect(&self, host: &str) -> Result<Handle<SshHandler>, SessionError> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(self.options.timeout),
            ..Default::default()
        });

        let host_key_error: HostKeyError = Arc::new(Mutex::new(None));
        let handler = SshHandler::new(
            host,
            self.options.port,
            self.options.host_key_verification,
            self.options.known_hosts_path.clone(),
            host_key_error.clone(),
        );

        let port = self.options.port;
        tokio::time::timeout(
            self.options.timeout,
            client::connect(config, (host, port), handler),
        )
        .await
        .map_err(|_| SessionError::Timeout(self.options.timeout))?
        .map_err(|e| {
            // Prefer the handler's detailed host key error over UnknownKey
            if let Some(detailed) = host_key_error.lock().ok().and_then(|mut slot| slot.take()) {
                return detailed;
            }
            match e {
                russh::Error::IO(source) => SessionError::ConnectionFailed {
                    host: host.to_string(),
                    port,
                    source,
                },
                other => SessionError::Ssh(other),
            }
        })
    }

    async fn open_shell(&self, handle: &Handle<SshHandler>) -> Result<Channel<Msg>, SessionError> {
        let channel = handle.channel_open_session().await?;
        channel
            .request_pty(
                true,
                "xterm",
                self.options.terminal_width,
                self.options.terminal_height,
                0,
                0,
                &[],
            )
            .await?;
        channel.request_shell(true).await?;
        Ok(channel)
    }
}

async fn authenticate(
    handle: &mut Handle<SshHandler>,
    credential: &Credential,
) -> Result<(), SessionError> {
    let user = credential.username.as_str();
    let success = match &credential.auth {
        AuthMethod::None => handle.authenticate_none(user).await?.success(),
        AuthMethod::Password(password) => handle
            .authenticate_password(user, password.expose_secret())
            .await?
            .success(),
        AuthMethod::PrivateKey { path, passphrase } => {
            let key = load_secret_key(path, passphrase.as_ref().map(|p| p.expose_secret()))
                .map_err(|e| SessionError::Key(e.to_string()))?;

            // Best RSA hash the server supports; ignored for other key types
            let hash_alg = handle.best_supported_rsa_hash().await?.flatten();

            handle
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
                .await?
                .success()
        }
    };

    if !success {
        return Err(SessionError::AuthenticationFailed {
            user: user.to_string(),
        });
    }
    Ok(())
}

impl Connector for SshConnector {
    type Session = SshSession;

    async fn open(&self, device: &DeviceDescriptor) -> Result<SshSession, SessionError> {
        let platform =
            platform::lookup(&device.platform).ok_or_else(|| SessionError::UnknownPlatform {
                name: device.platform.clone(),
            })?;
        let credential =
            self.credentials
                .get(&device.credential)
                .ok_or_else(|| SessionError::UnknownCredential {
                    reference: device.credential.clone(),
                })?;
        let prompt = Regex::new(platform.prompt)?;

        debug!("{}: connecting to port {}", device, self.options.port);
        let mut handle = self.connect(&device.address).await?;
        authenticate(&mut handle, credential).await?;
        let channel = self.open_shell(&handle).await?;

        let mut session = SshSession {
            handle,
            channel,
            platform,
            prompt,
            buffer: PromptBuffer::new(self.options.search_depth),
            timeout: self.options.timeout,
        };

        if let Err(e) = session.prepare().await {
            if let Err(close_err) = session.close().await {
                debug!("{}: close after failed open: {}", device, close_err);
            }
            return Err(e);
        }
        debug!("{}: session ready ({})", device, platform.name);
        Ok(session)
    }
}

/// A PTY shell on one device.
pub struct SshSession {
    handle: Handle<SshHandler>,
    channel: Channel<Msg>,
    platform: &'static Platform,
    prompt: Regex,
    buffer: PromptBuffer,
    timeout: Duration,
}

impl SshSession {
    /// The platform this session speaks.
    pub fn platform(&self) -> &'static Platform {
        self.platform
    }

    /// Wait for the login prompt and disable paging.
    async fn prepare(&mut self) -> Result<(), SessionError> {
        self.read_until_prompt().await?;
        for command in self.platform.on_open {
            self.execute(command).await?;
        }
        Ok(())
    }

    async fn read_until_prompt(&mut self) -> Result<String, SessionError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(end) = self.buffer.find_prompt(&self.prompt) {
                let raw = self.buffer.split_through(end);
                return Ok(String::from_utf8_lossy(&raw).into_owned());
            }

            match tokio::time::timeout_at(deadline, self.channel.wait()).await {
                Err(_) => return Err(SessionError::Timeout(self.timeout)),
                Ok(Some(ChannelMsg::Data { data })) => self.buffer.extend(&data),
                Ok(Some(ChannelMsg::ExtendedData { data, .. })) => self.buffer.extend(&data),
                Ok(Some(ChannelMsg::Eof | ChannelMsg::Close)) | Ok(None) => {
                    return Err(SessionError::Closed);
                }
                Ok(Some(other)) => trace!("ignoring channel message {:?}", other),
            }
        }
    }

    /// Best-effort discard of a partially applied batch.
    async fn abort_config(&mut self) {
        for command in self.platform.config_abort {
            if let Err(e) = self.execute(command).await {
                warn!("Failed to abort configuration with '{}': {}", command, e);
                return;
            }
        }
    }
}

/// Strip the command echo and the trailing prompt line.
fn normalize_output(raw: &str, command: &str) -> String {
    let text = raw.replace('\r', "");
    let output = text
        .strip_prefix(command)
        .unwrap_or(&text)
        .trim_start_matches('\n');

    match output.rfind('\n') {
        Some(pos) => output[..pos].to_string(),
        None => String::new(),
    }
}

/// The output line carrying the first failure marker, if any.
fn detect_failure(output: &str, markers: &[&str]) -> Option<String> {
    output
        .lines()
        .find(|line| markers.iter().any(|m| line.contains(m)))
        .map(|line| line.trim().to_string())
}

impl DeviceSession for SshSession {
    async fn execute(&mut self, command: &str) -> Result<String, SessionError> {
        trace!("send: {}", command);
        self.channel
            .data(format!("{command}\n").as_bytes())
            .await
            .map_err(|_| SessionError::Closed)?;

        let raw = self.read_until_prompt().await?;
        let output = normalize_output(&raw, command);

        if let Some(message) = detect_failure(&output, self.platform.failure_markers) {
            return Err(SessionError::CommandRejected {
                command: command.to_string(),
                message,
            });
        }
        Ok(output)
    }

    async fn execute_batch(&mut self, commands: &[String]) -> Result<Vec<String>, BatchError> {
        let enter = self.platform.config_enter;
        self.execute(enter)
            .await
            .map_err(|source| BatchError::Prepare {
                command: enter.to_string(),
                source,
            })?;

        let mut outputs = Vec::with_capacity(commands.len());
        for (index, command) in commands.iter().enumerate() {
            match self.execute(command).await {
                Ok(output) => outputs.push(output),
                Err(source) => {
                    if !matches!(source, SessionError::Closed | SessionError::Timeout(_)) {
                        self.abort_config().await;
                    }
                    return Err(BatchError::Rejected {
                        index,
                        command: command.clone(),
                        source,
                    });
                }
            }
        }

        for command in self.platform.config_exit {
            self.execute(command)
                .await
                .map_err(|source| BatchError::Finish {
                    command: command.to_string(),
                    source,
                })?;
        }
        Ok(outputs)
    }

    async fn running_config(&mut self) -> Result<String, SessionError> {
        let show = self.platform.show_config;
        self.execute(show).await
    }

    async fn close(self) -> Result<(), SessionError> {
        // The shell may already be gone; the disconnect below is what matters
        let _ = self.channel.eof().await;
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}
