//! russh client handler with known_hosts checking.
//!
//! Many devices may be opened at once, so learning new keys (accept-new) is
//! serialized through a process-wide lock and re-checked under it: two
//! workers reaching the same unknown host append its key only once.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use russh::client;
use russh::keys::PublicKey;

use super::HostKeyVerification;
use crate::error::SessionError;

/// Slot where the handler leaves a detailed host key error for `open`,
/// which otherwise only sees russh's generic `UnknownKey`.
pub(super) type HostKeyError = Arc<Mutex<Option<SessionError>>>;

static KNOWN_HOSTS_WRITE: Mutex<()> = Mutex::new(());

/// What known_hosts says about a presented key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KnownHost {
    Match,
    Unknown,
    Changed { line: usize },
}

#[derive(Debug)]
enum Decision {
    Accept,
    Learn,
    Reject(SessionError),
}

fn decide(mode: HostKeyVerification, known: KnownHost, host: &str, port: u16) -> Decision {
    match (mode, known) {
        (HostKeyVerification::Disabled, _) | (_, KnownHost::Match) => Decision::Accept,
        (_, KnownHost::Changed { line }) => Decision::Reject(SessionError::HostKeyChanged {
            host: host.to_string(),
            port,
            line,
        }),
        (HostKeyVerification::AcceptNew, KnownHost::Unknown) => Decision::Learn,
        (HostKeyVerification::Strict, KnownHost::Unknown) => {
            Decision::Reject(SessionError::HostKeyUnknown {
                host: host.to_string(),
                port,
            })
        }
    }
}

pub struct SshHandler {
    host: String,
    port: u16,
    verification: HostKeyVerification,
    known_hosts_path: Option<PathBuf>,
    host_key_error: HostKeyError,
}

impl SshHandler {
    pub(super) fn new(
        host: &str,
        port: u16,
        verification: HostKeyVerification,
        known_hosts_path: Option<PathBuf>,
        host_key_error: HostKeyError,
    ) -> Self {
        Self {
            host: host.to_string(),
            port,
            verification,
            known_hosts_path,
            host_key_error,
        }
    }

    fn lookup(&self, key: &PublicKey) -> Result<KnownHost, SessionError> {
        let checked = match &self.known_hosts_path {
            Some(path) => russh::keys::check_known_hosts_path(&self.host, self.port, key, path),
            None => russh::keys::check_known_hosts(&self.host, self.port, key),
        };
        match checked {
            Ok(true) => Ok(KnownHost::Match),
            Ok(false) => Ok(KnownHost::Unknown),
            Err(russh::keys::Error::KeyChanged { line }) => Ok(KnownHost::Changed { line }),
            Err(e) => Err(SessionError::KnownHosts(e.to_string())),
        }
    }

    /// Append `key` unless another session learned it first.
    fn learn(&self, key: &PublicKey) -> Result<(), SessionError> {
        let _guard = KNOWN_HOSTS_WRITE
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if self.lookup(key)? != KnownHost::Unknown {
            return Ok(());
        }
        debug!("{}:{}: learning host key", self.host, self.port);
        let learned = match &self.known_hosts_path {
            Some(path) => {
                russh::keys::known_hosts::learn_known_hosts_path(&self.host, self.port, key, path)
            }
            None => russh::keys::known_hosts::learn_known_hosts(&self.host, self.port, key),
        };
        learned.map_err(|e| SessionError::KnownHosts(e.to_string()))
    }

    fn reject(&self, error: SessionError) -> bool {
        if let Ok(mut slot) = self.host_key_error.lock() {
            *slot = Some(error);
        }
        false
    }
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let known = if self.verification == HostKeyVerification::Disabled {
            KnownHost::Match
        } else {
            match self.lookup(server_public_key) {
                Ok(known) => known,
                Err(e) => return Ok(self.reject(e)),
            }
        };

        Ok(match decide(self.verification, known, &self.host, self.port) {
            Decision::Accept => true,
            Decision::Learn => {
                // Saving is best effort
                if let Err(e) = self.learn(server_public_key) {
                    warn!("{}: host key not saved: {}", self.host, e);
                }
                true
            }
            Decision::Reject(e) => self.reject(e),
        })
    }
}
