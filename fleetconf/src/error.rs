//! Error types for fleetconf.
//!
//! Errors are split by layer. [`SessionError`], [`BatchError`],
//! [`StorageError`] and [`TemplateError`] come from the collaborators a
//! device lifecycle talks to; [`DeviceError`] is what a lifecycle records
//! in its outcome; [`ConfigError`] and [`InventoryError`] are the only
//! errors that stop a run before any device work starts.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Errors that stop a run before any device work.
///
/// Everything that goes wrong on a device is recorded in its outcome
/// instead, as a [`DeviceError`].
#[derive(Error, Debug)]
pub enum Error {
    /// Inventory loading errors
    #[error("Inventory error: {0}")]
    Inventory(#[from] InventoryError),

    /// Caller misuse detected before a run starts
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Report serialization errors
    #[error("Report error: {0}")]
    Report(#[from] serde_json::Error),
}

/// Errors raised by a device session (connection, authentication, command I/O).
#[derive(Error, Debug)]
pub enum SessionError {
    /// Failed to reach the host
    #[error("Connection failed to {host}:{port}: {source}")]
    ConnectionFailed {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// SSH handshake or protocol error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// Authentication failed
    #[error("Authentication failed for user '{user}'")]
    AuthenticationFailed { user: String },

    /// SSH key error
    #[error("SSH key error: {0}")]
    Key(String),

    /// Host key not present in known_hosts (strict mode)
    #[error("Host key for {host}:{port} is not in known_hosts")]
    HostKeyUnknown { host: String, port: u16 },

    /// Host key differs from the one recorded in known_hosts
    #[error("Host key for {host}:{port} changed (known_hosts line {line})")]
    HostKeyChanged { host: String, port: u16, line: usize },

    /// known_hosts could not be read or written
    #[error("known_hosts error: {0}")]
    KnownHosts(String),

    /// The device references a credential that does not exist
    #[error("Unknown credential reference '{reference}'")]
    UnknownCredential { reference: String },

    /// The device's platform tag is not supported
    #[error("Unknown platform '{name}'")]
    UnknownPlatform { name: String },

    /// Invalid prompt pattern in a platform definition
    #[error("Invalid prompt pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// Operation timed out
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Channel closed unexpectedly
    #[error("Session closed by peer")]
    Closed,

    /// The device answered a command with one of its failure markers
    #[error("Device rejected '{command}': {message}")]
    CommandRejected { command: String, message: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failure of a command batch. Commands after the failing one are never sent.
#[derive(Error, Debug)]
pub enum BatchError {
    /// Entering configuration mode failed before any batch command was sent
    #[error("Failed to enter configuration mode with '{command}': {source}")]
    Prepare {
        command: String,
        #[source]
        source: SessionError,
    },

    /// The command at `index` failed or was rejected
    #[error("Command #{index} '{command}' failed: {source}")]
    Rejected {
        index: usize,
        command: String,
        #[source]
        source: SessionError,
    },

    /// Leaving (or committing) configuration mode failed after the batch
    #[error("Failed to leave configuration mode with '{command}': {source}")]
    Finish {
        command: String,
        #[source]
        source: SessionError,
    },
}

impl BatchError {
    /// Index of the first rejected batch command, if the failure was one.
    pub fn failed_index(&self) -> Option<usize> {
        match self {
            Self::Rejected { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Text of the command that failed.
    pub fn command(&self) -> &str {
        match self {
            Self::Prepare { command, .. }
            | Self::Rejected { command, .. }
            | Self::Finish { command, .. } => command,
        }
    }
}

/// Snapshot persistence errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Failed to create the backup directory
    #[error("Failed to create backup directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to write a snapshot
    #[error("Failed to write snapshot {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to read a snapshot back
    #[error("Failed to read snapshot {location}: {source}")]
    Read {
        location: String,
        #[source]
        source: io::Error,
    },

    /// No snapshot exists for the handle
    #[error("Snapshot not found: {location}")]
    NotFound { location: String },
}

/// Template errors.
#[derive(Error, Debug)]
pub enum TemplateError {
    /// The template could not be parsed
    #[error("Template syntax error: {message}")]
    Syntax { message: String },

    /// Rendering failed (missing variable, bad filter argument, ...)
    #[error("Template rendering failed: {message}")]
    Render { message: String },
}

/// Caller misuse, raised before any device work starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Concurrency limit below one
    #[error("Concurrency limit must be at least 1, got {0}")]
    InvalidConcurrency(usize),

    /// Subnet could not be parsed
    #[error("Invalid subnet '{subnet}': {message}")]
    InvalidSubnet { subnet: String, message: String },

    /// A template file could not be read
    #[error("Failed to read template {path}: {source}")]
    TemplateRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Errors loading a device inventory.
#[derive(Error, Debug)]
pub enum InventoryError {
    /// Failed to read the file
    #[error("Failed to read inventory {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file is not valid JSON/TOML/YAML for the inventory schema
    #[error("Failed to parse inventory {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// The file extension selects no known format
    #[error("Unsupported inventory format for {path} (expected .json, .toml, .yaml or .yml)")]
    UnsupportedFormat { path: PathBuf },

    /// A template variable is not a scalar
    #[error("Variable '{key}' of {owner} must be a string, number or boolean")]
    InvalidVariable { owner: String, key: String },

    /// A device names neither a credential nor an inline username
    #[error("Device {device} has no credential or username")]
    MissingCredential { device: String },

    /// A device names a credential and also carries an inline username
    #[error("Device {device} has both a credential reference and an inline username")]
    ConflictingCredential { device: String },

    /// A credential names an environment variable that is not set
    #[error("Credential '{reference}' reads its password from ${var}, which is not set")]
    MissingEnv { reference: String, var: String },
}

// =============================================================================
// Per-device errors
// =============================================================================

/// Failure of one device lifecycle.
///
/// Never escapes the state machine: it is folded into the device's outcome.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The session could not be opened
    #[error("Connection to {address} failed: {source}")]
    Connection {
        address: String,
        #[source]
        source: SessionError,
    },

    /// The running configuration could not be retrieved for backup
    #[error("Failed to retrieve running configuration: {0}")]
    Backup(#[source] SessionError),

    /// The backup snapshot could not be persisted
    #[error("{0}")]
    Storage(#[from] StorageError),

    /// The template could not be rendered for this device
    #[error("{0}")]
    Template(#[from] TemplateError),

    /// The rendered configuration was not accepted by the device
    #[error("{0}")]
    Apply(#[from] BatchError),

    /// The run was cancelled while this device was in flight
    #[error("Run cancelled")]
    Cancelled,

    /// The lifecycle panicked
    #[error("Device task panicked: {0}")]
    Internal(String),
}

impl DeviceError {
    /// Classify the error into the reporting taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Backup(_) => ErrorKind::Backup,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Template(_) => ErrorKind::Template,
            Self::Apply(_) => ErrorKind::Apply,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Error taxonomy surfaced in run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Backup,
    Template,
    Apply,
    Storage,
    Configuration,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Report label for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "ConnectionError",
            Self::Backup => "BackupError",
            Self::Template => "TemplateError",
            Self::Apply => "ApplyError",
            Self::Storage => "StorageError",
            Self::Configuration => "ConfigurationError",
            Self::Cancelled => "Cancelled",
            Self::Internal => "InternalError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type alias using fleetconf's Error.
pub type Result<T> = std::result::Result<T, Error>;
