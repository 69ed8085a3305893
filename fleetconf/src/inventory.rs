//! Device inventory: descriptors, credentials and global template variables.
//!
//! Inventories are JSON, TOML or YAML documents, selected by file extension:
//!
//! ```toml
//! [vars]
//! ntp_server = "10.0.0.254"
//!
//! [credentials.lab]
//! username = "admin"
//! password_env = "LAB_PASSWORD"
//!
//! [[devices]]
//! address = "10.0.0.1"
//! platform = "cisco_ios"
//! credential = "lab"
//! name = "r1"
//! ```
//!
//! A device may carry its login inline (`username` plus `password`,
//! `password_env` or `private_key`) instead of naming a credential, as in a
//! plain YAML device list:
//!
//! ```yaml
//! - hostname: 10.0.0.1
//!   username: admin
//!   password: cisco
//!   device_type: ios
//!   name: r1
//! ```
//!
//! Every other key of a device record becomes a per-device template
//! variable. Login fields never do.

use std::fmt;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::Value;

use crate::error::InventoryError;

/// Ordered template variables.
pub type Variables = IndexMap<String, String>;

/// One target device.
///
/// Immutable once loaded; the orchestrator only ever reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Hostname or IP address used to open the session.
    pub address: String,

    /// Identifier used in reports and backup names (defaults to `address`).
    pub id: Option<String>,

    /// Platform tag (e.g. "cisco_ios", "juniper_junos").
    pub platform: String,

    /// Name of the credential used to authenticate.
    pub credential: String,

    /// Per-device template variables.
    pub vars: Variables,
}

impl DeviceDescriptor {
    /// Create a descriptor with no per-device variables.
    pub fn new(
        address: impl Into<String>,
        platform: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            id: None,
            platform: platform.into(),
            credential: credential.into(),
            vars: Variables::new(),
        }
    }

    /// Set an explicit identifier.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Add a per-device template variable.
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Identifier used in reports and snapshot names.
    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.address)
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id() == self.address {
            write!(f, "{}", self.address)
        } else {
            write!(f, "{} ({})", self.id(), self.address)
        }
    }
}

// =============================================================================
// Credentials
// =============================================================================

/// Authentication method for a device session.
#[derive(Debug)]
pub enum AuthMethod {
    /// No authentication (for lab use only).
    None,

    /// Password authentication.
    Password(SecretString),

    /// Private key authentication.
    PrivateKey {
        /// Path to the private key file.
        path: PathBuf,
        /// Optional passphrase for encrypted keys.
        passphrase: Option<SecretString>,
    },
}

/// A resolved credential.
#[derive(Debug)]
pub struct Credential {
    /// Login user.
    pub username: String,

    /// How to authenticate.
    pub auth: AuthMethod,
}

/// Named credentials referenced by device descriptors.
#[derive(Debug, Default)]
pub struct CredentialStore {
    entries: IndexMap<String, Credential>,
}

impl CredentialStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a credential under `reference`, replacing any previous one.
    pub fn insert(&mut self, reference: impl Into<String>, credential: Credential) {
        self.entries.insert(reference.into(), credential);
    }

    /// Look up a credential by reference.
    pub fn get(&self, reference: &str) -> Option<&Credential> {
        self.entries.get(reference)
    }

    /// Number of credentials.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no credentials.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Inventory
// =============================================================================

/// A loaded inventory.
#[derive(Debug, Default)]
pub struct Inventory {
    /// Global template variables.
    pub vars: Variables,

    /// Named credentials.
    pub credentials: CredentialStore,

    /// Devices in file order.
    pub devices: Vec<DeviceDescriptor>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDocument {
    Full(RawInventory),
    Devices(Vec<RawDevice>),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawInventory {
    #[serde(default)]
    vars: IndexMap<String, Value>,
    #[serde(default)]
    credentials: IndexMap<String, RawCredential>,
    #[serde(default)]
    devices: Vec<RawDevice>,
}

#[derive(Deserialize)]
struct RawDevice {
    #[serde(alias = "hostname", alias = "host")]
    address: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(alias = "device_type")]
    platform: String,
    #[serde(default, alias = "credential_ref")]
    credential: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    password_env: Option<String>,
    #[serde(default)]
    private_key: Option<PathBuf>,
    #[serde(default)]
    passphrase: Option<String>,
    #[serde(flatten)]
    vars: IndexMap<String, Value>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCredential {
    username: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    password_env: Option<String>,
    #[serde(default)]
    private_key: Option<PathBuf>,
    #[serde(default)]
    passphrase: Option<String>,
}

impl Inventory {
    /// Load an inventory from a `.json`, `.toml`, `.yaml` or `.yml` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, InventoryError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| InventoryError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&text).map_err(|e| e.with_path(path)),
            Some("toml") => Self::from_toml_str(&text).map_err(|e| e.with_path(path)),
            Some("yaml" | "yml") => Self::from_yaml_str(&text).map_err(|e| e.with_path(path)),
            _ => Err(InventoryError::UnsupportedFormat {
                path: path.to_path_buf(),
            }),
        }
    }

    /// Parse an inventory from JSON text.
    ///
    /// A bare array of device records is accepted as well.
    pub fn from_json_str(text: &str) -> Result<Self, InventoryError> {
        let doc: RawDocument = serde_json::from_str(text).map_err(|e| InventoryError::Parse {
            path: PathBuf::new(),
            message: e.to_string(),
        })?;
        Self::from_raw(doc)
    }

    /// Parse an inventory from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, InventoryError> {
        let raw: RawInventory = toml::from_str(text).map_err(|e| InventoryError::Parse {
            path: PathBuf::new(),
            message: e.to_string(),
        })?;
        Self::from_raw(RawDocument::Full(raw))
    }

    /// Parse an inventory from YAML text.
    ///
    /// Like JSON, a bare sequence of device records is accepted.
    pub fn from_yaml_str(text: &str) -> Result<Self, InventoryError> {
        let doc: RawDocument = serde_yaml::from_str(text).map_err(|e| InventoryError::Parse {
            path: PathBuf::new(),
            message: e.to_string(),
        })?;
        Self::from_raw(doc)
    }

    fn from_raw(doc: RawDocument) -> Result<Self, InventoryError> {
        let raw = match doc {
            RawDocument::Full(raw) => raw,
            RawDocument::Devices(devices) => RawInventory {
                vars: IndexMap::new(),
                credentials: IndexMap::new(),
                devices,
            },
        };

        let vars = scalar_vars("global vars", raw.vars)?;

        let mut credentials = CredentialStore::new();
        for (reference, cred) in raw.credentials {
            let credential = resolve_credential(&reference, cred)?;
            credentials.insert(reference, credential);
        }

        let mut devices = Vec::with_capacity(raw.devices.len());
        for (index, device) in raw.devices.into_iter().enumerate() {
            let owner = format!("device {}", device.address);
            let credential = match (device.credential, device.username) {
                (Some(reference), None) => reference,
                (None, Some(username)) => {
                    // Inline logins are keyed by address and position
                    let reference = format!("{}#{}", device.address, index);
                    let inline = RawCredential {
                        username,
                        password: device.password,
                        password_env: device.password_env,
                        private_key: device.private_key,
                        passphrase: device.passphrase,
                    };
                    credentials.insert(reference.clone(), resolve_credential(&reference, inline)?);
                    reference
                }
                (Some(_), Some(_)) => {
                    return Err(InventoryError::ConflictingCredential { device: device.address });
                }
                (None, None) => {
                    return Err(InventoryError::MissingCredential { device: device.address });
                }
            };
            devices.push(DeviceDescriptor {
                vars: scalar_vars(&owner, device.vars)?,
                address: device.address,
                id: device.id,
                platform: device.platform,
                credential,
            });
        }

        Ok(Self {
            vars,
            credentials,
            devices,
        })
    }
}

impl InventoryError {
    fn with_path(self, path: &Path) -> Self {
        match self {
            Self::Parse { message, .. } => Self::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        }
    }
}

fn resolve_credential(reference: &str, raw: RawCredential) -> Result<Credential, InventoryError> {
    let password = match (raw.password, raw.password_env) {
        (Some(password), _) => Some(password),
        (None, Some(var)) => Some(std::env::var(&var).map_err(|_| InventoryError::MissingEnv {
            reference: reference.to_string(),
            var,
        })?),
        (None, None) => None,
    };

    let auth = match (raw.private_key, password) {
        (Some(path), _) => AuthMethod::PrivateKey {
            path: expand_home(path),
            passphrase: raw.passphrase.map(SecretString::from),
        },
        (None, Some(password)) => AuthMethod::Password(SecretString::from(password)),
        (None, None) => AuthMethod::None,
    };

    Ok(Credential {
        username: raw.username,
        auth,
    })
}

/// Expand a leading `~/` to the user's home directory.
fn expand_home(path: PathBuf) -> PathBuf {
    if let (Ok(rest), Some(home)) = (path.strip_prefix("~"), std::env::var_os("HOME")) {
        return PathBuf::from(home).join(rest);
    }
    path
}

fn scalar_vars(owner: &str, raw: IndexMap<String, Value>) -> Result<Variables, InventoryError> {
    raw.into_iter()
        .map(|(key, value)| {
            let text = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                Value::Null => String::new(),
                Value::Array(_) | Value::Object(_) => {
                    return Err(InventoryError::InvalidVariable {
                        owner: owner.to_string(),
                        key,
                    });
                }
            };
            Ok((key, text))
        })
        .collect()
}
