use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};
use fleetconf::HostKeyVerification;

#[derive(Parser, Debug)]
#[command(name = "fleetconf")]
#[command(version)]
#[command(about = "Render a configuration template and push it to many network devices", long_about = None)]
pub struct Cli {
    /// Device inventory (.json, .toml, .yaml or .yml)
    #[arg(
        short,
        long,
        env = "FLEETCONF_DEVICES",
        required_unless_present = "discover",
        requires = "template"
    )]
    pub devices: Option<PathBuf>,

    /// Configuration template (Tera syntax)
    #[arg(
        short,
        long,
        env = "FLEETCONF_TEMPLATE",
        required_unless_present = "discover",
        requires = "devices"
    )]
    pub template: Option<PathBuf>,

    /// Directory for configuration backups
    #[arg(short, long, env = "FLEETCONF_BACKUP_DIR", default_value = "backups")]
    pub backup_dir: PathBuf,

    /// Maximum devices configured at the same time
    #[arg(short, long, env = "FLEETCONF_CONCURRENCY", default_value_t = 5)]
    pub concurrency: usize,

    /// Show the changes without applying them
    #[arg(long, env = "FLEETCONF_DRY_RUN")]
    pub dry_run: bool,

    /// Probe an IPv4 subnet (CIDR) for SSH hosts and print them
    #[arg(long, env = "FLEETCONF_DISCOVER", value_name = "SUBNET")]
    pub discover: Option<String>,

    /// Do not store backups of the running configuration
    #[arg(long, env = "FLEETCONF_NO_BACKUP")]
    pub no_backup: bool,

    /// Re-read the running configuration after applying and compare
    #[arg(long, env = "FLEETCONF_VERIFY")]
    pub verify: bool,

    /// Per-operation session timeout in seconds
    #[arg(long, env = "FLEETCONF_TIMEOUT", default_value_t = 30, value_name = "SECS")]
    pub timeout: u64,

    /// Cancel the whole run after this many seconds
    #[arg(long, env = "FLEETCONF_DEADLINE", value_name = "SECS")]
    pub deadline: Option<u64>,

    /// Report format
    #[arg(long, value_enum, env = "FLEETCONF_FORMAT", default_value_t = OutputFormat::Human)]
    pub format: OutputFormat,

    /// SSH port
    #[arg(long, env = "FLEETCONF_PORT", default_value_t = 22)]
    pub port: u16,

    /// Host key policy
    #[arg(long, value_enum, env = "FLEETCONF_HOST_KEY_CHECKING", default_value_t = HostKeyChecking::AcceptNew)]
    pub host_key_checking: HostKeyChecking,

    /// known_hosts file (defaults to the user's)
    #[arg(long, env = "FLEETCONF_KNOWN_HOSTS")]
    pub known_hosts: Option<PathBuf>,

    /// Verbosity level
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostKeyChecking {
    Strict,
    AcceptNew,
    Off,
}

impl From<HostKeyChecking> for HostKeyVerification {
    fn from(mode: HostKeyChecking) -> Self {
        match mode {
            HostKeyChecking::Strict => Self::Strict,
            HostKeyChecking::AcceptNew => Self::AcceptNew,
            HostKeyChecking::Off => Self::Disabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "fleetconf",
            "-d",
            "devices.toml",
            "-t",
            "base.j2",
            "-c",
            "10",
            "--dry-run",
            "--host-key-checking",
            "off",
            "-vv",
        ])
        .unwrap();
        assert_eq!(cli.devices, Some(PathBuf::from("devices.toml")));
        assert_eq!(cli.concurrency, 10);
        assert!(cli.dry_run);
        assert_eq!(cli.verbose, 2);
        assert_eq!(
            HostKeyVerification::from(cli.host_key_checking),
            HostKeyVerification::Disabled
        );
        assert_eq!(cli.format, OutputFormat::Human);
        assert_eq!(cli.backup_dir, PathBuf::from("backups"));
    }

    #[test]
    fn test_discover_alone() {
        let cli = Cli::try_parse_from(["fleetconf", "--discover", "10.0.0.0/24"]).unwrap();
        assert_eq!(cli.discover.as_deref(), Some("10.0.0.0/24"));
        assert!(cli.devices.is_none());
    }

    #[test]
    fn test_devices_require_template() {
        assert!(Cli::try_parse_from(["fleetconf", "-d", "devices.toml"]).is_err());
        assert!(Cli::try_parse_from(["fleetconf"]).is_err());
    }
}
