mod cli;

use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use fleetconf::discovery::{self, DiscoveryOptions};
use fleetconf::error::ConfigError;
use fleetconf::{
    FileBackupStore, Inventory, Orchestrator, Policy, SshConnector, SshOptions, TeraRenderer,
};
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::cli::{Cli, OutputFormat};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .parse_default_env()
        .format_timestamp_millis()
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> fleetconf::Result<ExitCode> {
    if let Some(subnet) = &cli.discover {
        let options = DiscoveryOptions {
            port: cli.port,
            ..DiscoveryOptions::default()
        };
        for host in discovery::discover(subnet, &options).await? {
            println!("{host}");
        }
    }

    let (Some(devices_path), Some(template_path)) = (&cli.devices, &cli.template) else {
        return Ok(ExitCode::SUCCESS);
    };

    let inventory = Inventory::load(devices_path)?;
    let template = read_template(template_path).await?;
    let renderer = TeraRenderer::new();
    if let Err(e) = renderer.validate(&template) {
        warn!("{}: {}", template_path.display(), e);
    }
    info!(
        "Loaded {} devices and {} credentials from {}",
        inventory.devices.len(),
        inventory.credentials.len(),
        devices_path.display()
    );

    let mut policy = Policy::default()
        .backup(!cli.no_backup)
        .verify(cli.verify)
        .dry_run(cli.dry_run);
    if let Some(secs) = cli.deadline {
        policy = policy.deadline(Duration::from_secs(secs));
    }

    let mut options = SshOptions::default()
        .port(cli.port)
        .timeout(Duration::from_secs(cli.timeout))
        .host_key_verification(cli.host_key_checking.into());
    if let Some(path) = &cli.known_hosts {
        options = options.known_hosts(path);
    }

    let orchestrator = Orchestrator::new(
        SshConnector::new(inventory.credentials, options),
        renderer,
        FileBackupStore::new(&cli.backup_dir),
    )
    .with_policy(policy);

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping after in-flight devices reach a checkpoint");
                cancel.cancel();
            }
        })
    };

    let report = orchestrator
        .run_with_cancel(
            &inventory.devices,
            &template,
            &inventory.vars,
            cli.concurrency,
            cancel,
        )
        .await?;
    interrupt.abort();

    match cli.format {
        OutputFormat::Human => print!("{}", report.render_human()),
        OutputFormat::Json => println!("{}", report.to_json()?),
    }

    Ok(ExitCode::from(report.exit_code()))
}

async fn read_template(path: &Path) -> Result<String, ConfigError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::TemplateRead {
            path: path.to_path_buf(),
            source,
        })
}
