//! portkeeper: NAT-PMP port keeper for qBittorrent behind a WireGuard tunnel
//!
//! This is the main entry point. It parses the CLI, loads and validates the
//! configuration, checks required tools and the state directory, then runs
//! the controller on a single-threaded runtime until SIGTERM/SIGINT.
//!
//! Configuration and permission faults abort here, before any lease is
//! requested or firewall rule installed.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use portkeeper::{
    app::QbittorrentClient,
    cli::Cli,
    config::{Config, ConfigError, ConfigLoader, parse_log_level},
    killswitch::{Iptables, KillswitchController, KillswitchPolicy},
    lease::NatPmpGateway,
    service::{self, Collaborators, Controller, ServiceContext, SystemdNotifier},
    state::StateStore,
    telemetry,
    tunnel::SystemTunnelProbe,
};
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, Registry, reload};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Bootstrap filter so config loading can already log; refined below.
    let filter = init_tracing(cli.verbose)?;

    let loader = match &cli.config {
        Some(path) => ConfigLoader::with_path(path.clone()),
        None => ConfigLoader::new(),
    };
    let mut config = loader
        .load()
        .with_context(|| format!("Failed to load configuration from {:?}", loader.path()))?;

    if let Some(level) = &cli.log_level {
        let level = parse_log_level(level).ok_or_else(|| ConfigError::InvalidValue {
            field: "--log-level".to_string(),
            message: format!("unknown level '{}'", level),
        })?;
        config.service.log_level = level.to_string();
    }
    apply_config_level(&filter, cli.verbose, &config.service.log_level)?;

    debug!("Loaded configuration: {:?}", config);

    preflight(&config)?;

    if let Err(e) = telemetry::init_logger() {
        warn!("Audit events will not reach syslog: {}", e);
    }

    let store = StateStore::new(&config.service.state_file);
    store
        .prepare()
        .context("Failed to secure state directory")?;
    let state = store.load();

    let killswitch = if config.killswitch.enabled {
        let policy = KillswitchPolicy::for_user(&config.killswitch.user, &config.wireguard.interface)
            .context("Failed to resolve killswitch user")?;
        let firewall = Iptables::new(Duration::from_secs(config.killswitch.command_timeout));
        Some(KillswitchController::new(firewall, policy))
    } else {
        info!("Killswitch disabled");
        None
    };

    let collaborators = Collaborators {
        probe: SystemTunnelProbe::new(
            config.wireguard.interface.as_str(),
            config.wireguard.health_check_host.as_str(),
            Duration::from_secs(config.wireguard.ping_timeout),
        ),
        gateway: NatPmpGateway::new(
            config.gateway_addr()?,
            Duration::from_secs(config.natpmp.request_timeout),
        ),
        api: QbittorrentClient::new(&config.qbittorrent)
            .context("Failed to build qBittorrent client")?,
        killswitch,
        notifier: notifier_for(&config),
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    let reason = runtime.block_on(async move {
        let (trigger, signal) = service::channel();
        service::listen_for_signals(trigger).context("Failed to install signal handlers")?;

        let context = ServiceContext {
            config,
            store,
            state,
        };
        anyhow::Ok(Controller::new(context, collaborators, signal).run().await)
    })?;

    if !reason.is_clean() {
        anyhow::bail!("portkeeper stopped: {}", reason);
    }
    info!("portkeeper stopped");
    Ok(())
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Initialize the tracing subscriber for diagnostic logging on stderr.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG`, else the configured `service.log_level`
/// - 1 (-v): Debug level
/// - 2+ (-vv): Trace level
fn init_tracing(verbose: u8) -> Result<FilterHandle> {
    use tracing_subscriber::{fmt, prelude::*};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(handle)
}

/// Switch to the configured level unless `-v` or `RUST_LOG` already decided.
fn apply_config_level(handle: &FilterHandle, verbose: u8, level: &str) -> Result<()> {
    if verbose > 0 || std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        return Ok(());
    }
    handle
        .reload(EnvFilter::new(level))
        .context("Failed to apply configured log level")
}

/// Refuse to start without the external tools the service shells out to.
fn preflight(config: &Config) -> Result<(), ConfigError> {
    for tool in config.required_tools() {
        let path = which::which(tool).map_err(|_| ConfigError::MissingTool(tool.to_string()))?;
        debug!("Found {} at {:?}", tool, path);
    }
    Ok(())
}

fn notifier_for(config: &Config) -> SystemdNotifier {
    let notifier = SystemdNotifier::from_env();
    if let Some(timeout) = SystemdNotifier::watchdog_timeout() {
        let longest_wait = config.longest_wait();
        if timeout <= longest_wait {
            warn!(
                "Watchdog timeout {:?} is not longer than the longest wait {:?}; the supervisor may restart a healthy instance",
                timeout, longest_wait
            );
        }
    }
    notifier
}
