//! certwarden - local CA certificate manager
//!
//! Serves the certificate API, watches containers for new router hosts and
//! renews certificates before they expire.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use certwarden::discovery::WatchError;
use certwarden::{
    api, CertificateManager, DiscoveryNotifier, DiscoveryWatcher, DockerEventFeed, MqttNotifier,
    RenewalScheduler,
};
use certwarden_config::Config;

/// certwarden - issue and renew local CA certificates for proxied domains
#[derive(Parser, Debug)]
#[command(name = "certwarden")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long = "json-logs", env = "JSON_LOGS", global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the API, the renewal sweep and the container watcher (default)
    Serve,
    /// Run only the container watcher
    Watch,
    /// Issue a certificate unconditionally
    Issue {
        domain: String,
        /// For wildcards, also cover the base domain
        #[arg(long = "include-base")]
        include_base: bool,
    },
    /// Issue if missing, renew if due, otherwise do nothing
    Renew { domain: String },
    /// Remove a stored certificate
    Delete { domain: String },
    /// Print the expiry of every stored certificate
    Expires,
    /// Validate configuration and exit
    CheckConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    let command = cli.command.unwrap_or(Commands::Serve);
    if let Commands::CheckConfig = command {
        return check_config();
    }

    let config = Config::load().context("Failed to load configuration")?;
    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async move {
        match command {
            Commands::Serve => serve(config).await,
            Commands::Watch => watch(config).await,
            Commands::Issue {
                domain,
                include_base,
            } => {
                let manager = start_manager(&config).await?;
                print_json(&manager.issue(&domain, include_base).await?)
            }
            Commands::Renew { domain } => {
                let manager = start_manager(&config).await?;
                print_json(&manager.renew_if_due(&domain).await?.report())
            }
            Commands::Delete { domain } => {
                let manager = start_manager(&config).await?;
                let outcome = manager.delete(&domain).await?;
                print_json(&serde_json::json!({
                    "domain": domain,
                    "deleted": matches!(outcome, certwarden::DeleteOutcome::Removed),
                }))
            }
            Commands::Expires => {
                let manager = start_manager(&config).await?;
                print_json(&manager.expiry_report()?)
            }
            Commands::CheckConfig => check_config(),
        }
    })
}

fn init_tracing(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    // stdout is reserved for command output
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Load configuration and print what would run
fn check_config() -> Result<()> {
    let config = Config::load().context("Configuration validation failed")?;

    info!("Configuration test successful:");
    info!("  - certificate store: {}", config.cert_dir.display());
    info!("  - proxy config: {}", config.proxy_config_path().display());
    info!("  - engine: {}", config.engine);
    info!("  - listen address: {}", config.listen_addr);
    match config.renew_interval() {
        Some(interval) => info!("  - renewal sweep every {}h", interval.as_secs() / 3600),
        None => info!("  - renewal sweep disabled"),
    }
    if config.watcher_enabled() {
        info!("  - container watcher: {:?}", config.docker_endpoint()?);
    }
    if let Some(mqtt) = config.mqtt() {
        info!("  - announcements: {}:{} topic {}", mqtt.host, mqtt.port, mqtt.topic);
    } else if config.mqtt_host.is_some() {
        warn!("MQTT_HOST is set without HOST_IP; announcements disabled");
    }

    println!("certwarden: configuration test is successful");
    Ok(())
}

/// Build the manager and make sure the root CA exists
async fn start_manager(config: &Config) -> Result<Arc<CertificateManager>> {
    let manager = CertificateManager::from_config(config).context("Failed to open certificate store")?;
    manager
        .bootstrap()
        .await
        .context("Failed to initialize root certificate")?;
    Ok(Arc::new(manager))
}

/// Connect the watcher to the configured Docker daemon
async fn start_watcher(
    config: &Config,
    manager: Arc<CertificateManager>,
) -> Result<(DiscoveryWatcher, DockerEventFeed)> {
    let endpoint = config
        .docker_endpoint()?
        .context("DOCKER_HOST is required for the container watcher")?;
    let feed = DockerEventFeed::connect(&endpoint)
        .await
        .context("Failed to subscribe to docker events")?;

    let mut watcher = DiscoveryWatcher::new(manager);
    if let Some(settings) = config.mqtt() {
        info!(broker = %settings.host, topic = %settings.topic, "Domain announcements enabled");
        let notifier: Arc<dyn DiscoveryNotifier> = Arc::new(MqttNotifier::new(settings));
        watcher = watcher.with_notifier(notifier);
    }
    Ok((watcher, feed))
}

async fn watch(config: Config) -> Result<()> {
    let manager = start_manager(&config).await?;
    let (watcher, feed) = start_watcher(&config, manager).await?;

    tokio::select! {
        result = watcher.run(feed) => result.context("Container watcher stopped"),
        _ = shutdown_signal() => Ok(()),
    }
}

async fn serve(config: Config) -> Result<()> {
    let manager = start_manager(&config).await?;

    let scheduler = config.renew_interval().map(|interval| {
        let scheduler = RenewalScheduler::new(Arc::clone(&manager)).with_interval(interval);
        tokio::spawn(scheduler.run())
    });
    if scheduler.is_none() {
        info!("Periodic renewal disabled");
    }

    let watcher: Option<JoinHandle<Result<(), WatchError>>> = if config.watcher_enabled() {
        let (watcher, feed) = start_watcher(&config, Arc::clone(&manager)).await?;
        Some(tokio::spawn(watcher.run(feed)))
    } else {
        info!("Container watcher disabled");
        None
    };

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    let server = api::serve(listener, Arc::clone(&manager), shutdown_signal());

    let result = match watcher {
        Some(watcher) => tokio::select! {
            result = server => result.context("API server error"),
            joined = watcher => match joined {
                Ok(result) => result.context("Container watcher stopped"),
                Err(e) => Err(e).context("Container watcher task failed"),
            },
        },
        None => server.await.context("API server error"),
    };

    if let Some(scheduler) = scheduler {
        scheduler.abort();
    }
    if let Err(e) = &result {
        error!(error = %e, "certwarden stopped");
    } else {
        info!("certwarden stopped");
    }
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Received shutdown signal, initiating graceful shutdown");
}
