//! Certwarden configuration
//!
//! All settings come from the process environment, deserialized with `envy`
//! and checked with `validator`. Everything is optional except `DOCKER_HOST`
//! when the discovery watcher is enabled through `DOCKER_LISTEN`.
//!
//! # Example
//!
//! ```ignore
//! use certwarden_config::Config;
//!
//! let config = Config::load()?;
//! println!("storing certificates in {}", config.cert_dir.display());
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use validator::Validate;

/// Name of the generated proxy certificate list inside the store directory
pub const DEFAULT_PROXY_CONFIG_FILE: &str = "certificates.toml";

/// Minimum interval between scheduled renewal sweeps
pub const MIN_RENEW_INTERVAL: Duration = Duration::from_secs(3600);

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration from environment: {0}")]
    Environment(#[from] envy::Error),

    #[error("invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),

    #[error("DOCKER_LISTEN is set but DOCKER_HOST is missing")]
    MissingDockerHost,

    #[error("unsupported DOCKER_HOST '{0}': expected unix:///path or tcp://host:port")]
    InvalidDockerHost(String),
}

/// Certificate engine selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// External `minica` binary
    #[default]
    Minica,
    /// In-process generator producing the same layout
    Builtin,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::Minica => f.write_str("minica"),
            EngineKind::Builtin => f.write_str("builtin"),
        }
    }
}

/// Where the Docker daemon API is reachable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerEndpoint {
    /// Unix domain socket, e.g. `unix:///var/run/docker.sock`
    Unix(PathBuf),
    /// Plain TCP, e.g. `tcp://10.0.0.2:2375`
    Tcp { host: String, port: u16 },
}

impl DockerEndpoint {
    /// Parse a `DOCKER_HOST` value
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidDockerHost(value.to_string());
        let url = url::Url::parse(value).map_err(|_| invalid())?;

        match url.scheme() {
            "unix" => {
                if url.path().is_empty() {
                    return Err(invalid());
                }
                Ok(DockerEndpoint::Unix(PathBuf::from(url.path())))
            }
            "tcp" | "http" => {
                let host = url.host_str().ok_or_else(invalid)?.to_string();
                let port = url.port().unwrap_or(2375);
                Ok(DockerEndpoint::Tcp { host, port })
            }
            _ => Err(invalid()),
        }
    }
}

/// MQTT settings for domain announcements
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub topic: String,
    /// Address announced alongside each domain
    pub host_ip: String,
}

/// Owner applied to issued certificate files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerIds {
    pub uid: u32,
    pub gid: u32,
}

/// Top-level configuration, one field per environment variable
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Config {
    /// Certificate store root (`CERT_DIR`)
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,

    /// Generated proxy file (`PROXY_CONFIG_FILE`), defaults to a file in the store
    #[serde(default)]
    pub proxy_config_file: Option<PathBuf>,

    /// HTTP bind address (`LISTEN_ADDR`)
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Engine implementation (`ENGINE`)
    #[serde(default)]
    pub engine: EngineKind,

    /// minica executable (`MINICA_BIN`)
    #[serde(default = "default_minica_bin")]
    #[validate(length(min = 1))]
    pub minica_bin: String,

    /// Upper bound for a single engine call (`ENGINE_TIMEOUT_SECS`)
    #[serde(default = "default_engine_timeout_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub engine_timeout_secs: u64,

    /// Leaf validity for the builtin engine (`LEAF_VALIDITY_DAYS`)
    #[serde(default = "default_leaf_validity_days")]
    #[validate(range(min = 1, max = 3650))]
    pub leaf_validity_days: u32,

    /// Hours between renewal sweeps, 0 disables (`RENEW_INTERVAL_HOURS`)
    #[serde(default = "default_renew_interval_hours")]
    pub renew_interval_hours: u64,

    /// Docker daemon address (`DOCKER_HOST`)
    #[serde(default)]
    pub docker_host: Option<String>,

    /// Enables the discovery watcher when truthy (`DOCKER_LISTEN`)
    #[serde(default)]
    pub docker_listen: Option<String>,

    #[serde(default)]
    pub mqtt_host: Option<String>,

    #[serde(default = "default_mqtt_port")]
    #[validate(range(min = 1))]
    pub mqtt_port: u16,

    #[serde(default = "default_mqtt_domains_topic")]
    #[validate(length(min = 1))]
    pub mqtt_domains_topic: String,

    /// Externally reachable address of this host (`HOST_IP`)
    #[serde(default)]
    pub host_ip: Option<String>,

    #[serde(default)]
    pub user_id: Option<u32>,

    #[serde(default)]
    pub group_id: Option<u32>,
}

fn default_cert_dir() -> PathBuf { PathBuf::from("certificates") }
fn default_listen_addr() -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], 8000)) }
fn default_minica_bin() -> String { "minica".to_string() }
fn default_engine_timeout_secs() -> u64 { 60 }
fn default_leaf_validity_days() -> u32 { 760 }
fn default_renew_interval_hours() -> u64 { 12 }
fn default_mqtt_port() -> u16 { 1883 }
fn default_mqtt_domains_topic() -> String { "domains".to_string() }

impl Default for Config {
    fn default() -> Self {
        Self {
            cert_dir: default_cert_dir(),
            proxy_config_file: None,
            listen_addr: default_listen_addr(),
            engine: EngineKind::default(),
            minica_bin: default_minica_bin(),
            engine_timeout_secs: default_engine_timeout_secs(),
            leaf_validity_days: default_leaf_validity_days(),
            renew_interval_hours: default_renew_interval_hours(),
            docker_host: None,
            docker_listen: None,
            mqtt_host: None,
            mqtt_port: default_mqtt_port(),
            mqtt_domains_topic: default_mqtt_domains_topic(),
            host_ip: None,
            user_id: None,
            group_id: None,
        }
    }
}

impl Config {
    /// Load and validate configuration from the process environment
    pub fn load() -> Result<Self, ConfigError> {
        let config: Config = envy::from_env()?;
        config.check()?;
        debug!(?config, "Loaded configuration from environment");
        Ok(config)
    }

    /// Load and validate configuration from explicit key/value pairs
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Config = envy::from_iter(vars)?;
        config.check()?;
        Ok(config)
    }

    /// Run field validation and cross-field checks
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if self.watcher_enabled() {
            match self.docker_host.as_deref() {
                None | Some("") => return Err(ConfigError::MissingDockerHost),
                Some(host) => {
                    DockerEndpoint::parse(host)?;
                }
            }
        }
        Ok(())
    }

    /// Whether `DOCKER_LISTEN` holds a truthy value
    pub fn watcher_enabled(&self) -> bool {
        match self.docker_listen.as_deref().map(str::trim) {
            None => false,
            Some(value) => !matches!(
                value.to_ascii_lowercase().as_str(),
                "" | "0" | "false" | "no" | "off"
            ),
        }
    }

    /// Parsed `DOCKER_HOST`, if set
    pub fn docker_endpoint(&self) -> Result<Option<DockerEndpoint>, ConfigError> {
        self.docker_host
            .as_deref()
            .filter(|host| !host.is_empty())
            .map(DockerEndpoint::parse)
            .transpose()
    }

    /// Path of the generated proxy certificate list
    pub fn proxy_config_path(&self) -> PathBuf {
        self.proxy_config_file
            .clone()
            .unwrap_or_else(|| self.cert_dir.join(DEFAULT_PROXY_CONFIG_FILE))
    }

    /// MQTT announcement settings; present only when both broker and host IP are set
    pub fn mqtt(&self) -> Option<MqttSettings> {
        let host = self.mqtt_host.as_deref().filter(|h| !h.is_empty())?;
        let host_ip = self.host_ip.as_deref().filter(|ip| !ip.is_empty())?;
        Some(MqttSettings {
            host: host.to_string(),
            port: self.mqtt_port,
            topic: self.mqtt_domains_topic.clone(),
            host_ip: host_ip.to_string(),
        })
    }

    /// Owner for issued files; unset ids default to root like the bootstrap utility
    pub fn owner(&self) -> Option<OwnerIds> {
        if self.user_id.is_none() && self.group_id.is_none() {
            return None;
        }
        Some(OwnerIds {
            uid: self.user_id.unwrap_or(0),
            gid: self.group_id.unwrap_or(0),
        })
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }

    /// Renewal sweep interval, clamped to at least an hour; `None` when disabled
    pub fn renew_interval(&self) -> Option<Duration> {
        if self.renew_interval_hours == 0 {
            return None;
        }
        Some(Duration::from_secs(self.renew_interval_hours * 3600).max(MIN_RENEW_INTERVAL))
    }
}
