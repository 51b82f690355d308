//! YAML configuration loading and validation.
//!
//! Every key has a stated default except `controller.base_url`,
//! `servers.<name>.crafty_server_id` and `servers.<name>.listen_port`. The
//! API token is deliberately absent from this file: it comes from the
//! `CRAFTY_API_TOKEN` environment variable only.

use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

pub const TOKEN_ENV: &str = "CRAFTY_API_TOKEN";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    pub controller: ControllerConfig,
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ControllerConfig {
    /// Base URL of the Crafty API, e.g. `https://localhost:8443`.
    pub base_url: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Crafty ships a self-signed certificate by default.
    #[serde(default = "default_true")]
    pub verify_tls: bool,
}

impl ControllerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    #[default]
    Java,
    Bedrock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WakePolicy {
    Always,
    #[default]
    Repeated,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct BedrockConfig {
    #[serde(default)]
    pub wake_on_ping: WakePolicy,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerConfig {
    /// The controller's opaque server id. Crafty emits both integer and
    /// UUID ids depending on version, so numbers are accepted too.
    #[serde(deserialize_with = "de_server_id")]
    pub crafty_server_id: String,
    #[serde(default)]
    pub kind: ServerKind,
    pub listen_port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    #[serde(default = "default_idle_timeout_minutes")]
    pub idle_timeout_minutes: u64,
    #[serde(default = "default_start_timeout_seconds")]
    pub start_timeout_seconds: u64,
    #[serde(default = "default_stop_timeout_seconds")]
    pub stop_timeout_seconds: u64,
    #[serde(default = "default_stop_cooldown_seconds")]
    pub stop_cooldown_seconds: u64,
    #[serde(default = "default_start_grace_seconds")]
    pub start_grace_seconds: u64,
    #[serde(default = "default_flap_threshold")]
    pub flap_threshold: u32,
    #[serde(default = "default_flap_window_seconds")]
    pub flap_window_seconds: u64,
    #[serde(default = "default_motd")]
    pub motd: String,
    #[serde(default = "default_version_name")]
    pub version_name: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: i32,
    #[serde(default = "default_max_players")]
    pub max_players: u32,
    #[serde(default = "default_kick_message")]
    pub starting_kick_message: String,
    #[serde(default)]
    pub bedrock: BedrockConfig,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.listen_port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_minutes * 60)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_seconds)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_seconds)
    }

    pub fn stop_cooldown(&self) -> Duration {
        Duration::from_secs(self.stop_cooldown_seconds)
    }

    pub fn start_grace(&self) -> Duration {
        Duration::from_secs(self.start_grace_seconds)
    }

    pub fn flap_window(&self) -> Duration {
        Duration::from_secs(self.flap_window_seconds)
    }

    /// True when a change requires tearing down and recreating the
    /// interposer; display-only changes flow through the watch channel.
    pub fn needs_rebind(&self, other: &Self) -> bool {
        self.kind != other.kind
            || self.listen_port != other.listen_port
            || self.bind_address != other.bind_address
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_port")]
    pub listen_port: u16,
    #[serde(default = "default_health_bind")]
    pub bind_address: IpAddr,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            listen_port: default_health_port(),
            bind_address: default_health_bind(),
        }
    }
}

impl HealthConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.listen_port)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct WebhookConfig {
    /// Absent URL disables webhook emission entirely.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_webhook_label")]
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_directory")]
    pub directory: String,
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` overrides it.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
            filter: default_log_filter(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_poll_interval() -> u64 {
    15
}
fn default_request_timeout() -> u64 {
    10
}
fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_idle_timeout_minutes() -> u64 {
    10
}
fn default_start_timeout_seconds() -> u64 {
    180
}
fn default_stop_timeout_seconds() -> u64 {
    120
}
fn default_stop_cooldown_seconds() -> u64 {
    60
}
fn default_start_grace_seconds() -> u64 {
    120
}
fn default_flap_threshold() -> u32 {
    3
}
fn default_flap_window_seconds() -> u64 {
    3600
}
fn default_motd() -> String {
    "§7⏳ Server is hibernating. Connect to wake it up!".to_string()
}
fn default_version_name() -> String {
    "Hibernating".to_string()
}
fn default_protocol_version() -> i32 {
    // -1 shows the entry as "incompatible" in the server list while still
    // displaying the MOTD.
    -1
}
fn default_max_players() -> u32 {
    20
}
fn default_kick_message() -> String {
    "§eServer is starting up!\n§7Please reconnect in a minute.".to_string()
}
fn default_health_port() -> u16 {
    8095
}
fn default_health_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}
fn default_webhook_label() -> String {
    "craftwatch".to_string()
}
fn default_log_directory() -> String {
    "logs".to_string()
}
fn default_log_filter() -> String {
    "info".to_string()
}

fn de_server_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdRepr {
        Text(String),
        Number(i64),
    }

    match IdRepr::deserialize(deserializer)? {
        IdRepr::Text(s) if !s.trim().is_empty() => Ok(s),
        IdRepr::Text(_) => Err(serde::de::Error::custom("crafty_server_id is empty")),
        IdRepr::Number(n) => Ok(n.to_string()),
    }
}

/// Load and validate a config file.
pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&raw)
        .with_context(|| format!("parse config file {}", path.display()))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> anyhow::Result<()> {
    if !config.controller.base_url.starts_with("http://")
        && !config.controller.base_url.starts_with("https://")
    {
        anyhow::bail!(
            "controller.base_url must start with http:// or https://, got '{}'",
            config.controller.base_url
        );
    }
    if config.servers.is_empty() {
        anyhow::bail!("no servers configured; nothing to watch");
    }

    // TCP and UDP namespaces are independent, so a Java and a Bedrock server
    // may share a port number.
    let mut seen: HashSet<(ServerKind, IpAddr, u16)> = HashSet::new();
    for (name, server) in &config.servers {
        if server.listen_port == 0 {
            anyhow::bail!("server '{name}': listen_port must be non-zero");
        }
        if server.flap_threshold == 0 {
            anyhow::bail!("server '{name}': flap_threshold must be at least 1");
        }
        if !seen.insert((server.kind, server.bind_address, server.listen_port)) {
            anyhow::bail!(
                "server '{name}': {}:{} is already claimed by another server of the same kind",
                server.bind_address,
                server.listen_port
            );
        }
    }

    let mut ids = HashSet::new();
    for (name, server) in &config.servers {
        if !ids.insert(server.crafty_server_id.as_str()) {
            anyhow::bail!(
                "server '{name}': crafty_server_id '{}' is used twice",
                server.crafty_server_id
            );
        }
    }

    Ok(())
}

/// Read the controller bearer token from the environment.
pub fn api_token() -> anyhow::Result<String> {
    let token = std::env::var(TOKEN_ENV)
        .with_context(|| format!("environment variable {TOKEN_ENV} is not set"))?;
    if token.trim().is_empty() {
        anyhow::bail!("environment variable {TOKEN_ENV} is empty");
    }
    Ok(token)
}
