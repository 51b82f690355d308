//! Channel payloads shared between the interposers, the signal bridge and
//! the monitor. Interposer → monitor is the only direction; the monitor
//! talks back through interposer method calls and the display watch channel.

use crate::config::ServerConfig;

/// Everything the monitor reacts to outside of its own tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// A player knocked on a hibernating server's port.
    Wake { server_id: String },
    /// SIGHUP: re-read the config file.
    Reload,
    /// SIGTERM / SIGINT: drain and exit.
    Shutdown,
}

/// What an interposer shows to pinging clients. Config supplies the
/// baseline; observed stats (real max players, favicon) refine it over time
/// via the watch channel.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayInfo {
    pub motd: String,
    pub version_name: String,
    pub protocol_version: i32,
    pub max_players: u32,
    pub kick_message: String,
    /// `data:image/png;base64,…` favicon captured from the live server.
    pub favicon: Option<String>,
}

impl DisplayInfo {
    pub fn from_config(cfg: &ServerConfig) -> Self {
        Self {
            motd: cfg.motd.clone(),
            version_name: cfg.version_name.clone(),
            protocol_version: cfg.protocol_version,
            max_players: cfg.max_players,
            kick_message: cfg.starting_kick_message.clone(),
            favicon: None,
        }
    }
}
