//! Configuration loading for the StageLink gateway
//!
//! Each setting resolves by priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`STAGELINK_*`)
//! 3. TOML config file
//! 4. Compiled default (fallback)

use crate::{Error, Result};
use std::path::PathBuf;

/// Environment variable names
pub const ENV_BIND: &str = "STAGELINK_BIND";
pub const ENV_DATABASE: &str = "STAGELINK_DB";
pub const ENV_AUTO_CREATE_ROOMS: &str = "STAGELINK_AUTO_CREATE_ROOMS";

/// Resolved gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_host: String,
    pub bind_port: u16,
    pub database_path: PathBuf,
    /// Join policy: create a placeholder room when a client connects with an
    /// unknown room key, instead of rejecting the connection.
    pub auto_create_rooms: bool,
    /// Server-initiated heartbeat interval
    pub ping_interval_secs: u64,
    /// Connections with no inbound frame for this long are closed
    pub pong_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            bind_port: 5000,
            database_path: default_database_path(),
            auto_create_rooms: false,
            // Matches the heartbeat window the deployed transport used
            ping_interval_secs: 25,
            pong_timeout_secs: 60,
        }
    }
}

impl GatewayConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.bind_port)
    }
}

/// Command-line overrides passed down from the binary's clap layer
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    /// `host:port` bind address
    pub bind: Option<String>,
    pub database: Option<PathBuf>,
    pub auto_create_rooms: Option<bool>,
}

/// Resolve the gateway configuration using the 4-tier priority order
pub fn load_config(overrides: &ConfigOverrides) -> Result<GatewayConfig> {
    let mut config = GatewayConfig::default();

    // Priority 3: TOML config file (applied first, then shadowed)
    if let Some(path) = find_config_file() {
        let content = std::fs::read_to_string(&path)?;
        let value: toml::Value = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        apply_toml(&mut config, &value)?;
    }

    // Priority 2: environment variables
    if let Ok(bind) = std::env::var(ENV_BIND) {
        apply_bind(&mut config, &bind)?;
    }
    if let Ok(db) = std::env::var(ENV_DATABASE) {
        config.database_path = PathBuf::from(db);
    }
    if let Ok(auto) = std::env::var(ENV_AUTO_CREATE_ROOMS) {
        config.auto_create_rooms = matches!(auto.as_str(), "1" | "true" | "yes");
    }

    // Priority 1: command-line arguments
    if let Some(bind) = &overrides.bind {
        apply_bind(&mut config, bind)?;
    }
    if let Some(db) = &overrides.database {
        config.database_path = db.clone();
    }
    if let Some(auto) = overrides.auto_create_rooms {
        config.auto_create_rooms = auto;
    }

    if config.pong_timeout_secs <= config.ping_interval_secs {
        return Err(Error::Config(
            "pong_timeout_secs must exceed ping_interval_secs".to_string(),
        ));
    }

    Ok(config)
}

fn apply_bind(config: &mut GatewayConfig, bind: &str) -> Result<()> {
    let (host, port) = bind
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(format!("Invalid bind address: {}", bind)))?;
    config.bind_host = host.to_string();
    config.bind_port = port
        .parse()
        .map_err(|_| Error::Config(format!("Invalid bind port: {}", port)))?;
    Ok(())
}

fn apply_toml(config: &mut GatewayConfig, value: &toml::Value) -> Result<()> {
    if let Some(bind) = value.get("bind").and_then(|v| v.as_str()) {
        apply_bind(config, bind)?;
    }
    if let Some(db) = value.get("database").and_then(|v| v.as_str()) {
        config.database_path = PathBuf::from(db);
    }
    if let Some(auto) = value.get("auto_create_rooms").and_then(|v| v.as_bool()) {
        config.auto_create_rooms = auto;
    }
    if let Some(secs) = value.get("ping_interval_secs").and_then(|v| v.as_integer()) {
        config.ping_interval_secs = parse_secs("ping_interval_secs", secs)?;
    }
    if let Some(secs) = value.get("pong_timeout_secs").and_then(|v| v.as_integer()) {
        config.pong_timeout_secs = parse_secs("pong_timeout_secs", secs)?;
    }
    Ok(())
}

fn parse_secs(key: &str, secs: i64) -> Result<u64> {
    u64::try_from(secs).map_err(|_| Error::Config(format!("{} must not be negative: {}", key, secs)))
}

/// Locate the config file: ~/.config/stagelink/config.toml first, then
/// /etc/stagelink/config.toml on unix platforms.
fn find_config_file() -> Option<PathBuf> {
    if let Some(path) = dirs::config_dir().map(|d| d.join("stagelink").join("config.toml")) {
        if path.exists() {
            return Some(path);
        }
    }
    if cfg!(unix) {
        let system_config = PathBuf::from("/etc/stagelink/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }
    None
}

/// Default database location: platform data dir, `./stagelink_data` otherwise
fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("stagelink"))
        .unwrap_or_else(|| PathBuf::from("./stagelink_data"))
        .join("stagelink.db")
}
