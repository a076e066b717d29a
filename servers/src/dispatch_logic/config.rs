use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "server_dispatch.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Ambulance Dispatch Server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "DISPATCH_PORT", help = "Port to listen on for HTTP and WebSocket clients.")]
    pub port: Option<u16>,

    #[clap(long, env = "DISPATCH_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "DISPATCH_POLICY_PATH", help = "Path to the JSON5 dispatch policy file.")]
    pub policy_path: Option<PathBuf>,

    #[clap(long, env = "DISPATCH_FLEET_PATH", help = "JSON5 fleet seed for the in-memory store.")]
    pub fleet_path: Option<PathBuf>,

    #[clap(long, env = "DISPATCH_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "DISPATCH_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "DATABASE_URL", help = "PostgreSQL URL. The in-memory store is used when unset.")]
    pub database_url: Option<String>,

    #[clap(long, env = "DISPATCH_DB_MAX_CONNECTIONS", help = "Maximum pooled database connections.")]
    pub db_max_connections: Option<usize>,

    #[clap(long, env = "DISPATCH_CORS_ORIGIN", help = "Allowed CORS origin, or * for any.")]
    pub cors_origin: Option<String>,

    #[clap(long, env = "DISPATCH_SWEEP_INTERVAL_SECS", help = "Seconds between assignment sweeps.")]
    pub sweep_interval_secs: Option<u64>,
}

/// Fully resolved settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub port: u16,
    pub policy_path: Option<PathBuf>,
    pub fleet_path: Option<PathBuf>,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub database_url: Option<String>,
    pub db_max_connections: usize,
    pub cors_origin: String,
    pub sweep_interval_secs: u64,
}

impl Config {
    fn defaults() -> Config {
        Config {
            port: Some(3000),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            db_max_connections: Some(16),
            cors_origin: Some("*".to_string()),
            sweep_interval_secs: Some(15),
            ..Default::default()
        }
    }

    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            policy_path: other.policy_path.or(self.policy_path),
            fleet_path: other.fleet_path.or(self.fleet_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            database_url: other.database_url.or(self.database_url),
            db_max_connections: other.db_max_connections.or(self.db_max_connections),
            cors_origin: other.cors_origin.or(self.cors_origin),
            sweep_interval_secs: other.sweep_interval_secs.or(self.sweep_interval_secs),
        }
    }

    fn resolve(self) -> ServerConfig {
        let fallback = Config::defaults();
        ServerConfig {
            port: self.port.or(fallback.port).unwrap_or(3000),
            policy_path: self.policy_path,
            fleet_path: self.fleet_path,
            log_dir: self.log_dir.or(fallback.log_dir).unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: self.log_level.or(fallback.log_level).unwrap_or_else(|| "info".to_string()),
            database_url: self.database_url.filter(|url| !url.trim().is_empty()),
            db_max_connections: self.db_max_connections.filter(|n| *n > 0).unwrap_or(16),
            cors_origin: self.cors_origin.or(fallback.cors_origin).unwrap_or_else(|| "*".to_string()),
            sweep_interval_secs: self.sweep_interval_secs.filter(|s| *s > 0).unwrap_or(15),
        }
    }
}

fn read_config_file(path: &Path) -> Result<Config> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Layers defaults, then the JSON config file, then environment and CLI values.
pub fn load_config() -> Result<ServerConfig> {
    load_config_from(Config::parse())
}

pub fn load_config_from(cli: Config) -> Result<ServerConfig> {
    let mut current_config = Config::defaults();

    let explicit = cli.config_path.is_some();
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    if config_file_path.exists() {
        current_config = current_config.merge(read_config_file(&config_file_path)?);
    } else if explicit {
        anyhow::bail!("config file {} does not exist", config_file_path.display());
    } else {
        tracing::debug!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    Ok(current_config.merge(cli).resolve())
}
