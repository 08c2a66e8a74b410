use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lib_common::retrieve::HttpFeedConfig;

pub const DEFAULT_CONFIG_PATH: &str = "server_matcher.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[command(about = "Candidate feed matcher control server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[arg(long, env = "MATCHER_PORT", help = "Port to listen on for control API requests.")]
    pub port: Option<u16>,

    #[arg(long, env = "MATCHER_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[arg(long, env = "MATCHER_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "MATCHER_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[arg(long, env = "DATABASE_URL", help = "PostgreSQL connection string. In-memory stores when unset.")]
    pub database_url: Option<String>,

    #[arg(long, env = "MATCHER_DB_MAX_CONNECTIONS", help = "Maximum pooled database connections.")]
    pub db_max_connections: Option<usize>,

    #[arg(long, env = "MATCHER_ANSWER_URL", help = "Accept endpoint; {user_id} is replaced by the candidate id.")]
    pub answer_url_template: Option<String>,

    #[arg(long, env = "MATCHER_CREDENTIAL_HEADER", help = "Header that carries the feed credential.")]
    pub credential_header: Option<String>,

    #[arg(long, env = "MATCHER_HTTP_TIMEOUT_SECONDS", help = "Total timeout of one feed request.")]
    pub http_timeout_seconds: Option<u64>,

    #[arg(long, env = "MATCHER_RESERVATION_TTL_SECONDS", help = "Age after which an unresolved reservation is swept.")]
    pub reservation_ttl_seconds: Option<u64>,

    #[arg(long, env = "MATCHER_SWEEP_INTERVAL_SECONDS", help = "Interval between reservation sweeps.")]
    pub sweep_interval_seconds: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            database_url: other.database_url.or(self.database_url),
            db_max_connections: other.db_max_connections.or(self.db_max_connections),
            answer_url_template: other.answer_url_template.or(self.answer_url_template),
            credential_header: other.credential_header.or(self.credential_header),
            http_timeout_seconds: other.http_timeout_seconds.or(self.http_timeout_seconds),
            reservation_ttl_seconds: other.reservation_ttl_seconds.or(self.reservation_ttl_seconds),
            sweep_interval_seconds: other.sweep_interval_seconds.or(self.sweep_interval_seconds),
        }
    }

    fn defaults() -> Config {
        let feed = HttpFeedConfig::default();
        Config {
            port: Some(9100),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            db_max_connections: Some(16),
            answer_url_template: Some(feed.answer_url_template),
            credential_header: Some(feed.credential_header),
            http_timeout_seconds: Some(feed.timeout.as_secs()),
            reservation_ttl_seconds: Some(600),
            sweep_interval_seconds: Some(60),
            ..Default::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(9100)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> String {
        self.log_level.clone().unwrap_or_else(|| "info".to_string())
    }

    pub fn db_max_connections(&self) -> usize {
        self.db_max_connections.unwrap_or(16).max(1)
    }

    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservation_ttl_seconds.unwrap_or(600))
    }

    pub fn sweep_interval(&self) -> Duration {
        // tokio intervals reject a zero period.
        Duration::from_secs(self.sweep_interval_seconds.unwrap_or(60).max(1))
    }

    pub fn feed_client(&self) -> HttpFeedConfig {
        let defaults = HttpFeedConfig::default();
        HttpFeedConfig {
            answer_url_template: self
                .answer_url_template
                .clone()
                .unwrap_or(defaults.answer_url_template),
            credential_header: self
                .credential_header
                .clone()
                .unwrap_or(defaults.credential_header),
            timeout: self
                .http_timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            user_agent: defaults.user_agent,
        }
    }
}

pub fn load_config() -> Config {
    load_config_with(Config::parse())
}

/// Defaults, then the JSON config file, then environment and CLI arguments.
pub fn load_config_with(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }
    current_config.merge(cli)
}

// Logging is not up yet when the config is read, so problems go to stderr.
fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        return None;
    }
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str::<Config>(&raw) {
        Ok(config) => Some(config),
        Err(e) => {
            eprintln!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}
