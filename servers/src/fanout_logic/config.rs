use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use lib_common::core::dispatcher::{DispatchMode, DispatcherConfig};
use lib_common::core::health::HealthPolicy;
use serde::Deserialize;

/// Broadcast strategy selection.
#[derive(ValueEnum, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Sequential socket writes; the slowest client paces everyone.
    Naive,
    /// Per-client bounded queues with drop-oldest and slow-client eviction.
    Queue,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Naive => write!(f, "naive"),
            Mode::Queue => write!(f, "queue"),
        }
    }
}

#[derive(Parser, Deserialize, Debug, Clone)]
#[clap(about = "WebSocket broadcast fanout server")]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Broadcast mode.
    #[clap(long, env = "FANOUT_MODE", value_enum, default_value = "queue")]
    pub mode: Mode,

    /// Listen address.
    #[clap(long, env = "FANOUT_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Listen port.
    #[clap(long, env = "FANOUT_PORT", default_value = "8765")]
    pub port: u16,

    /// Messages per second.
    #[clap(long, env = "FANOUT_RATE", default_value = "100.0")]
    pub rate: f64,

    /// Payload size before base64 encoding, in bytes.
    #[clap(long, env = "FANOUT_PAYLOAD_BYTES", default_value = "64")]
    pub payload_bytes: usize,

    /// Queue size per client (queue mode).
    #[clap(long, env = "FANOUT_MAXSIZE", default_value = "100")]
    pub maxsize: usize,

    /// Auto-disconnect when more than this many drops land in the trailing
    /// ten seconds.
    #[clap(long, env = "FANOUT_DROP_LIMIT", default_value = "50")]
    pub drop_limit: usize,

    /// Auto-disconnect when a queue stays full for this many seconds.
    #[clap(long, env = "FANOUT_FULL_TIMEOUT", default_value = "5.0")]
    pub full_timeout: f64,

    /// Keepalive ping interval in seconds.
    #[clap(long, env = "FANOUT_PING_INTERVAL", default_value = "20.0")]
    pub ping_interval: f64,

    /// Keepalive pong timeout in seconds.
    #[clap(long, env = "FANOUT_PING_TIMEOUT", default_value = "20.0")]
    pub ping_timeout: f64,

    /// Emit metrics records as JSON objects instead of human-readable lines.
    #[clap(long, env = "FANOUT_LOG_JSON")]
    #[serde(default)]
    pub log_json: bool,

    #[clap(long, env = "FANOUT_CONFIG_PATH")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "FANOUT_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "FANOUT_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Startup validation; a violation exits the process non-zero.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.rate > 0.0, "rate must be positive");
        anyhow::ensure!(self.payload_bytes > 0, "payload-bytes must be at least 1");
        anyhow::ensure!(self.maxsize > 0, "maxsize must be at least 1");
        anyhow::ensure!(self.full_timeout > 0.0, "full-timeout must be positive");
        anyhow::ensure!(self.ping_interval > 0.0, "ping-interval must be positive");
        anyhow::ensure!(self.ping_timeout > 0.0, "ping-timeout must be positive");
        Ok(())
    }

    /// Maps the CLI surface onto the dispatcher tuning.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            mode: match self.mode {
                Mode::Naive => DispatchMode::Naive,
                Mode::Queue => DispatchMode::Queued,
            },
            maxsize: self.maxsize,
            policy: HealthPolicy {
                drop_limit: self.drop_limit,
                full_timeout: Duration::from_secs_f64(self.full_timeout),
            },
            ping_interval: Duration::from_secs_f64(self.ping_interval),
            ping_timeout: Duration::from_secs_f64(self.ping_timeout),
        }
    }
}

pub fn load_config() -> Config {
    let cli_config = Config::parse();

    let config_from_file = cli_config.config_path.as_ref().and_then(|path| {
        fs::read_to_string(path)
            .ok()
            .and_then(|contents| serde_json::from_str::<Config>(&contents).ok())
    });

    if let Some(file_config) = config_from_file {
        // Command-line arguments override file configuration
        let mut merged = cli_config;
        merged.log_dir = merged.log_dir.or(file_config.log_dir);
        merged
    } else {
        cli_config
    }
}
