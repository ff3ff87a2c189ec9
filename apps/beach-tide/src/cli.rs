use clap::{Args, Parser};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::ClientConfig;
use crate::replay::ReplayOptions;
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Debug, Parser)]
#[command(
    name = "beach-tide",
    about = "Join an SFU room and replay a recorded data-channel timeline",
    author,
    version
)]
pub struct Cli {
    /// Gateway websocket URL.
    #[arg(long, env = "BEACH_TIDE_GATEWAY")]
    pub gateway: Option<String>,

    #[arg(long, env = "BEACH_TIDE_ROOM", default_value = "1")]
    pub room: String,

    /// Number of independent clients to start.
    #[arg(long, default_value_t = 1)]
    pub participants: usize,

    /// Delay between starting consecutive clients.
    #[arg(long, default_value_t = 0)]
    pub spawn_delay_ms: u64,

    /// Recorded timeline as a path or http(s) URL.
    #[arg(long, env = "BEACH_TIDE_RECORDING")]
    pub recording: Option<String>,

    /// Restart the timeline when it ends.
    #[arg(long = "loop")]
    pub looping: bool,

    #[arg(long)]
    pub tick_ms: Option<u64>,

    #[arg(long)]
    pub request_timeout_ms: Option<u64>,

    #[arg(long)]
    pub keepalive_ms: Option<u64>,

    /// STUN/TURN URL; repeat for several servers.
    #[arg(long = "ice-server")]
    pub ice_servers: Vec<String>,

    /// Don't ask the gateway for room data channel traffic.
    #[arg(long)]
    pub no_subscribe: bool,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Debug, Args)]
pub struct LoggingArgs {
    #[arg(long, value_enum, env = "BEACH_TIDE_LOG_LEVEL", default_value_t = LogLevel::Warn)]
    pub log_level: LogLevel,

    /// Write logs to this file instead of stderr.
    #[arg(long, env = "BEACH_TIDE_LOG_FILE")]
    pub log_file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level,
            file: self.log_file.clone(),
        }
    }
}

impl Cli {
    /// Applies command-line overrides on top of `base`.
    pub fn client_config(&self, mut base: ClientConfig) -> ClientConfig {
        if let Some(gateway) = &self.gateway {
            base.gateway_url = gateway.clone();
        }
        if let Some(ms) = self.tick_ms {
            base.replay_tick = Duration::from_millis(ms.max(1));
        }
        if let Some(ms) = self.request_timeout_ms {
            base.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.keepalive_ms {
            base.keepalive_interval = Duration::from_millis(ms);
        }
        if !self.ice_servers.is_empty() {
            base.ice_servers = self.ice_servers.clone();
        }
        if self.no_subscribe {
            base.subscribe_data = false;
        }
        base
    }

    pub fn replay_options(&self, config: &ClientConfig) -> ReplayOptions {
        ReplayOptions {
            tick: config.replay_tick,
            looping: self.looping,
        }
    }

    pub fn spawn_delay(&self) -> Duration {
        Duration::from_millis(self.spawn_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let cli = Cli::try_parse_from([
            "beach-tide",
            "--gateway",
            "ws://sfu.local:8188/",
            "--room",
            "lobby",
            "--participants",
            "3",
            "--loop",
            "--tick-ms",
            "0",
            "--ice-server",
            "stun:a:3478",
            "--ice-server",
            "turn:b:3478",
            "--no-subscribe",
        ])
        .unwrap();

        let config = cli.client_config(ClientConfig::default());
        assert_eq!(config.gateway_url, "ws://sfu.local:8188/");
        assert_eq!(config.replay_tick, Duration::from_millis(1));
        assert_eq!(config.ice_servers, vec!["stun:a:3478", "turn:b:3478"]);
        assert!(!config.subscribe_data);
        assert_eq!(cli.participants, 3);
        assert_eq!(cli.room, "lobby");
        assert!(cli.replay_options(&config).looping);
    }

    #[test]
    fn log_flags_map_to_config() {
        let cli = Cli::try_parse_from(["beach-tide", "--log-level", "debug"]).unwrap();
        let log = cli.logging.to_config();
        assert_eq!(log.level, LogLevel::Debug);
        assert!(log.file.is_none());
    }
}
