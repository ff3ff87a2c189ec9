use std::env;
use std::time::Duration;

use crate::signaling::{SFU_PLUGIN, SessionConfig};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub gateway_url: String,
    pub plugin: String,
    pub request_timeout: Duration,
    pub keepalive_interval: Duration,
    /// How long the handshake may wait for the gateway's connected signal.
    pub connect_timeout: Duration,
    pub replay_tick: Duration,
    pub ice_servers: Vec<String>,
    pub reliable_label: String,
    pub unreliable_label: String,
    /// Ask the gateway to forward room data channel traffic.
    pub subscribe_data: bool,
    /// Open a receive-only connection per remote participant.
    pub subscribe_media: bool,
}

fn env_millis(var: &str) -> Option<Duration> {
    env::var(var)
        .ok()
        .and_then(|value| value.parse().ok())
        .map(Duration::from_millis)
}

fn env_flag(var: &str) -> Option<bool> {
    env::var(var)
        .ok()
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
}

impl ClientConfig {
    /// Reads `BEACH_TIDE_*` overrides on top of the defaults. Callers load
    /// `.env` first.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ice_servers = env::var("BEACH_TIDE_ICE_SERVERS")
            .ok()
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|server| !server.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|servers| !servers.is_empty())
            .unwrap_or(defaults.ice_servers);

        Self {
            gateway_url: env::var("BEACH_TIDE_GATEWAY").unwrap_or(defaults.gateway_url),
            plugin: env::var("BEACH_TIDE_PLUGIN").unwrap_or(defaults.plugin),
            request_timeout: env_millis("BEACH_TIDE_REQUEST_TIMEOUT_MS")
                .unwrap_or(defaults.request_timeout),
            keepalive_interval: env_millis("BEACH_TIDE_KEEPALIVE_MS")
                .unwrap_or(defaults.keepalive_interval),
            connect_timeout: env_millis("BEACH_TIDE_CONNECT_TIMEOUT_MS")
                .unwrap_or(defaults.connect_timeout),
            replay_tick: env_millis("BEACH_TIDE_TICK_MS").unwrap_or(defaults.replay_tick),
            ice_servers,
            reliable_label: env::var("BEACH_TIDE_RELIABLE_LABEL")
                .unwrap_or(defaults.reliable_label),
            unreliable_label: env::var("BEACH_TIDE_UNRELIABLE_LABEL")
                .unwrap_or(defaults.unreliable_label),
            subscribe_data: env_flag("BEACH_TIDE_SUBSCRIBE_DATA")
                .unwrap_or(defaults.subscribe_data),
            subscribe_media: env_flag("BEACH_TIDE_SUBSCRIBE_MEDIA")
                .unwrap_or(defaults.subscribe_media),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            request_timeout: self.request_timeout,
            keepalive_interval: self.keepalive_interval,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            gateway_url: "ws://localhost:8188/".to_string(),
            plugin: SFU_PLUGIN.to_string(),
            request_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(30),
            replay_tick: Duration::from_millis(10),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            reliable_label: "reliable".to_string(),
            unreliable_label: "unreliable".to_string(),
            subscribe_data: true,
            subscribe_media: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_defaults() {
        // SAFETY: this is the only test touching these variables.
        unsafe {
            env::set_var("BEACH_TIDE_GATEWAY", "wss://sfu.example.com/janus");
            env::set_var("BEACH_TIDE_KEEPALIVE_MS", "1500");
            env::set_var("BEACH_TIDE_ICE_SERVERS", "stun:a:3478, turn:b:3478 ,");
            env::set_var("BEACH_TIDE_SUBSCRIBE_MEDIA", "true");
        }
        let config = ClientConfig::from_env();
        unsafe {
            env::remove_var("BEACH_TIDE_GATEWAY");
            env::remove_var("BEACH_TIDE_KEEPALIVE_MS");
            env::remove_var("BEACH_TIDE_ICE_SERVERS");
            env::remove_var("BEACH_TIDE_SUBSCRIBE_MEDIA");
        }

        assert_eq!(config.gateway_url, "wss://sfu.example.com/janus");
        assert_eq!(config.keepalive_interval, Duration::from_millis(1500));
        assert_eq!(config.ice_servers, vec!["stun:a:3478", "turn:b:3478"]);
        assert!(config.subscribe_media);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.plugin, SFU_PLUGIN);
    }
}
