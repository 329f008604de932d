use std::env;
use std::time::Duration;

use tracing::warn;
use url::Url;

use crate::transport::{
    FlowConfig, DEFAULT_CHUNK_BYTES, DEFAULT_HIGH_WATER_BYTES, DEFAULT_LOW_WATER_BYTES,
};

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:3030/ws";
pub const DEFAULT_RECONNECT: Duration = Duration::from_secs(3);

/// Client configuration, read from `SKIFF_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub relay_url: String,
    pub reconnect_delay: Duration,
    pub flow: FlowConfig,
    /// Empty disables STUN; host candidates are enough on a LAN.
    pub stun_urls: Vec<String>,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let relay_url = match env::var("SKIFF_RELAY_URL") {
            Ok(value) => match normalize_relay_url(&value) {
                Some(url) => url,
                None => {
                    warn!(
                        target = "skiff::config",
                        value = %value,
                        default = DEFAULT_RELAY_URL,
                        "invalid relay url; using default"
                    );
                    defaults.relay_url
                }
            },
            Err(_) => defaults.relay_url,
        };
        let reconnect_ms = parse_usize_env(
            "SKIFF_RECONNECT_MS",
            defaults.reconnect_delay.as_millis() as usize,
            1,
        );
        let chunk_size = parse_usize_env("SKIFF_CHUNK_BYTES", DEFAULT_CHUNK_BYTES, 1);
        let high_water_mark = parse_usize_env("SKIFF_HIGH_WATER_BYTES", DEFAULT_HIGH_WATER_BYTES, 1);
        let mut low_water_mark = parse_usize_env("SKIFF_LOW_WATER_BYTES", DEFAULT_LOW_WATER_BYTES, 0);
        if low_water_mark > high_water_mark {
            warn!(
                target = "skiff::config",
                low_water_mark,
                high_water_mark,
                "low water mark above high water mark; clamping"
            );
            low_water_mark = high_water_mark;
        }
        let stun_urls = match env::var("SKIFF_STUN_URLS") {
            Ok(list) => list
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => defaults.stun_urls,
        };

        Self {
            relay_url,
            reconnect_delay: Duration::from_millis(reconnect_ms as u64),
            flow: FlowConfig {
                chunk_size,
                high_water_mark,
                low_water_mark,
            },
            stun_urls,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            reconnect_delay: DEFAULT_RECONNECT,
            flow: FlowConfig::default(),
            stun_urls: Vec::new(),
        }
    }
}

/// Accept `ws://`/`wss://` URLs as given and map `http(s)://` to their
/// WebSocket equivalents.
pub fn normalize_relay_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        _ => return None,
    };
    url.set_scheme(scheme).ok()?;
    url.host_str()?;
    Some(url.to_string())
}

fn parse_usize_env(var: &str, default: usize, min: usize) -> usize {
    match env::var(var) {
        Ok(value) => match value.trim().parse::<usize>() {
            Ok(parsed) if parsed >= min => parsed,
            Ok(parsed) => {
                warn!(
                    target = "skiff::config",
                    var, parsed, min, default, "config value below minimum; using default"
                );
                default
            }
            Err(err) => {
                warn!(
                    target = "skiff::config",
                    var,
                    error = %err,
                    default,
                    "failed to parse config from env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}
