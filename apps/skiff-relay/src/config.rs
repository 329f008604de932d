use std::env;
use std::str::FromStr;
use std::time::Duration;

use clap::ValueEnum;

/// What to do when a `join` names an id that is already connected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum DuplicatePolicy {
    /// Refuse the newcomer; it retries after the stale session is reaped.
    #[default]
    Reject,
    /// Evict the existing session and register the newcomer.
    Replace,
}

impl FromStr for DuplicatePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(DuplicatePolicy::Reject),
            "replace" => Ok(DuplicatePolicy::Replace),
            other => Err(format!("unknown duplicate id policy {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub heartbeat_interval: Duration,
    pub duplicate_policy: DuplicatePolicy,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let port = env::var("SKIFF_RELAY_PORT")
            .or_else(|_| env::var("PORT"))
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(defaults.port);
        let bind = env::var("SKIFF_RELAY_BIND").unwrap_or(defaults.bind);
        let heartbeat_interval = env::var("SKIFF_HEARTBEAT_SECS")
            .ok()
            .and_then(|val| val.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.heartbeat_interval);
        let duplicate_policy = env::var("SKIFF_DUPLICATE_ID_POLICY")
            .ok()
            .and_then(|val| val.parse().ok())
            .unwrap_or(defaults.duplicate_policy);

        Self {
            port,
            bind,
            heartbeat_interval,
            duplicate_policy,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3030,
            bind: "0.0.0.0".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            duplicate_policy: DuplicatePolicy::Reject,
        }
    }
}
