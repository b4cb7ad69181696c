use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::backoff::{BackoffPolicy, DEFAULT_BASE, DEFAULT_MAX_ATTEMPTS};
use crate::transport::TransportOptions;

pub const DEFAULT_COORDINATOR_URL: &str = "ws://127.0.0.1:8080";
pub const DEFAULT_JITTER: f64 = 0.1;
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);

/// Connection settings shared by every channel a client opens.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    /// Coordinator base URL (defaults to "ws://127.0.0.1:8080")
    pub coordinator_url: String,
    /// Auth token appended to every channel URL
    pub token: Option<String>,
    pub backoff_base: Duration,
    pub max_attempts: u32,
    pub jitter: f64,
    /// Ping interval while open; `None` disables keepalive
    pub keepalive: Option<Duration>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            coordinator_url: DEFAULT_COORDINATOR_URL.to_string(),
            token: None,
            backoff_base: DEFAULT_BASE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            jitter: DEFAULT_JITTER,
            keepalive: Some(DEFAULT_KEEPALIVE),
        }
    }
}

impl ChannelConfig {
    /// Load configuration from `HUDDLE_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let coordinator_url = env::var("HUDDLE_COORDINATOR_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(|value| normalize_host(value.trim()))
            .unwrap_or(defaults.coordinator_url);
        let token = env::var("HUDDLE_TOKEN").ok().filter(|value| !value.is_empty());

        let backoff_base = parse_var::<u64>("HUDDLE_BACKOFF_BASE_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.backoff_base);
        let max_attempts =
            parse_var::<u32>("HUDDLE_MAX_RECONNECT_ATTEMPTS").unwrap_or(defaults.max_attempts);
        let jitter = parse_var::<f64>("HUDDLE_BACKOFF_JITTER")
            .filter(|value| (0.0..=1.0).contains(value))
            .unwrap_or(defaults.jitter);
        let keepalive = match parse_var::<u64>("HUDDLE_KEEPALIVE_SECS") {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.keepalive,
        };

        Self {
            coordinator_url,
            token,
            backoff_base,
            max_attempts,
            jitter,
            keepalive,
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_base, self.max_attempts).with_jitter(self.jitter)
    }

    pub fn options(&self) -> TransportOptions {
        TransportOptions {
            backoff: self.backoff(),
            keepalive: self.keepalive,
        }
    }
}

// Prefer IPv4 loopback; some resolvers hand back ::1 first for localhost.
fn normalize_host(url: &str) -> String {
    for scheme in ["ws://", "wss://", "http://", "https://"] {
        if let Some(rest) = url.strip_prefix(scheme) {
            if rest == "localhost" || rest.starts_with("localhost:") || rest.starts_with("localhost/") {
                return format!("{scheme}{}", rest.replacen("localhost", "127.0.0.1", 1));
            }
        }
    }
    url.to_string()
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(target: "huddle::signal", var = name, value = %raw, "ignoring unparsable setting");
            None
        }
    }
}
