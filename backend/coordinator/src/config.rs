use std::env;
use std::time::Duration;

/// Where the mediator lives and how patient we are with it.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub base_url: String,
    pub request_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:18080".to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl RelayConfig {
    /// Environment overrides: `RELAY_URL`, `RELAY_REQUEST_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let defaults = Self::default();
        Self {
            base_url: env
                ::var("RELAY_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            request_timeout: duration_var("RELAY_REQUEST_TIMEOUT_MS", defaults.request_timeout),
        }
    }
}

/// Knobs for one keysign ceremony. The defaults are the production values;
/// tests shrink them so failure paths finish in milliseconds.
#[derive(Clone, Debug)]
pub struct CeremonyConfig {
    /// Hard wall clock for the message-exchange phase of one attempt.
    pub exchange_timeout: Duration,
    /// Sleep between polls when the inbox comes back empty.
    pub poll_interval: Duration,
    /// Total attempts per digest (first try included).
    pub max_attempts: u32,
}

impl Default for CeremonyConfig {
    fn default() -> Self {
        Self {
            exchange_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            max_attempts: 4,
        }
    }
}

impl CeremonyConfig {
    /// Environment overrides: `KEYSIGN_EXCHANGE_TIMEOUT_MS`,
    /// `KEYSIGN_POLL_INTERVAL_MS`, `KEYSIGN_MAX_ATTEMPTS`.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let defaults = Self::default();
        Self {
            exchange_timeout: duration_var("KEYSIGN_EXCHANGE_TIMEOUT_MS", defaults.exchange_timeout),
            poll_interval: duration_var("KEYSIGN_POLL_INTERVAL_MS", defaults.poll_interval),
            max_attempts: env
                ::var("KEYSIGN_MAX_ATTEMPTS")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.max_attempts),
        }
    }
}

fn duration_var(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
