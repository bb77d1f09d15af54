//! Proxy Configuration Settings
//!
//! Configuration types for the ticker stream proxy, loaded from environment
//! variables.

use std::time::Duration;

use crate::application::ports::SourceKind;
use crate::domain::streaming::Symbol;

/// Placeholder substituted with the symbol in the live page URL template.
pub const SYMBOL_PLACEHOLDER: &str = "{symbol}";

/// Default live quote page.
pub const DEFAULT_PAGE_URL_TEMPLATE: &str =
    "https://www.tradingview.com/symbols/{symbol}/?exchange=BINANCE";

/// Default user agent presented by the live source.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Parse a boolean toggle the way the environment usually spells it.
#[must_use]
pub fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// Server port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// API HTTP port.
    pub http_port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            http_port: 8080,
            health_port: 8082,
        }
    }
}

/// Simulated source settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedSettings {
    /// Period between random-walk ticks.
    pub tick_interval: Duration,
}

impl Default for SimulatedSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(1500),
        }
    }
}

/// Live source settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSettings {
    /// Page URL with a `{symbol}` placeholder.
    pub page_url_template: String,
    /// Period between polls of a symbol's page.
    pub poll_interval: Duration,
    /// Delay between the initial page load and the first poll.
    pub settle_delay: Duration,
    /// Timeout for a single page request.
    pub page_timeout: Duration,
    /// User agent of the shared client.
    pub user_agent: String,
}

impl LiveSettings {
    /// Build the page URL for a symbol.
    #[must_use]
    pub fn page_url(&self, symbol: &Symbol) -> String {
        self.page_url_template
            .replace(SYMBOL_PLACEHOLDER, symbol.as_str())
    }
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            page_url_template: DEFAULT_PAGE_URL_TEMPLATE.to_string(),
            poll_interval: Duration::from_secs(2),
            settle_delay: Duration::from_secs(2),
            page_timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Complete proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Price source selected for the process lifetime.
    pub source: SourceKind,
    /// Server port settings.
    pub server: ServerSettings,
    /// Simulated source settings.
    pub simulated: SimulatedSettings,
    /// Live source settings.
    pub live: LiveSettings,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Live,
            server: ServerSettings::default(),
            simulated: SimulatedSettings::default(),
            live: LiveSettings::default(),
        }
    }
}

impl StreamConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is present but unusable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if an interval is zero or the URL template lacks the
    /// `{symbol}` placeholder.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let source = if env.get("USE_SIMULATED_SOURCE").is_some_and(|v| parse_flag(&v)) {
            SourceKind::Simulated
        } else {
            SourceKind::Live
        };

        let server = ServerSettings {
            http_port: env.parse_or(
                "TICKER_STREAM_HTTP_PORT",
                ServerSettings::default().http_port,
            ),
            health_port: env.parse_or(
                "TICKER_STREAM_HEALTH_PORT",
                ServerSettings::default().health_port,
            ),
        };

        let simulated = SimulatedSettings {
            tick_interval: env.duration_millis(
                "SIMULATED_TICK_INTERVAL_MS",
                SimulatedSettings::default().tick_interval,
            )?,
        };

        let defaults = LiveSettings::default();
        let page_url_template = env
            .get("LIVE_PAGE_URL_TEMPLATE")
            .unwrap_or(defaults.page_url_template);
        if !page_url_template.contains(SYMBOL_PLACEHOLDER) {
            return Err(ConfigError::InvalidUrlTemplate(page_url_template));
        }

        let live = LiveSettings {
            page_url_template,
            poll_interval: env.duration_millis("LIVE_POLL_INTERVAL_MS", defaults.poll_interval)?,
            // A zero settle delay is allowed: poll right after the load.
            settle_delay: env
                .parse::<u64>("LIVE_SETTLE_DELAY_MS")
                .map_or(defaults.settle_delay, Duration::from_millis),
            page_timeout: env.duration_secs("LIVE_PAGE_TIMEOUT_SECS", defaults.page_timeout)?,
            user_agent: env
                .get("LIVE_USER_AGENT")
                .filter(|ua| !ua.trim().is_empty())
                .unwrap_or(defaults.user_agent),
        };

        Ok(Self {
            source,
            server,
            simulated,
            live,
        })
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has a value that cannot be used.
    #[error("environment variable {key} has invalid value {value:?}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },
    /// Page URL template lacks the symbol placeholder.
    #[error("page URL template {0:?} must contain {{symbol}}")]
    InvalidUrlTemplate(String),
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    fn parse_or<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.parse(key).unwrap_or(default)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.nonzero(key, default, Duration::from_millis)
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.nonzero(key, default, Duration::from_secs)
    }

    fn nonzero(
        &self,
        key: &str,
        default: Duration,
        to_duration: fn(u64) -> Duration,
    ) -> Result<Duration, ConfigError> {
        match self.parse::<u64>(key) {
            None => Ok(default),
            Some(0) => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            }),
            Some(value) => Ok(to_duration(value)),
        }
    }
}
