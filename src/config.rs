use std::env;
use std::time::Duration;

/// How long an operation waits for its response before re-sending.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);
/// Pause between advance rounds for an idle pattern.
pub const DEFAULT_ADVANCE_DELAY: Duration = Duration::from_secs(5);
/// Upper bound on establishing a session, handshake included.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection and pacing configuration for an [`crate::App`].
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub operation_timeout: Duration,
    pub advance_delay: Duration,
    pub connect_timeout: Duration,
}

impl Config {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            advance_delay: DEFAULT_ADVANCE_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Load configuration from `TIDEPOOL_*` environment variables, falling
    /// back to localhost defaults.
    pub fn from_env() -> Self {
        let host = env::var("TIDEPOOL_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("TIDEPOOL_PORT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(4404);
        let tls = env::var("TIDEPOOL_TLS")
            .map(|raw| matches!(raw.trim(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);
        let mut config = Self::new(host, port);
        config.tls = tls;
        if let Some(millis) = env::var("TIDEPOOL_ADVANCE_DELAY_MS")
            .ok()
            .and_then(|raw| raw.parse().ok())
        {
            config.advance_delay = Duration::from_millis(millis);
        }
        config
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_advance_delay(mut self, delay: Duration) -> Self {
        self.advance_delay = delay;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}
