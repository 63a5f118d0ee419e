use crate::core::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_MAP_NAME: &str = "session-replication";
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(7);
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Store connection configuration
///
/// Host and port are opaque to the replication core; they are handed to the
/// [`StoreConnector`](crate::store::StoreConnector) as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store host
    pub host: String,

    /// Store port
    pub port: u16,

    /// Name of the distributed map holding session records
    pub map_name: String,

    /// Map-level expiry forwarded to the store on connect
    pub session_ttl: Option<Duration>,

    /// Minimum time between two reconnect attempts
    pub retry_interval: Duration,

    /// Cadence of the background reconnect probe
    pub probe_interval: Duration,

    /// Timeout of a single store call
    pub operation_timeout: Duration,

    /// Timeout of a single connect attempt
    pub connect_timeout: Duration,

    /// Bounded wait for the probe task on shutdown
    pub shutdown_timeout: Duration,
}

impl StoreConfig {
    /// Create a configuration for the given map
    pub fn new(map_name: &str) -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5701,
            map_name: map_name.to_string(),
            session_ttl: None,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            operation_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(1),
        }
    }

    /// Set the host
    pub fn host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the session time-to-live
    pub fn session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = Some(ttl);
        self
    }

    /// Set the reconnect rate limit
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the background probe cadence
    pub fn probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Set the per-call timeout
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the shutdown wait
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Parse from connection string
    ///
    /// Format: "memsession://host:port/map?ttl=SECONDS"
    ///
    /// # Examples
    ///
    /// ```
    /// # use memsession::StoreConfig;
    /// let config = StoreConfig::from_url("memsession://cache.local:5701/web-sessions?ttl=1800").unwrap();
    /// assert_eq!(config.map_name, "web-sessions");
    /// ```
    pub fn from_url(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("memsession://")
            .ok_or_else(|| SessionError::Config("URL must start with 'memsession://'".to_string()))?;

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };

        let (host_port, map_name) = location
            .split_once('/')
            .ok_or_else(|| SessionError::Config("Invalid host/map format".to_string()))?;
        if map_name.is_empty() {
            return Err(SessionError::Config("Map name cannot be empty".to_string()));
        }

        let (host, port) = match host_port.split_once(':') {
            Some((host, port)) => (
                host,
                port.parse()
                    .map_err(|_| SessionError::Config(format!("Invalid port '{}'", port)))?,
            ),
            None => (host_port, 5701),
        };

        let mut config = Self::new(map_name).host(host).port(port);
        if let Some(query) = query {
            for pair in query.split('&').filter(|pair| !pair.is_empty()) {
                match pair.split_once('=') {
                    Some(("ttl", secs)) => config.session_ttl = Some(parse_seconds("ttl", secs)?),
                    _ => {
                        return Err(SessionError::Config(format!(
                            "Unknown URL parameter '{}'",
                            pair
                        )));
                    }
                }
            }
        }
        Ok(config)
    }

    /// Convert to connection string
    pub fn to_url(&self) -> String {
        let mut url = format!("memsession://{}:{}/{}", self.host, self.port, self.map_name);
        if let Some(ttl) = self.session_ttl {
            url.push_str(&format!("?ttl={}", ttl.as_secs()));
        }
        url
    }

    /// Read deployment parameters (`map-name`, `session-ttl`).
    ///
    /// Unknown keys are ignored so one parameter map can feed both
    /// [`StoreConfig`] and [`SessionConfig`](crate::session::SessionConfig).
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self> {
        let map_name = params
            .get("map-name")
            .map(String::as_str)
            .unwrap_or(DEFAULT_MAP_NAME);
        let mut config = Self::new(map_name);
        if let Some(ttl) = params.get("session-ttl") {
            config.session_ttl = Some(parse_seconds("session-ttl", ttl)?);
        }
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.map_name.trim().is_empty() {
            return Err(SessionError::Config("map_name cannot be empty".to_string()));
        }

        if self.retry_interval.is_zero() {
            return Err(SessionError::Config("retry_interval must be > 0".to_string()));
        }

        if self.probe_interval.is_zero() {
            return Err(SessionError::Config("probe_interval must be > 0".to_string()));
        }

        if self.operation_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(SessionError::Config("timeouts must be > 0".to_string()));
        }

        if matches!(self.session_ttl, Some(ttl) if ttl.is_zero()) {
            return Err(SessionError::Config("session_ttl must be > 0 when set".to_string()));
        }

        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAP_NAME)
    }
}

pub(crate) fn parse_seconds(key: &str, raw: &str) -> Result<Duration> {
    raw.trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| SessionError::Config(format!("'{}' must be whole seconds, got '{}'", key, raw)))
}
