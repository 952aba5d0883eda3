//! Configuration for the STOMP output.

use crate::error::{StompError, StompResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Default STOMP broker port.
pub const DEFAULT_PORT: u16 = 61613;

/// Receipt id requested on the final DISCONNECT frame.
pub const DEFAULT_DISCONNECT_RECEIPT_ID: &str = "disconnect-receipt-id";

/// Flat delay between connection attempts when no policy is configured.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 2000;

/// A credential that never appears in logs.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Read the underlying value.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// How the connection manager retries a failed connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the second attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound on any delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor applied per failed attempt. 1 keeps the delay flat.
    pub multiplier: u32,
    /// Give up after this many attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS))
    }
}

impl ReconnectPolicy {
    /// Retry forever with the same delay between attempts.
    pub fn fixed(delay: Duration) -> Self {
        let delay_ms = delay.as_millis() as u64;
        Self {
            initial_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            multiplier: 1,
            max_attempts: None,
        }
    }

    /// Exponential backoff capped at `max`.
    pub fn exponential(initial: Duration, max: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            initial_delay_ms: initial.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
            multiplier: 2,
            max_attempts,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = (self.multiplier.max(1) as u64).saturating_pow(exponent);
        let delay = self.initial_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Whether `attempts` failed attempts used up the policy.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        matches!(self.max_attempts, Some(max) if attempts >= max)
    }
}

/// Where the broker lives and how to log in. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub vhost: Option<String>,
    pub login: String,
    pub passcode: Secret,
}

impl BrokerEndpoint {
    /// Broker address in `stomp://host:port` form.
    pub fn url(&self) -> StompResult<Url> {
        Url::parse(&format!("stomp://{}:{}", self.host, self.port))
            .map_err(|e| StompError::Config(format!("invalid broker address {}: {}", self.host, e)))
    }

    /// Value of the CONNECT `host` header.
    pub fn virtual_host(&self) -> &str {
        self.vhost.as_deref().unwrap_or(&self.host)
    }
}

/// STOMP output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StompOutputConfig {
    /// Broker host name or address.
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: Secret,
    /// Destination template, e.g. `/topic/logs` or `/queue/%{type}`.
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub vhost: Option<String>,
    /// Extra headers sent with every message, in configured order. Values
    /// are templates. Written as a JSON object.
    #[serde(default, with = "ordered_headers")]
    pub headers: Vec<(String, String)>,
    /// Log every frame exchanged with the broker.
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_disconnect_receipt_id")]
    pub disconnect_receipt_id: String,
    #[serde(default = "default_disconnect_timeout_secs")]
    pub disconnect_timeout_secs: u64,
    /// Bound on how long close waits for in-flight sends. `None` waits forever.
    #[serde(default)]
    pub drain_timeout_secs: Option<u64>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_disconnect_receipt_id() -> String {
    DEFAULT_DISCONNECT_RECEIPT_ID.to_string()
}

fn default_disconnect_timeout_secs() -> u64 {
    5
}

impl Default for StompOutputConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            user: String::new(),
            password: Secret::default(),
            destination: String::new(),
            vhost: None,
            headers: Vec::new(),
            debug: false,
            reconnect: ReconnectPolicy::default(),
            connect_timeout_secs: default_connect_timeout_secs(),
            disconnect_receipt_id: default_disconnect_receipt_id(),
            disconnect_timeout_secs: default_disconnect_timeout_secs(),
            drain_timeout_secs: None,
        }
    }
}

impl StompOutputConfig {
    /// Minimal configuration for a broker and destination.
    pub fn new(host: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            destination: destination.into(),
            ..Default::default()
        }
    }

    /// Load from a JSON file, then apply environment overrides.
    pub fn load(path: &Path) -> StompResult<Self> {
        let mut config = Self::load_from_file(path)?;
        config.load_from_env();
        Ok(config)
    }

    /// Load from a JSON file without environment overrides.
    pub fn load_from_file(path: &Path) -> StompResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: StompOutputConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Override connection settings from `STOMP_*` environment variables.
    pub fn load_from_env(&mut self) {
        if let Ok(host) = std::env::var("STOMP_HOST") {
            self.host = host;
        }
        if let Some(port) = std::env::var("STOMP_PORT").ok().and_then(|s| s.parse().ok()) {
            self.port = port;
        }
        if let Ok(user) = std::env::var("STOMP_USER") {
            self.user = user;
        }
        if let Ok(password) = std::env::var("STOMP_PASSWORD") {
            self.password = Secret::new(password);
        }
        if let Ok(destination) = std::env::var("STOMP_DESTINATION") {
            self.destination = destination;
        }
        if let Ok(vhost) = std::env::var("STOMP_VHOST") {
            self.vhost = Some(vhost).filter(|v| !v.is_empty());
        }
    }

    /// Reject configurations the output cannot run with.
    pub fn validate(&self) -> StompResult<()> {
        if self.host.trim().is_empty() {
            return Err(StompError::Config("host is required".to_string()));
        }
        if self.port == 0 {
            return Err(StompError::Config("port must be non-zero".to_string()));
        }
        if self.destination.trim().is_empty() {
            return Err(StompError::Config("destination is required".to_string()));
        }
        if self.disconnect_receipt_id.is_empty() {
            return Err(StompError::Config(
                "disconnect_receipt_id must not be empty".to_string(),
            ));
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(StompError::Config(format!(
                "reconnect max_delay_ms ({}) is below initial_delay_ms ({})",
                self.reconnect.max_delay_ms, self.reconnect.initial_delay_ms
            )));
        }
        self.endpoint().url()?;
        Ok(())
    }

    /// Broker endpoint derived from this configuration.
    pub fn endpoint(&self) -> BrokerEndpoint {
        BrokerEndpoint {
            host: self.host.clone(),
            port: self.port,
            vhost: self.vhost.clone(),
            login: self.user.clone(),
            passcode: self.password.clone(),
        }
    }

    /// Template configured for header `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t.as_str())
    }

    /// Replace the template for `name` in place, appending it if absent.
    pub fn set_header(&mut self, name: impl Into<String>, template: impl Into<String>) {
        let name = name.into();
        let template = template.into();
        match self.headers.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = template,
            None => self.headers.push((name, template)),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.disconnect_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_secs.map(Duration::from_secs)
    }
}

/// Header list as a JSON object, keeping the order entries appear in.
mod ordered_headers {
    use serde::de::{MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(
        headers: &[(String, String)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(headers.len()))?;
        for (name, template) in headers {
            map.serialize_entry(name, template)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(String, String)>, D::Error> {
        deserializer.deserialize_map(HeaderVisitor)
    }

    struct HeaderVisitor;

    impl<'de> Visitor<'de> for HeaderVisitor {
        type Value = Vec<(String, String)>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("an object of header names to templates")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut headers: Vec<(String, String)> =
                Vec::with_capacity(access.size_hint().unwrap_or(0));
            while let Some((name, template)) = access.next_entry::<String, String>()? {
                // Later duplicates win, at the first position
                match headers.iter_mut().find(|(n, _)| *n == name) {
                    Some(entry) => entry.1 = template,
                    None => headers.push((name, template)),
                }
            }
            Ok(headers)
        }
    }
}
