//! Configuration for a [`ServerSource`](crate::source::ServerSource).
//!
//! `ServerSrcConfig` replaces the property table of the hosting pipeline
//! with a typed structure. Setters validate their input; a rejected value
//! is logged and the previous value is kept, so a bad update never disturbs
//! an instance that is already running.

use std::{fmt, str::FromStr, time::Duration};

use log::warn;
use serde::Deserialize;
use thiserror::Error;


/// Host used when none is configured.
pub const DEFAULT_HOST: &str = "localhost";
/// Port used when none is configured.
pub const DEFAULT_PORT: u16 = 3001;
/// Connection timeout applied when none is configured.
pub const DEFAULT_TIMEOUT_SECS: u32 = 10;
/// Upper bound accepted for [`ServerSrcConfig::set_timeout_secs`].
pub const MAX_TIMEOUT_SECS: u32 = 3600;
/// Id used to look up the server context when none is configured.
pub const DEFAULT_SERVER_ID: u32 = 0;
/// How long `start` waits for a consumer by default.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised when a configuration value is rejected.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The listen host was empty.
    #[error("host cannot be empty")]
    EmptyHost,
    /// The timeout exceeded [`MAX_TIMEOUT_SECS`].
    #[error("timeout {0}s is out of range; must be between 0 and {max}", max = MAX_TIMEOUT_SECS)]
    TimeoutOutOfRange(u32),
    /// The protocol name was not recognised.
    #[error("unknown protocol {0:?}")]
    UnknownProtocol(String),
}

/// Wire protocol used between clients and the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Direct TCP connections.
    #[default]
    Tcp,
    /// Messages relayed through an MQTT broker.
    Mqtt,
    /// Broker-assisted discovery with direct TCP data.
    Hybrid,
    /// A transport supplied by the embedder.
    Custom,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Mqtt => "mqtt",
            Protocol::Hybrid => "hybrid",
            Protocol::Custom => "custom",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "mqtt" => Ok(Protocol::Mqtt),
            "hybrid" => Ok(Protocol::Hybrid),
            "custom" => Ok(Protocol::Custom),
            _ => Err(ConfigError::UnknownProtocol(s.to_owned())),
        }
    }
}

/// Settings for one listening server source.
///
/// Fields are read-only once the source has started streaming; the
/// source takes its own copy at construction.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerSrcConfig {
    host: String,
    port: u16,
    protocol: Protocol,
    timeout_secs: u32,
    topic: Option<String>,
    id: u32,
    is_live: bool,
    advertised_host: Option<String>,
    advertised_port: Option<u16>,
    broker_host: Option<String>,
    broker_port: Option<u16>,
    ready_timeout_ms: u64,
}

impl Default for ServerSrcConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
            protocol: Protocol::default(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            topic: None,
            id: DEFAULT_SERVER_ID,
            is_live: true,
            advertised_host: None,
            advertised_port: None,
            broker_host: None,
            broker_port: None,
            ready_timeout_ms: u64::try_from(DEFAULT_READY_TIMEOUT.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl ServerSrcConfig {
    /// Create a configuration listening on `host:port` with defaults elsewhere.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EmptyHost`] if `host` is empty.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.set_host(host)?;
        config.set_port(port);
        Ok(config)
    }

    /// Check every field, as required before the source is constructed.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.timeout_secs > MAX_TIMEOUT_SECS {
            return Err(ConfigError::TimeoutOutOfRange(self.timeout_secs));
        }
        Ok(())
    }

    /// Set the host to listen on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::EmptyHost`] and keeps the previous host when
    /// `host` is empty.
    pub fn set_host(&mut self, host: impl Into<String>) -> Result<(), ConfigError> {
        let host = host.into();
        if host.is_empty() {
            warn!("host cannot be empty: keeping host={}", self.host);
            return Err(ConfigError::EmptyHost);
        }
        self.host = host;
        Ok(())
    }

    /// Set the port to listen on; `0` selects any available port.
    pub fn set_port(&mut self, port: u16) { self.port = port; }

    /// Select the wire protocol.
    pub fn set_protocol(&mut self, protocol: Protocol) { self.protocol = protocol; }

    /// Set the connection timeout in seconds; `0` disables it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::TimeoutOutOfRange`] above [`MAX_TIMEOUT_SECS`].
    pub fn set_timeout_secs(&mut self, secs: u32) -> Result<(), ConfigError> {
        if secs > MAX_TIMEOUT_SECS {
            warn!(
                "timeout out of range: requested={secs}, keeping timeout={}",
                self.timeout_secs
            );
            return Err(ConfigError::TimeoutOutOfRange(secs));
        }
        self.timeout_secs = secs;
        Ok(())
    }

    /// Set the discovery topic. An empty topic disables discovery.
    pub fn set_topic(&mut self, topic: impl Into<String>) {
        let topic = topic.into();
        self.topic = if topic.is_empty() { None } else { Some(topic) };
    }

    /// Set the numeric id distinguishing servers in one process.
    pub fn set_id(&mut self, id: u32) { self.id = id; }

    /// Control whether frames are stamped with the running time.
    pub fn set_live(&mut self, is_live: bool) { self.is_live = is_live; }

    /// Advertise a different address to the broker than the one bound.
    pub fn set_advertised(&mut self, host: Option<String>, port: Option<u16>) {
        self.advertised_host = host.filter(|h| !h.is_empty());
        self.advertised_port = port;
    }

    /// Publish to a broker other than the listen address.
    pub fn set_broker(&mut self, host: Option<String>, port: Option<u16>) {
        self.broker_host = host.filter(|h| !h.is_empty());
        self.broker_port = port;
    }

    /// Bound the wait for a downstream consumer during start-up.
    pub fn set_ready_timeout(&mut self, timeout: Duration) {
        self.ready_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    }

    #[must_use]
    pub fn host(&self) -> &str { &self.host }

    #[must_use]
    pub const fn port(&self) -> u16 { self.port }

    #[must_use]
    pub const fn protocol(&self) -> Protocol { self.protocol }

    #[must_use]
    pub const fn timeout_secs(&self) -> u32 { self.timeout_secs }

    /// Connection timeout, or `None` when disabled.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(u64::from(self.timeout_secs)))
    }

    /// Discovery topic; `None` when discovery is disabled.
    #[must_use]
    pub fn topic(&self) -> Option<&str> { self.topic.as_deref().filter(|t| !t.is_empty()) }

    #[must_use]
    pub const fn id(&self) -> u32 { self.id }

    #[must_use]
    pub const fn is_live(&self) -> bool { self.is_live }

    /// Host advertised to the broker, defaulting to the listen host.
    #[must_use]
    pub fn advertised_host(&self) -> &str { self.advertised_host.as_deref().unwrap_or(&self.host) }

    /// Port advertised to the broker, defaulting to the listen port.
    #[must_use]
    pub fn advertised_port(&self) -> u16 { self.advertised_port.unwrap_or(self.port) }

    /// Broker host, defaulting to the listen host.
    #[must_use]
    pub fn broker_host(&self) -> &str { self.broker_host.as_deref().unwrap_or(&self.host) }

    /// Broker port, defaulting to the listen port.
    #[must_use]
    pub fn broker_port(&self) -> u16 { self.broker_port.unwrap_or(self.port) }

    #[must_use]
    pub const fn ready_timeout(&self) -> Duration { Duration::from_millis(self.ready_timeout_ms) }
}
