//! Relay configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`).

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::RelayError;

/// Where the broker client connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEndpoint {
    /// An MQTT broker reachable over TCP.
    Mqtt {
        /// Broker host name or address.
        host: String,
        /// Broker TCP port.
        port: u16,
    },
    /// The in-process loopback broker (`memory://`).
    Loopback,
}

impl BrokerEndpoint {
    /// Parses a broker URL such as `tcp://localhost:1883`, `mqtt://broker`
    /// or `memory://`.
    ///
    /// A missing port defaults to 1883.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] for unknown schemes, an empty host or
    /// an unparsable port.
    pub fn parse(url: &str) -> Result<Self, RelayError> {
        let Some((scheme, rest)) = url.split_once("://") else {
            return Err(RelayError::Config(format!("broker url missing scheme: {url}")));
        };

        match scheme {
            "memory" => Ok(Self::Loopback),
            "tcp" | "mqtt" => {
                let rest = rest.trim_end_matches('/');
                let (host, port) = match rest.rsplit_once(':') {
                    Some((host, port)) => {
                        let port = port.parse::<u16>().map_err(|_| {
                            RelayError::Config(format!("invalid broker port in {url}"))
                        })?;
                        (host, port)
                    }
                    None => (rest, 1883),
                };
                if host.is_empty() {
                    return Err(RelayError::Config(format!("broker url missing host: {url}")));
                }
                Ok(Self::Mqtt {
                    host: host.to_string(),
                    port,
                })
            }
            other => Err(RelayError::Config(format!(
                "unsupported broker scheme: {other}"
            ))),
        }
    }
}

/// Top-level relay configuration.
///
/// Loaded once at startup via [`RelayConfig::from_env`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Socket address to bind the HTTP server to (e.g. `0.0.0.0:8000`).
    pub listen_addr: SocketAddr,

    /// Broker to connect to.
    pub broker: BrokerEndpoint,

    /// Optional broker username.
    pub mqtt_username: Option<String>,

    /// Broker password, used only together with a username.
    pub mqtt_password: String,

    /// MQTT client identifier.
    pub mqtt_client_id: String,

    /// MQTT keep alive in seconds.
    pub mqtt_keep_alive_secs: u64,

    /// Capacity of the rumqttc request channel.
    pub mqtt_request_capacity: usize,

    /// How long to wait for SUBACK/PUBACK, in milliseconds.
    pub mqtt_ack_timeout_ms: u64,

    /// Capacity of the broadcaster submission queue.
    pub broadcast_queue_capacity: usize,

    /// Per-write deadline for a single client, in milliseconds.
    pub ws_write_timeout_ms: u64,

    /// Pending broadcast frames allowed per connection.
    pub connection_queue_capacity: usize,

    /// Pending broker messages allowed per topic subscription.
    pub subscription_queue_capacity: usize,

    /// Whether device telemetry topics are ingested.
    pub ingest_enabled: bool,
}

impl RelayConfig {
    /// Loads configuration from environment variables.
    ///
    /// Falls back to sensible defaults when a variable is not set.
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns an error if `LISTEN_ADDR` cannot be parsed as a
    /// [`SocketAddr`] or `MQTT_BROKER` is not a supported URL.
    pub fn from_env() -> Result<Self, RelayError> {
        dotenvy::dotenv().ok();

        let listen_addr: SocketAddr = std::env::var("LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8000".to_string())
            .parse()
            .map_err(|e| RelayError::Config(format!("LISTEN_ADDR: {e}")))?;

        let broker = BrokerEndpoint::parse(
            &std::env::var("MQTT_BROKER").unwrap_or_else(|_| "tcp://localhost:1883".to_string()),
        )?;

        let mqtt_username = std::env::var("MQTT_USERNAME")
            .ok()
            .filter(|u| !u.is_empty());
        let mqtt_password = std::env::var("MQTT_PASSWORD").unwrap_or_default();
        let mqtt_client_id =
            std::env::var("MQTT_CLIENT_ID").unwrap_or_else(|_| default_client_id());

        Ok(Self {
            listen_addr,
            broker,
            mqtt_username,
            mqtt_password,
            mqtt_client_id,
            mqtt_keep_alive_secs: parse_env("MQTT_KEEP_ALIVE_SECS", 30),
            mqtt_request_capacity: parse_env("MQTT_REQUEST_CAPACITY", 100),
            mqtt_ack_timeout_ms: parse_env("MQTT_ACK_TIMEOUT_MS", 10_000),
            broadcast_queue_capacity: parse_env("BROADCAST_QUEUE_CAPACITY", 256),
            ws_write_timeout_ms: parse_env("WS_WRITE_TIMEOUT_MS", 10_000),
            connection_queue_capacity: parse_env("CONNECTION_QUEUE_CAPACITY", 64),
            subscription_queue_capacity: parse_env("SUBSCRIPTION_QUEUE_CAPACITY", 256),
            ingest_enabled: parse_env_bool("INGEST_ENABLED", true),
        })
    }

    /// Per-write deadline as a [`Duration`].
    #[must_use]
    pub const fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.ws_write_timeout_ms)
    }

    /// Broker acknowledgement deadline as a [`Duration`].
    #[must_use]
    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.mqtt_ack_timeout_ms)
    }
}

/// Builds a client id with a short random suffix.
fn default_client_id() -> String {
    let short = uuid::Uuid::new_v4().simple().to_string();
    let suffix: String = short.chars().take(8).collect();
    format!("telemetry-relay-{suffix}")
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parses an environment variable as a boolean. Accepts `"true"`, `"1"`,
/// `"false"`, `"0"` (case-insensitive). Returns `default` otherwise.
fn parse_env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key).ok().as_deref() {
        Some("true") | Some("TRUE") | Some("1") => true,
        Some("false") | Some("FALSE") | Some("0") => false,
        _ => default,
    }
}
