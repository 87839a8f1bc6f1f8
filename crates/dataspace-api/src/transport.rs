// Transport seam between the dataspace session and a concrete broker.
//
// A `Connector` opens a `Transport`; the session owns the transport
// exclusively and drives it from a single task. Outbound operations
// are non-blocking (they only queue the request), inbound traffic and
// connection lifecycle changes arrive through `next_event`.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use secrecy::SecretString;
use strum::{Display, EnumString};

use crate::error::Error;
use crate::mqtt::ReconnectConfig;

// ── QoS ──────────────────────────────────────────────────────────────

/// Delivery guarantee requested for a publish or subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    /// Whether the broker acknowledges publishes at this level.
    pub fn is_acknowledged(self) -> bool {
        self != Self::AtMostOnce
    }
}

impl TryFrom<u8> for QoS {
    type Error = Error;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactlyOnce),
            other => Err(Error::Request(format!("invalid QoS level {other}"))),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

// ── Endpoint ─────────────────────────────────────────────────────────

/// URL scheme of a broker address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Scheme {
    Mqtt,
    Mqtts,
    Ws,
    Wss,
}

impl Scheme {
    /// Port used when the address does not carry one.
    pub fn default_port(self) -> u16 {
        match self {
            Self::Mqtt => 1883,
            Self::Mqtts => 8883,
            Self::Ws => 80,
            Self::Wss => 443,
        }
    }

    pub fn is_tls(self) -> bool {
        matches!(self, Self::Mqtts | Self::Wss)
    }
}

/// Fully resolved network location of a broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Username/password pair presented to the broker.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }
}

/// Everything a connector needs to open one broker session.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub endpoint: Endpoint,
    pub client_id: String,
    /// `None` connects anonymously.
    pub credentials: Option<Credentials>,
    pub keep_alive: Duration,
    /// Largest packet accepted or sent, in bytes.
    pub max_packet_size: usize,
    pub reconnect: ReconnectConfig,
}

// ── Events ───────────────────────────────────────────────────────────

/// A message delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    /// Set when the broker replays its stored last value.
    pub retain: bool,
    pub qos: QoS,
}

/// Something that happened on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The session is (re-)established. Subscriptions may need replaying.
    Connected,
    /// The session dropped; the transport retries on its own.
    Disconnected { reason: String, attempt: u32 },
    Message(InboundMessage),
    /// The broker acknowledged the oldest outstanding QoS >= 1 publish.
    ///
    /// Exactly one event is emitted per acknowledged publish, in the
    /// order the publishes were issued.
    PublishAcked,
}

// ── Traits ───────────────────────────────────────────────────────────

/// One live broker session.
pub trait Transport: Send + 'static {
    fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), Error>;

    fn unsubscribe(&mut self, filter: &str) -> Result<(), Error>;

    fn publish(&mut self, topic: &str, payload: Bytes, qos: QoS, retain: bool)
    -> Result<(), Error>;

    /// Next event from the broker. Must be cancel-safe: dropping the
    /// future before completion loses nothing.
    ///
    /// A returned error is fatal; the session stops polling afterwards.
    fn next_event(&mut self) -> impl Future<Output = Result<TransportEvent, Error>> + Send;

    fn disconnect(&mut self) -> Result<(), Error>;
}

/// Opens transports for a broker family.
pub trait Connector: Send + Sync + 'static {
    type Transport: Transport;

    fn open(&self, options: ConnectOptions) -> Result<Self::Transport, Error>;
}

// ── Topic filters ────────────────────────────────────────────────────

/// MQTT topic-filter matching with `+` and `#` wildcards.
///
/// Topics starting with `$` never match a filter whose first level is
/// a wildcard.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) | (None, None) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            _ => return false,
        }
    }
}
