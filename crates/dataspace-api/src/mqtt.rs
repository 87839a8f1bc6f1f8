//! MQTT 3.1.1 transport with auto-reconnect.
//!
//! Wraps a [`rumqttc`] client. The event loop runs in a background task
//! that forwards broker traffic over a channel, so [`MqttTransport::next_event`]
//! is cancel-safe. Connection errors are retried with exponential
//! backoff + jitter; refused credentials end the session.

use std::time::Duration;

use bytes::Bytes;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions,
    Outgoing, Packet,
};
use secrecy::ExposeSecret;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::transport::{
    ConnectOptions, Connector, InboundMessage, QoS, Scheme, Transport, TransportEvent,
};

// ── Request channel capacity ─────────────────────────────────────────

const REQUEST_CHANNEL_CAPACITY: usize = 256;

/// How long a graceful disconnect may take before the loop is torn down.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff configuration for broker reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

// ── Connector ────────────────────────────────────────────────────────

/// Opens [`MqttTransport`]s. Requires a running tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttConnector;

impl Connector for MqttConnector {
    type Transport = MqttTransport;

    fn open(&self, options: ConnectOptions) -> Result<MqttTransport, Error> {
        MqttTransport::open(options)
    }
}

// ── MqttTransport ────────────────────────────────────────────────────

/// A live MQTT session.
pub struct MqttTransport {
    client: AsyncClient,
    events: mpsc::UnboundedReceiver<Result<TransportEvent, Error>>,
    cancel: CancellationToken,
    closing: bool,
}

impl MqttTransport {
    /// Build the client and spawn the background event loop.
    ///
    /// Returns immediately; the first connection attempt happens in the
    /// background and is reported as [`TransportEvent::Connected`].
    pub fn open(options: ConnectOptions) -> Result<Self, Error> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Connect(format!("no async runtime: {e}")))?;

        let mqtt_options = build_options(&options)?;
        let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        let (event_tx, events) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        info!(endpoint = %options.endpoint, client_id = %options.client_id, "opening MQTT session");
        runtime.spawn(event_loop(
            eventloop,
            event_tx,
            options.reconnect,
            cancel.clone(),
        ));

        Ok(Self {
            client,
            events,
            cancel,
            closing: false,
        })
    }
}

impl Transport for MqttTransport {
    fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), Error> {
        self.client
            .try_subscribe(filter, to_mqtt_qos(qos))
            .map_err(request_error)
    }

    fn unsubscribe(&mut self, filter: &str) -> Result<(), Error> {
        self.client.try_unsubscribe(filter).map_err(request_error)
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), Error> {
        self.client
            .try_publish(topic, to_mqtt_qos(qos), retain, payload.to_vec())
            .map_err(request_error)
    }

    async fn next_event(&mut self) -> Result<TransportEvent, Error> {
        self.events.recv().await.unwrap_or(Err(Error::Closed))
    }

    fn disconnect(&mut self) -> Result<(), Error> {
        self.closing = true;
        let sent = self.client.try_disconnect().map_err(request_error);

        // The loop exits on its own once DISCONNECT is flushed; this
        // bounds the wait when the broker is unreachable.
        let cancel = self.cancel.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    tokio::time::sleep(DISCONNECT_GRACE).await;
                    cancel.cancel();
                });
            }
            Err(_) => cancel.cancel(),
        }
        sent
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if !self.closing {
            self.cancel.cancel();
        }
    }
}

// ── Background event loop ────────────────────────────────────────────

/// Main loop: poll → forward → on error, backoff → reconnect.
async fn event_loop(
    mut eventloop: EventLoop,
    event_tx: mpsc::UnboundedSender<Result<TransportEvent, Error>>,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        let polled = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(packet)) => {
                let Some(event) = translate(packet) else {
                    continue;
                };
                if event == TransportEvent::Connected {
                    info!("MQTT session established");
                    attempt = 0;
                }
                if event_tx.send(Ok(event)).is_err() {
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent");
                break;
            }
            Ok(Event::Outgoing(_)) => {}
            Err(e) => {
                if let Some(message) = refused_credentials(&e) {
                    warn!(%message, "broker refused credentials");
                    let _ = event_tx.send(Err(Error::Authentication { message }));
                    break;
                }

                if let Some(max) = reconnect.max_retries {
                    if attempt >= max {
                        tracing::error!(max_retries = max, "MQTT reconnection limit reached, giving up");
                        let _ = event_tx.send(Err(Error::RetriesExhausted {
                            attempts: attempt,
                            reason: e.to_string(),
                        }));
                        break;
                    }
                }

                warn!(error = %e, attempt, "MQTT connection error");
                let disconnected = TransportEvent::Disconnected {
                    reason: e.to_string(),
                    attempt,
                };
                if event_tx.send(Ok(disconnected)).is_err() {
                    break;
                }

                let delay = calculate_backoff(attempt, &reconnect);
                info!(
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    attempt,
                    "waiting before reconnect"
                );

                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }

                attempt = attempt.saturating_add(1);
            }
        }
    }

    debug!("MQTT event loop exiting");
}

fn translate(packet: Packet) -> Option<TransportEvent> {
    match packet {
        Packet::ConnAck(_) => Some(TransportEvent::Connected),
        Packet::Publish(publish) => Some(TransportEvent::Message(InboundMessage {
            topic: publish.topic,
            payload: publish.payload,
            retain: publish.retain,
            qos: from_mqtt_qos(publish.qos),
        })),
        Packet::PubAck(_) | Packet::PubComp(_) => Some(TransportEvent::PublishAcked),
        _ => None,
    }
}

fn refused_credentials(error: &ConnectionError) -> Option<String> {
    match error {
        ConnectionError::ConnectionRefused(
            code @ (ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized),
        ) => Some(format!("connection refused: {code:?}")),
        _ => None,
    }
}

// ── Option building ──────────────────────────────────────────────────

fn build_options(options: &ConnectOptions) -> Result<MqttOptions, Error> {
    let endpoint = &options.endpoint;
    if matches!(endpoint.scheme, Scheme::Ws | Scheme::Wss) {
        return Err(Error::UnsupportedScheme(endpoint.scheme.to_string()));
    }
    if endpoint.host.is_empty() {
        return Err(Error::InvalidEndpoint("empty host".into()));
    }
    if options.client_id.is_empty() || options.client_id.starts_with(' ') {
        return Err(Error::InvalidEndpoint(format!(
            "invalid client id {:?}",
            options.client_id
        )));
    }

    let mut mqtt = MqttOptions::new(
        options.client_id.clone(),
        endpoint.host.clone(),
        endpoint.port,
    );

    let keep_alive = if options.keep_alive.is_zero() {
        options.keep_alive
    } else {
        options.keep_alive.max(Duration::from_secs(1))
    };
    mqtt.set_keep_alive(keep_alive)
        .set_clean_session(true)
        .set_max_packet_size(options.max_packet_size, options.max_packet_size);

    if let Some(credentials) = &options.credentials {
        mqtt.set_credentials(
            credentials.username.clone(),
            credentials.password.expose_secret().to_owned(),
        );
    }

    if endpoint.scheme.is_tls() {
        mqtt.set_transport(rumqttc::Transport::tls_with_default_config());
    }

    Ok(mqtt)
}

fn to_mqtt_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

fn from_mqtt_qos(qos: rumqttc::QoS) -> QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
        rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

#[allow(clippy::needless_pass_by_value)]
fn request_error(e: ClientError) -> Error {
    Error::Request(e.to_string())
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Exponential backoff with a small deterministic jitter.
fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = i32::try_from(attempt.min(31)).unwrap_or(31);
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = base.min(config.max_delay.as_secs_f64());

    // Seeded from the attempt number so retries from many clients spread out.
    let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    let with_jitter = (capped * jitter_factor).max(0.0);

    Duration::from_secs_f64(with_jitter)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transport::{Credentials, Endpoint};

    fn options(scheme: Scheme) -> ConnectOptions {
        ConnectOptions {
            endpoint: Endpoint {
                scheme,
                host: "broker.local".into(),
                port: scheme.default_port(),
            },
            client_id: "client-test".into(),
            credentials: Some(Credentials::new("alice", "secret")),
            keep_alive: Duration::from_secs(60),
            max_packet_size: 1024 * 1024,
            reconnect: ReconnectConfig::default(),
        }
    }

    #[test]
    fn default_reconnect_config() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!(config.max_retries.is_none());
    }

    #[test]
    fn backoff_increases_exponentially() {
        let config = ReconnectConfig::default();

        let d0 = calculate_backoff(0, &config);
        let d1 = calculate_backoff(1, &config);
        let d2 = calculate_backoff(2, &config);

        assert!(d1 > d0, "d1 ({d1:?}) should be greater than d0 ({d0:?})");
        assert!(d2 > d1, "d2 ({d2:?}) should be greater than d1 ({d1:?})");
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_retries: None,
        };

        // Jitter factor tops out at 1.25.
        let d = calculate_backoff(u32::MAX, &config);
        assert!(d <= Duration::from_millis(12_500), "{d:?}");
    }

    #[test]
    fn websocket_schemes_are_unsupported() {
        let err = build_options(&options(Scheme::Ws)).err();
        assert!(matches!(err, Some(Error::UnsupportedScheme(s)) if s == "ws"));
    }

    #[test]
    fn rejects_blank_client_id() {
        let mut opts = options(Scheme::Mqtt);
        opts.client_id = String::new();
        assert!(matches!(
            build_options(&opts),
            Err(Error::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn builds_plain_and_tls_options() {
        let plain = build_options(&options(Scheme::Mqtt)).unwrap();
        assert_eq!(plain.broker_address(), ("broker.local".to_owned(), 1883));
        assert_eq!(plain.client_id(), "client-test");

        let tls = build_options(&options(Scheme::Mqtts)).unwrap();
        assert_eq!(tls.broker_address().1, 8883);
    }

    #[test]
    fn translates_publish_packets() {
        let mut publish = rumqttc::Publish::new("a/b", rumqttc::QoS::AtLeastOnce, b"42".to_vec());
        publish.retain = true;

        let event = translate(Packet::Publish(publish));
        assert_eq!(
            event,
            Some(TransportEvent::Message(InboundMessage {
                topic: "a/b".into(),
                payload: Bytes::from_static(b"42"),
                retain: true,
                qos: QoS::AtLeastOnce,
            }))
        );
    }

    #[test]
    fn translates_acks() {
        assert_eq!(
            translate(Packet::PubAck(rumqttc::PubAck::new(7))),
            Some(TransportEvent::PublishAcked)
        );
        assert_eq!(translate(Packet::PingResp), None);
    }

    #[test]
    fn bad_credentials_are_fatal() {
        let refused = ConnectionError::ConnectionRefused(ConnectReturnCode::BadUserNamePassword);
        assert!(refused_credentials(&refused).is_some());

        let unavailable = ConnectionError::ConnectionRefused(ConnectReturnCode::ServiceUnavailable);
        assert!(refused_credentials(&unavailable).is_none());
    }
}
