//! In-process loopback broker.
//!
//! [`MemoryBroker`] implements just enough broker behavior for offline use
//! and tests: topic filters with wildcards, retained messages replayed on
//! subscribe, per-publish acknowledgements, and optional username/password
//! checks. Every [`MemoryTransport`] opened from it is an independent
//! client session.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use secrecy::ExposeSecret;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::Error;
use crate::transport::{
    ConnectOptions, Connector, InboundMessage, QoS, Transport, TransportEvent, topic_matches,
};

type EventSender = mpsc::UnboundedSender<Result<TransportEvent, Error>>;
type EventReceiver = mpsc::UnboundedReceiver<Result<TransportEvent, Error>>;

// ── Broker ───────────────────────────────────────────────────────────

/// Shared handle to an in-process broker. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    retained: BTreeMap<String, Bytes>,
    sessions: HashMap<u64, Session>,
    users: HashMap<String, String>,
    next_session: u64,
}

struct Session {
    client_id: String,
    filters: Vec<(String, QoS)>,
    events: EventSender,
}

impl Session {
    /// Highest QoS granted by any filter matching `topic`.
    fn granted(&self, topic: &str) -> Option<QoS> {
        self.filters
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, qos)| *qos)
            .max()
    }

    fn emit(&self, event: TransportEvent) -> bool {
        self.events.send(Ok(event)).is_ok()
    }
}

impl BrokerState {
    fn route(&mut self, topic: &str, payload: &Bytes, qos: QoS, retain: bool) {
        if retain {
            if payload.is_empty() {
                self.retained.remove(topic);
            } else {
                self.retained.insert(topic.to_owned(), payload.clone());
            }
        }

        // Sessions whose receiver is gone are dropped on the way.
        self.sessions.retain(|_, session| {
            let Some(granted) = session.granted(topic) else {
                return true;
            };
            trace!(client_id = %session.client_id, topic, "routing message");
            session.emit(TransportEvent::Message(InboundMessage {
                topic: topic.to_owned(),
                payload: payload.clone(),
                retain: false,
                qos: qos.min(granted),
            }))
        });
    }

    fn authorize(&self, options: &ConnectOptions) -> bool {
        if self.users.is_empty() {
            return true;
        }
        options.credentials.as_ref().is_some_and(|credentials| {
            self.users
                .get(&credentials.username)
                .is_some_and(|password| password == credentials.password.expose_secret())
        })
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require credentials; once any user exists, anonymous and unknown
    /// clients are refused.
    pub fn with_user(self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.lock().users.insert(username.into(), password.into());
        self
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a client session.
    ///
    /// The returned transport yields [`TransportEvent::Connected`] first,
    /// or an authentication error if the credentials are refused.
    pub fn connect(&self, options: &ConnectOptions) -> MemoryTransport {
        let (tx, events) = mpsc::unbounded_channel();
        let mut state = self.lock();

        if !state.authorize(options) {
            debug!(client_id = %options.client_id, "refusing client credentials");
            let _ = tx.send(Err(Error::Authentication {
                message: "bad username or password".into(),
            }));
            return MemoryTransport {
                broker: self.clone(),
                session: None,
                events,
            };
        }

        let id = state.next_session;
        state.next_session += 1;
        let _ = tx.send(Ok(TransportEvent::Connected));
        state.sessions.insert(
            id,
            Session {
                client_id: options.client_id.clone(),
                filters: Vec::new(),
                events: tx,
            },
        );
        debug!(client_id = %options.client_id, session = id, "client connected");

        MemoryTransport {
            broker: self.clone(),
            session: Some(id),
            events,
        }
    }

    /// Publish as an out-of-band client (QoS 0).
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>, retain: bool) {
        self.lock()
            .route(topic, &payload.into(), QoS::AtMostOnce, retain);
    }

    /// Stored retained payload for `topic`.
    pub fn retained(&self, topic: &str) -> Option<Bytes> {
        self.lock().retained.get(topic).cloned()
    }

    /// Filters currently held by every session of `client_id`.
    pub fn subscriptions(&self, client_id: &str) -> Vec<String> {
        let state = self.lock();
        let mut filters: Vec<String> = state
            .sessions
            .values()
            .filter(|session| session.client_id == client_id)
            .flat_map(|session| session.filters.iter().map(|(filter, _)| filter.clone()))
            .collect();
        filters.sort();
        filters
    }

    /// Ids of every connected client.
    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .sessions
            .values()
            .map(|session| session.client_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Simulate a dropped connection for `client_id`: its subscriptions
    /// are lost and the client sees a disconnect followed by a reconnect.
    pub fn bounce(&self, client_id: &str) {
        let mut state = self.lock();
        for session in state
            .sessions
            .values_mut()
            .filter(|session| session.client_id == client_id)
        {
            session.filters.clear();
            session.emit(TransportEvent::Disconnected {
                reason: "connection reset".into(),
                attempt: 0,
            });
            session.emit(TransportEvent::Connected);
        }
    }
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("MemoryBroker")
            .field("sessions", &state.sessions.len())
            .field("retained", &state.retained.len())
            .finish_non_exhaustive()
    }
}

impl Connector for MemoryBroker {
    type Transport = MemoryTransport;

    fn open(&self, options: ConnectOptions) -> Result<MemoryTransport, Error> {
        Ok(self.connect(&options))
    }
}

// ── Transport ────────────────────────────────────────────────────────

/// One client session on a [`MemoryBroker`].
pub struct MemoryTransport {
    broker: MemoryBroker,
    session: Option<u64>,
    events: EventReceiver,
}

impl MemoryTransport {
    fn with_session<T>(
        &self,
        f: impl FnOnce(&mut BrokerState, u64) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let id = self.session.ok_or(Error::Closed)?;
        let mut state = self.broker.lock();
        if !state.sessions.contains_key(&id) {
            return Err(Error::Closed);
        }
        f(&mut *state, id)
    }
}

impl Transport for MemoryTransport {
    fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), Error> {
        self.with_session(|state, id| {
            let BrokerState {
                retained, sessions, ..
            } = state;
            let session = sessions.get_mut(&id).ok_or(Error::Closed)?;

            match session.filters.iter_mut().find(|(f, _)| f == filter) {
                Some(existing) => existing.1 = qos,
                None => session.filters.push((filter.to_owned(), qos)),
            }

            for (topic, payload) in retained.iter().filter(|(t, _)| topic_matches(filter, t)) {
                session.emit(TransportEvent::Message(InboundMessage {
                    topic: topic.clone(),
                    payload: payload.clone(),
                    retain: true,
                    qos,
                }));
            }
            Ok(())
        })
    }

    fn unsubscribe(&mut self, filter: &str) -> Result<(), Error> {
        self.with_session(|state, id| {
            if let Some(session) = state.sessions.get_mut(&id) {
                session.filters.retain(|(f, _)| f != filter);
            }
            Ok(())
        })
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), Error> {
        self.with_session(|state, id| {
            state.route(topic, &payload, qos, retain);
            if qos.is_acknowledged() {
                if let Some(session) = state.sessions.get(&id) {
                    session.emit(TransportEvent::PublishAcked);
                }
            }
            Ok(())
        })
    }

    async fn next_event(&mut self) -> Result<TransportEvent, Error> {
        self.events.recv().await.unwrap_or(Err(Error::Closed))
    }

    fn disconnect(&mut self) -> Result<(), Error> {
        if let Some(id) = self.session.take() {
            self.broker.lock().sessions.remove(&id);
            debug!(session = id, "client disconnected");
        }
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}
