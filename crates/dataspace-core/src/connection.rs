// ── Connection ──
//
// Handle to one broker session. Cheaply cloneable; every clone talks to
// the same session task. Topics passed here are relative to the server
// and may carry a `$jsonpath` suffix.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dataspace_api::{ConnectOptions, Connector, Credentials, QoS};
use serde_json::Value;
use tokio::sync::{Mutex, OnceCell, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::address::{ServerAddress, split_jsonpath};
use crate::admin::{AdminClient, AdminResponse, RESPONSE_TOPIC, reply_listener};
use crate::cache::CachedPayload;
use crate::config::HubConfig;
use crate::correlation::PendingRequests;
use crate::directory::{DirEntry, directory_topic, parse_listing};
use crate::error::CoreError;
use crate::jsonpath::JsonPathExpr;
use crate::patch::PatchOutcome;
use crate::payload::{Delivery, Handler, Payload};
use crate::records::{Record, parse_records};
use crate::session::{GetSink, Session, SessionCommand, SessionStats};
use crate::stream::TopicStream;
use crate::timeindex::time_index_path;

const COMMAND_CHANNEL_SIZE: usize = 64;

// ── ConnectionState ──────────────────────────────────────────────────

/// Connection state observable by consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// The broker refused the credentials. Terminal.
    AuthenticationFailed { reason: String },
    /// Gave up connecting. Terminal.
    Failed { reason: String },
}

impl ConnectionState {
    /// Still trying: connecting or reconnecting.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting { .. })
    }

    /// The session has ended and will not recover.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Disconnected | Self::AuthenticationFailed { .. } | Self::Failed { .. }
        )
    }
}

// ── Connection ───────────────────────────────────────────────────────

/// One broker session with its cache and subscriptions.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    server: ServerAddress,
    client_id: String,
    config: HubConfig,
    command_tx: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    admin_replies: OnceCell<PendingRequests<AdminResponse>>,
    next_get_id: AtomicU64,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Connection {
    /// Open a transport to `server` and start its session task.
    ///
    /// Returns immediately; use [`wait_connected`](Self::wait_connected)
    /// to wait for the broker. Must be called within a Tokio runtime.
    pub fn open<C: Connector>(
        connector: &C,
        server: ServerAddress,
        credentials: Option<Credentials>,
        config: HubConfig,
    ) -> Result<Self, CoreError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| CoreError::Internal("connections need a Tokio runtime".into()))?;

        let client_id = config.new_client_id();
        let options = ConnectOptions {
            endpoint: server.endpoint(),
            client_id: client_id.clone(),
            credentials,
            keep_alive: config.keep_alive,
            max_packet_size: config.max_packet_size,
            reconnect: config.reconnect.clone(),
        };
        let transport = connector.open(options).map_err(|e| match CoreError::from(e) {
            CoreError::ConnectionFailed { reason, .. } => CoreError::ConnectionFailed {
                server: server.to_string(),
                reason,
            },
            other => other,
        })?;

        let (state_tx, state) = watch::channel(ConnectionState::Connecting);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let cancel = CancellationToken::new();

        let session = Session::new(
            transport,
            server.clone(),
            client_id.clone(),
            config.cache_capacity,
            state_tx,
        );
        let task = runtime.spawn(session.run(command_rx, config.patch_sweep_interval, cancel.clone()));
        info!(server = %server, client_id = %client_id, "session started");

        Ok(Self {
            inner: Arc::new(ConnectionInner {
                server,
                client_id,
                config,
                command_tx,
                state,
                cancel,
                task: Mutex::new(Some(task)),
                admin_replies: OnceCell::new(),
                next_get_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn server(&self) -> &ServerAddress {
        &self.inner.server
    }

    /// Client identity used on the broker (and in private topics).
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Whether both handles drive the same session.
    pub fn same_session(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Subscribe to connection state changes.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.clone()
    }

    /// Wait until the broker accepted the session.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), CoreError> {
        let server = self.inner.server.to_string();
        let mut state = self.inner.state.clone();
        let settled = tokio::time::timeout(timeout, state.wait_for(|s| !s.is_pending())).await;

        let current = match settled {
            Err(_) => {
                return Err(CoreError::ConnectionFailed {
                    server,
                    reason: format!("no broker session within {timeout:?}"),
                });
            }
            Ok(Err(_)) => return Err(CoreError::Disconnected),
            Ok(Ok(current)) => current.clone(),
        };

        match current {
            ConnectionState::Connected => Ok(()),
            ConnectionState::AuthenticationFailed { reason } => {
                Err(CoreError::AuthenticationFailed { message: reason })
            }
            ConnectionState::Failed { reason } => Err(CoreError::ConnectionFailed { server, reason }),
            ConnectionState::Disconnected
            | ConnectionState::Connecting
            | ConnectionState::Reconnecting { .. } => Err(CoreError::Disconnected),
        }
    }

    /// Stop the session and disconnect. Outstanding gets and patches end.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Some(task) = self.inner.task.lock().await.take() {
            let _ = task.await;
        }
        debug!(server = %self.inner.server, "connection shut down");
    }

    async fn request<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> SessionCommand,
    ) -> Result<R, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .command_tx
            .send(build(tx))
            .await
            .map_err(|_| CoreError::Disconnected)?;
        rx.await.map_err(|_| CoreError::Disconnected)
    }

    // ── Subscriptions ────────────────────────────────────────────────

    /// Register `handler` for `topic` (optionally `topic$path`).
    ///
    /// The handler immediately receives the cached value, if any, then
    /// every delivery. Handlers run on the session task and must not
    /// block. Returns `false` if this handler and path were already
    /// registered.
    pub async fn subscribe(&self, topic: &str, handler: Handler) -> Result<bool, CoreError> {
        let (topic, path) = parse_topic(topic)?;
        self.request(|reply| SessionCommand::Subscribe {
            topic,
            path,
            handler,
            reply,
        })
        .await?
    }

    /// Remove a handler registration. Returns `false` if it was not found.
    pub async fn unsubscribe(&self, topic: &str, handler: &Handler) -> Result<bool, CoreError> {
        let (topic, path) = split_jsonpath(topic);
        let (topic, path) = (topic.to_owned(), path.map(str::to_owned));
        self.request(|reply| SessionCommand::Unsubscribe {
            topic,
            path,
            handler: handler.clone(),
            reply: Some(reply),
        })
        .await
    }

    /// Deliveries for `topic` as a stream; dropping it unsubscribes.
    pub async fn subscribe_stream(&self, topic: &str) -> Result<TopicStream, CoreError> {
        let (handler, rx) = TopicStream::channel();
        self.subscribe(topic, handler.clone()).await?;
        let (bare, path) = split_jsonpath(topic);
        Ok(TopicStream::new(
            rx,
            bare.to_owned(),
            path.map(str::to_owned),
            handler,
            self.inner.command_tx.clone(),
        ))
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// First delivery on `topic`, waiting up to `timeout`.
    ///
    /// A cached value counts as an immediate delivery. `Ok(None)` on
    /// timeout.
    pub async fn get(&self, topic: &str, timeout: Duration) -> Result<Option<Delivery>, CoreError> {
        let (topic_name, path) = parse_topic(topic)?;
        let (tx, rx) = oneshot::channel();
        let id = self.next_get_id();

        // Armed before the request so a cancelled caller still withdraws
        // the waiter.
        let guard = GetGuard {
            id,
            commands: self.inner.command_tx.clone(),
            armed: true,
        };
        self.request(|reply| SessionCommand::Get {
            id,
            topic: topic_name,
            path,
            sink: GetSink::Reply(tx),
            reply,
        })
        .await??;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(delivery)) => {
                guard.disarm();
                Ok(Some(delivery))
            }
            Ok(Err(_)) => Err(CoreError::Disconnected),
            Err(_) => {
                debug!(topic, ?timeout, "get timed out");
                Ok(None)
            }
        }
    }

    /// [`get`](Self::get), mapping the delivery through `f`.
    pub async fn get_with<T>(
        &self,
        topic: &str,
        timeout: Duration,
        f: impl FnOnce(Delivery) -> T,
    ) -> Result<Option<T>, CoreError> {
        Ok(self.get(topic, timeout).await?.map(f))
    }

    /// Non-blocking get: `handler` runs once, on the first delivery.
    pub async fn get_detached(&self, topic: &str, handler: Handler) -> Result<(), CoreError> {
        let (topic, path) = parse_topic(topic)?;
        let id = self.next_get_id();
        self.request(|reply| SessionCommand::Get {
            id,
            topic,
            path,
            sink: GetSink::Detached(handler),
            reply,
        })
        .await?
    }

    fn next_get_id(&self) -> u64 {
        self.inner.next_get_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Last cached payload of `topic`, without subscribing.
    pub async fn cached(&self, topic: &str) -> Result<Option<CachedPayload>, CoreError> {
        let topic = split_jsonpath(topic).0.to_owned();
        self.request(|reply| SessionCommand::Cached { topic, reply })
            .await
    }

    pub async fn stats(&self) -> Result<SessionStats, CoreError> {
        self.request(|reply| SessionCommand::Stats { reply }).await
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Publish `payload` to `topic`.
    ///
    /// With a `$path` suffix this is a patch: the value is written into
    /// the topic's current document when it next arrives (see
    /// [`patch`](Self::patch)), and this call returns without waiting.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Payload>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), CoreError> {
        let payload = payload.into();
        if let (bare, Some(path)) = split_jsonpath(topic) {
            self.patch(bare, path, payload.into_value()).await?;
            return Ok(());
        }

        self.request(|reply| SessionCommand::Publish {
            topic: topic.to_owned(),
            payload: payload.to_bytes(),
            qos,
            retain,
            reply,
        })
        .await??;
        Ok(())
    }

    /// Publish and wait until the broker acknowledged it (QoS 1 and 2;
    /// QoS 0 resolves once handed to the transport).
    pub async fn publish_confirmed(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        timeout: Duration,
    ) -> Result<(), CoreError> {
        let acked = self
            .request(|reply| SessionCommand::Publish {
                topic: topic.to_owned(),
                payload,
                qos,
                retain,
                reply,
            })
            .await??;

        match tokio::time::timeout(timeout, acked).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(CoreError::Disconnected),
            Err(_) => Err(CoreError::timeout(format!("publish to {topic}"), timeout)),
        }
    }

    /// Set `path` to `value` in the document at `topic`.
    ///
    /// The write happens on the next delivery of `topic` (immediately if
    /// a value is cached) and must happen before the configured patch
    /// deadline.
    pub async fn patch(&self, topic: &str, path: &str, value: Value) -> Result<PendingPatch, CoreError> {
        let path = JsonPathExpr::parse(path)?;
        let (outcome, rx) = oneshot::channel();
        self.inner
            .command_tx
            .send(SessionCommand::Patch {
                topic: topic.to_owned(),
                path,
                value,
                timeout: self.inner.config.patch_timeout,
                outcome,
            })
            .await
            .map_err(|_| CoreError::Disconnected)?;
        Ok(PendingPatch { rx })
    }

    /// Ask the server to link `topic` to `target`.
    pub async fn link(&self, topic: &str, target: &str) -> Result<(), CoreError> {
        self.publish(&format!("{topic}?link={target}"), Payload::Empty, QoS::AtMostOnce, false)
            .await
    }

    // ── Directories, search and history ──────────────────────────────

    /// Entries below `topic`. `Ok(None)` on timeout.
    pub async fn list(&self, topic: &str, timeout: Duration) -> Result<Option<Vec<DirEntry>>, CoreError> {
        let topic = directory_topic(topic);
        match self.get(&topic, timeout).await? {
            Some(delivery) => parse_listing(&topic, &delivery.payload).map(Some),
            None => Ok(None),
        }
    }

    /// Ask the server to search the base directory for `name`.
    pub async fn find(&self, name: &str, timeout: Duration) -> Result<Option<Delivery>, CoreError> {
        let topic = format!("{}/?find=\"{name}\"", self.inner.config.base_path);
        self.get(&topic, timeout).await
    }

    /// Hour bucket of `root` containing `epoch_secs`, in the configured zone.
    pub fn time_index_path(&self, root: &str, epoch_secs: i64) -> Result<String, CoreError> {
        time_index_path(root, epoch_secs, self.inner.config.time_zone)
    }

    pub async fn get_log_at(
        &self,
        root: &str,
        epoch_secs: i64,
        timeout: Duration,
    ) -> Result<Option<Delivery>, CoreError> {
        let topic = self.time_index_path(root, epoch_secs)?;
        self.get(&topic, timeout).await
    }

    pub async fn list_files_at(
        &self,
        root: &str,
        epoch_secs: i64,
        timeout: Duration,
    ) -> Result<Option<Vec<DirEntry>>, CoreError> {
        let topic = self.time_index_path(root, epoch_secs)?;
        self.list(&topic, timeout).await
    }

    /// JSON-lines log at `topic`, decoded.
    pub async fn get_records(&self, topic: &str, timeout: Duration) -> Result<Option<Vec<Record>>, CoreError> {
        match self.get(topic, timeout).await? {
            Some(delivery) => parse_records(&delivery.topic, &delivery.payload).map(Some),
            None => Ok(None),
        }
    }

    pub async fn get_records_at(
        &self,
        root: &str,
        epoch_secs: i64,
        timeout: Duration,
    ) -> Result<Option<Vec<Record>>, CoreError> {
        let topic = self.time_index_path(root, epoch_secs)?;
        self.get_records(&topic, timeout).await
    }

    // ── Control plane ────────────────────────────────────────────────

    /// Dynamic-security client; the reply listener is set up once per
    /// connection.
    pub async fn admin(&self) -> Result<AdminClient, CoreError> {
        let pending = self
            .inner
            .admin_replies
            .get_or_try_init(|| async {
                let pending = PendingRequests::new();
                self.subscribe(RESPONSE_TOPIC, reply_listener(pending.clone()))
                    .await?;
                Ok::<_, CoreError>(pending)
            })
            .await?
            .clone();
        Ok(AdminClient::new(self.clone(), pending))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("server", &self.inner.server)
            .field("client_id", &self.inner.client_id)
            .field("state", &*self.inner.state.borrow())
            .finish_non_exhaustive()
    }
}

/// Split `topic$path` and compile the path.
fn parse_topic(topic: &str) -> Result<(String, Option<JsonPathExpr>), CoreError> {
    let (topic, path) = split_jsonpath(topic);
    let path = path.map(JsonPathExpr::parse).transpose()?;
    Ok((topic.to_owned(), path))
}

/// Withdraws an abandoned get waiter.
struct GetGuard {
    id: u64,
    commands: mpsc::Sender<SessionCommand>,
    armed: bool,
}

impl GetGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for GetGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.commands.try_send(SessionCommand::CancelGet { id: self.id }) {
            Err(mpsc::error::TrySendError::Full(command)) => {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let commands = self.commands.clone();
                    runtime.spawn(async move {
                        let _ = commands.send(command).await;
                    });
                }
            }
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// An armed patch. Await [`outcome`](Self::outcome) to learn how it
/// ended, or drop it to let it run unobserved.
#[derive(Debug)]
pub struct PendingPatch {
    rx: oneshot::Receiver<PatchOutcome>,
}

impl PendingPatch {
    pub async fn outcome(self) -> PatchOutcome {
        self.rx.await.unwrap_or_else(|_| PatchOutcome::Failed {
            reason: "connection closed".into(),
        })
    }
}
