// ── Session task ──
//
// One task per connection owns the transport, the subscription table,
// the cache, get waiters, pending patches and the publish-ack queue.
// Callers talk to it through `SessionCommand` envelopes; deliveries are
// handled one at a time in arrival order.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use bytes::Bytes;
use dataspace_api::{InboundMessage, QoS, Transport, TransportEvent};
use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::address::{ServerAddress, private_topic, strip_private};
use crate::cache::{CachedPayload, PayloadCache};
use crate::connection::ConnectionState;
use crate::error::CoreError;
use crate::jsonpath::JsonPathExpr;
use crate::patch::{self, PatchOperation, PatchOutcome};
use crate::payload::{Delivery, Handler, MessageKind, Payload};
use crate::subscription::{Added, Entry, Removed, Subscriber, SubscriptionTable};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

// ── Commands ─────────────────────────────────────────────────────────

/// Where a `get` delivers its single value.
pub(crate) enum GetSink {
    /// A blocked caller.
    Reply(oneshot::Sender<Delivery>),
    /// Fire-and-forget callback.
    Detached(Handler),
}

pub(crate) enum SessionCommand {
    Subscribe {
        topic: String,
        path: Option<JsonPathExpr>,
        handler: Handler,
        reply: oneshot::Sender<Result<bool, CoreError>>,
    },
    Unsubscribe {
        topic: String,
        path: Option<String>,
        handler: Handler,
        reply: Option<oneshot::Sender<bool>>,
    },
    /// `id` is chosen by the caller so it can withdraw the waiter even
    /// before this command is answered.
    Get {
        id: u64,
        topic: String,
        path: Option<JsonPathExpr>,
        sink: GetSink,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    CancelGet {
        id: u64,
    },
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        /// Resolves with a receiver that fires once the broker has the message.
        reply: oneshot::Sender<Result<oneshot::Receiver<()>, CoreError>>,
    },
    Patch {
        topic: String,
        path: JsonPathExpr,
        value: Value,
        timeout: Duration,
        outcome: oneshot::Sender<PatchOutcome>,
    },
    Cached {
        topic: String,
        reply: oneshot::Sender<Option<CachedPayload>>,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
}

/// Point-in-time counters of a connection's session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub subscribed_topics: usize,
    pub pending_gets: usize,
    pub pending_patches: usize,
    pub cached_topics: usize,
    pub unconfirmed_publishes: usize,
}

// ── Session state ────────────────────────────────────────────────────

struct Waiter {
    topic: String,
    path: Option<String>,
    sink: GetSink,
}

struct PendingPatch {
    op: PatchOperation,
    outcome: oneshot::Sender<PatchOutcome>,
}

enum Step {
    Event(Result<TransportEvent, dataspace_api::Error>),
    Command(SessionCommand),
    Sweep,
    Shutdown,
}

pub(crate) struct Session<T: Transport> {
    transport: T,
    server: ServerAddress,
    client_id: String,
    table: SubscriptionTable,
    cache: PayloadCache,
    waiters: HashMap<u64, Waiter>,
    patches: IndexMap<String, Vec<PendingPatch>>,
    acks: VecDeque<oneshot::Sender<()>>,
    state: watch::Sender<ConnectionState>,
    resubscribe: bool,
    next_id: u64,
}

impl<T: Transport> Session<T> {
    pub fn new(
        transport: T,
        server: ServerAddress,
        client_id: String,
        cache_capacity: usize,
        state: watch::Sender<ConnectionState>,
    ) -> Self {
        Self {
            transport,
            server,
            client_id,
            table: SubscriptionTable::default(),
            cache: PayloadCache::new(cache_capacity),
            waiters: HashMap::new(),
            patches: IndexMap::new(),
            acks: VecDeque::new(),
            state,
            resubscribe: false,
            next_id: 0,
        }
    }

    /// Drive the session until cancelled, the last handle is dropped, or
    /// the transport fails for good.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        sweep_every: Duration,
        cancel: CancellationToken,
    ) {
        let mut sweep = tokio::time::interval(sweep_every.max(MIN_SWEEP_INTERVAL));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                biased;
                () = cancel.cancelled() => Step::Shutdown,
                event = self.transport.next_event() => Step::Event(event),
                command = commands.recv() => command.map_or(Step::Shutdown, Step::Command),
                _ = sweep.tick() => Step::Sweep,
            };

            match step {
                Step::Event(Ok(event)) => self.handle_event(event),
                Step::Event(Err(e)) => {
                    self.fail(&e);
                    break;
                }
                Step::Command(command) => self.handle_command(command),
                Step::Sweep => self.sweep(Instant::now()),
                Step::Shutdown => {
                    self.close();
                    break;
                }
            }
        }

        debug!(server = %self.server, "session exiting");
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    // ── Transport events ─────────────────────────────────────────────

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                if self.resubscribe {
                    let topics: Vec<String> = self.table.topics().map(str::to_owned).collect();
                    info!(server = %self.server, topics = topics.len(), "resubscribing after reconnect");
                    for topic in &topics {
                        if let Err(e) = self.subscribe_transport(topic) {
                            warn!(topic = %topic, error = %e, "resubscribe failed");
                        }
                    }
                    self.resubscribe = false;
                }
                self.state.send_replace(ConnectionState::Connected);
            }
            TransportEvent::Disconnected { reason, attempt } => {
                warn!(server = %self.server, %reason, attempt, "broker connection lost");
                self.resubscribe = true;
                // Confirmations in flight are lost with the session.
                self.acks.clear();
                self.state.send_replace(ConnectionState::Reconnecting {
                    attempt: attempt.saturating_add(1),
                });
            }
            TransportEvent::Message(message) => self.on_message(message),
            TransportEvent::PublishAcked => {
                if let Some(ack) = self.acks.pop_front() {
                    let _ = ack.send(());
                }
            }
        }
    }

    fn on_message(&mut self, message: InboundMessage) {
        let (topic, kind) = match strip_private(&self.client_id, &message.topic) {
            Some(topic) => (topic.to_owned(), MessageKind::Private),
            None if message.retain => (message.topic.clone(), MessageKind::Retained),
            None => (message.topic.clone(), MessageKind::Public),
        };
        trace!(topic = %topic, %kind, bytes = message.payload.len(), "delivery");

        self.cache.insert(&topic, message.payload.clone(), kind);

        let raw = Payload::Bytes(message.payload);
        let mut has_patches = false;
        for entry in self.table.entries(&topic) {
            if matches!(entry.subscriber, Subscriber::Patch(_)) {
                has_patches = true;
            } else {
                self.dispatch(&topic, &entry, &raw, kind);
            }
        }
        if has_patches {
            self.run_patches(&topic, &raw);
        }
    }

    /// Hand one value to one handler or waiter, applying its filter.
    fn dispatch(&mut self, topic: &str, entry: &Entry, raw: &Payload, kind: MessageKind) {
        let payload = match &entry.path {
            Some(path) => path.filter(raw),
            None => raw.clone(),
        };
        let delivery = Delivery {
            url: self.server.url_for(topic),
            topic: topic.to_owned(),
            payload,
            kind,
        };

        match &entry.subscriber {
            Subscriber::Handler(handler) => invoke(handler, &delivery),
            Subscriber::Waiter(id) => self.complete_waiter(*id, delivery),
            Subscriber::Patch(_) => self.run_patches(topic, raw),
        }
    }

    fn complete_waiter(&mut self, id: u64, delivery: Delivery) {
        let Some(waiter) = self.waiters.remove(&id) else {
            return;
        };
        self.unregister(&waiter.topic, &Subscriber::Waiter(id), waiter.path.as_deref());

        match waiter.sink {
            GetSink::Reply(tx) => {
                let _ = tx.send(delivery);
            }
            GetSink::Detached(handler) => invoke(&handler, &delivery),
        }
    }

    // ── Commands ─────────────────────────────────────────────────────

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Subscribe {
                topic,
                path,
                handler,
                reply,
            } => {
                let entry = Entry {
                    subscriber: Subscriber::Handler(handler),
                    path,
                };
                let _ = reply.send(self.register(&topic, entry));
            }
            SessionCommand::Unsubscribe {
                topic,
                path,
                handler,
                reply,
            } => {
                let removed = self.unregister(&topic, &Subscriber::Handler(handler), path.as_deref());
                if let Some(reply) = reply {
                    let _ = reply.send(removed);
                }
            }
            SessionCommand::Get {
                id,
                topic,
                path,
                sink,
                reply,
            } => {
                let _ = reply.send(self.start_get(id, &topic, path, sink));
            }
            SessionCommand::CancelGet { id } => {
                if let Some(waiter) = self.waiters.remove(&id) {
                    debug!(topic = %waiter.topic, "get abandoned");
                    self.unregister(&waiter.topic, &Subscriber::Waiter(id), waiter.path.as_deref());
                }
            }
            SessionCommand::Publish {
                topic,
                payload,
                qos,
                retain,
                reply,
            } => {
                let _ = reply.send(self.publish(&topic, payload, qos, retain));
            }
            SessionCommand::Patch {
                topic,
                path,
                value,
                timeout,
                outcome,
            } => self.start_patch(&topic, path, value, timeout, outcome),
            SessionCommand::Cached { topic, reply } => {
                let _ = reply.send(self.cache.get(&topic).cloned());
            }
            SessionCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    /// Add an entry; the first entry of a topic subscribes at the broker.
    /// A new entry on an already-subscribed topic immediately receives the
    /// cached value. A fresh broker subscription redelivers retained values
    /// itself, so only an unechoed local write is replayed then.
    fn register(&mut self, topic: &str, entry: Entry) -> Result<bool, CoreError> {
        let first = match self.table.insert(topic, entry.clone()) {
            Added::Duplicate => return Ok(false),
            Added::First => {
                if let Err(e) = self.subscribe_transport(topic) {
                    let path = entry.path.as_ref().map(JsonPathExpr::as_str);
                    self.table.remove(topic, &entry.subscriber, path);
                    return Err(e.into());
                }
                debug!(topic, "subscribed");
                true
            }
            Added::Appended => false,
        };

        let replay = self
            .cache
            .get(topic)
            .filter(|cached| !first || cached.kind == MessageKind::PendingUpdate)
            .map(|cached| Payload::Bytes(cached.payload.clone()));
        if let Some(raw) = replay {
            self.dispatch(topic, &entry, &raw, MessageKind::Cached);
        }
        Ok(true)
    }

    /// Remove an entry; emptying a topic unsubscribes at the broker.
    fn unregister(&mut self, topic: &str, subscriber: &Subscriber, path: Option<&str>) -> bool {
        match self.table.remove(topic, subscriber, path) {
            Removed::NotFound => false,
            Removed::Remaining => true,
            Removed::Emptied => {
                let private = private_topic(&self.client_id, topic);
                for filter in [topic, private.as_str()] {
                    if let Err(e) = self.transport.unsubscribe(filter) {
                        warn!(topic = filter, error = %e, "unsubscribe failed");
                    }
                }
                debug!(topic, "unsubscribed");
                true
            }
        }
    }

    fn subscribe_transport(&mut self, topic: &str) -> Result<(), dataspace_api::Error> {
        self.transport.subscribe(topic, QoS::AtMostOnce)?;
        self.transport
            .subscribe(&private_topic(&self.client_id, topic), QoS::AtMostOnce)
    }

    fn start_get(
        &mut self,
        id: u64,
        topic: &str,
        path: Option<JsonPathExpr>,
        sink: GetSink,
    ) -> Result<(), CoreError> {
        self.waiters.insert(
            id,
            Waiter {
                topic: topic.to_owned(),
                path: path.as_ref().map(|p| p.as_str().to_owned()),
                sink,
            },
        );

        let entry = Entry {
            subscriber: Subscriber::Waiter(id),
            path,
        };
        if let Err(e) = self.register(topic, entry) {
            self.waiters.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<oneshot::Receiver<()>, CoreError> {
        self.transport.publish(topic, payload.clone(), qos, retain)?;
        // `$` topics are broker system topics, not data.
        if !topic.starts_with('$') {
            self.cache.insert(topic, payload, MessageKind::PendingUpdate);
        }
        trace!(topic, %qos, retain, "published");

        let (tx, rx) = oneshot::channel();
        if qos.is_acknowledged() {
            self.acks.push_back(tx);
        } else {
            let _ = tx.send(());
        }
        Ok(rx)
    }

    // ── Patches ──────────────────────────────────────────────────────

    fn start_patch(
        &mut self,
        topic: &str,
        path: JsonPathExpr,
        value: Value,
        timeout: Duration,
        outcome: oneshot::Sender<PatchOutcome>,
    ) {
        let id = self.next_id();
        debug!(topic, path = %path, "patch armed");
        self.patches.entry(topic.to_owned()).or_default().push(PendingPatch {
            op: PatchOperation {
                id,
                path,
                value,
                deadline: Instant::now() + timeout,
            },
            outcome,
        });

        let entry = Entry {
            subscriber: Subscriber::Patch(id),
            path: None,
        };
        if let Err(e) = self.register(topic, entry) {
            self.finish_patches(
                topic,
                &[id],
                &HashMap::from([(
                    id,
                    PatchOutcome::Failed {
                        reason: e.to_string(),
                    },
                )]),
            );
        }
    }

    /// Apply every armed patch of `topic` to `current`, publish the
    /// result once, and retire the operations.
    fn run_patches(&mut self, topic: &str, current: &Payload) {
        let Some(pending) = self.patches.get(topic) else {
            return;
        };
        let ops: Vec<PatchOperation> = pending.iter().map(|p| p.op.clone()).collect();
        let run = patch::apply(current, &ops, Instant::now());
        let mut outcomes: HashMap<u64, PatchOutcome> = run.outcomes.into_iter().collect();

        if let Some(document) = run.document {
            let bytes = Bytes::from(document.to_string());
            match self.transport.publish(topic, bytes.clone(), QoS::AtMostOnce, false) {
                Ok(()) => self.cache.insert(topic, bytes, MessageKind::PendingUpdate),
                Err(e) => {
                    warn!(topic, error = %e, "publishing patched document failed");
                    for outcome in outcomes.values_mut() {
                        if *outcome == PatchOutcome::Applied {
                            *outcome = PatchOutcome::Failed {
                                reason: e.to_string(),
                            };
                        }
                    }
                }
            }
        }

        let ids: Vec<u64> = ops.iter().map(|op| op.id).collect();
        self.finish_patches(topic, &ids, &outcomes);
    }

    /// Expire overdue patches whose topic never delivered.
    fn sweep(&mut self, now: Instant) {
        let overdue: Vec<(String, Vec<u64>)> = self
            .patches
            .iter()
            .map(|(topic, pending)| {
                let ids = pending
                    .iter()
                    .filter(|p| p.op.is_expired(now))
                    .map(|p| p.op.id)
                    .collect::<Vec<_>>();
                (topic.clone(), ids)
            })
            .filter(|(_, ids)| !ids.is_empty())
            .collect();

        for (topic, ids) in overdue {
            let outcomes: HashMap<u64, PatchOutcome> =
                ids.iter().map(|id| (*id, PatchOutcome::Expired)).collect();
            self.finish_patches(&topic, &ids, &outcomes);
        }
    }

    fn finish_patches(&mut self, topic: &str, ids: &[u64], outcomes: &HashMap<u64, PatchOutcome>) {
        let Some(pending) = self.patches.get_mut(topic) else {
            return;
        };
        let (done, keep): (Vec<_>, Vec<_>) = pending.drain(..).partition(|p| ids.contains(&p.op.id));
        if keep.is_empty() {
            self.patches.shift_remove(topic);
        } else {
            *pending = keep;
        }

        for finished in done {
            let id = finished.op.id;
            let outcome = outcomes.get(&id).cloned().unwrap_or_else(|| PatchOutcome::Failed {
                reason: "no outcome recorded".into(),
            });
            match &outcome {
                PatchOutcome::Failed { reason } => {
                    warn!(topic, path = %finished.op.path, %reason, "patch failed");
                }
                other => debug!(topic, path = %finished.op.path, outcome = %other, "patch finished"),
            }
            self.unregister(topic, &Subscriber::Patch(id), None);
            let _ = finished.outcome.send(outcome);
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    fn stats(&self) -> SessionStats {
        SessionStats {
            subscribed_topics: self.table.len(),
            pending_gets: self.waiters.len(),
            pending_patches: self.patches.values().map(Vec::len).sum(),
            cached_topics: self.cache.len(),
            unconfirmed_publishes: self.acks.len(),
        }
    }

    fn fail(&self, error: &dataspace_api::Error) {
        error!(server = %self.server, error = %error, "broker session failed");
        let reason = error.to_string();
        let state = if error.is_auth() {
            ConnectionState::AuthenticationFailed { reason }
        } else {
            ConnectionState::Failed { reason }
        };
        self.state.send_replace(state);
    }

    fn close(&mut self) {
        if let Err(e) = self.transport.disconnect() {
            debug!(error = %e, "disconnect request failed");
        }
        self.state.send_replace(ConnectionState::Disconnected);
        info!(server = %self.server, "session closed");
    }
}

/// Run a subscriber callback; a panic is logged and contained.
fn invoke(handler: &Handler, delivery: &Delivery) {
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| handler.call(delivery))) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        error!(topic = %delivery.topic, panic = %message, "subscriber handler panicked");
    }
}
