// ── DataHub ──
//
// Multi-server entry point. Holds credentials per server and one
// Connection per distinct server address, created on first use. Every
// URL-based operation splits the URL, obtains the connection and
// delegates.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dataspace_api::{Connector, Credentials, MqttConnector, QoS};
use secrecy::SecretString;
use tracing::{debug, info, warn};

use crate::address::{ServerAddress, split, split_jsonpath};
use crate::admin::{AdminClient, GroupPermissions, ProvisionedUser};
use crate::cache::CachedPayload;
use crate::config::HubConfig;
use crate::connection::{Connection, PendingPatch};
use crate::directory::DirEntry;
use crate::error::CoreError;
use crate::payload::{Delivery, Handler, Payload};
use crate::records::Record;
use crate::stream::TopicStream;

/// Router over any number of brokers.
///
/// Cheaply cloneable via `Arc`. Connections live until
/// [`shutdown`](Self::shutdown), until their credentials are deleted,
/// or until they fail for good (the next use then reconnects).
pub struct DataHub<C: Connector = MqttConnector> {
    inner: Arc<HubInner<C>>,
}

struct HubInner<C> {
    connector: C,
    config: HubConfig,
    /// Keyed by `host[:port]`.
    credentials: DashMap<String, Credentials>,
    connections: DashMap<ServerAddress, Connection>,
}

impl<C: Connector> Clone for DataHub<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl DataHub<MqttConnector> {
    /// Hub speaking MQTT over TCP/TLS.
    pub fn new(config: HubConfig) -> Self {
        Self::with_connector(MqttConnector, config)
    }
}

impl Default for DataHub<MqttConnector> {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl<C: Connector> DataHub<C> {
    pub fn with_connector(connector: C, config: HubConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                connector,
                config,
                credentials: DashMap::new(),
                connections: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    // ── Credentials ──────────────────────────────────────────────────

    /// Use `username`/`password` for `server` (`host[:port]` or a URL).
    /// Takes effect for connections opened afterwards.
    pub fn add_credentials(
        &self,
        server: &str,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<(), CoreError> {
        let server = ServerAddress::parse(server)?;
        let key = server.credential_key();
        debug!(server = %key, "credentials added");
        self.inner
            .credentials
            .insert(key, Credentials::new(username, password));
        Ok(())
    }

    /// Forget the credentials for `server` and close every connection that
    /// used them, whatever its scheme. Returns whether credentials were
    /// stored.
    pub async fn delete_credentials(&self, server: &str) -> Result<bool, CoreError> {
        let key = ServerAddress::parse(server)?.credential_key();
        let removed = self.inner.credentials.remove(&key).is_some();

        let affected: Vec<ServerAddress> = self
            .inner
            .connections
            .iter()
            .filter(|entry| entry.key().credential_key() == key)
            .map(|entry| entry.key().clone())
            .collect();
        for address in affected {
            if let Some((_, connection)) = self.inner.connections.remove(&address) {
                info!(server = %address, "closing connection after credential removal");
                connection.shutdown().await;
            }
        }
        Ok(removed)
    }

    pub fn has_credentials(&self, server: &str) -> Result<bool, CoreError> {
        let server = ServerAddress::parse(server)?;
        Ok(self
            .inner
            .credentials
            .contains_key(&server.credential_key()))
    }

    // ── Connections ──────────────────────────────────────────────────

    /// Connection for `server`, opening it if needed.
    ///
    /// Concurrent callers for the same new server share one connection.
    /// Fails if the broker does not accept the session within the
    /// configured connect timeout.
    pub async fn ensure_connection(&self, server: &ServerAddress) -> Result<Connection, CoreError> {
        let (connection, fresh) = match self.inner.connections.entry(server.clone()) {
            Entry::Occupied(mut entry) if entry.get().state().is_terminal() => {
                debug!(server = %server, "replacing closed connection");
                let connection = self.open(server)?;
                entry.insert(connection.clone());
                (connection, true)
            }
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let connection = self.open(server)?;
                entry.insert(connection.clone());
                (connection, true)
            }
        };

        if let Err(e) = connection
            .wait_connected(self.inner.config.connect_timeout)
            .await
        {
            warn!(server = %server, error = %e, "connection not established");
            // An established session that is only reconnecting keeps its
            // subscriptions; anything else is dropped.
            if fresh || connection.state().is_terminal() {
                self.inner
                    .connections
                    .remove_if(server, |_, current| current.same_session(&connection));
                connection.shutdown().await;
            }
            return Err(e);
        }
        Ok(connection)
    }

    fn open(&self, server: &ServerAddress) -> Result<Connection, CoreError> {
        let credentials = self
            .inner
            .credentials
            .get(&server.credential_key())
            .map(|entry| entry.value().clone());
        if credentials.is_none() {
            debug!(server = %server, "no credentials stored, connecting anonymously");
        }
        Connection::open(
            &self.inner.connector,
            server.clone(),
            credentials,
            self.inner.config.clone(),
        )
    }

    /// Connection for the server named by `url` (`scheme://host[:port]`,
    /// any path ignored).
    pub async fn connection(&self, url: &str) -> Result<Connection, CoreError> {
        let server = ServerAddress::parse(url)?;
        self.ensure_connection(&server).await
    }

    async fn route(&self, url: &str) -> Result<(Connection, String), CoreError> {
        let (server, topic) = split(url)?;
        let connection = self.ensure_connection(&server).await?;
        Ok((connection, topic))
    }

    /// Close every connection.
    pub async fn shutdown(&self) {
        let connections: Vec<Connection> = self
            .inner
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.inner.connections.clear();
        for connection in connections {
            connection.shutdown().await;
        }
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// First delivery at `url`, waiting up to the configured get timeout.
    /// `Ok(None)` on timeout.
    pub async fn get(&self, url: &str) -> Result<Option<Delivery>, CoreError> {
        self.get_timeout(url, self.inner.config.get_timeout).await
    }

    pub async fn get_timeout(&self, url: &str, timeout: Duration) -> Result<Option<Delivery>, CoreError> {
        let (connection, topic) = self.route(url).await?;
        connection.get(&topic, timeout).await
    }

    /// Blocking get whose delivery is mapped through `f`.
    pub async fn get_with<T>(
        &self,
        url: &str,
        timeout: Duration,
        f: impl FnOnce(Delivery) -> T,
    ) -> Result<Option<T>, CoreError> {
        let (connection, topic) = self.route(url).await?;
        connection.get_with(&topic, timeout, f).await
    }

    /// Non-blocking get: `handler` runs once on the first delivery.
    pub async fn get_detached(&self, url: &str, handler: Handler) -> Result<(), CoreError> {
        let (connection, topic) = self.route(url).await?;
        connection.get_detached(&topic, handler).await
    }

    /// Last cached payload at `url`, without subscribing.
    pub async fn get_cached(&self, url: &str) -> Result<Option<CachedPayload>, CoreError> {
        let (connection, topic) = self.route(url).await?;
        connection.cached(&topic).await
    }

    /// Entries of the directory at `url`. `Ok(None)` on timeout.
    pub async fn list(&self, url: &str) -> Result<Option<Vec<DirEntry>>, CoreError> {
        let (connection, topic) = self.route(url).await?;
        connection.list(&topic, self.inner.config.get_timeout).await
    }

    /// Search the server's base directory for `name`.
    pub async fn find(&self, server: &str, name: &str) -> Result<Option<Delivery>, CoreError> {
        let connection = self.connection(server).await?;
        connection.find(name, self.inner.config.get_timeout).await
    }

    /// Hour-bucket path of `url` for `epoch_secs`, in the configured zone.
    pub fn time_index_url(&self, url: &str, epoch_secs: i64) -> Result<String, CoreError> {
        let (server, topic) = split(url)?;
        let path = crate::timeindex::time_index_path(&topic, epoch_secs, self.inner.config.time_zone)?;
        Ok(server.url_for(&path))
    }

    pub async fn get_log_at(&self, url: &str, epoch_secs: i64) -> Result<Option<Delivery>, CoreError> {
        let (connection, topic) = self.route(url).await?;
        connection
            .get_log_at(&topic, epoch_secs, self.inner.config.get_timeout)
            .await
    }

    pub async fn list_files_at(&self, url: &str, epoch_secs: i64) -> Result<Option<Vec<DirEntry>>, CoreError> {
        let (connection, topic) = self.route(url).await?;
        connection
            .list_files_at(&topic, epoch_secs, self.inner.config.get_timeout)
            .await
    }

    /// JSON-lines log at `url`, decoded into records.
    pub async fn get_records(&self, url: &str) -> Result<Option<Vec<Record>>, CoreError> {
        let (connection, topic) = self.route(url).await?;
        connection
            .get_records(&topic, self.inner.config.get_timeout)
            .await
    }

    pub async fn get_records_at(&self, url: &str, epoch_secs: i64) -> Result<Option<Vec<Record>>, CoreError> {
        let (connection, topic) = self.route(url).await?;
        connection
            .get_records_at(&topic, epoch_secs, self.inner.config.get_timeout)
            .await
    }

    // ── Subscriptions ────────────────────────────────────────────────

    pub async fn subscribe(&self, url: &str, handler: Handler) -> Result<bool, CoreError> {
        let (connection, topic) = self.route(url).await?;
        connection.subscribe(&topic, handler).await
    }

    pub async fn unsubscribe(&self, url: &str, handler: &Handler) -> Result<bool, CoreError> {
        let (connection, topic) = self.route(url).await?;
        connection.unsubscribe(&topic, handler).await
    }

    pub async fn subscribe_stream(&self, url: &str) -> Result<TopicStream, CoreError> {
        let (connection, topic) = self.route(url).await?;
        connection.subscribe_stream(&topic).await
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Publish to `url`; a `$path` suffix makes it a patch.
    pub async fn publish(
        &self,
        url: &str,
        payload: impl Into<Payload>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), CoreError> {
        let (connection, topic) = self.route(url).await?;
        connection.publish(&topic, payload, qos, retain).await
    }

    /// Publish to `url` and wait for the broker's acknowledgement.
    pub async fn publish_confirmed(
        &self,
        url: &str,
        payload: impl Into<Payload>,
        qos: QoS,
        retain: bool,
        timeout: Duration,
    ) -> Result<(), CoreError> {
        if let (_, Some(path)) = split_jsonpath(url) {
            return Err(CoreError::InvalidUrl {
                url: url.to_owned(),
                reason: format!("confirmed publishes cannot target JSON path {path}"),
            });
        }
        let (connection, topic) = self.route(url).await?;
        connection
            .publish_confirmed(&topic, payload.into().to_bytes(), qos, retain, timeout)
            .await
    }

    /// Patch `path` of the document at `url` and observe the outcome.
    pub async fn patch(
        &self,
        url: &str,
        path: &str,
        value: serde_json::Value,
    ) -> Result<PendingPatch, CoreError> {
        let (connection, topic) = self.route(url).await?;
        connection.patch(&topic, path, value).await
    }

    pub async fn link(&self, url: &str, target: &str) -> Result<(), CoreError> {
        let (connection, topic) = self.route(url).await?;
        connection.link(&topic, target).await
    }

    // ── Control plane ────────────────────────────────────────────────

    pub async fn admin(&self, server: &str) -> Result<AdminClient, CoreError> {
        self.connection(server).await?.admin().await
    }

    /// Create `username` with its personal role and, given a full name,
    /// publish it to the user's directory.
    pub async fn add_user_with_role(
        &self,
        server: &str,
        username: &str,
        password: &SecretString,
        full_name: Option<&str>,
    ) -> Result<ProvisionedUser, CoreError> {
        self.admin(server)
            .await?
            .provision_user(username, password, full_name)
            .await
    }

    pub async fn ensure_group_permissions(&self, server: &str, group: &str) -> Result<GroupPermissions, CoreError> {
        self.admin(server)
            .await?
            .ensure_group_permissions(group)
            .await
    }
}
