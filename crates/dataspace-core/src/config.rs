// ── Runtime hub configuration ──
//
// These types describe how the hub talks to its brokers: timeouts,
// cache sizing, reconnect policy. They never touch disk. The CLI builds
// a `HubConfig` (usually through dataspace-config) and hands it in.

use std::time::Duration;

use chrono_tz::Tz;
use dataspace_api::ReconnectConfig;

pub use dataspace_api::Credentials;

/// Root of the directory tree used by `find` and provisioning helpers.
pub const DEFAULT_BASE_PATH: &str = "datadirectory";

/// Tuning for a [`DataHub`](crate::DataHub) and every connection it opens.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// How long a blocking `get` waits for the first delivery.
    pub get_timeout: Duration,
    /// Deadline given to each patch operation.
    pub patch_timeout: Duration,
    /// How long a control-plane command waits for its reply.
    pub admin_timeout: Duration,
    /// How long `ensure_connection` waits for the broker session.
    pub connect_timeout: Duration,
    /// How often overdue patch operations are expired.
    pub patch_sweep_interval: Duration,
    /// Maximum number of cached topics per connection. `0` disables the cache.
    pub cache_capacity: usize,
    /// Zone used to bucket time-indexed paths.
    pub time_zone: Tz,
    pub base_path: String,
    pub keep_alive: Duration,
    pub max_packet_size: usize,
    pub reconnect: ReconnectConfig,
    /// Client ids are `<prefix><uuid>`.
    pub client_id_prefix: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            get_timeout: Duration::from_secs(10),
            patch_timeout: Duration::from_secs(2),
            admin_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            patch_sweep_interval: Duration::from_secs(1),
            cache_capacity: 4096,
            time_zone: chrono_tz::Europe::Stockholm,
            base_path: DEFAULT_BASE_PATH.to_owned(),
            keep_alive: Duration::from_secs(60),
            max_packet_size: 16 * 1024 * 1024,
            reconnect: ReconnectConfig::default(),
            client_id_prefix: "client-".to_owned(),
        }
    }
}

impl HubConfig {
    /// Fresh, process-unique client identity.
    pub(crate) fn new_client_id(&self) -> String {
        format!("{}{}", self.client_id_prefix, uuid::Uuid::new_v4())
    }
}
