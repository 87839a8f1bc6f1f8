// dataspace-core: Addressable, partially-mutable data space over publish/subscribe brokers.

pub mod address;
pub mod admin;
pub mod cache;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod directory;
pub mod error;
pub mod hub;
pub mod jsonpath;
pub mod patch;
pub mod payload;
pub mod records;
pub mod stream;
pub mod timeindex;

mod session;
mod subscription;

// ── Primary re-exports ──────────────────────────────────────────────
pub use address::{ServerAddress, split, split_jsonpath};
pub use admin::{AclRule, AclType, AdminClient, AdminCommand, GroupPermissions, ProvisionedUser};
pub use cache::CachedPayload;
pub use config::{Credentials, DEFAULT_BASE_PATH, HubConfig};
pub use connection::{Connection, ConnectionState, PendingPatch};
pub use correlation::{PendingReply, PendingRequests};
pub use directory::{DirEntry, EntryKind};
pub use error::CoreError;
pub use hub::DataHub;
pub use jsonpath::JsonPathExpr;
pub use patch::PatchOutcome;
pub use payload::{Delivery, Handler, MessageKind, Payload};
pub use records::Record;
pub use session::SessionStats;
pub use stream::TopicStream;
pub use timeindex::time_index_path;

// Transport types callers need to build hubs and publish.
pub use dataspace_api::{Connector, MemoryBroker, MqttConnector, QoS, ReconnectConfig};
