// dataspace-api: Broker transports (MQTT + in-process loopback) for the dataspace client.

pub mod error;
pub mod memory;
pub mod mqtt;
pub mod transport;

pub use error::Error;
pub use memory::{MemoryBroker, MemoryTransport};
pub use mqtt::{MqttConnector, MqttTransport, ReconnectConfig};
pub use transport::{
    ConnectOptions, Connector, Credentials, Endpoint, InboundMessage, QoS, Scheme, Transport,
    TransportEvent, topic_matches,
};
