//! Collaborator interfaces for the two transports
//!
//! The bridge drives a mesh coordinator on one side and a pub/sub broker on
//! the other. Both are reached through a trait so that the controller can be
//! tested against in-memory doubles:
//!
//! - [`MeshStack`] - coordinator control (startup, unicast, permit joining)
//! - [`PubSubClient`] - broker session (connect, subscribe, publish)
//!
//! Implementations:
//!
//! - [`mqtt::MqttClient`] - MQTT over rumqttc
//! - [`link::HostLink`] - framed JSON host link to a coordinator
//! - `SerialCoordinator` - host link over a serial port (requires `serial` feature)
//!
//! Both traits report asynchronous happenings through an mpsc sender handed
//! over at startup; the controller consumes those channels in its run loop.

pub mod link;
pub mod mqtt;

#[cfg(feature = "serial")]
mod serial;
#[cfg(feature = "serial")]
pub use serial::SerialCoordinator;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::codec::Publication;
use crate::config::{BridgeConfig, SerialSettings};
use crate::error::Result;
use crate::frame::{ApsFrame, Eui64, IncomingFrame, MeshAddress};
use crate::liveness::LastWill;

/// Client id prefix for broker sessions
pub const CLIENT_ID_PREFIX: &str = "zbmq-";

/// Something the coordinator reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// Application frame received from a node
    IncomingMessage(IncomingFrame),
    /// Node joined the network
    DeviceJoined {
        /// Assigned short address
        short_address: u16,
        /// Node's extended id
        extended_id: Eui64,
    },
    /// Node left the network
    DeviceLeft {
        /// Short address it had
        short_address: u16,
        /// Node's extended id
        extended_id: Eui64,
    },
}

/// Trait for mesh coordinator control
#[async_trait]
pub trait MeshStack: Send + Sync {
    /// Bring the coordinator up and start delivering events
    async fn startup(
        &mut self,
        settings: &SerialSettings,
        events: mpsc::Sender<MeshEvent>,
    ) -> Result<()>;

    /// Extended id of the coordinator itself
    async fn local_eui64(&mut self) -> Result<Eui64>;

    /// Send one unicast frame
    async fn request(
        &mut self,
        destination: MeshAddress,
        aps_frame: &ApsFrame,
        payload: &[u8],
    ) -> Result<()>;

    /// Open the joining window; zero closes it
    async fn permit_joining(&mut self, duration_seconds: u8) -> Result<()>;

    /// Ask the coordinator for a node's extended id
    ///
    /// `Ok(None)` means the coordinator does not know the node.
    async fn network_id_to_eui64(&mut self, short_address: u16) -> Result<Option<Eui64>>;

    /// Stop the coordinator link
    async fn stop(&mut self) -> Result<()>;

    /// Stack name (for logging)
    fn name(&self) -> &str;
}

/// Something the broker session reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubEvent {
    /// Handshake complete
    Connected {
        /// Broker resumed a stored session
        session_present: bool,
    },
    /// Message on a subscribed topic
    Message {
        /// Topic
        topic: String,
        /// Body
        payload: Bytes,
    },
    /// Client is retrying the connection
    Offline,
    /// Connection closed
    Closed,
    /// Transport error
    Error(String),
}

/// Broker session parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Broker URL
    pub broker: String,
    /// Client id
    pub client_id: String,
    /// Username and password
    pub credentials: Option<(String, String)>,
    /// Message the broker publishes if the session dies
    pub last_will: LastWill,
    /// Keep-alive interval
    pub keep_alive: Duration,
    /// Delay between reconnect attempts
    pub reconnect_period: Duration,
    /// Start without any stored session state
    pub clean_session: bool,
}

impl ConnectOptions {
    /// Options for a persistent session with a fresh client id
    pub fn from_config(config: &BridgeConfig, last_will: LastWill) -> Self {
        Self {
            broker: config.broker.clone(),
            client_id: generate_client_id(),
            credentials: config.credentials(),
            last_will,
            keep_alive: config.keep_alive,
            reconnect_period: config.reconnect_period,
            clean_session: false,
        }
    }
}

/// `zbmq-` followed by eight random hex digits
pub fn generate_client_id() -> String {
    format!("{}{:08x}", CLIENT_ID_PREFIX, rand::random::<u32>())
}

/// Trait for pub/sub broker sessions
#[async_trait]
pub trait PubSubClient: Send + Sync {
    /// Start connecting; progress arrives as [`PubSubEvent`]s
    async fn connect(
        &mut self,
        options: &ConnectOptions,
        events: mpsc::Sender<PubSubEvent>,
    ) -> Result<()>;

    /// Subscribe to a topic filter
    async fn subscribe(&mut self, filter: &str) -> Result<()>;

    /// Publish a message
    async fn publish(&mut self, publication: Publication) -> Result<()>;

    /// Close the session
    async fn end(&mut self) -> Result<()>;
}
