//! MeshBridge - protocol bridge service
//!
//! This module provides the controller that connects a mesh coordinator to an
//! MQTT broker. It handles:
//!
//! - Mesh → MQTT: frames from nodes are published on `<gateway>/response` and,
//!   when expansion is on, on the sender's own `<gateway>/<id>/response`
//! - MQTT → Mesh: `<gateway>/<id>/request` commands become unicast frames and
//!   `<gateway>/permit-joining` opens the joining window
//! - Membership: joins and leaves are recorded in the device directory
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                          MeshBridge                               │
//! ├───────────────────────────────────────────────────────────────────┤
//! │                                                                   │
//! │  ┌─────────────┐    ┌──────────────────┐    ┌────────────────┐    │
//! │  │ MeshStack   │───►│ MeshEvent rx     │    │ PubSubClient   │    │
//! │  │ (serial)    │◄───│                  │───►│ (MQTT)         │    │
//! │  └─────────────┘    │ TopicRouter      │    └───────┬────────┘    │
//! │                     │ Codec            │            │             │
//! │  ┌─────────────┐    │ DeviceDirectory  │◄───────────┘             │
//! │  │ BridgeHandle│───►│ LivenessSignaler │    PubSubEvent rx        │
//! │  └─────────────┘    └──────────────────┘                          │
//! │                                                                   │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All events are handled one at a time by [`MeshBridge::run`], so handlers
//! never race each other.
//!
//! # Example
//!
//! ```rust,ignore
//! use zbmq_bridge::{BridgeConfig, DeviceDirectory, JsonFileStore, MeshBridge, MqttClient};
//!
//! let config = BridgeConfig::default();
//! let directory = DeviceDirectory::load(JsonFileStore::new(&config.device_db)).await?;
//! let (bridge, handle) = MeshBridge::new(coordinator, MqttClient::new(), directory, config);
//!
//! bridge.run().await?;
//! ```

use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{outbound_publications, InboundPayload, Publication};
use crate::config::BridgeConfig;
use crate::directory::DeviceDirectory;
use crate::error::{BridgeError, Result};
use crate::frame::{Eui64, IncomingFrame, MeshAddress, SequenceCounter};
use crate::interface::{ConnectOptions, MeshEvent, MeshStack, PubSubClient, PubSubEvent};
use crate::liveness::{LivenessSignaler, SessionKind};
use crate::router::{Intent, TopicRouter};

/// Capacity of each event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the command channel
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Lifecycle of a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Not started, or fully stopped
    Stopped,
    /// Waiting for the mesh stack and the broker handshake
    Starting,
    /// Both transports are up
    Running,
    /// Shutting down
    Stopping,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeState::Stopped => write!(f, "stopped"),
            BridgeState::Starting => write!(f, "starting"),
            BridgeState::Running => write!(f, "running"),
            BridgeState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Commands that can be sent to the bridge
#[derive(Debug)]
pub enum BridgeCommand {
    /// Get bridge statistics
    GetStats(oneshot::Sender<BridgeStats>),
    /// Get lifecycle state
    GetState(oneshot::Sender<BridgeState>),
    /// Shutdown the bridge
    Shutdown,
}

/// Bridge statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Mesh frames published to the broker
    pub frames_published: u64,
    /// Commands delivered to the mesh
    pub commands_sent: u64,
    /// Permit-joining requests handled
    pub permit_join_requests: u64,
    /// Publications dropped because the broker was unreachable
    pub dropped_while_disconnected: u64,
    /// Publications the client refused, such as on a full request queue
    pub publish_failures: u64,
    /// Inbound messages that could not be understood
    pub malformed_payloads: u64,
    /// Mesh requests that failed
    pub mesh_send_failures: u64,
    /// Devices added to the directory
    pub devices_joined: u64,
    /// Devices removed from the directory
    pub devices_left: u64,
}

/// Handle for controlling the MeshBridge
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    command_tx: mpsc::Sender<BridgeCommand>,
}

impl BridgeHandle {
    /// Get bridge statistics
    pub async fn stats(&self) -> Result<BridgeStats> {
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(BridgeCommand::GetStats(tx)).await?;
        rx.await.map_err(|_| BridgeError::ChannelClosed)
    }

    /// Get lifecycle state
    pub async fn state(&self) -> Result<BridgeState> {
        let (tx, rx) = oneshot::channel();
        self.command_tx.send(BridgeCommand::GetState(tx)).await?;
        rx.await.map_err(|_| BridgeError::ChannelClosed)
    }

    /// Shutdown the bridge
    pub async fn shutdown(&self) -> Result<()> {
        self.command_tx.send(BridgeCommand::Shutdown).await?;
        Ok(())
    }
}

/// Main bridge service connecting a mesh coordinator to a pub/sub broker
pub struct MeshBridge<M: MeshStack, P: PubSubClient> {
    /// Mesh coordinator
    mesh: M,
    /// Broker session
    pubsub: P,
    /// Known devices
    directory: DeviceDirectory,
    /// Settings
    config: BridgeConfig,
    /// Inbound topic routing, bound to the gateway topic once known
    router: TopicRouter,
    /// Online/offline status
    liveness: LivenessSignaler,
    /// APS sequence numbers for commands that omit one
    sequence: SequenceCounter,
    /// Lifecycle state
    state: BridgeState,
    /// Mesh stack started
    mesh_ready: bool,
    /// First broker handshake done
    handshake_complete: bool,
    /// When the current joining window closes
    permit_join_deadline: Option<Instant>,
    /// Bridge statistics
    stats: BridgeStats,
    /// Command receiver
    command_rx: mpsc::Receiver<BridgeCommand>,
    /// Mesh events, sender half is handed to the stack at startup
    mesh_tx: mpsc::Sender<MeshEvent>,
    mesh_rx: mpsc::Receiver<MeshEvent>,
    /// Broker events, sender half is handed to the client at connect
    pubsub_tx: mpsc::Sender<PubSubEvent>,
    pubsub_rx: mpsc::Receiver<PubSubEvent>,
}

impl<M: MeshStack, P: PubSubClient> MeshBridge<M, P> {
    /// Create a new bridge
    pub fn new(
        mesh: M,
        pubsub: P,
        directory: DeviceDirectory,
        config: BridgeConfig,
    ) -> (Self, BridgeHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (mesh_tx, mesh_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (pubsub_tx, pubsub_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let router = TopicRouter::new(config.root_topic.clone());
        let liveness = LivenessSignaler::new(router.online_topic());

        let bridge = Self {
            mesh,
            pubsub,
            directory,
            config,
            router,
            liveness,
            sequence: SequenceCounter::new(),
            state: BridgeState::Stopped,
            mesh_ready: false,
            handshake_complete: false,
            permit_join_deadline: None,
            stats: BridgeStats::default(),
            command_rx,
            mesh_tx,
            mesh_rx,
            pubsub_tx,
            pubsub_rx,
        };

        (bridge, BridgeHandle { command_tx })
    }

    /// Current lifecycle state
    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Statistics so far
    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    /// Root of every topic the bridge uses
    pub fn gateway_topic(&self) -> &str {
        self.router.root()
    }

    /// Device directory
    pub fn directory(&self) -> &DeviceDirectory {
        &self.directory
    }

    /// Whether publications currently reach the broker
    pub fn is_connected(&self) -> bool {
        self.liveness.is_connected()
    }

    /// Bring up the mesh stack and start the broker session
    ///
    /// Mesh failures are fatal and returned as [`BridgeError::MeshStartupFailed`].
    /// Broker failures are only logged; the client keeps retrying on its own.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != BridgeState::Stopped {
            return Err(BridgeError::BridgeAlreadyRunning);
        }
        self.state = BridgeState::Starting;
        info!(mesh = self.mesh.name(), "Starting bridge");

        if let Err(e) = self.start_mesh().await {
            error!(error = %e, "Mesh stack failed to start");
            self.state = BridgeState::Stopped;
            return Err(e);
        }

        let options = ConnectOptions::from_config(&self.config, self.liveness.last_will());
        info!(broker = %options.broker, client_id = %options.client_id, "Connecting to broker");
        if let Err(e) = self
            .pubsub
            .connect(&options, self.pubsub_tx.clone())
            .await
        {
            self.report_error(&e).await;
        }

        self.update_running();
        Ok(())
    }

    async fn start_mesh(&mut self) -> Result<()> {
        self.mesh
            .startup(&self.config.serial_settings(), self.mesh_tx.clone())
            .await
            .map_err(startup_failure)?;

        let local = self.mesh.local_eui64().await.map_err(startup_failure)?;
        let gateway = format!("{}/{}", self.config.root_topic, local);
        self.router = TopicRouter::new(gateway);
        self.liveness = LivenessSignaler::new(self.router.online_topic());
        self.mesh_ready = true;

        info!(gateway = %self.router.root(), "Mesh stack ready");
        Ok(())
    }

    fn update_running(&mut self) {
        if self.state == BridgeState::Starting && self.mesh_ready && self.handshake_complete {
            self.state = BridgeState::Running;
            info!(gateway = %self.router.root(), "Bridge running");
        }
    }

    // ========================================================================
    // Mesh → MQTT
    // ========================================================================

    /// Handle one event from the mesh stack
    pub async fn on_mesh_event(&mut self, event: MeshEvent) {
        match event {
            MeshEvent::IncomingMessage(frame) => {
                if let Err(e) = self.forward_frame(frame).await {
                    self.report_error(&e).await;
                }
            }
            MeshEvent::DeviceJoined {
                short_address,
                extended_id,
            } => match self.directory.record_join(short_address, extended_id).await {
                Ok(true) => self.stats.devices_joined += 1,
                Ok(false) => {}
                Err(e) => self.report_error(&e).await,
            },
            MeshEvent::DeviceLeft {
                short_address,
                extended_id,
            } => match self.directory.record_leave(short_address, extended_id).await {
                Ok(true) => self.stats.devices_left += 1,
                Ok(false) => {}
                Err(e) => self.report_error(&e).await,
            },
        }
    }

    async fn forward_frame(&mut self, mut frame: IncomingFrame) -> Result<()> {
        if frame.sender_eui64.is_none() {
            frame.sender_eui64 = self.resolve_sender(frame.sender).await;
        }
        trace!(sender = %frame.sender_address(), cluster = frame.aps_frame.cluster_id, "Frame from mesh");

        let publications = outbound_publications(
            self.router.root(),
            &frame,
            self.config.expand_response_topics,
        )?;

        let mut delivered = false;
        for publication in publications {
            delivered |= self.publish(publication).await;
        }
        if delivered {
            self.stats.frames_published += 1;
        }
        Ok(())
    }

    /// Directory first, then the coordinator's own address table
    async fn resolve_sender(&mut self, short_address: u16) -> Option<Eui64> {
        if let Some(eui) = self.directory.resolve_extended_id(short_address) {
            return Some(eui);
        }
        match self.mesh.network_id_to_eui64(short_address).await {
            Ok(found) => found,
            Err(e) => {
                debug!(nwk = format!("0x{:04x}", short_address), error = %e, "Extended id lookup failed");
                None
            }
        }
    }

    // ========================================================================
    // MQTT → Mesh
    // ========================================================================

    /// Handle one event from the broker session
    pub async fn on_pubsub_event(&mut self, event: PubSubEvent) {
        match event {
            PubSubEvent::Connected { session_present } => self.on_connected(session_present).await,
            PubSubEvent::Message { topic, payload } => self.on_mqtt_message(&topic, &payload).await,
            PubSubEvent::Offline => self.liveness.on_offline(),
            PubSubEvent::Closed => self.liveness.on_close(),
            // Never forwarded to the log topic: that publish could fail the same way
            PubSubEvent::Error(reason) => warn!(%reason, "Broker session error"),
        }
    }

    async fn on_connected(&mut self, session_present: bool) {
        if self.liveness.is_shutting_down() {
            debug!("Ignoring broker handshake during shutdown");
            return;
        }

        let (online, kind) = self.liveness.on_connect(session_present);
        self.publish(online).await;

        if kind == SessionKind::Fresh {
            for filter in [self.router.request_filter(), self.router.permit_joining_topic()] {
                if let Err(e) = self.pubsub.subscribe(&filter).await {
                    self.report_error(&e).await;
                }
            }
        } else {
            debug!("Broker resumed session, subscriptions kept");
        }

        if !self.handshake_complete {
            self.handshake_complete = true;
            self.update_running();
        }
    }

    /// Handle one message from a subscribed topic
    pub async fn on_mqtt_message(&mut self, topic: &str, payload: &[u8]) {
        match self.router.route(topic, payload) {
            Intent::Command { address, payload } => {
                if let Err(e) = self.send_command(&address, payload).await {
                    if matches!(
                        e,
                        BridgeError::InvalidAddress(_) | BridgeError::PayloadMalformed(_)
                    ) {
                        self.stats.malformed_payloads += 1;
                    }
                    self.report_error(&e).await;
                }
            }
            Intent::PermitJoin { duration_seconds } => {
                self.stats.permit_join_requests += 1;
                if let Err(e) = self.permit_join(duration_seconds).await {
                    self.report_error(&e).await;
                }
            }
            Intent::Malformed { raw, reason } => {
                self.stats.malformed_payloads += 1;
                let err = BridgeError::PayloadMalformed(format!("{}: {}", raw, reason));
                self.report_error(&err).await;
            }
        }
    }

    async fn send_command(&mut self, address: &str, payload: InboundPayload) -> Result<()> {
        let mut destination: MeshAddress = address.parse()?;
        if let Some(repeated) = payload.address.as_deref() {
            if repeated != address {
                debug!(topic = address, payload = repeated, "Payload address ignored, topic wins");
            }
        }

        if let MeshAddress::Extended(eui) = destination {
            if let Some(nwk) = self.directory.resolve_short_address(eui) {
                destination = MeshAddress::Short(nwk);
            }
        }

        let bytes = payload.message.to_bytes()?;
        let aps_frame = payload.aps_frame.with_defaults(&mut self.sequence);

        debug!(
            %destination,
            cluster = aps_frame.cluster_id,
            sequence = ?aps_frame.sequence,
            bytes = bytes.len(),
            "Sending command to mesh"
        );
        if let Err(e) = self.mesh.request(destination, &aps_frame, &bytes).await {
            self.stats.mesh_send_failures += 1;
            return Err(e);
        }

        self.stats.commands_sent += 1;
        Ok(())
    }

    async fn permit_join(&mut self, duration_seconds: u8) -> Result<()> {
        self.mesh.permit_joining(duration_seconds).await?;

        if duration_seconds == 0 {
            self.permit_join_deadline = None;
            info!("Permit joining disabled");
        } else {
            self.permit_join_deadline =
                Some(Instant::now() + Duration::from_secs(u64::from(duration_seconds)));
            info!(seconds = duration_seconds, "Permit joining enabled");
        }
        Ok(())
    }

    /// Whether a joining window is currently open
    pub fn permit_join_open(&self) -> bool {
        self.permit_join_deadline.is_some()
    }

    // ========================================================================
    // Publishing
    // ========================================================================

    /// Publish if connected; returns whether the broker accepted it
    async fn publish(&mut self, publication: Publication) -> bool {
        if !self.liveness.is_connected() {
            warn!(topic = %publication.topic, "Not connected, dropping publication");
            self.stats.dropped_while_disconnected += 1;
            return false;
        }

        let topic = publication.topic.clone();
        match self.pubsub.publish(publication).await {
            Ok(()) => true,
            Err(e) => {
                warn!(%topic, error = %e, "Publish failed, dropping publication");
                self.stats.publish_failures += 1;
                false
            }
        }
    }

    /// Log an error and mirror it to the retained log topic
    async fn report_error(&mut self, err: &BridgeError) {
        warn!(code = err.error_code(), error = %err, "Bridge error");

        if !self.liveness.is_connected() {
            return;
        }
        let publication = Publication::retained(self.router.log_topic(), err.to_string());
        if let Err(e) = self.pubsub.publish(publication).await {
            warn!(error = %e, "Failed to publish error to log topic");
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Publish offline status, end the broker session and stop the mesh stack
    pub async fn stop(&mut self) -> Result<()> {
        if self.state == BridgeState::Stopped {
            return Err(BridgeError::BridgeNotRunning);
        }
        self.state = BridgeState::Stopping;
        info!("Stopping bridge");

        self.permit_join_deadline = None;
        if let Some(offline) = self.liveness.begin_shutdown() {
            if let Err(e) = self.pubsub.publish(offline).await {
                warn!(error = %e, "Failed to publish offline status");
            }
        }
        if let Err(e) = self.pubsub.end().await {
            warn!(error = %e, "Error ending broker session");
        }
        if self.mesh_ready {
            if let Err(e) = self.mesh.stop().await {
                warn!(error = %e, "Error stopping mesh stack");
            }
        }

        self.mesh_ready = false;
        self.handshake_complete = false;
        self.state = BridgeState::Stopped;
        info!(
            frames = self.stats.frames_published,
            commands = self.stats.commands_sent,
            "Bridge stopped"
        );
        Ok(())
    }

    /// Run the bridge service
    ///
    /// Starts both transports, then handles mesh events, broker events,
    /// control commands and the permit-joining timer until shutdown is
    /// requested or every handle is dropped.
    pub async fn run(mut self) -> Result<()> {
        self.start().await?;

        loop {
            let deadline = self.permit_join_deadline;
            let permit_join_closed = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                Some(event) = self.mesh_rx.recv() => {
                    self.on_mesh_event(event).await;
                }

                Some(event) = self.pubsub_rx.recv() => {
                    self.on_pubsub_event(event).await;
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(BridgeCommand::GetStats(tx)) => {
                            let _ = tx.send(self.stats.clone());
                        }
                        Some(BridgeCommand::GetState(tx)) => {
                            let _ = tx.send(self.state);
                        }
                        Some(BridgeCommand::Shutdown) => {
                            info!("Bridge shutdown requested");
                            break;
                        }
                        None => {
                            info!("All bridge handles dropped");
                            break;
                        }
                    }
                }

                _ = permit_join_closed => {
                    self.permit_join_deadline = None;
                    info!("Permit joining window closed");
                }
            }
        }

        self.stop().await
    }
}

impl<M: MeshStack, P: PubSubClient> fmt::Debug for MeshBridge<M, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshBridge")
            .field("gateway", &self.router.root())
            .field("state", &self.state)
            .field("connected", &self.liveness.is_connected())
            .field("devices", &self.directory.len())
            .field("stats", &self.stats)
            .finish()
    }
}

fn startup_failure(err: BridgeError) -> BridgeError {
    match err {
        BridgeError::MeshStartupFailed(_) => err,
        other => BridgeError::MeshStartupFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryStore;
    use crate::frame::aps_options;
    use crate::test_utils::{
        command_payload, sample_frame, MockMeshStack, MockPubSub, GATEWAY_EUI64,
    };

    const GATEWAY: &str = "zbmq/00124b0001000001";

    async fn test_bridge() -> (
        MeshBridge<MockMeshStack, MockPubSub>,
        MockMeshStack,
        MockPubSub,
    ) {
        let mesh = MockMeshStack::new(GATEWAY_EUI64);
        let pubsub = MockPubSub::new();
        let directory = DeviceDirectory::load(MemoryStore::new()).await.unwrap();
        let (bridge, _handle) = MeshBridge::new(
            mesh.clone(),
            pubsub.clone(),
            directory,
            BridgeConfig::default(),
        );
        (bridge, mesh, pubsub)
    }

    async fn running_bridge() -> (
        MeshBridge<MockMeshStack, MockPubSub>,
        MockMeshStack,
        MockPubSub,
    ) {
        let (mut bridge, mesh, pubsub) = test_bridge().await;
        bridge.start().await.unwrap();
        bridge
            .on_pubsub_event(PubSubEvent::Connected {
                session_present: false,
            })
            .await;
        pubsub.clear_publications();
        (bridge, mesh, pubsub)
    }

    #[tokio::test]
    async fn test_bridge_creation() {
        let (bridge, _, _) = test_bridge().await;
        assert_eq!(bridge.state(), BridgeState::Stopped);
        assert!(!bridge.is_connected());
        assert_eq!(bridge.gateway_topic(), "zbmq");
    }

    #[tokio::test]
    async fn test_start_waits_for_handshake() {
        let (mut bridge, mesh, pubsub) = test_bridge().await;
        bridge.start().await.unwrap();

        assert!(mesh.is_started());
        assert_eq!(bridge.gateway_topic(), GATEWAY);
        assert_eq!(bridge.state(), BridgeState::Starting);

        let options = pubsub.connect_options().unwrap();
        assert_eq!(options.last_will.topic, format!("{}/online", GATEWAY));
        assert_eq!(options.last_will.payload, "0");
        assert!(options.last_will.retain);

        bridge
            .on_pubsub_event(PubSubEvent::Connected {
                session_present: false,
            })
            .await;
        assert_eq!(bridge.state(), BridgeState::Running);
        assert_eq!(
            pubsub.subscriptions(),
            vec![
                format!("{}/+/request", GATEWAY),
                format!("{}/permit-joining", GATEWAY)
            ]
        );
        let online = pubsub.published_to(&format!("{}/online", GATEWAY));
        assert_eq!(online.len(), 1);
        assert_eq!(&online[0].payload[..], b"1");
        assert!(online[0].retain);
    }

    #[tokio::test]
    async fn test_start_twice() {
        let (mut bridge, _, _) = test_bridge().await;
        bridge.start().await.unwrap();
        assert!(matches!(
            bridge.start().await,
            Err(BridgeError::BridgeAlreadyRunning)
        ));
    }

    #[tokio::test]
    async fn test_mesh_startup_failure_is_fatal() {
        let mesh = MockMeshStack::new(GATEWAY_EUI64).failing_startup();
        let pubsub = MockPubSub::new();
        let directory = DeviceDirectory::load(MemoryStore::new()).await.unwrap();
        let (mut bridge, _handle) =
            MeshBridge::new(mesh, pubsub.clone(), directory, BridgeConfig::default());

        let err = bridge.start().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(bridge.state(), BridgeState::Stopped);
        assert!(pubsub.connect_options().is_none());
    }

    #[tokio::test]
    async fn test_broker_connect_failure_is_not_fatal() {
        let mesh = MockMeshStack::new(GATEWAY_EUI64);
        let pubsub = MockPubSub::new().failing_connect();
        let directory = DeviceDirectory::load(MemoryStore::new()).await.unwrap();
        let (mut bridge, _handle) = MeshBridge::new(mesh, pubsub, directory, BridgeConfig::default());

        assert!(bridge.start().await.is_ok());
        assert_eq!(bridge.state(), BridgeState::Starting);
    }

    #[tokio::test]
    async fn test_frame_enriched_from_directory() {
        let (mut bridge, _, pubsub) = running_bridge().await;
        let lamp = Eui64(0x00124b0001abcdef);
        bridge
            .on_mesh_event(MeshEvent::DeviceJoined {
                short_address: 0x2001,
                extended_id: lamp,
            })
            .await;

        bridge
            .on_mesh_event(MeshEvent::IncomingMessage(sample_frame(0x2001)))
            .await;

        let shared = pubsub.published_to(&format!("{}/response", GATEWAY));
        assert_eq!(shared.len(), 1);
        let body = std::str::from_utf8(&shared[0].payload).unwrap();
        assert!(body.contains("\"senderEui64\":\"00124b0001abcdef\""));

        let device = pubsub.published_to(&format!("{}/00124b0001abcdef/response", GATEWAY));
        assert_eq!(device.len(), 1);
        assert!(!std::str::from_utf8(&device[0].payload)
            .unwrap()
            .contains("senderEui64"));
        assert_eq!(bridge.stats().frames_published, 1);
    }

    #[tokio::test]
    async fn test_frame_enriched_from_coordinator() {
        let mesh = MockMeshStack::new(GATEWAY_EUI64).with_known_node(0x3003, Eui64(0xaa));
        let pubsub = MockPubSub::new();
        let directory = DeviceDirectory::load(MemoryStore::new()).await.unwrap();
        let (mut bridge, _handle) =
            MeshBridge::new(mesh.clone(), pubsub.clone(), directory, BridgeConfig::default());
        bridge.start().await.unwrap();
        bridge
            .on_pubsub_event(PubSubEvent::Connected {
                session_present: false,
            })
            .await;

        bridge
            .on_mesh_event(MeshEvent::IncomingMessage(sample_frame(0x3003)))
            .await;

        assert_eq!(mesh.lookups(), vec![0x3003]);
        assert_eq!(
            pubsub
                .published_to(&format!("{}/00000000000000aa/response", GATEWAY))
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_expansion_disabled() {
        let mesh = MockMeshStack::new(GATEWAY_EUI64);
        let pubsub = MockPubSub::new().auto_connect(false);
        let directory = DeviceDirectory::load(MemoryStore::new()).await.unwrap();
        let config = crate::config::BridgeConfigBuilder::new()
            .expand_response_topics(false)
            .build();
        let (mut bridge, _handle) = MeshBridge::new(mesh, pubsub.clone(), directory, config);
        bridge.start().await.unwrap();
        bridge
            .on_pubsub_event(PubSubEvent::Connected {
                session_present: false,
            })
            .await;
        pubsub.clear_publications();

        bridge
            .on_mesh_event(MeshEvent::IncomingMessage(sample_frame(0x1234)))
            .await;

        let topics: Vec<String> = pubsub.publications().into_iter().map(|p| p.topic).collect();
        assert_eq!(topics, vec![format!("{}/response", GATEWAY)]);
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_is_dropped() {
        let (mut bridge, _, pubsub) = running_bridge().await;
        bridge.on_pubsub_event(PubSubEvent::Closed).await;
        assert!(!bridge.is_connected());

        bridge
            .on_mesh_event(MeshEvent::IncomingMessage(sample_frame(0x1234)))
            .await;

        assert!(pubsub.publications().is_empty());
        assert_eq!(bridge.stats().dropped_while_disconnected, 2);
        assert_eq!(bridge.stats().frames_published, 0);
    }

    #[tokio::test]
    async fn test_offline_keeps_connected_flag() {
        let (mut bridge, _, _) = running_bridge().await;
        bridge.on_pubsub_event(PubSubEvent::Offline).await;
        assert!(bridge.is_connected());
    }

    #[tokio::test]
    async fn test_command_fills_defaults() {
        let (mut bridge, mesh, _) = running_bridge().await;

        bridge
            .on_mqtt_message(&format!("{}/nwk:0x1234/request", GATEWAY), &command_payload("on"))
            .await;
        bridge
            .on_mqtt_message(&format!("{}/nwk:0x1234/request", GATEWAY), &command_payload("off"))
            .await;

        let requests = mesh.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].destination, MeshAddress::Short(0x1234));
        assert_eq!(requests[0].aps_frame.options, Some(aps_options::DEFAULT));
        assert_eq!(requests[0].aps_frame.sequence, Some(0));
        assert_eq!(requests[0].payload, b"on");
        assert_eq!(requests[1].aps_frame.sequence, Some(1));
        assert_eq!(bridge.stats().commands_sent, 2);
    }

    #[tokio::test]
    async fn test_command_by_extended_id_uses_known_short_address() {
        let (mut bridge, mesh, _) = running_bridge().await;
        let lamp = Eui64(0x00124b0001abcdef);
        bridge
            .on_mesh_event(MeshEvent::DeviceJoined {
                short_address: 0x2001,
                extended_id: lamp,
            })
            .await;

        bridge
            .on_mqtt_message(&format!("{}/{}/request", GATEWAY, lamp), &command_payload("on"))
            .await;
        bridge
            .on_mqtt_message(
                &format!("{}/00158d0002345678/request", GATEWAY),
                &command_payload("on"),
            )
            .await;

        let requests = mesh.requests();
        assert_eq!(requests[0].destination, MeshAddress::Short(0x2001));
        assert_eq!(
            requests[1].destination,
            MeshAddress::Extended(Eui64(0x00158d0002345678))
        );
    }

    #[tokio::test]
    async fn test_invalid_address_is_logged() {
        let (mut bridge, mesh, pubsub) = running_bridge().await;

        bridge
            .on_mqtt_message(&format!("{}/kitchen/request", GATEWAY), &command_payload("on"))
            .await;

        assert!(mesh.requests().is_empty());
        assert_eq!(bridge.stats().malformed_payloads, 1);
        let log = pubsub.published_to(&format!("{}/log", GATEWAY));
        assert_eq!(log.len(), 1);
        assert!(log[0].retain);
        assert!(std::str::from_utf8(&log[0].payload)
            .unwrap()
            .contains("kitchen"));
    }

    #[tokio::test]
    async fn test_mesh_send_failure_is_reported() {
        let (mut bridge, mesh, pubsub) = running_bridge().await;
        mesh.set_fail_requests(true);

        bridge
            .on_mqtt_message(&format!("{}/nwk:0x1/request", GATEWAY), &command_payload("on"))
            .await;

        assert_eq!(bridge.stats().mesh_send_failures, 1);
        assert_eq!(bridge.stats().commands_sent, 0);
        assert_eq!(pubsub.published_to(&format!("{}/log", GATEWAY)).len(), 1);
    }

    #[tokio::test]
    async fn test_refused_publish_is_dropped_and_counted() {
        let (mut bridge, _, pubsub) = running_bridge().await;
        pubsub.set_fail_publish(true);

        bridge
            .on_mesh_event(MeshEvent::IncomingMessage(sample_frame(0x1234)))
            .await;

        assert_eq!(bridge.stats().publish_failures, 2);
        assert_eq!(bridge.stats().frames_published, 0);
        assert_eq!(bridge.stats().dropped_while_disconnected, 0);

        pubsub.set_fail_publish(false);
        bridge
            .on_mesh_event(MeshEvent::IncomingMessage(sample_frame(0x1234)))
            .await;
        assert_eq!(bridge.stats().frames_published, 1);
    }

    #[tokio::test]
    async fn test_failing_log_publish_does_not_recurse() {
        let (mut bridge, _, pubsub) = running_bridge().await;
        pubsub.set_fail_publish(true);

        bridge
            .on_mqtt_message(&format!("{}/permit-joining", GATEWAY), b"soon")
            .await;

        assert!(pubsub.publications().is_empty());
        assert_eq!(bridge.stats().malformed_payloads, 1);
    }

    #[tokio::test]
    async fn test_permit_join_window() {
        let (mut bridge, mesh, _) = running_bridge().await;

        bridge
            .on_mqtt_message(&format!("{}/permit-joining", GATEWAY), b"30")
            .await;
        assert_eq!(mesh.permit_joins(), vec![30]);
        assert!(bridge.permit_join_open());

        bridge
            .on_mqtt_message(&format!("{}/permit-joining", GATEWAY), b"0")
            .await;
        assert_eq!(mesh.permit_joins(), vec![30, 0]);
        assert!(!bridge.permit_join_open());
        assert_eq!(bridge.stats().permit_join_requests, 2);
    }

    #[tokio::test]
    async fn test_resumed_session_skips_subscribe() {
        let (mut bridge, _, pubsub) = test_bridge().await;
        bridge.start().await.unwrap();

        bridge
            .on_pubsub_event(PubSubEvent::Connected {
                session_present: true,
            })
            .await;

        assert!(pubsub.subscriptions().is_empty());
        assert_eq!(pubsub.published_to(&format!("{}/online", GATEWAY)).len(), 1);
        assert_eq!(bridge.state(), BridgeState::Running);
    }

    #[tokio::test]
    async fn test_stop_publishes_offline() {
        let (mut bridge, mesh, pubsub) = running_bridge().await;

        bridge.stop().await.unwrap();

        let online = pubsub.published_to(&format!("{}/online", GATEWAY));
        assert_eq!(online.len(), 1);
        assert_eq!(&online[0].payload[..], b"0");
        assert!(online[0].retain);
        assert!(pubsub.is_ended());
        assert!(mesh.is_stopped());
        assert_eq!(bridge.state(), BridgeState::Stopped);

        assert!(matches!(
            bridge.stop().await,
            Err(BridgeError::BridgeNotRunning)
        ));
    }

    #[test]
    fn test_bridge_state_display() {
        assert_eq!(BridgeState::Running.to_string(), "running");
        assert_eq!(BridgeState::Stopping.to_string(), "stopping");
    }
}
