//! In-memory collaborators for exercising the bridge without hardware
//!
//! [`MockMeshStack`] and [`MockPubSub`] implement the collaborator traits
//! against shared state. Both are `Clone`: hand one copy to the bridge and
//! keep another to inject events and inspect what the bridge did.
//!
//! Both mocks can write to a shared [`Journal`] so tests can assert on the
//! order of calls across the two transports.
//!
//! # Example
//!
//! ```rust,ignore
//! let journal = Journal::default();
//! let mesh = MockMeshStack::new(GATEWAY_EUI64).with_journal(journal.clone());
//! let pubsub = MockPubSub::new().auto_connect(false).with_journal(journal.clone());
//!
//! let (mut bridge, _handle) = MeshBridge::new(mesh.clone(), pubsub.clone(), directory, config);
//! bridge.start().await?;
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::codec::Publication;
use crate::config::SerialSettings;
use crate::error::{BridgeError, Result};
use crate::frame::{ApsFrame, Eui64, IncomingFrame, MeshAddress, MessageBody};
use crate::interface::{ConnectOptions, MeshEvent, MeshStack, PubSubClient, PubSubEvent};

/// Extended id the mock coordinator reports for itself
pub const GATEWAY_EUI64: Eui64 = Eui64(0x00124b0001000001);

/// Ordered record of collaborator calls shared between mocks
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    /// Append an entry
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    /// Snapshot of all entries
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Position of the first entry equal to `entry`
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries.lock().iter().position(|e| e == entry)
    }
}

// ============================================================================
// Mesh stack
// ============================================================================

/// One frame handed to [`MeshStack::request`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRequest {
    /// Destination
    pub destination: MeshAddress,
    /// Frame header after defaults were applied
    pub aps_frame: ApsFrame,
    /// Payload bytes
    pub payload: Vec<u8>,
}

#[derive(Debug)]
struct MeshState {
    local_eui64: Eui64,
    known_nodes: HashMap<u16, Eui64>,
    fail_startup: bool,
    fail_requests: bool,
    events: Option<mpsc::Sender<MeshEvent>>,
    started: bool,
    stopped: bool,
    requests: Vec<SentRequest>,
    permit_joins: Vec<u8>,
    lookups: Vec<u16>,
}

/// Scriptable [`MeshStack`]
#[derive(Debug, Clone)]
pub struct MockMeshStack {
    state: Arc<Mutex<MeshState>>,
    journal: Journal,
}

impl MockMeshStack {
    /// Coordinator reporting `local_eui64` as its own id
    pub fn new(local_eui64: Eui64) -> Self {
        Self {
            state: Arc::new(Mutex::new(MeshState {
                local_eui64,
                known_nodes: HashMap::new(),
                fail_startup: false,
                fail_requests: false,
                events: None,
                started: false,
                stopped: false,
                requests: Vec::new(),
                permit_joins: Vec::new(),
                lookups: Vec::new(),
            })),
            journal: Journal::default(),
        }
    }

    /// Record calls in a shared journal
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    /// Node the coordinator can resolve via `network_id_to_eui64`
    pub fn with_known_node(self, short_address: u16, extended_id: Eui64) -> Self {
        self.state.lock().known_nodes.insert(short_address, extended_id);
        self
    }

    /// Make `startup` fail
    pub fn failing_startup(self) -> Self {
        self.state.lock().fail_startup = true;
        self
    }

    /// Make `request` fail or succeed
    pub fn set_fail_requests(&self, fail: bool) {
        self.state.lock().fail_requests = fail;
    }

    /// Push an event as if the coordinator had reported it
    ///
    /// Returns false if the stack was never started or the bridge is gone.
    pub async fn emit(&self, event: MeshEvent) -> bool {
        let events = self.state.lock().events.clone();
        match events {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Frames sent so far
    pub fn requests(&self) -> Vec<SentRequest> {
        self.state.lock().requests.clone()
    }

    /// Permit-joining durations requested so far
    pub fn permit_joins(&self) -> Vec<u8> {
        self.state.lock().permit_joins.clone()
    }

    /// Short addresses looked up so far
    pub fn lookups(&self) -> Vec<u16> {
        self.state.lock().lookups.clone()
    }

    /// Whether `startup` succeeded
    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    /// Whether `stop` was called
    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }
}

#[async_trait]
impl MeshStack for MockMeshStack {
    async fn startup(
        &mut self,
        settings: &SerialSettings,
        events: mpsc::Sender<MeshEvent>,
    ) -> Result<()> {
        self.journal.record("mesh.startup");
        let mut state = self.state.lock();
        if state.fail_startup {
            return Err(BridgeError::MeshStartupFailed(format!(
                "no coordinator on {}",
                settings.port
            )));
        }
        state.events = Some(events);
        state.started = true;
        Ok(())
    }

    async fn local_eui64(&mut self) -> Result<Eui64> {
        Ok(self.state.lock().local_eui64)
    }

    async fn request(
        &mut self,
        destination: MeshAddress,
        aps_frame: &ApsFrame,
        payload: &[u8],
    ) -> Result<()> {
        self.journal.record(format!("mesh.request {}", destination));
        let mut state = self.state.lock();
        if state.fail_requests {
            return Err(BridgeError::MeshTransport("delivery failed".to_string()));
        }
        state.requests.push(SentRequest {
            destination,
            aps_frame: aps_frame.clone(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn permit_joining(&mut self, duration_seconds: u8) -> Result<()> {
        self.journal
            .record(format!("mesh.permit_joining {}", duration_seconds));
        self.state.lock().permit_joins.push(duration_seconds);
        Ok(())
    }

    async fn network_id_to_eui64(&mut self, short_address: u16) -> Result<Option<Eui64>> {
        let mut state = self.state.lock();
        state.lookups.push(short_address);
        Ok(state.known_nodes.get(&short_address).copied())
    }

    async fn stop(&mut self) -> Result<()> {
        self.journal.record("mesh.stop");
        let mut state = self.state.lock();
        state.stopped = true;
        state.events = None;
        Ok(())
    }

    fn name(&self) -> &str {
        "mock-mesh"
    }
}

// ============================================================================
// Pub/sub client
// ============================================================================

#[derive(Debug, Default)]
struct PubSubState {
    auto_connect: Option<bool>,
    fail_connect: bool,
    fail_publish: bool,
    options: Option<ConnectOptions>,
    events: Option<mpsc::Sender<PubSubEvent>>,
    subscriptions: Vec<String>,
    publications: Vec<Publication>,
    ended: bool,
}

/// Scriptable [`PubSubClient`]
#[derive(Debug, Clone, Default)]
pub struct MockPubSub {
    state: Arc<Mutex<PubSubState>>,
    journal: Journal,
}

impl MockPubSub {
    /// Client that connects only when told to
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `Connected` as soon as `connect` is called
    pub fn auto_connect(self, session_present: bool) -> Self {
        self.state.lock().auto_connect = Some(session_present);
        self
    }

    /// Record calls in a shared journal
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    /// Make `connect` fail
    pub fn failing_connect(self) -> Self {
        self.state.lock().fail_connect = true;
        self
    }

    /// Make `publish` fail or succeed
    pub fn set_fail_publish(&self, fail: bool) {
        self.state.lock().fail_publish = fail;
    }

    /// Push an event as if the broker session had reported it
    pub async fn emit(&self, event: PubSubEvent) -> bool {
        let events = self.state.lock().events.clone();
        match events {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Options passed to `connect`
    pub fn connect_options(&self) -> Option<ConnectOptions> {
        self.state.lock().options.clone()
    }

    /// Filters subscribed so far
    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().subscriptions.clone()
    }

    /// Everything published so far
    pub fn publications(&self) -> Vec<Publication> {
        self.state.lock().publications.clone()
    }

    /// Publications on one topic
    pub fn published_to(&self, topic: &str) -> Vec<Publication> {
        self.state
            .lock()
            .publications
            .iter()
            .filter(|p| p.topic == topic)
            .cloned()
            .collect()
    }

    /// Forget recorded publications
    pub fn clear_publications(&self) {
        self.state.lock().publications.clear();
    }

    /// Whether `end` was called
    pub fn is_ended(&self) -> bool {
        self.state.lock().ended
    }
}

#[async_trait]
impl PubSubClient for MockPubSub {
    async fn connect(
        &mut self,
        options: &ConnectOptions,
        events: mpsc::Sender<PubSubEvent>,
    ) -> Result<()> {
        self.journal.record("pubsub.connect");
        let mut state = self.state.lock();
        if state.fail_connect {
            return Err(BridgeError::PubSubTransport(
                "connection refused".to_string(),
            ));
        }
        if let Some(session_present) = state.auto_connect {
            events
                .try_send(PubSubEvent::Connected { session_present })
                .map_err(|_| BridgeError::ChannelClosed)?;
        }
        state.options = Some(options.clone());
        state.events = Some(events);
        Ok(())
    }

    async fn subscribe(&mut self, filter: &str) -> Result<()> {
        self.journal.record(format!("pubsub.subscribe {}", filter));
        self.state.lock().subscriptions.push(filter.to_string());
        Ok(())
    }

    async fn publish(&mut self, publication: Publication) -> Result<()> {
        self.journal
            .record(format!("pubsub.publish {}", publication.topic));
        let mut state = self.state.lock();
        if state.fail_publish {
            return Err(BridgeError::PubSubTransport("publish rejected".to_string()));
        }
        state.publications.push(publication);
        Ok(())
    }

    async fn end(&mut self) -> Result<()> {
        self.journal.record("pubsub.end");
        let mut state = self.state.lock();
        state.ended = true;
        state.events = None;
        Ok(())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Frame as the coordinator would report it, without an extended id
pub fn sample_frame(sender: u16) -> IncomingFrame {
    IncomingFrame {
        message_type: 0,
        aps_frame: ApsFrame {
            profile_id: 0x0104,
            cluster_id: 0x0006,
            source_endpoint: 1,
            destination_endpoint: 1,
            options: Some(0x0140),
            group_id: None,
            sequence: Some(1),
        },
        lqi: 220,
        rssi: -52,
        sender,
        binding_index: 0xff,
        address_index: 0xff,
        message: MessageBody::from_bytes(&[0x18, 0x01, 0x0b, 0x01, 0x00]),
        sender_eui64: None,
    }
}

/// Command body for the on/off cluster without options or sequence
pub fn command_payload(message: &str) -> Vec<u8> {
    serde_json::json!({
        "apsFrame": {
            "profileId": 0x0104,
            "clusterId": 0x0006,
            "sourceEndpoint": 1,
            "destinationEndpoint": 1
        },
        "message": message
    })
    .to_string()
    .into_bytes()
}
