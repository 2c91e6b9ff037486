//! Online/offline status and last-will handling
//!
//! The bridge advertises itself on a retained `<root>/online` topic: `1`
//! while connected, `0` after a deliberate shutdown, and `0` from the broker
//! (via the last will) when the connection dies.

use tracing::debug;

use crate::codec::Publication;

/// Payload while the bridge is up
pub const ONLINE_PAYLOAD: &str = "1";

/// Payload after shutdown or connection loss
pub const OFFLINE_PAYLOAD: &str = "0";

/// Last-will message registered with the broker at connect time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    /// Will topic
    pub topic: String,
    /// Will payload
    pub payload: String,
    /// Retain flag
    pub retain: bool,
}

/// How a broker handshake should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// New session: subscriptions must be (re)established
    Fresh,
    /// Broker kept our session; subscriptions are still in place
    Resumed,
}

/// Tracks broker connection state and produces status messages
#[derive(Debug, Clone)]
pub struct LivenessSignaler {
    online_topic: String,
    connected: bool,
    shutting_down: bool,
}

impl LivenessSignaler {
    /// Create a signaler for the given online topic
    pub fn new(online_topic: impl Into<String>) -> Self {
        Self {
            online_topic: online_topic.into(),
            connected: false,
            shutting_down: false,
        }
    }

    /// Topic the status is published on
    pub fn online_topic(&self) -> &str {
        &self.online_topic
    }

    /// Will to register with the broker
    pub fn last_will(&self) -> LastWill {
        LastWill {
            topic: self.online_topic.clone(),
            payload: OFFLINE_PAYLOAD.to_string(),
            retain: true,
        }
    }

    /// Whether publishing is currently possible
    pub fn is_connected(&self) -> bool {
        self.connected && !self.shutting_down
    }

    /// Whether a deliberate shutdown has begun
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Broker handshake completed
    ///
    /// Returns the status message to publish and whether the session is new.
    pub fn on_connect(&mut self, session_present: bool) -> (Publication, SessionKind) {
        self.connected = true;
        let kind = if session_present {
            SessionKind::Resumed
        } else {
            SessionKind::Fresh
        };
        debug!(topic = %self.online_topic, ?kind, "Broker connected");
        (
            Publication::retained(self.online_topic.clone(), ONLINE_PAYLOAD),
            kind,
        )
    }

    /// Connection closed
    pub fn on_close(&mut self) {
        if self.connected {
            debug!(topic = %self.online_topic, "Broker connection closed");
        }
        self.connected = false;
    }

    /// Client went offline while reconnecting. Does not change state.
    pub fn on_offline(&self) {
        debug!(connected = self.connected, "Broker client offline");
    }

    /// Start a deliberate shutdown
    ///
    /// Returns the offline status to publish if the broker is still reachable.
    /// After this call [`is_connected`](Self::is_connected) is false.
    pub fn begin_shutdown(&mut self) -> Option<Publication> {
        let publication = self
            .is_connected()
            .then(|| Publication::retained(self.online_topic.clone(), OFFLINE_PAYLOAD));
        self.shutting_down = true;
        publication
    }
}
