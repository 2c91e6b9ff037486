//! Inbound topic routing
//!
//! The router turns an MQTT `(topic, payload)` pair into an [`Intent`]. Topic
//! shape is positional: the address is whatever segment sits right before
//! `request`, so the root topic may itself contain `/`.
//!
//! ```text
//! zbmq/00124b0001000001/00124b0001abcdef/request   -> Command
//! zbmq/00124b0001000001/nwk:0x1234/request         -> Command
//! zbmq/00124b0001000001/permit-joining             -> PermitJoin
//! ```

use tracing::trace;

use crate::codec::{decode_inbound_payload, shared_response_topic, InboundPayload};

/// Segment that marks a command topic
pub const REQUEST_SEGMENT: &str = "request";

/// Suffix of the permit-joining control topic
pub const PERMIT_JOINING_SUFFIX: &str = "/permit-joining";

/// What an inbound message asks the bridge to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// Send a frame to a device
    Command {
        /// Address segment from the topic, not yet interpreted
        address: String,
        /// Decoded request body
        payload: InboundPayload,
    },
    /// Open or close the joining window
    PermitJoin {
        /// Window length in seconds
        duration_seconds: u8,
    },
    /// Nothing usable
    Malformed {
        /// Topic as received
        raw: String,
        /// Why it was rejected
        reason: String,
    },
}

/// Routes topics below one gateway topic
#[derive(Debug, Clone)]
pub struct TopicRouter {
    root: String,
}

impl TopicRouter {
    /// Create a router for a gateway topic
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    /// Gateway topic this router is bound to
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Subscription filter for device commands
    pub fn request_filter(&self) -> String {
        format!("{}/+/{}", self.root, REQUEST_SEGMENT)
    }

    /// Permit-joining control topic
    pub fn permit_joining_topic(&self) -> String {
        format!("{}{}", self.root, PERMIT_JOINING_SUFFIX)
    }

    /// Shared response topic
    pub fn response_topic(&self) -> String {
        shared_response_topic(&self.root)
    }

    /// Retained liveness topic
    pub fn online_topic(&self) -> String {
        format!("{}/online", self.root)
    }

    /// Retained error log topic
    pub fn log_topic(&self) -> String {
        format!("{}/log", self.root)
    }

    /// Classify an inbound message
    pub fn route(&self, topic: &str, payload: &[u8]) -> Intent {
        trace!(topic, bytes = payload.len(), "Routing inbound message");

        if topic.ends_with(PERMIT_JOINING_SUFFIX) {
            return self.route_permit_join(topic, payload);
        }

        let relative = topic
            .strip_prefix(self.root.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(topic);
        let segments: Vec<&str> = relative.split('/').collect();

        let address = match segments.iter().position(|s| *s == REQUEST_SEGMENT) {
            None => return malformed(topic, "no request segment"),
            Some(0) => return malformed(topic, "no address before request segment"),
            Some(index) => segments[index - 1],
        };
        if address.is_empty() {
            return malformed(topic, "empty address segment");
        }

        match decode_inbound_payload(payload) {
            Ok(payload) => Intent::Command {
                address: address.to_string(),
                payload,
            },
            Err(e) => malformed(topic, &e.to_string()),
        }
    }

    fn route_permit_join(&self, topic: &str, payload: &[u8]) -> Intent {
        let text = match std::str::from_utf8(payload) {
            Ok(text) => text.trim(),
            Err(_) => return malformed(topic, "permit-joining duration is not UTF-8"),
        };

        if text.is_empty() || !text.chars().all(|c| c.is_ascii_digit()) {
            return malformed(
                topic,
                &format!("permit-joining duration `{}` is not a decimal integer", text),
            );
        }

        match text.parse::<u8>() {
            Ok(duration_seconds) => Intent::PermitJoin { duration_seconds },
            Err(_) => malformed(
                topic,
                &format!("permit-joining duration `{}` exceeds 255 seconds", text),
            ),
        }
    }
}

fn malformed(topic: &str, reason: &str) -> Intent {
    Intent::Malformed {
        raw: topic.to_string(),
        reason: reason.to_string(),
    }
}
