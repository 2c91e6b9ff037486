//! Mesh addressing and application-layer frame types
//!
//! A mesh node has two identities:
//!
//! | Identity | Width | Lifetime |
//! |----------|-------|----------|
//! | Short address (`nwk`) | 16 bit | Until the node leaves; may be reassigned |
//! | Extended id (EUI-64) | 64 bit | Device lifetime |
//!
//! On MQTT topics the extended id appears as 16 lowercase hex digits and the
//! short address as `nwk:0x1234`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::{BridgeError, Result};

/// Prefix marking a short network address on topics
pub const SHORT_ADDRESS_PREFIX: &str = "nwk:";

/// APS delivery option bits understood by the coordinator
pub mod aps_options {
    /// No options
    pub const NONE: u16 = 0x0000;
    /// Encrypt with the link key
    pub const ENCRYPTION: u16 = 0x0020;
    /// Resend until acknowledged
    pub const RETRY: u16 = 0x0040;
    /// Discover a route if none exists
    pub const ENABLE_ROUTE_DISCOVERY: u16 = 0x0100;
    /// Always discover a fresh route
    pub const FORCE_ROUTE_DISCOVERY: u16 = 0x0200;
    /// Include the source EUI-64 in the network frame
    pub const SOURCE_EUI64: u16 = 0x0400;
    /// Include the destination EUI-64 in the network frame
    pub const DESTINATION_EUI64: u16 = 0x0800;
    /// Resolve the short address from the EUI-64 before sending
    pub const ENABLE_ADDRESS_DISCOVERY: u16 = 0x1000;

    /// Options applied when a command omits them
    pub const DEFAULT: u16 = RETRY | ENABLE_ROUTE_DISCOVERY;
}

// ============================================================================
// Identifiers
// ============================================================================

/// Globally unique 64-bit device identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Eui64(pub u64);

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for Eui64 {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        if digits.len() != 16 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BridgeError::InvalidAddress(s.to_string()));
        }
        u64::from_str_radix(digits, 16)
            .map(Eui64)
            .map_err(|_| BridgeError::InvalidAddress(s.to_string()))
    }
}

impl Serialize for Eui64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Eui64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Target of an outbound request or origin of an inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeshAddress {
    /// Coordinator-assigned 16-bit network address
    Short(u16),
    /// Stable 64-bit identifier
    Extended(Eui64),
}

impl MeshAddress {
    /// Whether this is the transient short form
    pub fn is_short(&self) -> bool {
        matches!(self, MeshAddress::Short(_))
    }
}

impl fmt::Display for MeshAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshAddress::Short(nwk) => write!(f, "{}0x{:x}", SHORT_ADDRESS_PREFIX, nwk),
            MeshAddress::Extended(eui) => write!(f, "{}", eui),
        }
    }
}

impl FromStr for MeshAddress {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix(SHORT_ADDRESS_PREFIX) {
            let digits = rest
                .strip_prefix("0x")
                .or_else(|| rest.strip_prefix("0X"))
                .unwrap_or(rest);
            if digits.is_empty() {
                return Err(BridgeError::InvalidAddress(s.to_string()));
            }
            return u16::from_str_radix(digits, 16)
                .map(MeshAddress::Short)
                .map_err(|_| BridgeError::InvalidAddress(s.to_string()));
        }
        s.parse::<Eui64>().map(MeshAddress::Extended)
    }
}

impl From<Eui64> for MeshAddress {
    fn from(eui: Eui64) -> Self {
        MeshAddress::Extended(eui)
    }
}

impl Serialize for MeshAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MeshAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Frames
// ============================================================================

/// Application-layer frame header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApsFrame {
    /// Application profile
    pub profile_id: u16,
    /// Cluster within the profile
    pub cluster_id: u16,
    /// Sending endpoint
    pub source_endpoint: u8,
    /// Receiving endpoint
    pub destination_endpoint: u8,
    /// Delivery option bitmask, see [`aps_options`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<u16>,
    /// Multicast group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<u16>,
    /// APS sequence number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u8>,
}

impl ApsFrame {
    /// Fill in the fields a caller is allowed to omit
    ///
    /// The counter only advances when `sequence` is missing.
    pub fn with_defaults(mut self, sequence: &mut SequenceCounter) -> Self {
        if self.options.is_none() {
            self.options = Some(aps_options::DEFAULT);
        }
        if self.sequence.is_none() {
            self.sequence = Some(sequence.allocate());
        }
        self
    }
}

/// Frame payload as carried in JSON
///
/// Commands may send plain text, which goes out as its UTF-8 bytes, or
/// `{"data": "<hex>"}` for binary content. Frames received from the mesh are
/// always published in the `data` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    /// UTF-8 text
    Text(String),
    /// Hex-encoded bytes
    Data {
        /// Hex string
        data: String,
    },
}

impl MessageBody {
    /// Wrap raw bytes received from the mesh
    pub fn from_bytes(bytes: &[u8]) -> Self {
        MessageBody::Data {
            data: hex::encode(bytes),
        }
    }

    /// Bytes to put on the air
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            MessageBody::Text(text) => Ok(text.as_bytes().to_vec()),
            MessageBody::Data { data } => hex::decode(data)
                .map_err(|e| BridgeError::PayloadMalformed(format!("message data: {}", e))),
        }
    }
}

/// Frame delivered by the mesh stack's `incomingMessage` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingFrame {
    /// Unicast, broadcast or multicast indicator from the coordinator
    #[serde(default)]
    pub message_type: u8,
    /// Frame header
    pub aps_frame: ApsFrame,
    /// Link quality of the last hop
    #[serde(default)]
    pub lqi: u8,
    /// Signal strength of the last hop
    #[serde(default)]
    pub rssi: i8,
    /// Short address of the sender
    pub sender: u16,
    /// Binding table index
    #[serde(default)]
    pub binding_index: u8,
    /// Address table index
    #[serde(default)]
    pub address_index: u8,
    /// Payload
    pub message: MessageBody,
    /// Extended id of the sender, when known. Internal annotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_eui64: Option<Eui64>,
}

impl IncomingFrame {
    /// Best available address of the sender
    pub fn sender_address(&self) -> MeshAddress {
        match self.sender_eui64 {
            Some(eui) => MeshAddress::Extended(eui),
            None => MeshAddress::Short(self.sender),
        }
    }

    /// Copy without bridge-internal annotations
    pub fn stripped(&self) -> Self {
        Self {
            sender_eui64: None,
            ..self.clone()
        }
    }
}

// ============================================================================
// Sequence numbering
// ============================================================================

/// 8-bit APS sequence generator, wraps at 256
#[derive(Debug, Clone, Default)]
pub struct SequenceCounter {
    next: u8,
}

impl SequenceCounter {
    /// Counter starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter starting at an arbitrary value
    pub fn starting_at(value: u8) -> Self {
        Self { next: value }
    }

    /// Take the next sequence number
    pub fn allocate(&mut self) -> u8 {
        let current = self.next;
        self.next = self.next.wrapping_add(1);
        current
    }
}
