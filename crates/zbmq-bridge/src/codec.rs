//! Translation between mesh frames and MQTT topics/payloads
//!
//! Everything here is a pure function. The bridge controller decides *when*
//! to publish; the codec decides *what* goes on which topic.
//!
//! | Direction | Topic | Payload |
//! |-----------|-------|---------|
//! | mesh → MQTT | `<root>/response` | full [`IncomingFrame`] JSON |
//! | mesh → MQTT | `<root>/<id>/response` | frame JSON without `senderEui64` |
//! | MQTT → mesh | `<root>/<id>/request` | [`InboundPayload`] JSON |

use bytes::Bytes;
use serde::Deserialize;

use crate::error::{BridgeError, Result};
use crate::frame::{ApsFrame, IncomingFrame, MeshAddress, MessageBody};

/// Last topic segment of every outbound frame topic
pub const RESPONSE_SEGMENT: &str = "response";

/// Message ready to hand to the pub/sub client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    /// Destination topic
    pub topic: String,
    /// Message body
    pub payload: Bytes,
    /// Whether the broker should retain it
    pub retain: bool,
}

impl Publication {
    /// Non-retained publication
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }

    /// Retained publication
    pub fn retained(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            retain: true,
            ..Self::new(topic, payload)
        }
    }
}

/// Body of a `<root>/<id>/request` message
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundPayload {
    /// Address repeated in the payload. The topic segment wins.
    #[serde(default)]
    pub address: Option<String>,
    /// Frame header; `options` and `sequence` may be omitted
    pub aps_frame: ApsFrame,
    /// Frame payload
    pub message: MessageBody,
}

/// Topic shared by all mesh frames
pub fn shared_response_topic(root: &str) -> String {
    format!("{}/{}", root, RESPONSE_SEGMENT)
}

/// Per-device response topic
pub fn encode_outbound_topic(root: &str, address: &MeshAddress) -> String {
    format!("{}/{}/{}", root, address, RESPONSE_SEGMENT)
}

/// Serialize a frame, optionally without bridge-internal fields
pub fn frame_to_json(frame: &IncomingFrame, strip_internal: bool) -> Result<String> {
    let result = if strip_internal {
        serde_json::to_string(&frame.stripped())
    } else {
        serde_json::to_string(frame)
    };
    result.map_err(|e| BridgeError::PayloadMalformed(format!("frame encode: {}", e)))
}

/// Parse a frame previously produced by [`frame_to_json`]
pub fn frame_from_json(raw: &[u8]) -> Result<IncomingFrame> {
    serde_json::from_slice(raw).map_err(|e| BridgeError::PayloadMalformed(e.to_string()))
}

/// Everything to publish for one mesh frame
///
/// The shared `<root>/response` copy keeps the resolved extended id. With
/// `expand` set, a second copy goes to the sender's own topic without it.
pub fn outbound_publications(
    root: &str,
    frame: &IncomingFrame,
    expand: bool,
) -> Result<Vec<Publication>> {
    let mut publications = vec![Publication::new(
        shared_response_topic(root),
        frame_to_json(frame, false)?,
    )];

    if expand {
        publications.push(Publication::new(
            encode_outbound_topic(root, &frame.sender_address()),
            frame_to_json(frame, true)?,
        ));
    }

    Ok(publications)
}

/// Decode the JSON body of a request message
pub fn decode_inbound_payload(raw: &[u8]) -> Result<InboundPayload> {
    let value: serde_json::Value = serde_json::from_slice(raw)
        .map_err(|e| BridgeError::PayloadMalformed(format!("invalid JSON: {}", e)))?;

    let Some(object) = value.as_object() else {
        return Err(BridgeError::PayloadMalformed(
            "request payload must be a JSON object".to_string(),
        ));
    };
    for field in ["apsFrame", "message"] {
        if !object.contains_key(field) {
            return Err(BridgeError::PayloadMalformed(format!(
                "request payload missing `{}`",
                field
            )));
        }
    }

    serde_json::from_value(value).map_err(|e| BridgeError::PayloadMalformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Eui64;

    fn sample_frame() -> IncomingFrame {
        IncomingFrame {
            message_type: 0,
            aps_frame: ApsFrame {
                profile_id: 0x0104,
                cluster_id: 0x0402,
                source_endpoint: 1,
                destination_endpoint: 1,
                options: Some(0x0140),
                group_id: None,
                sequence: Some(12),
            },
            lqi: 200,
            rssi: -61,
            sender: 0x1234,
            binding_index: 0xff,
            address_index: 0xff,
            message: MessageBody::from_bytes(&[0x18, 0x01, 0x0a]),
            sender_eui64: Some(Eui64(0x00124b0001abcdef)),
        }
    }

    #[test]
    fn test_topics() {
        assert_eq!(shared_response_topic("zbmq/gw"), "zbmq/gw/response");
        assert_eq!(
            encode_outbound_topic("zbmq/gw", &MeshAddress::Short(0x1234)),
            "zbmq/gw/nwk:0x1234/response"
        );
        assert_eq!(
            encode_outbound_topic("zbmq/gw", &MeshAddress::Extended(Eui64(0xab))),
            "zbmq/gw/00000000000000ab/response"
        );
    }

    #[test]
    fn test_frame_json_round_trip() {
        let frame = sample_frame();

        let full = frame_to_json(&frame, false).unwrap();
        assert_eq!(frame_from_json(full.as_bytes()).unwrap(), frame);

        let stripped = frame_to_json(&frame, true).unwrap();
        assert!(!stripped.contains("senderEui64"));
        assert_eq!(frame_from_json(stripped.as_bytes()).unwrap(), frame.stripped());
    }

    #[test]
    fn test_frame_json_field_names() {
        let json = frame_to_json(&sample_frame(), false).unwrap();
        assert!(json.contains("\"apsFrame\""));
        assert!(json.contains("\"profileId\":260"));
        assert!(json.contains("\"senderEui64\":\"00124b0001abcdef\""));
        assert!(json.contains("\"message\":{\"data\":\"18010a\"}"));
    }

    #[test]
    fn test_outbound_publications_without_expansion() {
        let pubs = outbound_publications("root", &sample_frame(), false).unwrap();
        assert_eq!(pubs.len(), 1);
        assert_eq!(pubs[0].topic, "root/response");
        assert!(!pubs[0].retain);
    }

    #[test]
    fn test_outbound_publications_with_expansion() {
        let pubs = outbound_publications("root", &sample_frame(), true).unwrap();
        assert_eq!(pubs.len(), 2);
        assert_eq!(pubs[0].topic, "root/response");
        assert_eq!(pubs[1].topic, "root/00124b0001abcdef/response");

        let shared = std::str::from_utf8(&pubs[0].payload).unwrap();
        let device = std::str::from_utf8(&pubs[1].payload).unwrap();
        assert!(shared.contains("senderEui64"));
        assert!(!device.contains("senderEui64"));
    }

    #[test]
    fn test_decode_inbound_payload() {
        let raw = br#"{
            "apsFrame": {"profileId": 260, "clusterId": 6, "sourceEndpoint": 1, "destinationEndpoint": 1},
            "message": "on"
        }"#;
        let payload = decode_inbound_payload(raw).unwrap();
        assert_eq!(payload.aps_frame.cluster_id, 6);
        assert_eq!(payload.aps_frame.sequence, None);
        assert_eq!(payload.message, MessageBody::Text("on".to_string()));
        assert_eq!(payload.address, None);
    }

    #[test]
    fn test_decode_inbound_payload_rejects_bad_shapes() {
        let cases: [&[u8]; 6] = [
            b"not json",
            b"[1, 2, 3]",
            b"\"text\"",
            br#"{"message": "on"}"#,
            br#"{"apsFrame": {"profileId": 260, "clusterId": 6, "sourceEndpoint": 1, "destinationEndpoint": 1}}"#,
            br#"{"apsFrame": {"profileId": "x"}, "message": "on"}"#,
        ];
        for raw in cases {
            assert!(
                matches!(
                    decode_inbound_payload(raw),
                    Err(BridgeError::PayloadMalformed(_))
                ),
                "accepted {:?}",
                String::from_utf8_lossy(raw)
            );
        }
    }
}
