//! Framed JSON host link to a mesh coordinator
//!
//! This is the crate's own protocol, not EZSP or ZNP: the coordinator must
//! run host-link firmware that speaks it. It is a small request/response
//! protocol over a byte stream. Every message is framed:
//!
//! - 2 bytes: Magic number (0x5A42, big-endian)
//! - 2 bytes: Body length (big-endian)
//! - N bytes: JSON body
//!
//! The host sends `{"id": 7, "op": "send_unicast", ...}` and the coordinator
//! answers `{"type": "response", "id": 7, "ok": true, "result": ...}`. Frames
//! and membership changes are pushed unsolicited as `incoming_message`,
//! `device_joined` and `device_left` messages.
//!
//! [`HostLink`] works over any `AsyncRead + AsyncWrite` stream so the same
//! code runs against a serial port or an in-memory pipe.

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::error::{BridgeError, Result};
use crate::frame::{Eui64, IncomingFrame};
use crate::interface::MeshEvent;

/// Host link magic number (`ZB`)
pub const LINK_MAGIC: u16 = 0x5A42;

/// Largest body the coordinator will send
pub const MAX_BODY_LEN: usize = 4096;

/// Magic plus length
const HEADER_LEN: usize = 4;

/// Buffer size for reading from the stream
const READ_BUFFER_SIZE: usize = 512;

/// Outgoing frames waiting for the writer task
const WRITE_QUEUE_CAPACITY: usize = 32;

// ============================================================================
// Framing
// ============================================================================

/// Frame a body with the host link header
pub fn frame_packet(body: &[u8]) -> Result<Vec<u8>> {
    if body.len() > MAX_BODY_LEN {
        return Err(BridgeError::MeshTransport(format!(
            "host link body of {} bytes exceeds {}",
            body.len(),
            MAX_BODY_LEN
        )));
    }

    let mut packet = Vec::with_capacity(HEADER_LEN + body.len());
    packet.extend_from_slice(&LINK_MAGIC.to_be_bytes());
    packet.extend_from_slice(&(body.len() as u16).to_be_bytes());
    packet.extend_from_slice(body);
    Ok(packet)
}

/// Accumulates stream bytes and splits them into frame bodies
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: BytesMut,
}

impl FrameBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(READ_BUFFER_SIZE * 2),
        }
    }

    /// Append bytes read from the stream
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes not yet consumed
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Take the next complete body, if any
    ///
    /// Garbage before a magic number is discarded. An oversized length skips
    /// the magic and returns an error; the next call resynchronizes.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let magic = u16::from_be_bytes([self.buffer[0], self.buffer[1]]);
        if magic != LINK_MAGIC {
            match self.find_magic() {
                Some(pos) => {
                    warn!(discarded = pos, "Discarding bytes before magic number");
                    self.buffer.advance(pos);
                }
                None => {
                    // Last byte may be the first half of a magic
                    let first = LINK_MAGIC.to_be_bytes()[0];
                    let keep = usize::from(self.buffer.last() == Some(&first));
                    let discard = self.buffer.len() - keep;
                    if discard > 0 {
                        warn!(discarded = discard, "Discarding buffer without magic");
                        self.buffer.advance(discard);
                    }
                    return Ok(None);
                }
            }

            if self.buffer.len() < HEADER_LEN {
                return Ok(None);
            }
        }

        let length = u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize;
        if length > MAX_BODY_LEN {
            self.buffer.advance(2);
            return Err(BridgeError::MeshTransport(format!(
                "host link frame length {} exceeds maximum",
                length
            )));
        }

        let total = HEADER_LEN + length;
        if self.buffer.len() < total {
            trace!(
                have = self.buffer.len(),
                need = total,
                "Waiting for complete frame"
            );
            return Ok(None);
        }

        let packet = self.buffer.split_to(total);
        Ok(Some(Bytes::copy_from_slice(&packet[HEADER_LEN..])))
    }

    fn find_magic(&self) -> Option<usize> {
        let [hi, lo] = LINK_MAGIC.to_be_bytes();
        self.buffer.windows(2).position(|w| w[0] == hi && w[1] == lo)
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Message sent by the coordinator
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorMessage {
    /// Answer to a host request
    Response {
        /// Request id being answered
        id: u32,
        /// Whether the request succeeded
        ok: bool,
        /// Result value on success
        #[serde(default)]
        result: Option<Value>,
        /// Failure reason
        #[serde(default)]
        error: Option<String>,
    },
    /// Frame received from a node
    IncomingMessage(IncomingFrame),
    /// Node joined
    DeviceJoined {
        /// Assigned short address
        #[serde(rename = "shortAddress")]
        short_address: u16,
        /// Node's extended id
        #[serde(rename = "extendedId")]
        extended_id: Eui64,
    },
    /// Node left
    DeviceLeft {
        /// Short address it had
        #[serde(rename = "shortAddress")]
        short_address: u16,
        /// Node's extended id
        #[serde(rename = "extendedId")]
        extended_id: Eui64,
    },
}

/// Build a request body: `{"id", "op"}` merged with the parameter object
pub fn encode_request(id: u32, op: &str, params: Value) -> Result<Vec<u8>> {
    let mut body = Map::new();
    body.insert("id".to_string(), Value::from(id));
    body.insert("op".to_string(), Value::from(op));
    match params {
        Value::Object(fields) => body.extend(fields),
        Value::Null => {}
        other => {
            return Err(BridgeError::MeshTransport(format!(
                "request parameters for `{}` must be an object, got {}",
                op, other
            )))
        }
    }
    serde_json::to_vec(&Value::Object(body))
        .map_err(|e| BridgeError::MeshTransport(format!("request encode: {}", e)))
}

// ============================================================================
// Link
// ============================================================================

type Pending = Arc<Mutex<HashMap<u32, oneshot::Sender<Result<Value>>>>>;

/// Request/response client over a framed stream
pub struct HostLink {
    outgoing: mpsc::Sender<Vec<u8>>,
    pending: Pending,
    next_id: u32,
    timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl HostLink {
    /// Take over a stream and start the reader and writer tasks
    pub fn attach<T>(stream: T, events: mpsc::Sender<MeshEvent>, timeout: Duration) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outgoing, outgoing_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        let reader = tokio::spawn(read_loop(read_half, pending.clone(), events));
        let writer = tokio::spawn(write_loop(write_half, outgoing_rx, pending.clone()));

        Self {
            outgoing,
            pending,
            next_id: 1,
            timeout,
            reader,
            writer,
        }
    }

    /// Send a request and wait for its response
    pub async fn call(&mut self, op: &str, params: Value) -> Result<Value> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let packet = frame_packet(&encode_request(id, op, params)?)?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        if self.outgoing.send(packet).await.is_err() {
            self.pending.lock().remove(&id);
            return Err(BridgeError::MeshTransport("host link closed".to_string()));
        }
        trace!(id, op, "Host request sent");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::MeshTransport("host link closed".to_string())),
            Err(_) => {
                self.pending.lock().remove(&id);
                warn!(id, op, "Host request timed out");
                Err(BridgeError::Timeout {
                    duration_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Whether the reader task is still running
    pub fn is_open(&self) -> bool {
        !self.reader.is_finished()
    }

    /// Stop both tasks and fail outstanding requests
    pub fn close(&mut self) {
        self.reader.abort();
        self.writer.abort();
        self.pending.lock().clear();
    }
}

impl Drop for HostLink {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for HostLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostLink")
            .field("next_id", &self.next_id)
            .field("pending", &self.pending.lock().len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

async fn write_loop<W>(mut writer: W, mut outgoing: mpsc::Receiver<Vec<u8>>, pending: Pending)
where
    W: AsyncWrite + Unpin,
{
    while let Some(packet) = outgoing.recv().await {
        let written = match writer.write_all(&packet).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            error!(error = %e, "Host link write error");
            break;
        }
    }

    pending.lock().clear();
}

async fn read_loop<R>(mut reader: R, pending: Pending, events: mpsc::Sender<MeshEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameBuffer::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                warn!("Host link closed by coordinator");
                break;
            }
            Ok(n) => frames.extend(&buf[..n]),
            Err(e) => {
                error!(error = %e, "Host link read error");
                break;
            }
        }

        loop {
            match frames.next_frame() {
                Ok(Some(body)) => dispatch(&body, &pending, &events).await,
                Ok(None) => break,
                Err(e) => warn!(error = %e, "Dropping corrupt host link frame"),
            }
        }
    }

    // Dropping the senders fails every waiting call
    pending.lock().clear();
}

async fn dispatch(body: &[u8], pending: &Pending, events: &mpsc::Sender<MeshEvent>) {
    let message: CoordinatorMessage = match serde_json::from_slice(body) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Unrecognized host link message");
            return;
        }
    };

    let event = match message {
        CoordinatorMessage::Response {
            id,
            ok,
            result,
            error,
        } => {
            let waiter = pending.lock().remove(&id);
            let Some(tx) = waiter else {
                debug!(id, "Response for unknown or expired request");
                return;
            };
            let outcome = if ok {
                Ok(result.unwrap_or(Value::Null))
            } else {
                Err(BridgeError::MeshTransport(
                    error.unwrap_or_else(|| "request failed".to_string()),
                ))
            };
            let _ = tx.send(outcome);
            return;
        }
        CoordinatorMessage::IncomingMessage(frame) => MeshEvent::IncomingMessage(frame),
        CoordinatorMessage::DeviceJoined {
            short_address,
            extended_id,
        } => MeshEvent::DeviceJoined {
            short_address,
            extended_id,
        },
        CoordinatorMessage::DeviceLeft {
            short_address,
            extended_id,
        } => MeshEvent::DeviceLeft {
            short_address,
            extended_id,
        },
    };

    // The reader also completes responses, so it never waits on the bridge
    match events.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            warn!(?event, "Bridge is behind, dropping mesh event");
        }
        Err(TrySendError::Closed(_)) => debug!("Mesh event receiver dropped"),
    }
}
