//! ZigBee Mesh to MQTT Bridge
//!
//! This crate provides a bridge between a ZigBee-style mesh coordinator and an
//! MQTT broker. Frames received from mesh nodes are published as JSON, and
//! JSON commands published to per-device request topics are delivered to the
//! mesh as unicast frames.
//!
//! # Architecture
//!
//! The bridge operates in four layers:
//!
//! 1. **Transport Interfaces** - Serial host link to the coordinator, MQTT session to the broker
//! 2. **Message Translation** - Frame ↔ JSON conversion and topic routing
//! 3. **State** - Device directory and online/offline liveness
//! 4. **Bridge Controller** - Lifecycle and event handling
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // Enable the `serial` feature to use SerialCoordinator
//! // Cargo.toml: zbmq-bridge = { version = "0.1", features = ["serial"] }
//!
//! use zbmq_bridge::{
//!     BridgeConfigBuilder, DeviceDirectory, JsonFileStore, MeshBridge, MqttClient,
//!     SerialCoordinator,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BridgeConfigBuilder::new()
//!         .broker("mqtt://localhost")
//!         .serial_port("/dev/ttyUSB0")
//!         .build();
//!     config.validate()?;
//!
//!     let directory = DeviceDirectory::load(JsonFileStore::new(&config.device_db)).await?;
//!     let (bridge, handle) =
//!         MeshBridge::new(SerialCoordinator::new(), MqttClient::new(), directory, config);
//!
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         let _ = handle.shutdown().await;
//!     });
//!
//!     bridge.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `serial` - Serial port coordinator via tokio-serial. It speaks the crate's
//!   own host-link protocol, so the coordinator needs matching firmware.
//!
//! # Topics
//!
//! With root topic `zbmq` and coordinator `00124b0001000001` the gateway topic
//! is `zbmq/00124b0001000001`, and the bridge uses:
//!
//! | Topic                          | Direction   | Content                        |
//! |--------------------------------|-------------|--------------------------------|
//! | `<gateway>/response`           | publish     | every mesh frame               |
//! | `<gateway>/<id>/response`      | publish     | frames from one device         |
//! | `<gateway>/<id>/request`       | subscribe   | command for one device         |
//! | `<gateway>/permit-joining`     | subscribe   | joining window in seconds      |
//! | `<gateway>/online`             | publish     | `1` or `0`, retained, last will |
//! | `<gateway>/log`                | publish     | last error text, retained      |
//!
//! `<id>` is a 16-digit hex extended id, or `nwk:0x1234` for a device only
//! known by its short address.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Phase 1: Core modules
pub mod config;
pub mod error;
pub mod frame;

// Phase 2: Translation and state
pub mod codec;
pub mod directory;
pub mod liveness;
pub mod router;

// Phase 3: Transports
pub mod interface;

// Phase 4: Controller
pub mod bridge;

// Phase 5: Testing utilities
pub mod test_utils;

// Re-exports for convenience - Phase 1
pub use config::{BridgeConfig, BridgeConfigBuilder, SerialSettings};
pub use error::{BridgeError, Result};
pub use frame::{ApsFrame, Eui64, IncomingFrame, MeshAddress, MessageBody, SequenceCounter};

// Re-exports for convenience - Phase 2
pub use codec::{InboundPayload, Publication};
pub use directory::{DeviceDirectory, DeviceRecord, DirectoryStore, JsonFileStore, MemoryStore};
pub use liveness::{LastWill, LivenessSignaler, SessionKind};
pub use router::{Intent, TopicRouter};

// Re-exports for convenience - Phase 3
pub use interface::link::HostLink;
pub use interface::mqtt::{BrokerEndpoint, MqttClient};
pub use interface::{ConnectOptions, MeshEvent, MeshStack, PubSubClient, PubSubEvent};

#[cfg(feature = "serial")]
pub use interface::SerialCoordinator;

// Re-exports for convenience - Phase 4
pub use bridge::{BridgeCommand, BridgeHandle, BridgeState, BridgeStats, MeshBridge};

// Re-exports for convenience - Phase 5 (testing)
pub use test_utils::{Journal, MockMeshStack, MockPubSub};

// Protocol constants re-exports
pub use config::{DEFAULT_BAUD_RATE, DEFAULT_ROOT_TOPIC};
pub use interface::link::LINK_MAGIC;
pub use liveness::{OFFLINE_PAYLOAD, ONLINE_PAYLOAD};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
