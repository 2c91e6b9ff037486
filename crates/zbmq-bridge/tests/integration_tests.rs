//! Integration tests for the mesh to MQTT bridge
//!
//! These tests drive a full [`MeshBridge`] run loop against the in-memory
//! collaborators from `test_utils` and cover:
//! - Mesh frames published under shared and per-device topics
//! - Commands and permit-joining requests delivered to the mesh
//! - Device directory persistence
//! - Liveness, resumed sessions and shutdown ordering
//! - Error reporting on the log topic

use std::time::Duration;
use zbmq_bridge::codec::{frame_from_json, frame_to_json};
use zbmq_bridge::test_utils::{command_payload, sample_frame, GATEWAY_EUI64};
use zbmq_bridge::{
    BridgeConfig, BridgeConfigBuilder, BridgeError, BridgeHandle, BridgeState, DeviceDirectory,
    DeviceRecord, DirectoryStore, Eui64, JsonFileStore, Journal, MeshAddress, MeshBridge,
    MeshEvent, MemoryStore, MockMeshStack, MockPubSub, PubSubEvent, VERSION,
};

const GATEWAY: &str = "zbmq/00124b0001000001";
const LAMP: Eui64 = Eui64(0x00124b0001abcdef);

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    mesh: MockMeshStack,
    pubsub: MockPubSub,
    journal: Journal,
    handle: BridgeHandle,
    task: tokio::task::JoinHandle<zbmq_bridge::Result<()>>,
}

impl Harness {
    async fn start(config: BridgeConfig, session_present: bool) -> Self {
        Self::start_with_mesh(MockMeshStack::new(GATEWAY_EUI64), config, session_present).await
    }

    async fn start_with_mesh(mesh: MockMeshStack, config: BridgeConfig, session_present: bool) -> Self {
        let journal = Journal::default();
        let mesh = mesh.with_journal(journal.clone());
        let pubsub = MockPubSub::new()
            .auto_connect(session_present)
            .with_journal(journal.clone());
        let directory = DeviceDirectory::load(MemoryStore::new()).await.unwrap();

        let (bridge, handle) = MeshBridge::new(mesh.clone(), pubsub.clone(), directory, config);
        let task = tokio::spawn(bridge.run());

        let harness = Self {
            mesh,
            pubsub,
            journal,
            handle,
            task,
        };
        harness.wait_for_state(BridgeState::Running).await;
        harness
    }

    async fn wait_for_state(&self, expected: BridgeState) {
        for _ in 0..200 {
            if self.handle.state().await.ok() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("bridge never reached {}", expected);
    }

    async fn shutdown(self) -> (MockMeshStack, MockPubSub, Journal) {
        self.handle.shutdown().await.unwrap();
        self.task.await.unwrap().unwrap();
        (self.mesh, self.pubsub, self.journal)
    }
}

/// Poll until `condition` holds; the run loop handles events asynchronously
async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

fn topic(suffix: &str) -> String {
    format!("{}/{}", GATEWAY, suffix)
}

// ============================================================================
// Mesh → MQTT
// ============================================================================

#[tokio::test]
async fn test_unresolved_sender_published_by_short_address() {
    let h = Harness::start(BridgeConfig::default(), false).await;

    assert!(
        h.mesh
            .emit(MeshEvent::IncomingMessage(sample_frame(0x1234)))
            .await
    );
    let pubsub = h.pubsub.clone();
    eventually(|| pubsub.published_to(&topic("nwk:0x1234/response")).len() == 1).await;

    let shared = h.pubsub.published_to(&topic("response"));
    assert_eq!(shared.len(), 1);
    assert!(!shared[0].retain);

    let frame = frame_from_json(&shared[0].payload).unwrap();
    assert_eq!(frame.sender, 0x1234);
    assert_eq!(frame.sender_eui64, None);

    h.shutdown().await;
}

#[tokio::test]
async fn test_joined_device_published_by_extended_id() {
    let h = Harness::start(BridgeConfig::default(), false).await;

    h.mesh
        .emit(MeshEvent::DeviceJoined {
            short_address: 0x2001,
            extended_id: LAMP,
        })
        .await;
    h.mesh
        .emit(MeshEvent::IncomingMessage(sample_frame(0x2001)))
        .await;

    let pubsub = h.pubsub.clone();
    eventually(|| {
        pubsub
            .published_to(&topic("00124b0001abcdef/response"))
            .len()
            == 1
    })
    .await;

    let shared = h.pubsub.published_to(&topic("response"));
    let frame = frame_from_json(&shared[0].payload).unwrap();
    assert_eq!(frame.sender_eui64, Some(LAMP));

    let stats = h.handle.stats().await.unwrap();
    assert_eq!(stats.devices_joined, 1);
    assert_eq!(stats.frames_published, 1);

    h.shutdown().await;
}

#[test]
fn test_frame_json_round_trip() {
    let mut frame = sample_frame(0x1234);
    frame.sender_eui64 = Some(LAMP);

    let full = frame_to_json(&frame, false).unwrap();
    assert_eq!(frame_from_json(full.as_bytes()).unwrap(), frame);

    let stripped = frame_to_json(&frame, true).unwrap();
    assert!(!stripped.contains("senderEui64"));
    assert_eq!(
        frame_from_json(stripped.as_bytes()).unwrap(),
        frame.stripped()
    );
}

// ============================================================================
// MQTT → Mesh
// ============================================================================

#[tokio::test]
async fn test_command_delivered_to_mesh() {
    let h = Harness::start(BridgeConfig::default(), false).await;

    h.pubsub
        .emit(PubSubEvent::Message {
            topic: topic("nwk:0x1234/request"),
            payload: command_payload("on").into(),
        })
        .await;

    let mesh = h.mesh.clone();
    eventually(|| mesh.requests().len() == 1).await;

    let requests = h.mesh.requests();
    let request = &requests[0];
    assert_eq!(request.destination, MeshAddress::Short(0x1234));
    assert_eq!(request.aps_frame.cluster_id, 0x0006);
    assert_eq!(request.aps_frame.options, Some(0x0140));
    assert_eq!(request.aps_frame.sequence, Some(0));
    assert_eq!(request.payload, b"on");

    h.shutdown().await;
}

#[tokio::test]
async fn test_permit_joining() {
    let h = Harness::start(BridgeConfig::default(), false).await;

    h.pubsub
        .emit(PubSubEvent::Message {
            topic: topic("permit-joining"),
            payload: "30".into(),
        })
        .await;

    let mesh = h.mesh.clone();
    eventually(|| mesh.permit_joins() == vec![30]).await;

    h.shutdown().await;
}

#[tokio::test]
async fn test_malformed_permit_joining_is_logged() {
    let h = Harness::start(BridgeConfig::default(), false).await;

    h.pubsub
        .emit(PubSubEvent::Message {
            topic: topic("permit-joining"),
            payload: "abc".into(),
        })
        .await;

    let pubsub = h.pubsub.clone();
    eventually(|| pubsub.published_to(&topic("log")).len() == 1).await;

    let log = h.pubsub.published_to(&topic("log"));
    assert!(log[0].retain);
    assert!(std::str::from_utf8(&log[0].payload)
        .unwrap()
        .starts_with("Malformed payload"));
    assert!(h.mesh.permit_joins().is_empty());
    assert_eq!(h.handle.stats().await.unwrap().malformed_payloads, 1);

    h.shutdown().await;
}

#[tokio::test]
async fn test_command_with_bad_json_not_sent() {
    let h = Harness::start(BridgeConfig::default(), false).await;

    h.pubsub
        .emit(PubSubEvent::Message {
            topic: topic("nwk:0x1234/request"),
            payload: "{not json".into(),
        })
        .await;

    let pubsub = h.pubsub.clone();
    eventually(|| pubsub.published_to(&topic("log")).len() == 1).await;
    assert!(h.mesh.requests().is_empty());

    h.shutdown().await;
}

#[tokio::test]
async fn test_auto_sequence_wraps_after_256_commands() {
    let mesh = MockMeshStack::new(GATEWAY_EUI64);
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

    for _ in 0..257 {
        bridge
            .on_mqtt_message(&topic("nwk:0x1234/request"), &command_payload("on"))
            .await;
    }

    let requests = mesh.requests();
    assert_eq!(requests.len(), 257);
    assert_eq!(requests[0].aps_frame.sequence, Some(0));
    assert_eq!(requests[255].aps_frame.sequence, Some(255));
    assert_eq!(requests[256].aps_frame.sequence, requests[0].aps_frame.sequence);
}

// ============================================================================
// Device Directory
// ============================================================================

#[tokio::test]
async fn test_double_join_keeps_one_record() {
    let store = MemoryStore::new();
    let mut directory = DeviceDirectory::load(store.clone()).await.unwrap();

    assert!(directory.record_join(0x2001, LAMP).await.unwrap());
    assert!(!directory.record_join(0x2001, LAMP).await.unwrap());
    assert!(!directory.record_join(0x3003, LAMP).await.unwrap());

    assert_eq!(directory.len(), 1);
    assert_eq!(directory.resolve_short_address(LAMP), Some(0x2001));
    assert_eq!(directory.resolve_extended_id(0x3003), None);
    assert_eq!(store.save_count(), 1);
    assert_eq!(
        store.records(),
        vec![DeviceRecord {
            short_address: 0x2001,
            extended_id: LAMP
        }]
    );
}

#[tokio::test]
async fn test_directory_file_persistence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("devices.json");

    let mut directory = DeviceDirectory::load(JsonFileStore::new(&path)).await.unwrap();
    assert!(directory.is_empty());
    directory.record_join(0x2001, LAMP).await.unwrap();

    let reloaded = DeviceDirectory::load(JsonFileStore::new(&path)).await.unwrap();
    assert_eq!(reloaded.resolve_extended_id(0x2001), Some(LAMP));
    assert_eq!(reloaded.resolve_short_address(LAMP), Some(0x2001));
}

#[tokio::test]
async fn test_corrupt_directory_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("devices.json");
    std::fs::write(&path, "[{\"shortAddress\":").unwrap();

    let err = DeviceDirectory::load(JsonFileStore::new(&path))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::StorageCorrupt { .. }));
    assert!(err.is_fatal());

    let directory = DeviceDirectory::load_or_reset(JsonFileStore::new(&path))
        .await
        .unwrap();
    assert!(directory.is_empty());
    assert!(JsonFileStore::new(&path).location().contains("devices.json"));
}

// ============================================================================
// Liveness and Lifecycle
// ============================================================================

#[tokio::test]
async fn test_online_published_and_subscribed() {
    let h = Harness::start(BridgeConfig::default(), false).await;

    let online = h.pubsub.published_to(&topic("online"));
    assert_eq!(online.len(), 1);
    assert_eq!(&online[0].payload[..], b"1");
    assert!(online[0].retain);
    assert_eq!(
        h.pubsub.subscriptions(),
        vec![topic("+/request"), topic("permit-joining")]
    );

    let will = h.pubsub.connect_options().unwrap().last_will;
    assert_eq!(will.topic, topic("online"));
    assert_eq!(will.payload, "0");

    h.shutdown().await;
}

#[tokio::test]
async fn test_resumed_session_skips_subscribe() {
    let h = Harness::start(BridgeConfig::default(), true).await;

    assert!(h.pubsub.subscriptions().is_empty());
    assert_eq!(h.pubsub.published_to(&topic("online")).len(), 1);

    h.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_order() {
    let h = Harness::start(BridgeConfig::default(), false).await;
    let (mesh, pubsub, journal) = h.shutdown().await;

    let entries = journal.entries();
    let last_online = entries
        .iter()
        .rposition(|e| *e == format!("pubsub.publish {}", topic("online")))
        .unwrap();
    let ended = journal.position("pubsub.end").unwrap();
    let stopped = journal.position("mesh.stop").unwrap();
    assert!(last_online < ended);
    assert!(ended < stopped);

    let online = pubsub.published_to(&topic("online"));
    assert_eq!(&online.last().unwrap().payload[..], b"0");
    assert!(mesh.is_stopped());
}

#[tokio::test]
async fn test_events_after_stop_are_not_delivered() {
    let h = Harness::start(BridgeConfig::default(), false).await;
    let (mesh, pubsub, _) = h.shutdown().await;

    let published = pubsub.publications().len();
    assert!(
        !mesh
            .emit(MeshEvent::IncomingMessage(sample_frame(0x1234)))
            .await
    );
    assert!(!pubsub.emit(PubSubEvent::Connected { session_present: false }).await);
    assert_eq!(pubsub.publications().len(), published);
}

#[tokio::test]
async fn test_dropping_handles_stops_bridge() {
    let h = Harness::start(BridgeConfig::default(), false).await;
    let Harness {
        mesh, handle, task, ..
    } = h;

    drop(handle);
    task.await.unwrap().unwrap();
    assert!(mesh.is_stopped());
}

#[tokio::test]
async fn test_mesh_startup_failure_ends_run() {
    let mesh = MockMeshStack::new(GATEWAY_EUI64).failing_startup();
    let pubsub = MockPubSub::new().auto_connect(false);
    let directory = DeviceDirectory::load(MemoryStore::new()).await.unwrap();
    let (bridge, _handle) = MeshBridge::new(mesh, pubsub.clone(), directory, BridgeConfig::default());

    let err = bridge.run().await.unwrap_err();
    assert!(matches!(err, BridgeError::MeshStartupFailed(_)));
    assert!(pubsub.connect_options().is_none());
}

#[tokio::test]
async fn test_custom_root_topic() {
    let config = BridgeConfigBuilder::new()
        .root_topic("home/zigbee")
        .expand_response_topics(false)
        .build();
    let mesh = MockMeshStack::new(GATEWAY_EUI64).with_known_node(0x3003, LAMP);
    let h = Harness::start_with_mesh(mesh, config, false).await;

    h.mesh
        .emit(MeshEvent::IncomingMessage(sample_frame(0x3003)))
        .await;

    let pubsub = h.pubsub.clone();
    eventually(|| {
        pubsub
            .published_to("home/zigbee/00124b0001000001/response")
            .len()
            == 1
    })
    .await;
    assert!(h
        .pubsub
        .publications()
        .iter()
        .all(|p| !p.topic.contains("00124b0001abcdef")));

    h.shutdown().await;
}

#[test]
fn test_version() {
    assert!(!VERSION.is_empty());
}
