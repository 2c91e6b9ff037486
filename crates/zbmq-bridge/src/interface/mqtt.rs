//! MQTT broker session over rumqttc
//!
//! rumqttc splits a session into an [`AsyncClient`] for requests and an
//! [`EventLoop`] that must be polled for anything to happen. The event loop
//! runs in its own task and turns broker traffic into [`PubSubEvent`]s.
//! Reconnecting is the poll loop's job: after a failed poll it reports the
//! error, waits the reconnect period and polls again.
//!
//! Delivery is at most once in both directions. Publishing never waits for
//! room in the request queue, and the poll loop drops inbound messages when
//! the bridge is behind, so neither side can stall the other.

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::codec::Publication;
use crate::error::{BridgeError, Result};
use crate::interface::{ConnectOptions, PubSubClient, PubSubEvent};

/// Default port for plain MQTT
pub const MQTT_PORT: u16 = 1883;

/// Default port for MQTT over TLS
pub const MQTTS_PORT: u16 = 8883;

/// Capacity of the request queue between client and event loop
const REQUEST_QUEUE_CAPACITY: usize = 64;

/// How long `end` waits for the event loop to flush the disconnect
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// Broker host, port and transport parsed from a URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Whether to wrap the connection in TLS
    pub tls: bool,
}

impl BrokerEndpoint {
    /// Parse `mqtt://`, `tcp://`, `mqtts://` or `ssl://` URLs
    pub fn parse(broker: &str) -> Result<Self> {
        let url = Url::parse(broker)
            .map_err(|e| BridgeError::ConfigInvalid(format!("broker `{}`: {}", broker, e)))?;

        let (tls, default_port) = match url.scheme() {
            "mqtt" | "tcp" => (false, MQTT_PORT),
            "mqtts" | "ssl" => (true, MQTTS_PORT),
            other => {
                return Err(BridgeError::ConfigInvalid(format!(
                    "broker `{}`: unsupported scheme `{}`",
                    broker, other
                )))
            }
        };

        let host = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
            .filter(|h| !h.is_empty())
            .ok_or_else(|| BridgeError::ConfigInvalid(format!("broker `{}`: missing host", broker)))?;

        Ok(Self {
            host: host.to_string(),
            port: url.port().unwrap_or(default_port),
            tls,
        })
    }
}

/// Translate session parameters into rumqttc options
pub fn build_mqtt_options(options: &ConnectOptions) -> Result<MqttOptions> {
    let endpoint = BrokerEndpoint::parse(&options.broker)?;

    let mut mqtt = MqttOptions::new(options.client_id.clone(), endpoint.host, endpoint.port);
    mqtt.set_keep_alive(options.keep_alive);
    mqtt.set_clean_session(options.clean_session);
    if let Some((username, password)) = &options.credentials {
        mqtt.set_credentials(username.clone(), password.clone());
    }
    mqtt.set_last_will(rumqttc::LastWill::new(
        options.last_will.topic.clone(),
        options.last_will.payload.clone(),
        QoS::AtMostOnce,
        options.last_will.retain,
    ));
    if endpoint.tls {
        mqtt.set_transport(Transport::tls_with_default_config());
    }

    Ok(mqtt)
}

/// MQTT implementation of [`PubSubClient`]
#[derive(Default)]
pub struct MqttClient {
    client: Option<AsyncClient>,
    poller: Option<JoinHandle<()>>,
}

impl MqttClient {
    /// Create an unconnected client
    pub fn new() -> Self {
        Self::default()
    }

    fn client(&self) -> Result<&AsyncClient> {
        self.client.as_ref().ok_or(BridgeError::NotConnected)
    }
}

#[async_trait]
impl PubSubClient for MqttClient {
    async fn connect(
        &mut self,
        options: &ConnectOptions,
        events: mpsc::Sender<PubSubEvent>,
    ) -> Result<()> {
        if self.client.is_some() {
            return Err(BridgeError::PubSubTransport(
                "session already started".to_string(),
            ));
        }

        let mqtt = build_mqtt_options(options)?;
        let (host, port) = mqtt.broker_address();
        info!(%host, port, client_id = %options.client_id, "Connecting to MQTT broker");

        let (client, eventloop) = AsyncClient::new(mqtt, REQUEST_QUEUE_CAPACITY);
        self.client = Some(client);
        self.poller = Some(tokio::spawn(poll_loop(
            eventloop,
            events,
            options.reconnect_period,
        )));
        Ok(())
    }

    async fn subscribe(&mut self, filter: &str) -> Result<()> {
        debug!(filter, "Subscribing");
        self.client()?.subscribe(filter, QoS::AtMostOnce).await?;
        Ok(())
    }

    async fn publish(&mut self, publication: Publication) -> Result<()> {
        trace!(
            topic = %publication.topic,
            bytes = publication.payload.len(),
            retain = publication.retain,
            "Publishing"
        );
        self.client()?
            .try_publish(
                publication.topic,
                QoS::AtMostOnce,
                publication.retain,
                publication.payload.to_vec(),
            )
            .map_err(|e| match e {
                rumqttc::ClientError::TryRequest(_) => {
                    BridgeError::PubSubTransport("request queue full".to_string())
                }
                other => other.into(),
            })
    }

    async fn end(&mut self) -> Result<()> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };

        if let Err(e) = client.disconnect().await {
            debug!(error = %e, "Disconnect request not delivered");
        }

        if let Some(mut poller) = self.poller.take() {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut poller)
                .await
                .is_err()
            {
                warn!("MQTT event loop did not stop in time");
                poller.abort();
            }
        }

        info!("MQTT session ended");
        Ok(())
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
    }
}

impl std::fmt::Debug for MqttClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttClient")
            .field("started", &self.client.is_some())
            .finish()
    }
}

/// Drive the event loop until the session is closed or nobody listens
async fn poll_loop(
    mut eventloop: EventLoop,
    events: mpsc::Sender<PubSubEvent>,
    reconnect_period: Duration,
) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => PubSubEvent::Connected {
                session_present: ack.session_present,
            },
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if !offer_message(&events, publish.topic, publish.payload) {
                    debug!("Event receiver dropped, stopping MQTT event loop");
                    break;
                }
                continue;
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                let _ = events.send(PubSubEvent::Closed).await;
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "MQTT connection error");
                for event in [
                    PubSubEvent::Error(e.to_string()),
                    PubSubEvent::Closed,
                    PubSubEvent::Offline,
                ] {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
                tokio::time::sleep(reconnect_period).await;
                continue;
            }
        };

        if events.send(event).await.is_err() {
            debug!("Event receiver dropped, stopping MQTT event loop");
            break;
        }
    }
}

/// Hand an inbound message to the bridge without waiting
///
/// A full queue drops the message. Returns false once the receiver is gone.
fn offer_message(events: &mpsc::Sender<PubSubEvent>, topic: String, payload: Bytes) -> bool {
    match events.try_send(PubSubEvent::Message { topic, payload }) {
        Ok(()) => true,
        Err(TrySendError::Full(PubSubEvent::Message { topic, .. })) => {
            warn!(%topic, "Bridge is behind, dropping inbound message");
            true
        }
        Err(TrySendError::Full(_)) => true,
        Err(TrySendError::Closed(_)) => false,
    }
}
