//! Serial port coordinator for mesh networks
//!
//! Opens the coordinator's serial port with tokio-serial and runs the
//! [`HostLink`] protocol over it. The port is configured 8N1 with XON/XOFF
//! flow control, which is what the coordinator firmware expects.
//!
//! This is not an EZSP or ZNP driver. The coordinator must be flashed with
//! firmware that speaks the host-link protocol described in
//! [`crate::interface::link`].

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::Path;
use tokio::sync::mpsc;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, StopBits};
use tracing::{debug, info, warn};

use crate::config::SerialSettings;
use crate::error::{BridgeError, Result};
use crate::frame::{ApsFrame, Eui64, MeshAddress};
use crate::interface::link::HostLink;
use crate::interface::{MeshEvent, MeshStack};

/// Mesh coordinator reached through a serial host link
pub struct SerialCoordinator {
    link: Option<HostLink>,
    name: String,
}

impl SerialCoordinator {
    /// Create an unstarted coordinator
    pub fn new() -> Self {
        Self {
            link: None,
            name: "serial".to_string(),
        }
    }

    fn link(&mut self) -> Result<&mut HostLink> {
        self.link
            .as_mut()
            .ok_or_else(|| BridgeError::MeshTransport("coordinator not started".to_string()))
    }
}

impl Default for SerialCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MeshStack for SerialCoordinator {
    async fn startup(
        &mut self,
        settings: &SerialSettings,
        events: mpsc::Sender<MeshEvent>,
    ) -> Result<()> {
        if self.link.is_some() {
            return Err(BridgeError::MeshStartupFailed(
                "coordinator already started".to_string(),
            ));
        }

        info!(port = %settings.port, baud = settings.baud_rate, "Opening coordinator serial port");
        if !Path::new(&settings.port).exists() {
            return Err(BridgeError::MeshStartupFailed(format!(
                "serial port {} not found",
                settings.port
            )));
        }

        let stream = tokio_serial::new(&settings.port, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::Software)
            .open_native_async()
            .map_err(|e| {
                BridgeError::MeshStartupFailed(format!("{}: {}", settings.port, e))
            })?;

        let mut link = HostLink::attach(stream, events, settings.request_timeout);
        link.call("startup", Value::Null)
            .await
            .map_err(|e| BridgeError::MeshStartupFailed(e.to_string()))?;

        self.name = format!("serial:{}", settings.port);
        self.link = Some(link);
        info!(port = %settings.port, "Coordinator started");
        Ok(())
    }

    async fn local_eui64(&mut self) -> Result<Eui64> {
        let value = self.link()?.call("get_eui64", Value::Null).await?;
        parse_eui64(value)?.ok_or_else(|| {
            BridgeError::MeshTransport("coordinator did not report its EUI-64".to_string())
        })
    }

    async fn request(
        &mut self,
        destination: MeshAddress,
        aps_frame: &ApsFrame,
        payload: &[u8],
    ) -> Result<()> {
        debug!(%destination, bytes = payload.len(), "Sending unicast");
        self.link()?
            .call(
                "send_unicast",
                json!({
                    "destination": destination.to_string(),
                    "apsFrame": aps_frame,
                    "message": hex::encode(payload),
                }),
            )
            .await?;
        Ok(())
    }

    async fn permit_joining(&mut self, duration_seconds: u8) -> Result<()> {
        self.link()?
            .call("permit_joining", json!({ "duration": duration_seconds }))
            .await?;
        Ok(())
    }

    async fn network_id_to_eui64(&mut self, short_address: u16) -> Result<Option<Eui64>> {
        let value = self
            .link()?
            .call("lookup_eui64", json!({ "nodeId": short_address }))
            .await?;
        parse_eui64(value)
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(mut link) = self.link.take() else {
            return Ok(());
        };

        if let Err(e) = link.call("shutdown", Value::Null).await {
            warn!(error = %e, "Coordinator did not acknowledge shutdown");
        }
        link.close();

        info!(name = %self.name, "Coordinator stopped");
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for SerialCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialCoordinator")
            .field("name", &self.name)
            .field("link", &self.link)
            .finish()
    }
}

/// `null` means unknown; anything else must be an EUI-64 string
fn parse_eui64(value: Value) -> Result<Option<Eui64>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => s
            .parse()
            .map(Some)
            .map_err(|_| BridgeError::MeshTransport(format!("invalid EUI-64 `{}`", s))),
        other => Err(BridgeError::MeshTransport(format!(
            "expected EUI-64 string, got {}",
            other
        ))),
    }
}
