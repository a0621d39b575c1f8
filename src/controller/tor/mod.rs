//! Tor control-port backend

mod client;
pub mod reply;

pub use client::TorClient;

use super::{Controller, ControllerEvent, ControllerEvents};
use crate::config::BrokerConfig;
use crate::error::Result;
use crate::types::{BootstrapStatus, CloseReason, TorVersion};
use async_trait::async_trait;
use reply::Reply;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Events the broker subscribes to
pub const EVENTS: &[&str] = &["STREAM", "STATUS_CLIENT"];

/// Connection settings for the control port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorConfig {
    pub address: String,
    pub password: Option<String>,
    pub cookie_path: Option<PathBuf>,
}

impl TorConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            password: None,
            cookie_path: None,
        }
    }

    pub fn from_broker(config: &BrokerConfig) -> Self {
        Self {
            address: config.control_address.clone(),
            password: config.control_password.clone(),
            cookie_path: config.cookie_path.clone(),
        }
    }
}

/// Controller backed by a live control connection
pub struct TorController {
    client: TorClient,
    config: TorConfig,
}

impl TorController {
    /// Connect and authenticate
    pub async fn connect(config: TorConfig) -> Result<Self> {
        let client = TorClient::connect(&config.address).await?;
        client
            .authenticate(config.password.as_deref(), config.cookie_path.as_deref())
            .await?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &TorConfig {
        &self.config
    }

    pub async fn version(&self) -> Result<TorVersion> {
        self.client.version().await
    }

    /// Whether `__LeaveStreamsUnattached` is set to `1`
    pub async fn leaves_streams_unattached(&self) -> Result<bool> {
        Ok(self.client.get_conf("__LeaveStreamsUnattached").await?.as_deref() == Some("1"))
    }

    pub async fn bootstrap_phase(&self) -> Result<Option<BootstrapStatus>> {
        self.client.bootstrap_phase().await
    }

    /// Subscribe to stream and client-status events
    pub async fn events(&self) -> Result<TorEvents> {
        let rx = self.client.subscribe(EVENTS).await?;
        tracing::info!(events = ?EVENTS, "Subscribed to controller events");
        Ok(TorEvents { rx, closed: false })
    }
}

#[async_trait]
impl Controller for TorController {
    async fn attach_stream(&self, stream_id: &str, circuit_id: u64) -> Result<()> {
        self.client
            .command(&format!("ATTACHSTREAM {} {}", stream_id, circuit_id))
            .await?;
        Ok(())
    }

    async fn close_stream(&self, stream_id: &str, reason: CloseReason) -> Result<()> {
        self.client
            .command(&format!("CLOSESTREAM {} {}", stream_id, reason.code()))
            .await?;
        Ok(())
    }

    async fn redirect_stream(&self, stream_id: &str, address: &str) -> Result<()> {
        self.client
            .command(&format!("REDIRECTSTREAM {} {}", stream_id, address))
            .await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "tor"
    }
}

/// Event feed from the control connection
pub struct TorEvents {
    rx: mpsc::UnboundedReceiver<Reply>,
    closed: bool,
}

#[async_trait]
impl ControllerEvents for TorEvents {
    async fn next(&mut self) -> Result<Option<ControllerEvent>> {
        if self.closed {
            return Ok(None);
        }
        while let Some(reply) = self.rx.recv().await {
            if let Some(event) = reply::parse_event(reply.first_line()) {
                return Ok(Some(event));
            }
        }
        self.closed = true;
        Ok(Some(ControllerEvent::Closed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tor_config_from_broker() {
        let broker = BrokerConfig {
            control_password: Some("secret".to_string()),
            ..BrokerConfig::default()
        };
        let config = TorConfig::from_broker(&broker);
        assert_eq!(config.address, broker.control_address);
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert!(config.cookie_path.is_none());
    }

    #[tokio::test]
    async fn test_events_skip_unknown_and_close_once() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut events = TorEvents { rx, closed: false };
        let event = |line: &str| Reply {
            code: 650,
            lines: vec![line.to_string()],
        };
        tx.send(event("CIRC 4 BUILT")).unwrap();
        tx.send(event("STREAM 3 CONTROLLER_WAIT 0 a.pet.onion:80")).unwrap();
        drop(tx);

        match events.next().await.unwrap() {
            Some(ControllerEvent::Stream(stream)) => assert_eq!(stream.id, "3"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(events.next().await.unwrap(), Some(ControllerEvent::Closed));
        assert_eq!(events.next().await.unwrap(), None);
    }
}
