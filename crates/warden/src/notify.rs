//! Discovery announcements
//!
//! Tells interested parties (typically a local DNS updater) that a domain now
//! has a certificate and which host serves it.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use certwarden_config::MqttSettings;
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, QoS};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

/// Upper bound for one connect-publish-disconnect cycle
pub const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to encode announcement: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("MQTT connection error: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("announcement timed out after {0:?}")]
    Timeout(Duration),
}

/// Message body published for each discovered domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainAnnouncement {
    pub domain: String,
    pub ip: String,
}

/// Announces discovered domains
#[async_trait]
pub trait DiscoveryNotifier: Send + Sync + fmt::Debug {
    async fn announce(&self, domain: &str) -> Result<(), NotifyError>;
}

/// Publishes announcements to an MQTT broker, one short connection each
#[derive(Debug, Clone)]
pub struct MqttNotifier {
    settings: MqttSettings,
    timeout: Duration,
}

impl MqttNotifier {
    pub fn new(settings: MqttSettings) -> Self {
        Self {
            settings,
            timeout: ANNOUNCE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn announcement(&self, domain: &str) -> DomainAnnouncement {
        DomainAnnouncement {
            domain: domain.to_string(),
            ip: self.settings.host_ip.clone(),
        }
    }

    async fn publish(&self, payload: Vec<u8>) -> Result<(), NotifyError> {
        let client_id = format!("certwarden-{}", std::process::id());
        let mut options = MqttOptions::new(client_id, &self.settings.host, self.settings.port);
        options.set_keep_alive(Duration::from_secs(5));

        let (client, mut eventloop) = AsyncClient::new(options, 10);
        client
            .publish(&self.settings.topic, QoS::AtMostOnce, false, payload)
            .await?;
        client.disconnect().await?;

        // Drive the connection until the queued publish and disconnect are out
        loop {
            match eventloop.poll().await? {
                Event::Outgoing(Outgoing::Disconnect) => return Ok(()),
                event => debug!(?event, "MQTT event"),
            }
        }
    }
}

#[async_trait]
impl DiscoveryNotifier for MqttNotifier {
    async fn announce(&self, domain: &str) -> Result<(), NotifyError> {
        let payload = serde_json::to_vec(&self.announcement(domain))?;

        tokio::time::timeout(self.timeout, self.publish(payload))
            .await
            .map_err(|_| NotifyError::Timeout(self.timeout))??;

        info!(
            domain = %domain,
            topic = %self.settings.topic,
            broker = %self.settings.host,
            "Announced domain"
        );
        Ok(())
    }
}
