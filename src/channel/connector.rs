use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{SecureChannel, ServiceChannel};
use crate::chunking::ChannelSecurity;
use crate::config::{ChannelConfig, TransportConfig};
use crate::crypto::{ApplicationCredentials, Certificate, MessageSecurityMode, SecurityPolicy};
use crate::error::UaError;

/// Policy, mode and key material a channel is opened with.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub policy: SecurityPolicy,
    pub mode: MessageSecurityMode,
    pub credentials: Option<Arc<ApplicationCredentials>>,
    pub server_certificate: Option<Certificate>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self::none()
    }
}

impl SecurityConfig {
    pub fn none() -> Self {
        Self {
            policy: SecurityPolicy::None,
            mode: MessageSecurityMode::None,
            credentials: None,
            server_certificate: None,
        }
    }

    pub fn secured(
        mode: MessageSecurityMode,
        credentials: ApplicationCredentials,
        server_certificate: Certificate,
    ) -> Self {
        Self {
            policy: SecurityPolicy::Aes256Sha256Ed25519,
            mode,
            credentials: Some(Arc::new(credentials)),
            server_certificate: Some(server_certificate),
        }
    }

    /// Loads the client key from a PKCS#8 PEM file and the server certificate from its
    /// encoded form on disk.
    pub fn from_files(
        mode: MessageSecurityMode,
        key_pem: impl AsRef<Path>,
        application_uri: &str,
        server_certificate: impl AsRef<Path>,
    ) -> Result<Self, UaError> {
        let credentials = ApplicationCredentials::from_pem_file(key_pem, application_uri)?;
        let certificate = Certificate::decode(&std::fs::read(server_certificate)?)?;
        Ok(Self::secured(mode, credentials, certificate))
    }

    /// Fresh per-channel security context.
    pub fn channel_security(&self) -> Result<ChannelSecurity, UaError> {
        if !self.mode.signs() {
            return Ok(ChannelSecurity::none());
        }
        ChannelSecurity::new(
            self.policy,
            self.mode,
            self.credentials.clone(),
            self.server_certificate.clone(),
        )
    }
}

/// Produces fresh, open channels to one endpoint.
///
/// The reconnection controller calls this for every repair attempt; tests substitute
/// in-memory implementations.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    fn endpoint_url(&self) -> &str;

    async fn connect(&self) -> Result<Arc<dyn ServiceChannel>, UaError>;
}

/// Opens channels over TCP.
#[derive(Debug, Clone)]
pub struct TcpChannelConnector {
    endpoint_url: String,
    transport: TransportConfig,
    channel: ChannelConfig,
    security: SecurityConfig,
}

impl TcpChannelConnector {
    pub fn new(
        endpoint_url: impl Into<String>,
        transport: TransportConfig,
        channel: ChannelConfig,
        security: SecurityConfig,
    ) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            transport,
            channel,
            security,
        }
    }
}

#[async_trait]
impl ChannelConnector for TcpChannelConnector {
    fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    async fn connect(&self) -> Result<Arc<dyn ServiceChannel>, UaError> {
        info!(endpoint = %self.endpoint_url, mode = ?self.security.mode, "opening secure channel");
        let channel = SecureChannel::connect(
            &self.endpoint_url,
            &self.transport,
            self.channel.clone(),
            self.security.channel_security()?,
        )
        .await?;
        Ok(Arc::new(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsecured_config_builds_plain_context() {
        let security = SecurityConfig::none().channel_security().unwrap();
        assert_eq!(security.mode, MessageSecurityMode::None);
        assert!(security.local_credentials().is_none());
    }

    #[test]
    fn secured_config_carries_keys() {
        let client = ApplicationCredentials::generate("urn:client");
        let server = ApplicationCredentials::generate("urn:server");
        let config = SecurityConfig::secured(
            MessageSecurityMode::Sign,
            client,
            server.certificate().clone(),
        );
        let security = config.channel_security().unwrap();
        assert_eq!(security.policy, SecurityPolicy::Aes256Sha256Ed25519);
        assert_eq!(security.remote_certificate(), Some(server.certificate()));
    }
}
