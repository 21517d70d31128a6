//! TLS client for the command channel.

use crate::channel::tls::load_certificates;
use crate::protocol::{framing, CommandRequest, CommandResponse, Fields};
use anyhow::{bail, Context, Result};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore, SupportedProtocolVersion};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Connects to a gateway, trusting a single CA certificate file.
pub struct ChannelClient {
    address: String,
    server_name: ServerName<'static>,
    connector: TlsConnector,
}

impl ChannelClient {
    pub fn new(address: impl Into<String>, server_name: &str, ca_certificate: &Path) -> Result<Self> {
        Self::with_versions(address, server_name, ca_certificate, rustls::ALL_VERSIONS)
    }

    /// Client restricted to the given TLS versions.
    pub fn with_versions(
        address: impl Into<String>,
        server_name: &str,
        ca_certificate: &Path,
        versions: &[&'static SupportedProtocolVersion],
    ) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        for cert in load_certificates(ca_certificate)? {
            roots
                .add(cert)
                .with_context(|| format!("Invalid CA certificate in {}", ca_certificate.display()))?;
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(versions)?
            .with_root_certificates(roots)
            .with_no_client_auth();

        let server_name = ServerName::try_from(server_name.to_string())
            .with_context(|| format!("Invalid server name: {}", server_name))?;

        Ok(Self {
            address: address.into(),
            server_name,
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Open a connection and complete the TLS handshake.
    pub async fn connect(&self) -> Result<ClientConnection> {
        let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.address))
            .await
            .map_err(|_| anyhow::anyhow!("Connection timeout - is the gateway reachable?"))?
            .with_context(|| format!("Failed to connect to {}", self.address))?;

        let stream = tokio::time::timeout(
            CONNECT_TIMEOUT,
            self.connector.connect(self.server_name.clone(), tcp),
        )
        .await
        .map_err(|_| anyhow::anyhow!("TLS handshake timeout"))?
        .with_context(|| format!("TLS handshake with {} failed", self.address))?;

        Ok(ClientConnection {
            stream,
            next_ask: 1,
        })
    }
}

/// An open channel; requests go out one at a time.
pub struct ClientConnection {
    stream: TlsStream<TcpStream>,
    next_ask: u64,
}

impl ClientConnection {
    /// Send one command and wait for its response.
    pub async fn call(&mut self, command: &str, fields: Fields) -> Result<CommandResponse> {
        let ask = self.next_ask.to_string();
        self.next_ask += 1;

        let request = CommandRequest::new(command, fields).with_ask(ask.clone());
        framing::write_box(&mut self.stream, &request.into_box()).await?;

        let reply = tokio::time::timeout(RESPONSE_TIMEOUT, framing::read_box(&mut self.stream))
            .await
            .map_err(|_| anyhow::anyhow!("Request timeout - no response to {}", command))??;
        let Some(reply) = reply else {
            bail!("Connection closed before a response to {} arrived", command);
        };

        let (tag, response) = CommandResponse::from_box(reply)?;
        if tag.as_deref() != Some(ask.as_str()) {
            bail!(
                "Response tag mismatch: sent {}, got {}",
                ask,
                tag.as_deref().unwrap_or("none")
            );
        }
        Ok(response)
    }
}
