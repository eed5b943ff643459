//! One bounded attempt at a certificate-validated session.

use super::{ConnectError, Connector, SessionIo, TcpConnector, WsSession, CRYPTO_PROVIDER};
use crate::config::{ChannelConfig, Credentials, Endpoint};
use log::{debug, error, info, warn};
use rustls::pki_types::ServerName;
use rustls::{CertificateError, ClientConfig, RootCertStore};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::Error as WsError;

/// Produces live sessions for the channel supervisor.
pub trait Establish: Send + Sync + 'static {
    /// Session type produced.
    type Io: SessionIo;

    /// Make one attempt. Never retries.
    fn connect(&self) -> impl Future<Output = Result<Self::Io, ConnectError>> + Send;
}

/// TLS client bound to one endpoint and trust anchor.
///
/// The rustls configuration is built once from the credentials; an unusable
/// trust anchor is remembered and every `connect()` fails with
/// `ConfigurationInvalid` before any socket is opened.
pub struct SecureChannelEstablisher<C: Connector = TcpConnector> {
    credentials: Arc<Credentials>,
    connector: C,
    handshake_timeout: Duration,
    tls: Result<(TlsConnector, ServerName<'static>), ConnectError>,
}

impl SecureChannelEstablisher<TcpConnector> {
    /// Establisher over plain TCP sockets.
    pub fn new(credentials: Arc<Credentials>, config: &ChannelConfig) -> Self {
        Self::with_connector(credentials, config, TcpConnector)
    }
}

impl<C: Connector> SecureChannelEstablisher<C> {
    /// Establisher over a custom transport.
    pub fn with_connector(credentials: Arc<Credentials>, config: &ChannelConfig, connector: C) -> Self {
        let tls = build_tls(credentials.endpoint());
        if let Err(e) = &tls {
            error!("Secure channel unusable: {}", e);
        }
        Self {
            credentials,
            connector,
            handshake_timeout: config.handshake_timeout,
            tls,
        }
    }

    /// Credentials this establisher connects with.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Open transport, run the TLS handshake, then upgrade to WebSocket.
    ///
    /// The whole sequence is bounded by the handshake timeout.
    pub async fn connect(&self) -> Result<WsSession<TlsStream<C::Stream>>, ConnectError> {
        let (tls, server_name) = self.tls.as_ref().map_err(Clone::clone)?;
        let endpoint = self.credentials.endpoint();

        info!("Connecting to {}", endpoint.url());
        match timeout(self.handshake_timeout, self.handshake(endpoint, tls, server_name)).await {
            Ok(Ok(session)) => {
                info!("Secure session established with {}", endpoint.address());
                Ok(session)
            }
            Ok(Err(e)) => {
                warn!("Connect to {} failed: {}", endpoint.address(), e);
                Err(e)
            }
            Err(_) => {
                warn!(
                    "Connect to {} timed out after {:?}",
                    endpoint.address(),
                    self.handshake_timeout
                );
                Err(ConnectError::HandshakeTimeout)
            }
        }
    }

    async fn handshake(
        &self,
        endpoint: &Endpoint,
        tls: &TlsConnector,
        server_name: &ServerName<'static>,
    ) -> Result<WsSession<TlsStream<C::Stream>>, ConnectError> {
        let tcp = self
            .connector
            .open(endpoint.host(), endpoint.port())
            .await
            .map_err(|e| ConnectError::NetworkUnreachable(e.to_string()))?;

        let tls_stream = tls
            .connect(server_name.clone(), tcp)
            .await
            .map_err(classify_tls_error)?;
        debug!("TLS handshake complete with {}", endpoint.host());

        let (ws, response) = tokio_tungstenite::client_async(endpoint.url(), tls_stream)
            .await
            .map_err(classify_upgrade_error)?;
        debug!("WebSocket upgrade accepted ({})", response.status());

        Ok(WsSession::new(ws))
    }
}

impl<C: Connector> Establish for SecureChannelEstablisher<C> {
    type Io = WsSession<TlsStream<C::Stream>>;

    async fn connect(&self) -> Result<Self::Io, ConnectError> {
        SecureChannelEstablisher::connect(self).await
    }
}

/// Build the TLS client with the trust anchor as the only root.
fn build_tls(endpoint: &Endpoint) -> Result<(TlsConnector, ServerName<'static>), ConnectError> {
    let anchor = endpoint.trust_anchor();
    if anchor.is_empty() {
        return Err(ConnectError::ConfigurationInvalid(
            "no trust anchor configured".into(),
        ));
    }

    let mut roots = RootCertStore::empty();
    roots
        .add(anchor.to_certificate_der())
        .map_err(|e| ConnectError::ConfigurationInvalid(format!("trust anchor rejected: {}", e)))?;

    let config = ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ConnectError::ConfigurationInvalid(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    let server_name = ServerName::try_from(endpoint.host().to_string())
        .map_err(|e| ConnectError::ConfigurationInvalid(format!("invalid host name: {}", e)))?;

    Ok((TlsConnector::from(Arc::new(config)), server_name))
}

/// Map a TLS handshake failure to the connect taxonomy.
///
/// tokio-rustls reports rustls errors wrapped in `io::Error`; anything else is
/// a transport failure.
fn classify_tls_error(e: io::Error) -> ConnectError {
    let Some(tls_error) = e.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()) else {
        return ConnectError::NetworkUnreachable(e.to_string());
    };

    match tls_error {
        rustls::Error::InvalidCertificate(cert_error) => match cert_error {
            CertificateError::Expired
            | CertificateError::ExpiredContext { .. }
            | CertificateError::NotValidYet
            | CertificateError::NotValidYetContext { .. } => ConnectError::CertificateExpired,
            CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. } => {
                ConnectError::HostnameMismatch
            }
            other => ConnectError::CertificateInvalid(format!("{:?}", other)),
        },
        other => ConnectError::HandshakeFailed(other.to_string()),
    }
}

/// Map a WebSocket upgrade failure to the connect taxonomy.
fn classify_upgrade_error(e: WsError) -> ConnectError {
    match e {
        WsError::Http(response) => ConnectError::UpgradeRejected(response.status().as_u16()),
        other => ConnectError::NetworkUnreachable(format!("upgrade failed: {}", other)),
    }
}
