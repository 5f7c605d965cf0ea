//! Long-lived outbound channels to ingest and query endpoints.
//!
//! A [`Connection`] wraps one pooled HTTP client, or one gRPC channel for
//! OTLP ingest endpoints. It is built once at canary startup, reused by every
//! cycle, and released exactly once at shutdown, either through
//! [`Connection::release`] or when the last owner drops it.
//!
//! Both transports dial lazily. Setup fails only on an unusable URL, TLS
//! material that cannot be loaded, or a client that cannot be built; an
//! endpoint that is unreachable at startup surfaces as write or query
//! transport errors on every cycle until it comes up.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tonic::codegen::http::Uri;
use tonic::transport::{Channel, Endpoint};
use url::Url;

use crate::config::{EndpointConfig, IngestProtocol, TlsConfig};
use crate::error::{ConnectionSetupError, Result, TransportError};
use crate::tls;

/// Default port for `https` gRPC endpoints without an explicit port.
const HTTPS_PORT: u16 = 443;

#[derive(Debug, Clone)]
enum Handle {
    Http(reqwest::Client),
    Grpc(Channel),
}

/// An established channel to a single endpoint.
#[derive(Debug)]
pub struct Connection {
    url: Url,
    protocol: IngestProtocol,
    tls: bool,
    handle: Mutex<Option<Handle>>,
}

impl Connection {
    /// Resolves TLS for `endpoint` and builds its client or channel.
    ///
    /// Endpoint-level TLS replaces `canary_tls` when present. TLS files are
    /// read from disk on every call. OTLP endpoints must be connected from
    /// within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionSetupError`] if the URL is unusable, TLS material
    /// cannot be loaded, or the client cannot be built.
    pub fn connect(endpoint: &EndpointConfig, canary_tls: Option<&TlsConfig>) -> Result<Self> {
        let url = Url::parse(&endpoint.url).map_err(|e| ConnectionSetupError::InvalidUrl {
            url: endpoint.url.clone(),
            source: e,
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConnectionSetupError::UnsupportedScheme {
                url: endpoint.url.clone(),
                scheme: url.scheme().to_string(),
            }
            .into());
        }

        let resolved = tls::resolve(endpoint.tls.as_ref(), canary_tls);
        if resolved.is_some() && url.scheme() == "http" {
            tracing::warn!(
                endpoint = %url,
                "TLS configured for a plain http endpoint; TLS applies only to https"
            );
        }

        let handle = match endpoint.protocol {
            IngestProtocol::RemoteWrite => Handle::Http(http_client(resolved)?),
            IngestProtocol::Otlp => Handle::Grpc(grpc_channel(&url, resolved)?),
        };

        tracing::debug!(
            endpoint = %url,
            protocol = %endpoint.protocol,
            tls = resolved.is_some(),
            "connection established"
        );

        Ok(Self {
            url,
            protocol: endpoint.protocol,
            tls: resolved.is_some(),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// The endpoint URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The protocol this connection was built for.
    pub fn protocol(&self) -> IngestProtocol {
        self.protocol
    }

    /// Whether a TLS block applied to this endpoint.
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Returns a handle to the pooled HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] after [`release`](Self::release)
    /// and [`TransportError::ProtocolMismatch`] on a gRPC connection.
    pub fn client(&self) -> std::result::Result<reqwest::Client, TransportError> {
        match self.handle()? {
            Handle::Http(client) => Ok(client),
            Handle::Grpc(_) => Err(self.mismatch("an HTTP client")),
        }
    }

    /// Returns a handle to the gRPC channel.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] after [`release`](Self::release)
    /// and [`TransportError::ProtocolMismatch`] on an HTTP connection.
    pub fn channel(&self) -> std::result::Result<Channel, TransportError> {
        match self.handle()? {
            Handle::Grpc(channel) => Ok(channel),
            Handle::Http(_) => Err(self.mismatch("a gRPC channel")),
        }
    }

    /// Releases the channel. Returns `true` only for the call that actually
    /// released it; later calls (and the drop) are no-ops.
    pub fn release(&self) -> bool {
        let released = self.lock().take().is_some();
        if released {
            tracing::debug!(endpoint = %self.url, "connection released");
        }
        released
    }

    /// Returns `true` once the channel has been released.
    pub fn is_released(&self) -> bool {
        self.lock().is_none()
    }

    fn handle(&self) -> std::result::Result<Handle, TransportError> {
        self.lock()
            .clone()
            .ok_or_else(|| TransportError::ConnectionClosed {
                target: self.url.to_string(),
            })
    }

    fn mismatch(&self, expected: &'static str) -> TransportError {
        TransportError::ProtocolMismatch {
            target: self.url.to_string(),
            expected,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Handle>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.release();
    }
}

fn http_client(tls: Option<&TlsConfig>) -> Result<reqwest::Client> {
    let builder = match tls {
        Some(tls_config) => {
            reqwest::Client::builder().use_preconfigured_tls(tls::client_config(tls_config)?)
        }
        None => reqwest::Client::builder(),
    };
    builder
        .build()
        .map_err(|e| ConnectionSetupError::ClientCreate { source: e }.into())
}

/// Builds a lazily-dialled gRPC channel.
///
/// `https` endpoints are dialled through rustls with the resolved TLS block,
/// or the bundled roots without one. `http` endpoints are plaintext h2c.
fn grpc_channel(url: &Url, tls: Option<&TlsConfig>) -> Result<Channel> {
    let endpoint =
        Endpoint::from_shared(url.to_string()).map_err(|e| ConnectionSetupError::GrpcEndpoint {
            url: url.to_string(),
            source: e,
        })?;

    if url.scheme() != "https" {
        return Ok(endpoint.connect_lazy());
    }

    let mut config = match tls {
        Some(tls_config) => tls::client_config(tls_config)?,
        None => tls::client_config(&TlsConfig::default())?,
    };
    config.alpn_protocols = vec![b"h2".to_vec()];
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

    let dial = tower::service_fn(move |uri: Uri| {
        let connector = connector.clone();
        async move {
            let host = uri
                .host()
                .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "endpoint has no host"))?;
            let port = uri.port_u16().unwrap_or(HTTPS_PORT);

            let tcp = TcpStream::connect((host.as_str(), port)).await?;
            let server_name = ServerName::try_from(host)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let stream = connector.connect(server_name, tcp).await?;
            Ok::<_, io::Error>(TokioIo::new(stream))
        }
    });

    Ok(endpoint.connect_with_connector_lazy(dial))
}
