//! TLS resolution and rustls client configuration.
//!
//! An endpoint's own TLS block, when present, replaces the canary-level block
//! whole; there is no field-level merge. With neither present, or with the
//! winning block disabled, the endpoint is plaintext.
//!
//! TLS files are read every time [`client_config`] is called so that rotated
//! certificates are picked up by the next connection attempt.

use std::path::Path;
use std::sync::Arc;

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::config::TlsConfig;
use crate::error::{ConnectionSetupError, Result};

/// Picks the TLS block that applies to an endpoint.
///
/// Returns `None` for a plaintext connection.
pub fn resolve<'a>(
    endpoint: Option<&'a TlsConfig>,
    canary: Option<&'a TlsConfig>,
) -> Option<&'a TlsConfig> {
    endpoint.or(canary).filter(|tls| tls.enabled)
}

/// Builds a rustls client configuration from a resolved TLS block.
///
/// # Errors
///
/// Returns [`ConnectionSetupError`] if a referenced file cannot be read or
/// parsed, the server-name override is invalid, or rustls rejects the
/// certificate/key pair.
pub fn client_config(tls: &TlsConfig) -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| ConnectionSetupError::Tls { source: e })?;

    let builder = if tls.insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification { provider }))
    } else {
        let roots = Arc::new(root_store(tls.ca_file.as_deref())?);
        match &tls.server_name {
            Some(name) => {
                let server_name = ServerName::try_from(name.clone()).map_err(|_| {
                    ConnectionSetupError::InvalidServerName { name: name.clone() }
                })?;
                let inner = WebPkiServerVerifier::builder_with_provider(roots, provider)
                    .build()
                    .map_err(|e| ConnectionSetupError::Verifier {
                        reason: e.to_string(),
                    })?;
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(ServerNameOverride {
                        inner,
                        server_name,
                    }))
            }
            None => builder.with_root_certificates(roots),
        }
    };

    let config = match (&tls.cert_file, &tls.key_file) {
        (Some(cert_file), Some(key_file)) => builder
            .with_client_auth_cert(load_certificates(cert_file)?, load_private_key(key_file)?)
            .map_err(|e| ConnectionSetupError::Tls { source: e })?,
        (None, None) => builder.with_no_client_auth(),
        _ => return Err(ConnectionSetupError::IncompleteClientAuth.into()),
    };

    Ok(config)
}

/// Trust store from a CA bundle, or the bundled Mozilla roots without one.
fn root_store(ca_file: Option<&Path>) -> Result<RootCertStore> {
    let Some(path) = ca_file else {
        return Ok(RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        });
    };

    let mut roots = RootCertStore::empty();
    for cert in load_certificates(path)? {
        roots
            .add(cert)
            .map_err(|e| ConnectionSetupError::TlsMaterialInvalid {
                path: path.to_path_buf(),
                reason: format!("failed to add CA certificate: {e}"),
            })?;
    }
    Ok(roots)
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| ConnectionSetupError::TlsMaterialRead {
            path: path.to_path_buf(),
            source: e,
        })
        .map_err(Into::into)
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = read_pem(path)?;
    let certs = CertificateDer::pem_slice_iter(&pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ConnectionSetupError::TlsMaterialInvalid {
            path: path.to_path_buf(),
            reason: format!("failed to parse certificates: {e}"),
        })?;

    if certs.is_empty() {
        return Err(ConnectionSetupError::TlsMaterialInvalid {
            path: path.to_path_buf(),
            reason: "no certificates found".to_string(),
        }
        .into());
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = read_pem(path)?;
    PrivateKeyDer::from_pem_slice(&pem)
        .map_err(|e| ConnectionSetupError::TlsMaterialInvalid {
            path: path.to_path_buf(),
            reason: format!("failed to parse private key: {e}"),
        })
        .map_err(Into::into)
}

/// Verifies the server chain against the configured roots, but checks the
/// certificate names against `server_name` instead of the URL host.
#[derive(Debug)]
struct ServerNameOverride {
    inner: Arc<WebPkiServerVerifier>,
    server_name: ServerName<'static>,
}

impl ServerCertVerifier for ServerNameOverride {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        self.inner.verify_server_cert(
            end_entity,
            intermediates,
            &self.server_name,
            ocsp_response,
            now,
        )
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// `insecure_skip_verify`: accepts any server certificate. Handshake
/// signatures are still checked so the session keys are bound to the
/// presented certificate.
#[derive(Debug)]
struct SkipServerVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
