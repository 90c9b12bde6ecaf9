//! TLS material for both ends of a tunnel
//!
//! Loaded once at server construction and shared read-only by every
//! handshake afterwards.

use super::TunnelError;
use crate::config::CertPaths;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring as ring_provider, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Certificate chain plus its private key
pub type Identity = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

/// CA pool, local identities and the verification flag
pub struct TlsMaterial {
    roots: RootCertStore,
    server_identity: Option<Identity>,
    client_identity: Option<Identity>,
    verify_peer: bool,
    provider: Arc<CryptoProvider>,
}

impl TlsMaterial {
    /// Load everything that exists under `paths`.
    ///
    /// Missing files are not fatal; they only disable the corresponding
    /// feature (or make verification fail later when `verify_peer` is set).
    pub fn load(paths: &CertPaths, verify_peer: bool) -> Self {
        let mut roots = RootCertStore::empty();
        match load_certs(&paths.ca) {
            Ok(certs) => {
                let (added, ignored) = roots.add_parsable_certificates(certs);
                debug!("Loaded {} CA certificate(s), ignored {}", added, ignored);
            }
            Err(e) if verify_peer => warn!("Open CA bundle failed: {}", e),
            Err(e) => debug!("No CA bundle: {}", e),
        }

        let server_identity = load_identity(&paths.server_cert, &paths.server_key)
            .map_err(|e| warn!("Server certificate unavailable, tunnels disabled: {}", e))
            .ok();

        let client_identity = load_identity(&paths.client_cert, &paths.client_key)
            .map_err(|e| {
                if verify_peer {
                    warn!("Client certificate unavailable: {}", e)
                } else {
                    debug!("Client certificate unavailable: {}", e)
                }
            })
            .ok();

        Self::from_parts(roots, server_identity, client_identity, verify_peer)
    }

    /// Build from already-parsed material
    pub fn from_parts(
        roots: RootCertStore,
        server_identity: Option<Identity>,
        client_identity: Option<Identity>,
        verify_peer: bool,
    ) -> Self {
        Self {
            roots,
            server_identity,
            client_identity,
            verify_peer,
            provider: Arc::new(ring_provider::default_provider()),
        }
    }

    pub fn verify_peer(&self) -> bool {
        self.verify_peer
    }

    /// TLS 1.3-only server configuration, `None` without a server identity
    pub fn server_config(&self) -> Result<Option<Arc<ServerConfig>>, TunnelError> {
        let Some((certs, key)) = &self.server_identity else {
            return Ok(None);
        };

        let builder = ServerConfig::builder_with_provider(self.provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| TunnelError::Tls(e.to_string()))?;

        let builder = if self.verify_peer {
            let verifier = WebPkiClientVerifier::builder_with_provider(
                Arc::new(self.roots.clone()),
                self.provider.clone(),
            )
            .build()
            .map_err(|e| TunnelError::Tls(format!("client verifier: {}", e)))?;
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };

        let config = builder
            .with_single_cert(certs.clone(), key.clone_key())
            .map_err(|e| TunnelError::Tls(e.to_string()))?;

        info!("TLS server ready (client verification: {})", self.verify_peer);
        Ok(Some(Arc::new(config)))
    }

    /// Client configuration used to dial upstream tunnels
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, TunnelError> {
        let builder = ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| TunnelError::Tls(e.to_string()))?;

        let builder = if self.verify_peer {
            builder.with_root_certificates(self.roots.clone())
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification(
                    self.provider.clone(),
                )))
        };

        let config = match &self.client_identity {
            Some((certs, key)) => builder
                .with_client_auth_cert(certs.clone(), key.clone_key())
                .map_err(|e| TunnelError::Tls(e.to_string()))?,
            None => builder.with_no_client_auth(),
        };

        Ok(Arc::new(config))
    }
}

fn load_identity(cert: &Path, key: &Path) -> Result<Identity, TunnelError> {
    Ok((load_certs(cert)?, load_private_key(key)?))
}

/// Load a certificate chain from a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TunnelError> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path).map_err(|e| {
        TunnelError::Certificate(format!("Failed to open {}: {}", path.display(), e))
    })?);
    let certs: Vec<_> = rustls_pemfile::certs(&mut file)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| parse_error(path, e))?;
    if certs.is_empty() {
        return Err(TunnelError::Certificate(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load a private key from a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TunnelError> {
    let mut file = std::io::BufReader::new(std::fs::File::open(path).map_err(|e| {
        TunnelError::Certificate(format!("Failed to open {}: {}", path.display(), e))
    })?);
    rustls_pemfile::private_key(&mut file)
        .map_err(|e| parse_error(path, e))?
        .ok_or_else(|| {
            TunnelError::Certificate(format!("No private key found in {}", path.display()))
        })
}

fn parse_error(path: &Path, e: std::io::Error) -> TunnelError {
    TunnelError::Certificate(format!("Failed to parse {}: {}", path.display(), e))
}

/// Accepts any server certificate; signatures are still checked.
/// Used when peer verification is switched off.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
