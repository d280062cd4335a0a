//! TLS configuration for the control channel
//!
//! Connections are TLS 1.3 only, negotiate HTTP/2 through ALPN and go through
//! [`PinnedVerifier`], which adds the CA pin check on top of standard chain
//! verification.

use crate::error::{Result, RestError};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, SignatureVerificationAlgorithm, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, OtherError, RootCertStore};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use super::pins::{CertificateSummary, PinSet};

/// Server certificate verifier that enforces the pin table after the
/// standard webpki checks have passed
///
/// The pins are checked over the verified path: the end entity, the
/// intermediates webpki actually used and the trust anchor it ended at.
#[derive(Debug)]
pub struct PinnedVerifier {
    inner: Arc<WebPkiServerVerifier>,
    roots: Arc<RootCertStore>,
    algorithms: &'static [&'static dyn SignatureVerificationAlgorithm],
    pins: Arc<PinSet>,
}

impl PinnedVerifier {
    pub fn new(
        roots: Arc<RootCertStore>,
        provider: Arc<CryptoProvider>,
        pins: Arc<PinSet>,
    ) -> Result<Self> {
        let algorithms = provider.signature_verification_algorithms.all;
        let inner = WebPkiServerVerifier::builder_with_provider(roots.clone(), provider)
            .build()
            .map_err(|e| RestError::Tls(format!("Cannot build certificate verifier: {e}")))?;

        Ok(Self {
            inner,
            roots,
            algorithms,
            pins,
        })
    }

    /// Rebuild the verified path and check every CA certificate on it
    pub fn check_pins(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<(), rustls::Error> {
        let bad_encoding = |e: String| {
            log::warn!("Pins: {e}");
            rustls::Error::InvalidCertificate(CertificateError::BadEncoding)
        };

        let certificate = webpki::EndEntityCert::try_from(end_entity)
            .map_err(|e| bad_encoding(format!("unparsable end entity: {e}")))?;
        let path = certificate
            .verify_for_usage(
                self.algorithms,
                &self.roots.roots,
                intermediates,
                now,
                webpki::KeyUsage::server_auth(),
                None,
                None,
            )
            .map_err(|e| {
                log::warn!("Pins: no verified path, {e}");
                rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer)
            })?;

        let leaf = CertificateSummary::from_der(end_entity.as_ref()).map_err(bad_encoding)?;
        let mut chain = vec![leaf];
        for intermediate in path.intermediate_certificates() {
            chain.push(
                CertificateSummary::from_der(intermediate.der().as_ref()).map_err(bad_encoding)?,
            );
        }
        chain.push(CertificateSummary::from_trust_anchor(path.anchor()).map_err(bad_encoding)?);

        self.pins.verify_chains(&[chain]).map_err(|mismatch| {
            rustls::Error::InvalidCertificate(CertificateError::Other(OtherError(Arc::new(
                mismatch,
            ))))
        })
    }
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        self.inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;
        self.check_pins(end_entity, intermediates, now)?;
        Ok(ServerCertVerified::assertion())
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

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Root store from a PEM bundle, or the bundled webpki roots
pub fn root_store(ca_bundle: Option<&Path>) -> Result<RootCertStore> {
    let mut root_store = RootCertStore::empty();

    match ca_bundle {
        Some(path) => {
            let file = File::open(path).map_err(|e| {
                RestError::Config(format!("Cannot open CA bundle {}: {e}", path.display()))
            })?;
            let certs = rustls_pemfile::certs(&mut BufReader::new(file))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| {
                    RestError::Config(format!("Bad certificate in {}: {e}", path.display()))
                })?;

            let (added, ignored) = root_store.add_parsable_certificates(certs);
            if added == 0 {
                return Err(RestError::Config(format!(
                    "Bad certificate in {}",
                    path.display()
                )));
            }
            log::debug!(
                "Loaded {added} CA certificates from {} ({ignored} ignored)",
                path.display()
            );
        }
        None => root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    Ok(root_store)
}

/// Build the client TLS configuration: TLS 1.3, ALPN `h2`, pinned verifier
pub fn client_config(ca_bundle: Option<&Path>, pins: Arc<PinSet>) -> Result<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let roots = Arc::new(root_store(ca_bundle)?);
    let verifier = PinnedVerifier::new(roots, provider.clone(), pins)?;

    let mut config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec()];

    Ok(Arc::new(config))
}
