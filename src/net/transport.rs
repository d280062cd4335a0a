//! HTTPS transport for the control channel
//!
//! Every exchange opens a fresh TCP connection through the [`Dialer`], runs a
//! full TLS handshake (and with it the pin check) and sends exactly one
//! HTTP/2 request. Connections are never pooled.

use crate::crypto::PinMismatch;
use crate::error::{Result, RestError};
use crate::protocol::constants::USER_AGENT;
use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, USER_AGENT as USER_AGENT_HEADER};
use hyper::{Method, Request, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use rustls::{CertificateError, ClientConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use super::dialer::Dialer;

/// Bound for TCP connect plus TLS handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound for receiving response headers once the request is sent
pub const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a request goes and which name the certificate must carry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub addr: SocketAddr,
    pub server_name: String,
}

/// Raw HTTP outcome before status interpretation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub body: Bytes,
}

/// One JSON POST, one reply
pub trait Exchange: Send + Sync {
    fn post_json<'a>(
        &'a self,
        target: &'a Target,
        url: &'a str,
        body: Vec<u8>,
    ) -> BoxFuture<'a, Result<Reply>>;
}

/// Production transport: dialer, pinned TLS and HTTP/2
pub struct HttpsTransport {
    dialer: Arc<Dialer>,
    connector: TlsConnector,
    user_agent: String,
}

impl HttpsTransport {
    pub fn new(dialer: Arc<Dialer>, tls_config: Arc<ClientConfig>) -> Self {
        Self {
            dialer,
            connector: TlsConnector::from(tls_config),
            user_agent: USER_AGENT.to_string(),
        }
    }

    /// Replace the user-agent header value
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    async fn exchange(&self, target: &Target, url: &str, body: Vec<u8>) -> Result<Reply> {
        let uri: Uri = url
            .parse()
            .map_err(|e| RestError::Config(format!("Invalid request URL {url}: {e}")))?;
        let server_name = ServerName::try_from(target.server_name.clone())
            .map_err(|e| RestError::Config(format!("Invalid server name: {e}")))?;

        let stream = timeout(HANDSHAKE_TIMEOUT, async {
            let tcp = self.dialer.dial_tcp(target.addr).await.map_err(|e| {
                RestError::Network(format!("TCP connection to {} failed: {e}", target.addr))
            })?;
            self.connector
                .connect(server_name, tcp)
                .await
                .map_err(handshake_error)
        })
        .await
        .map_err(|_| RestError::Timeout(format!("TLS handshake with {}", target.addr)))??;

        if stream.get_ref().1.alpn_protocol() != Some(b"h2".as_slice()) {
            return Err(RestError::Tls(format!(
                "{} did not negotiate HTTP/2",
                target.addr
            )));
        }

        let (mut sender, connection) =
            hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
                .await
                .map_err(|e| RestError::Http(format!("HTTP/2 handshake failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::debug!("Rest: connection closed with error: {e}");
            }
        });

        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(USER_AGENT_HEADER, self.user_agent.as_str())
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| RestError::Http(format!("Cannot build request: {e}")))?;

        let response = timeout(RESPONSE_HEADER_TIMEOUT, sender.send_request(request))
            .await
            .map_err(|_| RestError::Timeout(format!("response headers from {url}")))?
            .map_err(|e| RestError::Http(format!("Request to {url} failed: {e}")))?;

        let status = response.status().as_u16();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| RestError::Http(format!("Cannot read response body: {e}")))?
            .to_bytes();

        log::debug!("Rest: POST {url} -> {status} ({} bytes)", body.len());
        Ok(Reply { status, body })
    }
}

impl Exchange for HttpsTransport {
    fn post_json<'a>(
        &'a self,
        target: &'a Target,
        url: &'a str,
        body: Vec<u8>,
    ) -> BoxFuture<'a, Result<Reply>> {
        Box::pin(self.exchange(target, url, body))
    }
}

/// Surface pin mismatches as their own error instead of a generic TLS failure
fn handshake_error(err: std::io::Error) -> RestError {
    let tls_error = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>());

    match tls_error {
        Some(rustls::Error::InvalidCertificate(CertificateError::Other(other))) => {
            match other.0.downcast_ref::<PinMismatch>() {
                Some(mismatch) => RestError::BadPin(mismatch.common_name.clone()),
                None => RestError::Tls(format!("TLS handshake failed: {err}")),
            }
        }
        Some(tls) => RestError::Tls(format!("TLS handshake failed: {tls}")),
        None => RestError::Network(format!("TLS handshake failed: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::OtherError;

    #[test]
    fn test_pin_mismatch_maps_to_bad_pin() {
        let tls = rustls::Error::InvalidCertificate(CertificateError::Other(OtherError(
            Arc::new(PinMismatch {
                common_name: "Evil Root CA".to_string(),
            }),
        )));
        let io = std::io::Error::new(std::io::ErrorKind::InvalidData, tls);

        match handshake_error(io) {
            RestError::BadPin(name) => assert_eq!(name, "Evil Root CA"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_other_certificate_errors_stay_tls() {
        let tls = rustls::Error::InvalidCertificate(CertificateError::Expired);
        let io = std::io::Error::new(std::io::ErrorKind::InvalidData, tls);
        assert!(matches!(handshake_error(io), RestError::Tls(_)));

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(handshake_error(io), RestError::Network(_)));
    }

    #[test]
    fn test_user_agent() {
        let tls = crate::crypto::client_config(None, Arc::new(crate::crypto::PinSet::authorized()))
            .unwrap();
        let transport = HttpsTransport::new(Arc::new(Dialer::new(0, Vec::new())), tls);
        assert_eq!(transport.user_agent(), "HIDE.ME.LINUX.CLI-0.9.3");

        let transport = transport.with_user_agent("HIDE.ME.LINUX.CLI-1.0.0");
        assert_eq!(transport.user_agent(), "HIDE.ME.LINUX.CLI-1.0.0");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_network_error() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let dialer = Arc::new(Dialer::new(0, Vec::new()));
        let tls = crate::crypto::client_config(None, Arc::new(crate::crypto::PinSet::authorized()))
            .unwrap();
        let transport = HttpsTransport::new(dialer, tls);
        let target = Target {
            addr,
            server_name: "hideservers.net".to_string(),
        };

        let url = format!("https://{addr}/v1.0.0/connect");
        let result = transport.post_json(&target, &url, b"{}".to_vec()).await;
        assert!(matches!(result, Err(RestError::Network(_))));
    }
}
