//! Session endpoint resolution
//!
//! The service balances DNS rapidly across many servers, so the session host
//! is resolved once and the resulting IP is used for every request of the
//! session. If a later lookup fails (typically while reconnecting) the
//! previous address is reused.

use crate::error::{Result, RestError};
use crate::protocol::constants::FALLBACK_SERVER_NAME;
use futures::future::BoxFuture;
use hickory_resolver::proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_resolver::proto::rr::{Name, RData, RecordType};
use hickory_resolver::proto::serialize::binary::{BinDecodable, BinEncodable};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use super::dialer::Dialer;

/// Upper bound for a single host lookup
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait for one DNS datagram exchange before resending
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(1);
/// Sends per query; each goes to a freshly picked server
pub const QUERY_ATTEMPTS: usize = 3;

const MAX_DNS_MESSAGE: usize = 4096;

/// Name to address lookup used by the resolver
pub trait HostLookup: Send + Sync {
    fn lookup_ip<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>>>;
}

/// How a call to [`EndpointResolver::resolve`] produced its address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The host is a literal IP; no lookup was made
    Literal(SocketAddr),
    /// A lookup succeeded and replaced the session address
    Fresh(SocketAddr),
    /// The lookup failed and the previous session address is reused
    Stale(SocketAddr),
}

impl Resolution {
    pub fn addr(&self) -> SocketAddr {
        match *self {
            Resolution::Literal(addr) | Resolution::Fresh(addr) | Resolution::Stale(addr) => addr,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Resolution::Stale(_))
    }
}

/// Sticky resolver for the session server address
pub struct EndpointResolver {
    lookup: Arc<dyn HostLookup>,
    remote: Option<SocketAddr>,
    server_name: Option<String>,
}

impl EndpointResolver {
    pub fn new(lookup: Arc<dyn HostLookup>) -> Self {
        Self {
            lookup,
            remote: None,
            server_name: None,
        }
    }

    /// Session address, once any resolution has succeeded
    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Name used for TLS server name indication and certificate verification
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    /// Resolve `host` and commit to the result for the rest of the session
    pub async fn resolve(&mut self, host: &str, port: u16) -> Result<Resolution> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            let remote = SocketAddr::new(ip, port);
            self.remote = Some(remote);
            // The fallback name is a SAN on every server certificate
            self.server_name = Some(FALLBACK_SERVER_NAME.to_string());
            return Ok(Resolution::Literal(remote));
        }

        let addrs = match self.lookup_with_timeout(host).await {
            Ok(addrs) => addrs,
            Err(e) => {
                log::error!("Resolve: {host} lookup failed, {e}");
                if let Some(previous) = self.remote {
                    log::warn!("Resolve: using previous lookup response {previous}");
                    return Ok(Resolution::Stale(previous));
                }
                return Err(e);
            }
        };

        let ip = addrs
            .first()
            .copied()
            .ok_or_else(|| RestError::Resolution(format!("dns lookup failed for {host}")))?;

        let remote = SocketAddr::new(ip, port);
        self.server_name = Some(host.to_string());
        self.remote = Some(remote);
        log::info!("Name: resolved {host} to {ip}");
        Ok(Resolution::Fresh(remote))
    }

    /// Resolve `host` without touching the session address
    pub async fn lookup_once(&self, host: &str, port: u16) -> Result<SocketAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        let addrs = self.lookup_with_timeout(host).await?;
        addrs
            .first()
            .map(|ip| SocketAddr::new(*ip, port))
            .ok_or_else(|| RestError::Resolution(format!("no IP found for {host}")))
    }

    async fn lookup_with_timeout(&self, host: &str) -> Result<Vec<IpAddr>> {
        match tokio::time::timeout(LOOKUP_TIMEOUT, self.lookup.lookup_ip(host)).await {
            Ok(Ok(addrs)) => Ok(addrs),
            Ok(Err(RestError::Resolution(msg))) => Err(RestError::Resolution(msg)),
            Ok(Err(e)) => Err(RestError::Resolution(format!("{host}: {e}"))),
            Err(_) => Err(RestError::Resolution(format!(
                "{host}: lookup timed out after {LOOKUP_TIMEOUT:?}"
            ))),
        }
    }
}

/// A/AAAA lookups over the dialer's UDP path
#[derive(Debug, Clone)]
pub struct DnsLookup {
    dialer: Arc<Dialer>,
    query_timeout: Duration,
}

impl DnsLookup {
    pub fn new(dialer: Arc<Dialer>) -> Self {
        Self {
            dialer,
            query_timeout: QUERY_TIMEOUT,
        }
    }

    /// Override the per-send timeout
    pub fn with_query_timeout(mut self, query_timeout: Duration) -> Self {
        self.query_timeout = query_timeout;
        self
    }

    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
        let fqdn = format!("{}.", host.trim_end_matches('.'));
        let name = Name::from_ascii(&fqdn)
            .map_err(|e| RestError::Resolution(format!("invalid host name {host}: {e}")))?;

        // Each query dials separately and may reach a different server
        let (v4, v6) = tokio::join!(
            self.query(&name, RecordType::A),
            self.query(&name, RecordType::AAAA)
        );

        // Whichever family answered is enough
        match (v4, v6) {
            (Err(e), Err(_)) => Err(e),
            (v4, v6) => {
                if let Err(e) = &v4 {
                    log::debug!("Resolve: {name} A failed, {e}");
                }
                if let Err(e) = &v6 {
                    log::debug!("Resolve: {name} AAAA failed, {e}");
                }
                let mut addrs = v4.unwrap_or_default();
                addrs.extend(v6.unwrap_or_default());
                Ok(addrs)
            }
        }
    }

    async fn query(&self, name: &Name, record_type: RecordType) -> Result<Vec<IpAddr>> {
        let mut last_error = None;
        for attempt in 1..=QUERY_ATTEMPTS {
            match tokio::time::timeout(self.query_timeout, self.exchange(name, record_type)).await {
                Ok(Ok(addrs)) => return Ok(addrs),
                Ok(Err(e)) => {
                    log::debug!("Resolve: {name} {record_type} attempt {attempt} failed, {e}");
                    last_error = Some(e);
                }
                Err(_) => {
                    log::debug!("Resolve: {name} {record_type} attempt {attempt} timed out");
                    last_error = Some(RestError::Resolution(format!(
                        "{name} {record_type}: no response within {:?}",
                        self.query_timeout
                    )));
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            RestError::Resolution(format!("{name} {record_type}: no query sent"))
        }))
    }

    /// One datagram exchange with a freshly picked server
    async fn exchange(&self, name: &Name, record_type: RecordType) -> Result<Vec<IpAddr>> {
        let socket = self.dialer.dial_udp().await?;

        let id: u16 = rand::random();
        let mut request = Message::new();
        request
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(name.clone(), record_type));
        let bytes = request
            .to_vec()
            .map_err(|e| RestError::Resolution(format!("cannot encode DNS query: {e}")))?;
        socket.send(&bytes).await?;

        let mut buf = vec![0u8; MAX_DNS_MESSAGE];
        loop {
            let len = socket.recv(&mut buf).await?;
            let response = match Message::from_vec(&buf[..len]) {
                Ok(message) if message.id() == id => message,
                Ok(_) => continue,
                Err(e) => {
                    log::debug!("Resolve: ignoring malformed DNS response, {e}");
                    continue;
                }
            };

            if response.response_code() != ResponseCode::NoError {
                return Err(RestError::Resolution(format!(
                    "{name} {record_type}: {}",
                    response.response_code()
                )));
            }

            return Ok(response
                .answers()
                .iter()
                .filter_map(|record| match record.data() {
                    Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
                    Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
                    _ => None,
                })
                .collect());
        }
    }
}

impl HostLookup for DnsLookup {
    fn lookup_ip<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Result<Vec<IpAddr>>> {
        Box::pin(self.lookup(host))
    }
}
