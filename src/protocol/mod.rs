//! REST control channel messages
//!
//! Every request type carries the service host and domain, knows how to check
//! its own required fields, and serializes to the JSON layout the session
//! servers expect. Byte fields travel as standard base64 strings.

use crate::error::{Result, RestError};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

pub mod filter;

pub use filter::Filter;

// Protocol constants
pub mod constants {
    pub const DEFAULT_PORT: u16 = 432;
    pub const DEFAULT_DOMAIN: &str = "hide.me";
    pub const API_VERSION: &str = "v1.0.0";
    /// Suffix stripped from the configured host before it is sent
    pub const SERVICE_SUFFIX: &str = ".hideservers.net";
    /// Name present as a SAN on every session server certificate
    pub const FALLBACK_SERVER_NAME: &str = "hideservers.net";
    pub const FILTER_HOST: &str = "vpn.hide.me";
    pub const FILTER_PORT: u16 = 4321;
    pub const WIREGUARD_KEY_LEN: usize = 32;
    /// Client identification the session servers expect
    pub const USER_AGENT: &str = "HIDE.ME.LINUX.CLI-0.9.3";
}

/// Server short name as sent in request bodies
pub fn service_host(host: &str) -> &str {
    host.strip_suffix(constants::SERVICE_SUFFIX).unwrap_or(host)
}

fn check_host_domain(host: &str, domain: &str) -> Result<()> {
    if host.is_empty() {
        return Err(RestError::Validation("host is empty".to_string()));
    }
    if host.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(RestError::Validation(format!("malformed host '{host}'")));
    }
    if domain.is_empty() {
        return Err(RestError::Validation("domain is empty".to_string()));
    }
    Ok(())
}

/// Body of `/<version>/connect`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest<'a> {
    pub host: &'a str,
    pub domain: &'a str,
    #[serde(serialize_with = "b64::serialize_opt")]
    pub access_token: Option<&'a [u8]>,
    #[serde(serialize_with = "b64::serialize")]
    pub public_key: &'a [u8],
}

impl ConnectRequest<'_> {
    pub fn check(&self) -> Result<()> {
        check_host_domain(self.host, self.domain)?;
        if self.public_key.len() != constants::WIREGUARD_KEY_LEN {
            return Err(RestError::Validation(format!(
                "public key must be {} bytes, got {}",
                constants::WIREGUARD_KEY_LEN,
                self.public_key.len()
            )));
        }
        Ok(())
    }
}

/// Body of `/<version>/disconnect`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectRequest<'a> {
    pub host: &'a str,
    pub domain: &'a str,
    #[serde(serialize_with = "b64::serialize")]
    pub session_token: &'a [u8],
}

impl DisconnectRequest<'_> {
    pub fn check(&self) -> Result<()> {
        check_host_domain(self.host, self.domain)?;
        if self.session_token.is_empty() {
            return Err(RestError::Validation("session token is empty".to_string()));
        }
        Ok(())
    }
}

/// Body of `/<version>/accessToken`
///
/// The current token takes precedence; username and password are only a
/// fallback for the first issuance.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenRequest<'a> {
    pub host: &'a str,
    pub domain: &'a str,
    #[serde(serialize_with = "b64::serialize_opt")]
    pub access_token: Option<&'a [u8]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<&'a str>,
}

impl AccessTokenRequest<'_> {
    pub fn check(&self) -> Result<()> {
        check_host_domain(self.host, self.domain)?;
        let has_token = self.access_token.is_some_and(|t| !t.is_empty());
        let has_credentials = self.username.is_some_and(|u| !u.is_empty())
            && self.password.is_some_and(|p| !p.is_empty());
        if !has_token && !has_credentials {
            return Err(RestError::Validation(
                "neither an access token nor username and password are available".to_string(),
            ));
        }
        Ok(())
    }
}

/// WireGuard peer endpoint as encoded by the session server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UdpEndpoint {
    #[serde(rename = "IP")]
    pub ip: IpAddr,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Zone", default)]
    pub zone: String,
}

impl UdpEndpoint {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// Session parameters returned by a successful connect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    #[serde(with = "b64", default)]
    pub public_key: Vec<u8>,
    #[serde(with = "b64", default)]
    pub preshared_key: Vec<u8>,
    pub endpoint: UdpEndpoint,
    /// Nanoseconds
    #[serde(default)]
    pub persistent_keepalive_interval: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub allowed_ips: Vec<IpAddr>,
    #[serde(rename = "DNS", default, deserialize_with = "null_as_default")]
    pub dns: Vec<IpAddr>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub gateway: Vec<IpAddr>,
    #[serde(with = "b64", default)]
    pub session_token: Vec<u8>,
    /// The server wants the access token refreshed soon
    #[serde(default)]
    pub stale_access_token: bool,
}

impl ConnectResponse {
    pub fn persistent_keepalive(&self) -> Duration {
        Duration::from_nanos(self.persistent_keepalive_interval)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Standard base64 for byte fields; `null` reads as empty
pub(crate) mod b64 {
    use base64::{engine::general_purpose, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, T>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes.as_ref()))
    }

    pub fn serialize_opt<S, T>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        match value {
            Some(bytes) => serialize(bytes, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => general_purpose::STANDARD
                .decode(text.as_bytes())
                .map_err(serde::de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}

/// Tab-indented JSON, the layout the servers have always received
pub fn to_indented_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut serializer = serde_json::Serializer::with_formatter(&mut body, formatter);
    value
        .serialize(&mut serializer)
        .map_err(|e| RestError::Validation(format!("cannot encode request: {e}")))?;
    Ok(body)
}
