//! Configuration module for the REST control channel client
//!
//! This module provides TOML-based configuration parsing and validation.
//! The client reads the configuration once and never mutates it.

use crate::error::{Result, RestError};
use crate::protocol::{constants, Filter};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Resolver used when no DNS servers are configured
pub const DEFAULT_DNS_SERVER: &str = "1.1.1.1:53";

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// FQDN or literal IP of the session server
    pub host: String,
    /// Port for REST requests (0 means the service default)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Service domain
    #[serde(default = "default_domain")]
    pub domain: String,
    /// API version, used as the first path segment
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// File holding the base64 access token
    pub access_token_file: Option<PathBuf>,
    /// Username (the access token takes precedence)
    pub username: Option<String>,
    /// Password (the access token takes precedence)
    pub password: Option<String>,
    /// Timeout for REST requests in seconds
    #[serde(default = "default_rest_timeout")]
    pub rest_timeout: u64,
    /// Wait between reconnection attempts in seconds
    #[serde(default = "default_reconnect_wait")]
    pub reconnect_wait: u64,
    /// Wait before replacing a stale access token in seconds
    #[serde(default = "default_access_token_update_delay")]
    pub access_token_update_delay: u64,
    /// CA certificate bundle (empty for the built-in roots)
    pub ca: Option<PathBuf>,
    /// Firewall mark for the traffic generated by this client (0 disables)
    #[serde(default)]
    pub firewall_mark: u32,
    /// Comma separated DNS servers for resolving the session host
    #[serde(default)]
    pub dns_servers: String,
    /// Value of the user-agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Filtering settings
    #[serde(default)]
    pub filter: Filter,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Minimal configuration for a host, everything else defaulted
    pub fn for_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            domain: default_domain(),
            api_version: default_api_version(),
            access_token_file: None,
            username: None,
            password: None,
            rest_timeout: default_rest_timeout(),
            reconnect_wait: default_reconnect_wait(),
            access_token_update_delay: default_access_token_update_delay(),
            ca: None,
            firewall_mark: 0,
            dns_servers: String::new(),
            user_agent: default_user_agent(),
            filter: Filter::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| RestError::Config(format!("Failed to read config file: {e}")))?;

        <Self as FromStr>::from_str(&contents)
    }

    /// Convert configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| RestError::Config(format!("Failed to serialize config: {e}")))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(RestError::Config("Server host cannot be empty".to_string()));
        }

        if self.api_version.is_empty() || self.api_version.contains('/') {
            return Err(RestError::Config(format!(
                "Invalid API version '{}'",
                self.api_version
            )));
        }

        if self.user_agent.is_empty()
            || !self.user_agent.bytes().all(|b| (0x20..0x7f).contains(&b))
        {
            return Err(RestError::Config(format!(
                "Invalid user agent '{}'",
                self.user_agent
            )));
        }

        self.dns_server_addrs()?;
        Ok(())
    }

    /// REST port with the service default applied
    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            constants::DEFAULT_PORT
        } else {
            self.port
        }
    }

    /// Parsed DNS server list; entries without a port use 53
    pub fn dns_server_addrs(&self) -> Result<Vec<SocketAddr>> {
        let list = if self.dns_servers.trim().is_empty() {
            DEFAULT_DNS_SERVER
        } else {
            self.dns_servers.as_str()
        };

        list.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                entry
                    .parse::<SocketAddr>()
                    .or_else(|_| entry.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, 53)))
                    .map_err(|_| RestError::Config(format!("Invalid DNS server '{entry}'")))
            })
            .collect()
    }

    pub fn rest_timeout(&self) -> Duration {
        Duration::from_secs(self.rest_timeout)
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_secs(self.reconnect_wait)
    }

    pub fn access_token_update_delay(&self) -> Duration {
        Duration::from_secs(self.access_token_update_delay)
    }
}

impl FromStr for Config {
    type Err = RestError;

    fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| RestError::Config(format!("Failed to parse TOML: {e}")))
    }
}

// Default value functions for serde
fn default_port() -> u16 {
    constants::DEFAULT_PORT
}

fn default_domain() -> String {
    constants::DEFAULT_DOMAIN.to_string()
}

fn default_api_version() -> String {
    constants::API_VERSION.to_string()
}

fn default_user_agent() -> String {
    constants::USER_AGENT.to_string()
}

fn default_rest_timeout() -> u64 {
    5
}

fn default_reconnect_wait() -> u64 {
    30
}

fn default_access_token_update_delay() -> u64 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}
