//! vpn-rest - REST control channel client for WireGuard VPN sessions
//!
//! This library talks to the session servers of a WireGuard VPN service over
//! a small JSON API carried by HTTPS with certificate pinning.
//!
//! ## What This Library Provides
//! - Configuration parsing and validation (TOML format)
//! - Sticky resolution of the session server address
//! - Firewall-marked sockets for both HTTPS and DNS traffic
//! - TLS 1.3 with a pinned set of issuing CAs
//! - Access token storage and refresh
//! - The connect, disconnect, access token and filter operations
//!
//! ## What Your Application Must Implement
//! - WireGuard key generation and interface setup
//! - Retry and backoff policy around [`RestClient`] operations
//!
//! ## Example
//! ```no_run
//! # async fn example() -> vpn_rest::Result<()> {
//! let config = vpn_rest::Config::from_file("client.toml")?;
//! let mut client = vpn_rest::RestClient::new(config)?;
//! client.resolve().await?;
//! if !client.have_access_token() {
//!     client.get_access_token().await?;
//! }
//! let session = client.connect(&[0u8; 32]).await?;
//! println!("endpoint {}", session.endpoint.socket_addr());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod net;
pub mod protocol;
pub mod token;

// Re-export core types
pub use client::RestClient;
pub use config::Config;
pub use error::{RestError, Result};
pub use net::Resolution;
pub use protocol::{ConnectResponse, Filter};
pub use token::TokenStore;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
