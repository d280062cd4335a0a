//! Network plumbing: marked sockets, sticky name resolution and the HTTPS exchange

pub mod dialer;
pub mod resolver;
pub mod transport;

pub use dialer::Dialer;
pub use resolver::{DnsLookup, EndpointResolver, HostLookup, Resolution};
pub use transport::{Exchange, HttpsTransport, Reply, Target};
