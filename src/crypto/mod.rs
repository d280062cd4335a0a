/// Certificate pinning and TLS configuration
use base64::{engine::general_purpose, Engine};
use ring::digest;

pub mod pins;
pub mod tls;

pub use pins::{CertificateSummary, PinMismatch, PinSet};
pub use tls::{client_config, PinnedVerifier};

/// Base64 SHA-256 of a DER SubjectPublicKeyInfo, the pin format used by the table
pub fn public_key_pin(subject_public_key_info: &[u8]) -> String {
    let hash = digest::digest(&digest::SHA256, subject_public_key_info);
    general_purpose::STANDARD.encode(hash.as_ref())
}
