//! CA public key pins
//!
//! Standard chain verification decides whether a certificate chain is
//! trustworthy at all; the pin table additionally restricts which certificate
//! authorities may appear in it. Every CA certificate in a verified chain must
//! be one of the pinned authorities, with exactly the pinned public key.

use std::collections::HashMap;
use std::fmt;

use rustls::pki_types::TrustAnchor;
use x509_parser::prelude::{FromDer, X509Certificate, X509Name};

use super::public_key_pin;

/// The fields of a certificate the pin check looks at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateSummary {
    pub common_name: String,
    pub is_ca: bool,
    /// Base64 SHA-256 of the SubjectPublicKeyInfo
    pub pin: String,
}

impl CertificateSummary {
    /// Extract the subject common name, CA flag and pin from a DER certificate
    pub fn from_der(der: &[u8]) -> Result<Self, String> {
        let (_, certificate) =
            X509Certificate::from_der(der).map_err(|e| format!("unparsable certificate: {e}"))?;

        Ok(Self {
            common_name: common_name(certificate.subject()),
            is_ca: certificate.is_ca(),
            pin: public_key_pin(certificate.public_key().raw),
        })
    }

    /// Summarize the trust anchor that terminated a verified path.
    ///
    /// Anchors keep only the contents of the subject and SubjectPublicKeyInfo
    /// sequences, so both are re-wrapped before parsing and hashing.
    pub fn from_trust_anchor(anchor: &TrustAnchor<'_>) -> Result<Self, String> {
        let subject = der_sequence(anchor.subject.as_ref());
        let (_, name) =
            X509Name::from_der(&subject).map_err(|e| format!("unparsable anchor subject: {e}"))?;

        Ok(Self {
            common_name: common_name(&name),
            is_ca: true,
            pin: public_key_pin(&der_sequence(anchor.subject_public_key_info.as_ref())),
        })
    }
}

fn common_name(name: &X509Name<'_>) -> String {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// DER SEQUENCE with the given contents
fn der_sequence(contents: &[u8]) -> Vec<u8> {
    let len = contents.len();
    let mut out = Vec::with_capacity(len + 6);
    out.push(0x30);
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
    out.extend_from_slice(contents);
    out
}

/// A CA certificate whose name and key do not match the pin table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinMismatch {
    pub common_name: String,
}

impl fmt::Display for PinMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bad public key PIN for '{}'", self.common_name)
    }
}

impl std::error::Error for PinMismatch {}

/// Authorized CA pins, keyed by CA common name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinSet {
    pins: HashMap<String, String>,
}

impl PinSet {
    /// Build a table from (common name, base64 pin) pairs
    pub fn new<I, N, P>(entries: I) -> Self
    where
        I: IntoIterator<Item = (N, P)>,
        N: Into<String>,
        P: Into<String>,
    {
        Self {
            pins: entries
                .into_iter()
                .map(|(name, pin)| (name.into(), pin.into()))
                .collect(),
        }
    }

    /// Authorities that sign the service's session server certificates
    pub fn authorized() -> Self {
        Self::new([
            ("Hide.Me Root CA", "AdKh8rXi68jeqv5kEzF4wJ9M2R89gFuMILRQ1uwADQI="),
            ("Hide.Me Server CA #1", "CsEyDelMHMPh9qLGgeQn8sJwdUwvc+fCMhOU9Ne5PbU="),
            ("DigiCert Global Root CA", "r/mIkG3eEpVdm+u/ko/cwxzOMo1bk4TyHIlByibiA5E="),
            ("DigiCert TLS RSA SHA256 2020 CA1", "RQeZkB42znUfsDIIFWIRiYEcKl7nHwNFwWCrnMMJbVc="),
        ])
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    /// Whether `pin` is the authorized key of the CA called `common_name`
    pub fn matches(&self, common_name: &str, pin: &str) -> bool {
        self.pins
            .get(common_name)
            .is_some_and(|authorized| authorized == pin)
    }

    /// Check every CA certificate of every chain against the table.
    ///
    /// Fails on the first CA certificate that is not pinned, regardless of
    /// whether other chains would pass. Leaf certificates are skipped.
    pub fn verify_chains<C>(&self, chains: &[C]) -> Result<(), PinMismatch>
    where
        C: AsRef<[CertificateSummary]>,
    {
        for chain in chains {
            for certificate in chain.as_ref().iter().filter(|c| c.is_ca) {
                if !self.matches(&certificate.common_name, &certificate.pin) {
                    log::warn!("Pins: {} pin failed", certificate.common_name);
                    return Err(PinMismatch {
                        common_name: certificate.common_name.clone(),
                    });
                }
                log::info!("Pins: {} pin OK", certificate.common_name);
            }
        }
        Ok(())
    }
}

impl Default for PinSet {
    fn default() -> Self {
        Self::authorized()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ca(name: &str, pin: &str) -> CertificateSummary {
        CertificateSummary {
            common_name: name.to_string(),
            is_ca: true,
            pin: pin.to_string(),
        }
    }

    fn leaf(name: &str) -> CertificateSummary {
        CertificateSummary {
            common_name: name.to_string(),
            is_ca: false,
            pin: public_key_pin(name.as_bytes()),
        }
    }

    fn hide_me_chain() -> Vec<CertificateSummary> {
        vec![
            leaf("nl.hideservers.net"),
            ca("Hide.Me Server CA #1", "CsEyDelMHMPh9qLGgeQn8sJwdUwvc+fCMhOU9Ne5PbU="),
            ca("Hide.Me Root CA", "AdKh8rXi68jeqv5kEzF4wJ9M2R89gFuMILRQ1uwADQI="),
        ]
    }

    #[test]
    fn test_authorized_table() {
        let pins = PinSet::authorized();
        assert_eq!(pins.len(), 4);
        assert!(pins.matches(
            "DigiCert Global Root CA",
            "r/mIkG3eEpVdm+u/ko/cwxzOMo1bk4TyHIlByibiA5E="
        ));
        assert!(!pins.matches(
            "DigiCert Global Root CA",
            "AdKh8rXi68jeqv5kEzF4wJ9M2R89gFuMILRQ1uwADQI="
        ));
    }

    #[test]
    fn test_pinned_chain_passes() {
        let pins = PinSet::authorized();
        assert!(pins.verify_chains(&[hide_me_chain()]).is_ok());
    }

    #[test]
    fn test_leaf_certificates_are_not_checked() {
        let pins = PinSet::authorized();
        let chain = vec![leaf("some.other.host")];
        assert!(pins.verify_chains(&[chain]).is_ok());
    }

    #[test]
    fn test_unknown_ca_fails() {
        let pins = PinSet::authorized();
        let mut chain = hide_me_chain();
        chain.push(ca("Evil Root CA", &public_key_pin(b"evil")));

        let err = pins.verify_chains(&[chain]).unwrap_err();
        assert_eq!(err.common_name, "Evil Root CA");
    }

    #[test]
    fn test_known_name_with_wrong_key_fails() {
        let pins = PinSet::authorized();
        let chain = vec![
            leaf("nl.hideservers.net"),
            ca("Hide.Me Server CA #1", &public_key_pin(b"substituted key")),
        ];
        assert!(pins.verify_chains(&[chain]).is_err());
    }

    #[test]
    fn test_one_bad_chain_fails_everything() {
        let pins = PinSet::authorized();
        let good = hide_me_chain();
        let bad = vec![
            leaf("nl.hideservers.net"),
            ca("Intercepting Proxy CA", &public_key_pin(b"proxy")),
        ];
        assert!(pins.verify_chains(&[good.clone(), bad.clone()]).is_err());
        assert!(pins.verify_chains(&[bad, good]).is_err());
    }

    #[test]
    fn test_custom_table() {
        let pin = public_key_pin(b"test root key");
        let pins = PinSet::new([("Test Root", pin.clone())]);
        assert!(pins.verify_chains(&[vec![ca("Test Root", &pin)]]).is_ok());
        assert!(PinSet::authorized()
            .verify_chains(&[vec![ca("Test Root", &pin)]])
            .is_err());
    }

    #[test]
    fn test_garbage_der_is_rejected() {
        assert!(CertificateSummary::from_der(b"not a certificate").is_err());
    }

    fn generated_ca(name: &str) -> (rcgen::Certificate, rcgen::KeyPair) {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, name);
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        (params.self_signed(&key).unwrap(), key)
    }

    #[test]
    fn test_summary_of_generated_certificates() {
        let (root, root_key) = generated_ca("Test Root CA");
        let summary = CertificateSummary::from_der(root.der()).unwrap();
        assert_eq!(summary.common_name, "Test Root CA");
        assert!(summary.is_ca);
        assert_eq!(summary.pin, public_key_pin(&root_key.public_key_der()));

        let leaf_key = rcgen::KeyPair::generate().unwrap();
        let leaf = rcgen::CertificateParams::new(vec!["hideservers.net".to_string()])
            .unwrap()
            .signed_by(&leaf_key, &root, &root_key)
            .unwrap();
        let summary = CertificateSummary::from_der(leaf.der()).unwrap();
        assert!(!summary.is_ca);
        assert_eq!(summary.pin, public_key_pin(&leaf_key.public_key_der()));
    }

    #[test]
    fn test_trust_anchor_summary_matches_certificate() {
        let (root, _) = generated_ca("Test Root CA");
        let anchor = webpki::anchor_from_trusted_cert(root.der()).unwrap();

        let from_anchor = CertificateSummary::from_trust_anchor(&anchor).unwrap();
        let from_certificate = CertificateSummary::from_der(root.der()).unwrap();
        assert_eq!(from_anchor, from_certificate);
    }

    #[test]
    fn test_bundled_root_anchor_summaries() {
        let summaries = webpki_roots::TLS_SERVER_ROOTS
            .iter()
            .map(CertificateSummary::from_trust_anchor)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(summaries.len(), webpki_roots::TLS_SERVER_ROOTS.len());

        let g2 = summaries
            .iter()
            .find(|summary| summary.common_name == "DigiCert Global Root G2")
            .unwrap();
        assert!(g2.is_ca);
        assert!(PinSet::authorized()
            .verify_chains(&[vec![g2.clone()]])
            .is_err());
    }

    #[test]
    fn test_der_sequence_lengths() {
        assert_eq!(der_sequence(&[1, 2]), vec![0x30, 0x02, 1, 2]);

        let long = der_sequence(&[0u8; 0x80]);
        assert_eq!(&long[..3], &[0x30, 0x81, 0x80]);
        assert_eq!(long.len(), 3 + 0x80);

        let longer = der_sequence(&[0u8; 0x1234]);
        assert_eq!(&longer[..4], &[0x30, 0x82, 0x12, 0x34]);
    }
}
