//! Trust bundle content handling
//!
//! A bundle is an ordered, de-duplicated set of PEM certificate blocks. During
//! a rotation the bundle written to hosts is the union of the authoritative
//! bundle and the one hosts last converged on, so that connections signed by
//! the outgoing CA keep validating until every host has the new one.

use std::time::{SystemTime, UNIX_EPOCH};

use ::pem::{EncodeConfig, LineEnding, Pem};
use tracing::{debug, warn};
use x509_parser::prelude::*;

use winnode_common::{deterministic_hash, Error, Result};

const CERTIFICATE_TAG: &str = "CERTIFICATE";

/// Normalize bundle text for comparison: LF line endings, no surrounding whitespace
pub fn normalize_text(text: &str) -> String {
    text.replace("\r\n", "\n").trim().to_string()
}

/// Ordered set of certificates
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CertificateBundle {
    certs: Vec<Pem>,
}

impl CertificateBundle {
    /// Parse every CERTIFICATE block in `text`; other block types are ignored
    pub fn parse(text: &str) -> Result<Self> {
        let blocks = ::pem::parse_many(text.as_bytes())
            .map_err(|e| Error::input(format!("failed to parse trust bundle PEM: {e}")))?;

        let mut bundle = Self::default();
        for block in blocks {
            if block.tag() != CERTIFICATE_TAG {
                debug!(tag = block.tag(), "skipping non-certificate PEM block");
                continue;
            }
            bundle.push(block);
        }
        Ok(bundle)
    }

    fn push(&mut self, cert: Pem) {
        if !self.contains(&cert) {
            self.certs.push(cert);
        }
    }

    /// Whether a certificate with the same DER contents is present
    pub fn contains(&self, cert: &Pem) -> bool {
        self.certs.iter().any(|c| c.contents() == cert.contents())
    }

    /// Whether every certificate of `other` is present
    pub fn is_superset_of(&self, other: &CertificateBundle) -> bool {
        other.certs.iter().all(|c| self.contains(c))
    }

    /// Whether both bundles hold the same certificates, in any order
    pub fn same_certificates(&self, other: &CertificateBundle) -> bool {
        self.len() == other.len() && self.is_superset_of(other)
    }

    /// Certificates of `self` followed by those only present in `other`
    pub fn union(&self, other: &CertificateBundle) -> Self {
        let mut union = self.clone();
        for cert in &other.certs {
            union.push(cert.clone());
        }
        union
    }

    /// Certificates in bundle order
    pub fn certificates(&self) -> &[Pem] {
        &self.certs
    }

    /// Number of certificates
    pub fn len(&self) -> usize {
        self.certs.len()
    }

    /// Whether the bundle holds no certificates
    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// Encode as PEM text with LF line endings
    pub fn to_pem(&self) -> String {
        ::pem::encode_many_config(
            &self.certs,
            EncodeConfig::new().set_line_ending(LineEnding::LF),
        )
    }

    /// Fingerprint of the certificate set; independent of bundle order
    pub fn fingerprint(&self) -> String {
        let mut sorted = self.clone();
        sorted.certs.sort_by(|a, b| a.contents().cmp(b.contents()));
        deterministic_hash(&normalize_text(&sorted.to_pem()))
    }

    /// Whether installed file contents already hold this bundle.
    ///
    /// Compared textually after normalization, the same way an administrator
    /// would check the file by hand.
    pub fn is_installed_in(&self, installed: &str) -> bool {
        normalize_text(installed).contains(&normalize_text(&self.to_pem()))
    }

    /// Union of `authoritative` and `prior`.
    ///
    /// Authoritative certificates come first and are always kept. Certificates
    /// only present in `prior` are kept unless they have expired.
    pub fn merge(prior: Option<&CertificateBundle>, authoritative: &CertificateBundle) -> Self {
        let mut merged = authoritative.clone();
        if let Some(prior) = prior {
            let now = unix_now();
            for cert in &prior.certs {
                if merged.contains(cert) {
                    continue;
                }
                if is_expired(cert, now) {
                    debug!("dropping expired certificate from prior bundle");
                    continue;
                }
                merged.certs.push(cert.clone());
            }
        }
        merged
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Unparseable certificates are treated as not expired and kept
fn is_expired(cert: &Pem, now: i64) -> bool {
    match X509Certificate::from_der(cert.contents()) {
        Ok((_, parsed)) => parsed.validity().not_after.timestamp() <= now,
        Err(e) => {
            warn!(error = %e, "failed to parse certificate in prior bundle, keeping it");
            false
        }
    }
}
