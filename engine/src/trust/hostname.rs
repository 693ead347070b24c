//! Post-handshake host name check.

use rustls::pki_types::CertificateDer;
use tracing::{debug, info};
use x509_parser::prelude::*;

use super::TrustError;
use crate::options::VerifyLevel;

/// Exact length and ASCII case-insensitive equality. Wildcards are not expanded.
pub fn names_match(presented: &str, configured: &str) -> bool {
    presented.len() == configured.len() && presented.eq_ignore_ascii_case(configured)
}

/// Whether the certificate names `host` in a DNS subjectAltName or, failing that, a commonName.
pub fn certificate_matches(der: &[u8], host: &str) -> Result<bool, TrustError> {
    let (_, cert) =
        parse_x509_certificate(der).map_err(|e| TrustError::BadCertificate(e.to_string()))?;

    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                debug!("Post check: subjectAltName DNS:{}", dns);
                if names_match(dns, host) {
                    return Ok(true);
                }
            }
        }
    }

    for cn in cert.subject().iter_common_name() {
        if let Ok(cn) = cn.as_str() {
            debug!("Post check: commonName {}", cn);
            if names_match(cn, host) {
                return Ok(true);
            }
        }
    }

    Ok(false)
}

/// Check the peer leaf against `host` when the level demands a certificate.
pub fn post_connection_check(
    level: VerifyLevel,
    host: Option<&str>,
    peer: Option<&[CertificateDer<'_>]>,
) -> Result<(), TrustError> {
    if level < VerifyLevel::Require {
        info!("Post check: verification level is low, skipping check");
        return Ok(());
    }

    let Some(leaf) = peer.and_then(|chain| chain.first()) else {
        info!("Post check: No peer certificate!");
        return Err(TrustError::NoPeerCertificate);
    };

    let Some(host) = host else {
        return Err(TrustError::HostnameMismatch(String::new()));
    };
    info!("Post check: Config hostname: {}", host);

    if certificate_matches(leaf.as_ref(), host)? {
        Ok(())
    } else {
        Err(TrustError::HostnameMismatch(host.to_string()))
    }
}
