//! Certificate revocation lists.

use rustls::pki_types::CertificateRevocationListDer;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{debug, warn};
use x509_parser::prelude::*;

use super::{dir_files, TrustError};

/// CRLs indexed by the raw DER of their issuer name.
#[derive(Debug, Default)]
pub struct RevocationStore {
    by_issuer: HashMap<Vec<u8>, Vec<CertificateRevocationListDer<'static>>>,
}

fn load_error(path: &Path, reason: impl ToString) -> TrustError {
    TrustError::Load {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

fn read_pem_crls(path: &Path) -> Result<Vec<CertificateRevocationListDer<'static>>, TrustError> {
    let file = File::open(path).map_err(|e| load_error(path, e))?;
    rustls_pemfile::crls(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| load_error(path, e))
}

impl RevocationStore {
    pub fn from_der(
        crls: impl IntoIterator<Item = CertificateRevocationListDer<'static>>,
    ) -> Result<Self, TrustError> {
        let mut store = Self::default();
        for der in crls {
            let (_, crl) = parse_x509_crl(der.as_ref())
                .map_err(|e| TrustError::BadCertificate(format!("CRL: {}", e)))?;
            let issuer = crl.issuer().as_raw().to_vec();
            store.by_issuer.entry(issuer).or_default().push(der);
        }
        Ok(store)
    }

    /// Load PEM CRLs from a file and/or every file in a directory.
    pub fn load(file: Option<&Path>, dir: Option<&Path>) -> Result<Self, TrustError> {
        let mut crls = Vec::new();
        if let Some(file) = file {
            crls.extend(read_pem_crls(file)?);
            debug!("CRL file set to {}", file.display());
        }
        if let Some(dir) = dir {
            for path in dir_files(dir)? {
                match read_pem_crls(&path) {
                    Ok(found) => crls.extend(found),
                    Err(e) => debug!("Skipping {}: {}", path.display(), e),
                }
            }
            debug!("CRL directory set to {}", dir.display());
        }
        Self::from_der(crls)
    }

    pub fn len(&self) -> usize {
        self.by_issuer.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_issuer.is_empty()
    }

    fn lookup(&self, name: &[u8]) -> &[CertificateRevocationListDer<'static>] {
        self.by_issuer.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Reject `cert` when a CRL it signed is invalid or stale, or when its
    /// issuer's CRL lists its serial number.
    pub fn check(&self, cert: &X509Certificate<'_>) -> Result<(), TrustError> {
        for der in self.lookup(cert.subject().as_raw()) {
            let (_, crl) = parse_x509_crl(der.as_ref())
                .map_err(|e| TrustError::BadCertificate(format!("CRL: {}", e)))?;
            debug!(
                "CRL: issuer: {}, last update: {}, next update: {}",
                crl.issuer(),
                crl.last_update(),
                crl.next_update()
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "-".into())
            );

            if crl.verify_signature(cert.public_key()).is_err() {
                warn!("Invalid signature on CRL");
                return Err(TrustError::CrlSignature);
            }

            match crl.next_update() {
                None => {
                    warn!("Found CRL has invalid nextUpdate field");
                    return Err(TrustError::CrlMissingNextUpdate);
                }
                Some(next) if next < ASN1Time::now() => {
                    warn!("Found CRL is expired - revoking all certificates until you get updated CRL");
                    return Err(TrustError::CrlExpired);
                }
                Some(_) => {}
            }
        }

        for der in self.lookup(cert.issuer().as_raw()) {
            let (_, crl) = parse_x509_crl(der.as_ref())
                .map_err(|e| TrustError::BadCertificate(format!("CRL: {}", e)))?;
            let serial = crl
                .iter_revoked_certificates()
                .find(|revoked| revoked.serial() == &cert.tbs_certificate.serial)
                .map(|revoked| revoked.raw_serial_as_string());
            if let Some(serial) = serial {
                warn!(
                    "Certificate with serial {} revoked per CRL from issuer {}",
                    serial,
                    cert.issuer()
                );
                return Err(TrustError::Revoked(serial));
            }
        }

        Ok(())
    }
}
