//! Certificate trust engine.
//!
//! [`TrustPolicy`] decides, certificate by certificate, whether a peer chain is
//! accepted. The rustls seams live in [`verifier`], revocation lists in
//! [`revocation`] and the post-handshake name check in [`hostname`].

pub mod hostname;
pub mod revocation;
pub mod verifier;

use rustls::pki_types::CertificateDer;
use rustls::{CertificateError, OtherError, RootCertStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use x509_parser::prelude::*;

use crate::error::{Error, Result};
use crate::options::{TrustOptions, VerifyLevel};
use crate::tls::load_certs;

pub use hostname::post_connection_check;
pub use revocation::RevocationStore;

/// Reasons a peer certificate is rejected by this engine.
#[derive(Debug, Error)]
pub enum TrustError {
    #[error("no peer certificate")]
    NoPeerCertificate,

    #[error("application verification failure: certificate does not match '{0}'")]
    HostnameMismatch(String),

    #[error("certificate chain rejected: {0}")]
    Chain(String),

    #[error("unparsable certificate: {0}")]
    BadCertificate(String),

    #[error("peer certificate subject is not a trusted certificate")]
    NotTrusted,

    #[error("invalid signature on CRL")]
    CrlSignature,

    #[error("CRL has no nextUpdate field")]
    CrlMissingNextUpdate,

    #[error("CRL is expired")]
    CrlExpired,

    #[error("certificate with serial {0} revoked")]
    Revoked(String),

    #[error("cannot load {path}: {reason}")]
    Load { path: String, reason: String },
}

impl From<TrustError> for rustls::Error {
    fn from(e: TrustError) -> Self {
        match e {
            TrustError::Revoked(_) => rustls::Error::InvalidCertificate(CertificateError::Revoked),
            TrustError::HostnameMismatch(_) => {
                rustls::Error::InvalidCertificate(CertificateError::ApplicationVerificationFailure)
            }
            other => rustls::Error::InvalidCertificate(CertificateError::Other(OtherError(
                Arc::new(other),
            ))),
        }
    }
}

/// Per-service trust configuration, immutable once loaded.
#[derive(Debug)]
pub struct TrustPolicy {
    level: VerifyLevel,
    only_trusted: bool,
    anchors: Vec<CertificateDer<'static>>,
    roots: Arc<RootCertStore>,
    revocation: Option<RevocationStore>,
}

impl TrustPolicy {
    pub fn new(
        level: VerifyLevel,
        only_trusted: bool,
        anchors: Vec<CertificateDer<'static>>,
        revocation: Option<RevocationStore>,
    ) -> Self {
        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(anchors.iter().cloned());
        if ignored > 0 {
            warn!("{} CA certificate(s) could not be used as trust anchors", ignored);
        }
        debug!("{} trust anchor(s) loaded", added);
        Self {
            level,
            only_trusted,
            anchors,
            roots: Arc::new(roots),
            revocation,
        }
    }

    /// Load CA and CRL material named by `opts`.
    pub fn load(opts: &TrustOptions) -> Result<Self> {
        if opts.level == VerifyLevel::None {
            return Ok(Self::new(VerifyLevel::None, false, Vec::new(), None));
        }

        if opts.level >= VerifyLevel::Require && opts.ca_file.is_none() && opts.ca_dir.is_none() {
            return Err(Error::Config(
                "Either ca_file or ca_dir has to be used for authentication".into(),
            ));
        }

        let mut anchors = Vec::new();
        if let Some(file) = &opts.ca_file {
            let certs = load_certs(file)?;
            debug!("Loaded {} verify certificate(s) from {}", certs.len(), file.display());
            anchors.extend(certs);
        }
        if let Some(dir) = &opts.ca_dir {
            for path in dir_files(dir)? {
                match load_certs(&path) {
                    Ok(certs) => anchors.extend(certs),
                    Err(e) => debug!("Skipping {}: {}", path.display(), e),
                }
            }
            if opts.only_trusted {
                info!("Peer certificate location {}", dir.display());
            }
        }

        let revocation = if opts.crl_file.is_some() || opts.crl_dir.is_some() {
            Some(RevocationStore::load(
                opts.crl_file.as_deref(),
                opts.crl_dir.as_deref(),
            )?)
        } else {
            None
        };

        Ok(Self::new(opts.level, opts.only_trusted, anchors, revocation))
    }

    pub fn level(&self) -> VerifyLevel {
        self.level
    }

    pub fn roots(&self) -> Arc<RootCertStore> {
        Arc::clone(&self.roots)
    }

    pub fn has_roots(&self) -> bool {
        !self.roots.is_empty()
    }

    /// Decide one certificate of the peer chain. `chain` is the library's own
    /// validation verdict for the chain it belongs to.
    pub fn check_certificate(
        &self,
        depth: usize,
        der: &CertificateDer<'_>,
        chain: &std::result::Result<(), rustls::Error>,
    ) -> std::result::Result<(), TrustError> {
        let (_, cert) = parse_x509_certificate(der.as_ref())
            .map_err(|e| TrustError::BadCertificate(e.to_string()))?;
        let subject = cert.subject().to_string();

        if self.level == VerifyLevel::Ignore {
            info!("VERIFY IGNORE: depth={}, {}", depth, subject);
            return Ok(());
        }

        if let Err(e) = chain {
            warn!("VERIFY ERROR: depth={}, error={}: {}", depth, e, subject);
            return Err(TrustError::Chain(e.to_string()));
        }

        if self.only_trusted && depth == 0 && !self.is_anchor_subject(cert.subject().as_raw()) {
            warn!("VERIFY ERROR ONLY MY: no cert for {}", subject);
            return Err(TrustError::NotTrusted);
        }

        if let Some(store) = &self.revocation {
            store.check(&cert)?;
        }

        info!("VERIFY OK: depth={}, {}", depth, subject);
        Ok(())
    }

    /// Run [`check_certificate`](Self::check_certificate) over the presented chain plus the
    /// anchor that issued it, deepest certificate first.
    pub fn verify_chain(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        chain: &std::result::Result<(), rustls::Error>,
    ) -> std::result::Result<(), TrustError> {
        let mut certs: Vec<&CertificateDer<'_>> = Vec::with_capacity(intermediates.len() + 2);
        certs.push(end_entity);
        certs.extend(intermediates.iter());
        if let Some(anchor) = certs.last().and_then(|top| self.issuing_anchor(top)) {
            certs.push(anchor);
        }

        for (depth, der) in certs.iter().enumerate().rev() {
            self.check_certificate(depth, der, chain)?;
        }
        Ok(())
    }

    fn is_anchor_subject(&self, subject: &[u8]) -> bool {
        self.anchors.iter().any(|der| {
            parse_x509_certificate(der.as_ref())
                .map(|(_, anchor)| anchor.subject().as_raw() == subject)
                .unwrap_or(false)
        })
    }

    /// Trust anchor whose subject issued `top`, unless `top` is self-issued.
    fn issuing_anchor(&self, top: &CertificateDer<'_>) -> Option<&CertificateDer<'static>> {
        let (_, top) = parse_x509_certificate(top.as_ref()).ok()?;
        let issuer = top.issuer().as_raw();
        if issuer == top.subject().as_raw() {
            return None;
        }
        self.anchors.iter().find(|der| {
            parse_x509_certificate(der.as_ref())
                .map(|(_, anchor)| anchor.subject().as_raw() == issuer)
                .unwrap_or(false)
        })
    }
}

/// Regular files of `dir`, sorted by name.
pub(crate) fn dir_files(dir: &Path) -> std::result::Result<Vec<PathBuf>, TrustError> {
    let load_err = |e: std::io::Error| TrustError::Load {
        path: dir.display().to_string(),
        reason: e.to_string(),
    };
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(load_err)? {
        let path = entry.map_err(load_err)?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
