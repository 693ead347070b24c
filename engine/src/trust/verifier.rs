//! rustls verifier seams that route every peer chain through [`TrustPolicy`].

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, SignatureScheme};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::TrustPolicy;
use crate::error::{Error, Result};
use crate::options::VerifyLevel;

fn algorithms() -> WebPkiSupportedAlgorithms {
    rustls::crypto::ring::default_provider().signature_verification_algorithms
}

fn no_anchor() -> std::result::Result<(), rustls::Error> {
    Err(rustls::Error::InvalidCertificate(
        CertificateError::UnknownIssuer,
    ))
}

/// Checks the remote server's chain for the TLS-client role.
pub struct ServerCertCheck {
    policy: Arc<TrustPolicy>,
    webpki: Option<Arc<WebPkiServerVerifier>>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertCheck {
    pub fn new(policy: Arc<TrustPolicy>) -> Result<Self> {
        let webpki = if policy.has_roots() {
            Some(
                WebPkiServerVerifier::builder(policy.roots())
                    .build()
                    .map_err(|e| Error::Config(format!("{:?}", e)))?,
            )
        } else {
            None
        };
        Ok(Self {
            policy,
            webpki,
            algorithms: algorithms(),
        })
    }
}

impl fmt::Debug for ServerCertCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCertCheck")
            .field("level", &self.policy.level())
            .finish()
    }
}

impl ServerCertVerifier for ServerCertCheck {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if self.policy.level() == VerifyLevel::None {
            return Ok(ServerCertVerified::assertion());
        }

        let chain = match &self.webpki {
            Some(webpki) => {
                match webpki.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now) {
                    Ok(_) => Ok(()),
                    // names are matched by the post-handshake check
                    Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            None => no_anchor(),
        };

        self.policy.verify_chain(end_entity, intermediates, &chain)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// One connection's view of a [`ServerCertCheck`]. rustls does not verify
/// the server certificate again when it resumes a session, so a check that
/// never ran marks a resumed handshake.
#[derive(Debug)]
pub struct SessionCertCheck {
    inner: Arc<ServerCertCheck>,
    verified: AtomicBool,
}

impl SessionCertCheck {
    pub fn new(inner: Arc<ServerCertCheck>) -> Self {
        Self {
            inner,
            verified: AtomicBool::new(false),
        }
    }

    /// The server certificate was checked during this handshake.
    pub fn verified(&self) -> bool {
        self.verified.load(Ordering::Relaxed)
    }
}

impl ServerCertVerifier for SessionCertCheck {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        self.verified.store(true, Ordering::Relaxed);
        self.inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Checks client certificates for the TLS-server role.
pub struct ClientCertCheck {
    policy: Arc<TrustPolicy>,
    webpki: Option<Arc<dyn ClientCertVerifier>>,
    hints: Vec<DistinguishedName>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertCheck {
    pub fn new(policy: Arc<TrustPolicy>) -> Result<Self> {
        let webpki = if policy.has_roots() {
            Some(
                WebPkiClientVerifier::builder(policy.roots())
                    .allow_unauthenticated()
                    .build()
                    .map_err(|e| Error::Config(format!("{:?}", e)))?,
            )
        } else {
            None
        };
        Ok(Self {
            hints: policy.roots().subjects(),
            policy,
            webpki,
            algorithms: algorithms(),
        })
    }
}

impl fmt::Debug for ClientCertCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCertCheck")
            .field("level", &self.policy.level())
            .field("hints", &self.hints.len())
            .finish()
    }
}

impl ClientCertVerifier for ClientCertCheck {
    fn offer_client_auth(&self) -> bool {
        self.policy.level() > VerifyLevel::None
    }

    fn client_auth_mandatory(&self) -> bool {
        self.policy.level() >= VerifyLevel::Require
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &self.hints
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        let chain = match &self.webpki {
            Some(webpki) => webpki
                .verify_client_cert(end_entity, intermediates, now)
                .map(|_| ()),
            None => no_anchor(),
        };

        self.policy.verify_chain(end_entity, intermediates, &chain)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
