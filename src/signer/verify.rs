//! Certificate verification against the trust configuration.
use bytes::Bytes;
use openssl::x509::X509;

use crate::signer::model::SecurityServerId;

//------------ CertVerifier --------------------------------------------------

/// Verifies certificates against the trusted chains and OCSP responders
/// known to the surrounding system.
///
/// The token signer only asks questions through this trait. Errors are
/// reported as human readable messages.
pub trait CertVerifier: Send + Sync {
    /// Checks that the certificate chains up to a trusted root.
    fn verify_chain(&self, cert: &X509) -> Result<(), String>;

    /// Checks that the certificate may authenticate the given server,
    /// using the OCSP response if one is known.
    fn verify_auth_cert(
        &self,
        server: &SecurityServerId,
        cert: &X509,
        ocsp_response: Option<&[u8]>,
    ) -> Result<(), String>;

    /// Fetches a fresh OCSP response, if the certificate has a responder.
    fn fetch_ocsp(&self, cert: &X509) -> Result<Option<Bytes>, String>;

    /// Checks that the OCSP response is fresh and reports the certificate
    /// as good. Whether a missing response is acceptable is up to the
    /// verifier.
    fn verify_ocsp(&self, cert: &X509, ocsp_response: Option<&[u8]>) -> Result<(), String>;
}

//------------ PermissiveVerifier --------------------------------------------

/// Accepts every certificate and never has OCSP responses.
#[derive(Clone, Copy, Debug, Default)]
pub struct PermissiveVerifier;

impl CertVerifier for PermissiveVerifier {
    fn verify_chain(&self, _cert: &X509) -> Result<(), String> {
        Ok(())
    }

    fn verify_auth_cert(
        &self,
        _server: &SecurityServerId,
        _cert: &X509,
        _ocsp_response: Option<&[u8]>,
    ) -> Result<(), String> {
        Ok(())
    }

    fn fetch_ocsp(&self, _cert: &X509) -> Result<Option<Bytes>, String> {
        Ok(None)
    }

    fn verify_ocsp(&self, _cert: &X509, _ocsp_response: Option<&[u8]>) -> Result<(), String> {
        Ok(())
    }
}
