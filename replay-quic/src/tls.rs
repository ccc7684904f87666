//! Process-wide TLS contexts.
//!
//! One client and (when server credentials are supplied) one server context
//! exist per process, built once inside `init` and immutable afterwards.
//! Both advertise exactly one ALPN token, `h3`. The client default is to
//! skip certificate verification: the usual peer is a proxy under test with
//! a throwaway certificate.

use std::sync::{Arc, Mutex, OnceLock};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::error::Error;

/// The only ALPN token either role speaks.
pub const ALPN_H3: &[u8] = b"h3";

/// Client-side certificate verification toward the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyMode {
    /// Accept any certificate chain.
    #[default]
    None,
    /// Verify against the roots supplied at init.
    Required,
}

/// Credentials and trust anchors supplied to [`TlsContext::init`].
pub struct TlsMaterial {
    /// Server certificate chain, leaf first. Required for the server role.
    pub server_chain: Vec<CertificateDer<'static>>,
    /// Server private key.
    pub server_key: PrivateKeyDer<'static>,
    /// Roots for [`VerifyMode::Required`] clients.
    pub roots: Option<RootCertStore>,
}

struct Contexts {
    client_no_verify: Arc<rustls::ClientConfig>,
    client_verify: Option<Arc<rustls::ClientConfig>>,
    server: Option<Arc<rustls::ServerConfig>>,
}

fn contexts() -> &'static Mutex<Option<Contexts>> {
    static CONTEXTS: OnceLock<Mutex<Option<Contexts>>> = OnceLock::new();
    CONTEXTS.get_or_init(|| Mutex::new(None))
}

fn provider() -> Arc<CryptoProvider> {
    static PROVIDER: OnceLock<Arc<CryptoProvider>> = OnceLock::new();
    PROVIDER
        .get_or_init(|| Arc::new(rustls::crypto::ring::default_provider()))
        .clone()
}

/// Handle for the process-wide TLS context lifecycle.
pub struct TlsContext;

impl TlsContext {
    /// Build the process contexts. Client-only processes pass `None`; the
    /// server context (and the verifying client variant) require material.
    ///
    /// Calling `init` again replaces the contexts; endpoints hold `Arc`s to
    /// whatever was current when they connected.
    pub fn init(material: Option<TlsMaterial>) -> Result<(), Error> {
        let client_no_verify = Arc::new(Self::build_client(None)?);
        let (client_verify, server) = match material {
            None => (None, None),
            Some(material) => {
                let verify = match material.roots {
                    Some(roots) => Some(Arc::new(Self::build_client(Some(roots))?)),
                    None => None,
                };
                let server = Arc::new(Self::build_server(
                    material.server_chain,
                    material.server_key,
                )?);
                (verify, Some(server))
            }
        };

        let mut guard = contexts().lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(Contexts {
            client_no_verify,
            client_verify,
            server,
        });
        Ok(())
    }

    /// Drop the process contexts. Live endpoints keep their `Arc`s.
    pub fn terminate() {
        let mut guard = contexts().lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }

    pub(crate) fn client_config(verify: VerifyMode) -> Result<Arc<rustls::ClientConfig>, Error> {
        let guard = contexts().lock().unwrap_or_else(|e| e.into_inner());
        let contexts = guard
            .as_ref()
            .ok_or_else(|| Error::Config("TLS contexts not initialized".into()))?;
        match verify {
            VerifyMode::None => Ok(contexts.client_no_verify.clone()),
            VerifyMode::Required => contexts
                .client_verify
                .clone()
                .ok_or_else(|| Error::Config("no trust roots were supplied at init".into())),
        }
    }

    pub(crate) fn server_config() -> Result<Arc<rustls::ServerConfig>, Error> {
        let guard = contexts().lock().unwrap_or_else(|e| e.into_inner());
        guard
            .as_ref()
            .and_then(|c| c.server.clone())
            .ok_or_else(|| Error::Config("no server credentials were supplied at init".into()))
    }

    fn build_client(roots: Option<RootCertStore>) -> Result<rustls::ClientConfig, Error> {
        let builder = rustls::ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| Error::Config(format!("TLS 1.3 unavailable: {e}")))?;
        let mut config = match roots {
            Some(roots) => builder.with_root_certificates(roots).with_no_client_auth(),
            None => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification::new()))
                .with_no_client_auth(),
        };
        config.alpn_protocols = vec![ALPN_H3.to_vec()];
        Ok(config)
    }

    fn build_server(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<rustls::ServerConfig, Error> {
        let mut config = rustls::ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .map_err(|e| Error::Config(format!("TLS 1.3 unavailable: {e}")))?
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| Error::Config(format!("bad server credentials: {e}")))?;
        config.alpn_protocols = vec![ALPN_H3.to_vec()];
        Ok(config)
    }
}

/// Accepts any server certificate. Signature checks still run so that a
/// malformed handshake fails loudly rather than silently.
#[derive(Debug)]
struct NoVerification {
    provider: Arc<CryptoProvider>,
}

impl NoVerification {
    fn new() -> Self {
        Self {
            provider: provider(),
        }
    }
}

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
