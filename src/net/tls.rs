//! TLS contexts, client certificate policy and certificate loading.
//!
//! # Responsibilities
//! - Build a rustls server configuration from a combined PEM file
//! - Advertise `h2` and `http/1.1` over ALPN when HTTP/2 is enabled
//! - Request, but never require, a client certificate
//! - Hold the current context so a reload can replace it without
//!   disturbing connections that already captured the old one
//!
//! # Design Decisions
//! - The handshake verifier accepts any presented chain; identity is only
//!   bound after a strict re-verification against the trust store
//! - Contexts are immutable; reload builds a new one and swaps the pointer

use arc_swap::ArcSwapOption;
use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificate found in {0}")]
    MissingCertificate(PathBuf),

    #[error("no private key found in {0}")]
    MissingKey(PathBuf),

    #[error("invalid TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("invalid client trust store: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
}

/// An immutable server TLS configuration.
pub struct TlsContext {
    acceptor: TlsAcceptor,
    client_verifier: Option<Arc<dyn ClientCertVerifier>>,
}

impl TlsContext {
    pub fn new(
        config: rustls::ServerConfig,
        client_verifier: Option<Arc<dyn ClientCertVerifier>>,
    ) -> Self {
        Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            client_verifier,
        }
    }

    pub fn acceptor(&self) -> &TlsAcceptor {
        &self.acceptor
    }

    /// Whether client certificates are requested during the handshake.
    pub fn mutual_tls(&self) -> bool {
        self.client_verifier.is_some()
    }

    /// Strictly verify a presented chain against the trust store.
    pub fn verify_client(&self, chain: &[CertificateDer<'static>]) -> bool {
        let (Some(verifier), Some((end_entity, intermediates))) =
            (&self.client_verifier, chain.split_first())
        else {
            return false;
        };
        match verifier.verify_client_cert(end_entity, intermediates, UnixTime::now()) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error = %e, "Client certificate rejected");
                false
            }
        }
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("mutual_tls", &self.mutual_tls())
            .finish()
    }
}

/// Handshake-time verifier that lets every client through.
///
/// Signature checks still run so a client cannot present a certificate it
/// does not hold the key for.
#[derive(Debug)]
pub struct PermissiveClientVerifier {
    inner: Arc<dyn ClientCertVerifier>,
}

impl PermissiveClientVerifier {
    pub fn new(inner: Arc<dyn ClientCertVerifier>) -> Self {
        Self { inner }
    }
}

impl ClientCertVerifier for PermissiveClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.inner.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Source of TLS contexts and the certificate file checks reload relies on.
pub trait CertificateProvider: Send + Sync + 'static {
    /// Make sure a usable certificate exists at `path` and build a context from it.
    fn ensure_key_present_encrypted_and_valid(&self, path: &Path) -> Result<TlsContext, TlsError>;

    /// Whether `path` holds both a certificate and a private key.
    fn file_has_credentials(&self, path: &Path) -> bool;

    /// Bring the key at `path` into its at-rest form.
    fn ensure_credentials_encrypted(&self, path: &Path) -> Result<(), TlsError>;
}

/// Loads a certificate chain and private key from one PEM file.
#[derive(Debug, Clone)]
pub struct PemCertificateProvider {
    trust_store: Option<PathBuf>,
    http2: bool,
    mutual_tls: bool,
}

impl PemCertificateProvider {
    pub fn new(trust_store: Option<PathBuf>, http2: bool, mutual_tls: bool) -> Self {
        Self {
            trust_store,
            http2,
            mutual_tls,
        }
    }

    fn provider() -> Arc<CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    fn read_pem(path: &Path) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), TlsError> {
        let io_err = |source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut reader = BufReader::new(File::open(path).map_err(io_err)?);
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_err)?;
        if certs.is_empty() {
            return Err(TlsError::MissingCertificate(path.to_path_buf()));
        }

        let mut reader = BufReader::new(File::open(path).map_err(io_err)?);
        let key = rustls_pemfile::private_key(&mut reader)
            .map_err(io_err)?
            .ok_or_else(|| TlsError::MissingKey(path.to_path_buf()))?;

        Ok((certs, key))
    }

    /// Every certificate under the trust store directory.
    fn load_trust_store(&self) -> Result<RootCertStore, TlsError> {
        let mut roots = RootCertStore::empty();
        let Some(dir) = &self.trust_store else {
            return Ok(roots);
        };
        let io_err = |source| TlsError::Io {
            path: dir.clone(),
            source,
        };

        for entry in std::fs::read_dir(dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if !path.is_file() {
                continue;
            }
            let Ok(file) = File::open(&path) else {
                continue;
            };
            let mut reader = BufReader::new(file);
            let certs = rustls_pemfile::certs(&mut reader).filter_map(Result::ok);
            let (added, ignored) = roots.add_parsable_certificates(certs);
            tracing::debug!(path = %path.display(), added, ignored, "Loaded trust anchors");
        }
        Ok(roots)
    }

    fn client_verifier(
        &self,
        provider: &Arc<CryptoProvider>,
    ) -> Result<Option<Arc<dyn ClientCertVerifier>>, TlsError> {
        if !self.mutual_tls {
            return Ok(None);
        }
        let roots = self.load_trust_store()?;
        if roots.is_empty() {
            tracing::warn!("Mutual TLS enabled but the trust store is empty, not requesting client certificates");
            return Ok(None);
        }
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(provider))
                .build()?;
        Ok(Some(verifier))
    }
}

impl CertificateProvider for PemCertificateProvider {
    fn ensure_key_present_encrypted_and_valid(&self, path: &Path) -> Result<TlsContext, TlsError> {
        let (certs, key) = Self::read_pem(path)?;
        let provider = Self::provider();
        let strict = self.client_verifier(&provider)?;

        let builder = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?;
        let builder = match &strict {
            Some(verifier) => builder.with_client_cert_verifier(Arc::new(
                PermissiveClientVerifier::new(Arc::clone(verifier)),
            )),
            None => builder.with_no_client_auth(),
        };
        let mut config = builder.with_single_cert(certs, key)?;

        config.alpn_protocols = if self.http2 {
            vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()]
        } else {
            vec![ALPN_HTTP11.to_vec()]
        };

        tracing::info!(
            path = %path.display(),
            http2 = self.http2,
            mutual_tls = strict.is_some(),
            "TLS context built"
        );
        Ok(TlsContext::new(config, strict))
    }

    fn file_has_credentials(&self, path: &Path) -> bool {
        Self::read_pem(path).is_ok()
    }

    fn ensure_credentials_encrypted(&self, path: &Path) -> Result<(), TlsError> {
        // Keys are kept as plain PEM; nothing to convert.
        tracing::debug!(path = %path.display(), "Credentials checked");
        Ok(())
    }
}

/// Holder of the context new connections should use.
#[derive(Debug, Clone, Default)]
pub struct CertificateStore {
    current: Arc<ArcSwapOption<TlsContext>>,
}

impl CertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<TlsContext>> {
        self.current.load_full()
    }

    /// Publish a new context. Holders of the previous one keep it alive.
    pub fn replace(&self, ctx: TlsContext) {
        self.current.store(Some(Arc::new(ctx)));
    }
}
