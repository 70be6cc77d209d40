//! Outbound TLS settings shared by the proxy's upstream leg and the
//! application's own request sender.
//!
//! Settings are validated into a [`rustls::ClientConfig`] up front. The
//! active configuration is published through an [`ArcSwap`], so a connection
//! that already loaded a config keeps using it while a newer one is applied.

use arc_swap::ArcSwap;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::crypto_provider;
use crate::error::TlsError;

/// User-supplied outbound TLS settings, as submitted from the TLS dialog.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsClientConfig {
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub client_key_path: Option<PathBuf>,
    #[serde(default)]
    pub custom_ca_path: Option<PathBuf>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

impl TlsClientConfig {
    pub fn client_cert_path(&self) -> Option<&Path> {
        non_empty(&self.client_cert_path)
    }

    pub fn client_key_path(&self) -> Option<&Path> {
        non_empty(&self.client_key_path)
    }

    pub fn custom_ca_path(&self) -> Option<&Path> {
        non_empty(&self.custom_ca_path)
    }
}

// Dialog fields arrive as strings; an empty one means "unset".
fn non_empty(path: &Option<PathBuf>) -> Option<&Path> {
    path.as_deref().filter(|p| !p.as_os_str().is_empty())
}

/// A validated configuration together with the settings it was built from.
#[derive(Debug)]
pub struct ActiveTlsConfig {
    pub settings: TlsClientConfig,
    /// General-purpose client configuration, no ALPN preference.
    pub client: Arc<ClientConfig>,
    /// Same trust and identity, pinned to `http/1.1` for the proxy's
    /// upstream leg.
    pub proxy_upstream: Arc<ClientConfig>,
}

pub struct TlsConfigProvider {
    current: ArcSwap<ActiveTlsConfig>,
}

impl TlsConfigProvider {
    /// Provider holding the default configuration (public web roots, no
    /// client identity, verification on).
    pub fn new() -> Result<Self, TlsError> {
        let active = Self::build_active(TlsClientConfig::default())?;
        Ok(Self {
            current: ArcSwap::from_pointee(active),
        })
    }

    /// Build a client configuration from `settings` without touching the
    /// provider's state.
    pub fn build(settings: &TlsClientConfig) -> Result<Arc<ClientConfig>, TlsError> {
        build_client_config(settings).map(Arc::new)
    }

    /// Validate `settings` and, only if that succeeds, make them the active
    /// configuration. On error the previous configuration stays in place.
    pub fn apply(&self, settings: TlsClientConfig) -> Result<Arc<ActiveTlsConfig>, TlsError> {
        let active = Arc::new(Self::build_active(settings)?);
        self.current.store(Arc::clone(&active));
        tracing::info!(
            client_auth = active.settings.client_cert_path().is_some(),
            custom_ca = active.settings.custom_ca_path().is_some(),
            insecure_skip_verify = active.settings.insecure_skip_verify,
            "Applied outbound TLS settings"
        );
        Ok(active)
    }

    pub fn active(&self) -> Arc<ActiveTlsConfig> {
        self.current.load_full()
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.current.load().client)
    }

    pub fn proxy_upstream_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.current.load().proxy_upstream)
    }

    pub fn settings(&self) -> TlsClientConfig {
        self.current.load().settings.clone()
    }

    fn build_active(settings: TlsClientConfig) -> Result<ActiveTlsConfig, TlsError> {
        let client = build_client_config(&settings)?;
        let mut proxy_upstream = client.clone();
        proxy_upstream.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(ActiveTlsConfig {
            settings,
            client: Arc::new(client),
            proxy_upstream: Arc::new(proxy_upstream),
        })
    }
}

fn build_client_config(settings: &TlsClientConfig) -> Result<ClientConfig, TlsError> {
    let provider = crypto_provider();
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()?;

    let mut roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(ca_path) = settings.custom_ca_path() {
        let bundle = load_certs(ca_path)?;
        let (added, ignored) = roots.add_parsable_certificates(bundle);
        if added == 0 {
            return Err(TlsError::InvalidMaterial(format!(
                "{} contains no usable CA certificates",
                ca_path.display()
            )));
        }
        tracing::debug!(added, ignored, path = %ca_path.display(), "Loaded custom CA bundle");
    }

    let builder = if settings.insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
    } else {
        builder.with_root_certificates(roots)
    };

    let config = match (settings.client_cert_path(), settings.client_key_path()) {
        (Some(cert_path), Some(key_path)) => {
            let chain = load_certs(cert_path)?;
            let key = load_private_key(key_path)?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| TlsError::InvalidMaterial(format!("client certificate/key: {e}")))?
        }
        (None, None) => builder.with_no_client_auth(),
        (Some(_), None) => {
            return Err(TlsError::InvalidMaterial(
                "client certificate set without a private key".into(),
            ))
        }
        (None, Some(_)) => {
            return Err(TlsError::InvalidMaterial(
                "client key set without a certificate".into(),
            ))
        }
    };

    Ok(config)
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| TlsError::InvalidMaterial(format!("{}: {e}", path.display())))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::InvalidMaterial(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(TlsError::InvalidMaterial(format!(
            "{} contains no PEM certificates",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TlsError::InvalidMaterial(format!("{}: {e}", path.display())))?
        .ok_or_else(|| {
            TlsError::InvalidMaterial(format!("{} contains no private key", path.display()))
        })
}

#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
