pub mod authority;
pub mod client;

pub use authority::{
    normalize_host, AuthorityStats, CertificateAuthority, CertificateCacheEntry, RootCertificate,
};
pub use client::{ActiveTlsConfig, TlsClientConfig, TlsConfigProvider};

use rustls::crypto::CryptoProvider;
use std::sync::Arc;

/// Process-wide rustls provider if one was installed, aws-lc-rs otherwise.
pub(crate) fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}
