//! Session certificate authority for HTTPS interception.
//!
//! A self-signed root is generated lazily on first use and lives for the
//! process. Leaf certificates are minted per destination host, signed by the
//! root, and cached until they near expiry or the root is regenerated.
//! Minting for one host is single-flight: concurrent first contacts wait for
//! the same result instead of producing divergent certificates.

use dashmap::DashMap;
use parking_lot::RwLock;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::OnceCell;

use super::crypto_provider;
use crate::config::AuthorityConfig;
use crate::error::TlsError;

/// Leaves closer than this to `not_after` are re-minted.
const LEAF_RENEW_MARGIN: Duration = Duration::hours(1);

/// The session's trust root.
pub struct RootCertificate {
    cert: Certificate,
    key: KeyPair,
    pem: String,
    not_after: OffsetDateTime,
    generation: u64,
}

impl RootCertificate {
    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn der(&self) -> &CertificateDer<'static> {
        self.cert.der()
    }

    pub fn key_pem(&self) -> String {
        self.key.serialize_pem()
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn fingerprint(&self) -> String {
        sha256_hex(self.der())
    }
}

/// A minted leaf for one host. Never mutated; replaced wholesale on expiry
/// or root regeneration.
pub struct CertificateCacheEntry {
    pub host: String,
    pub certificate: CertificateDer<'static>,
    pub private_key: PrivatePkcs8KeyDer<'static>,
    pub not_after: OffsetDateTime,
    generation: u64,
    server_config: Arc<ServerConfig>,
}

impl CertificateCacheEntry {
    /// Ready-made rustls acceptor configuration presenting this leaf (and
    /// the root) with `http/1.1` as the only ALPN protocol.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }

    pub fn fingerprint(&self) -> String {
        sha256_hex(&self.certificate)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn is_fresh(&self, generation: u64, now: OffsetDateTime) -> bool {
        self.generation == generation && self.not_after - LEAF_RENEW_MARGIN > now
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthorityStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub leaves_issued: u64,
    pub regenerations: u64,
}

type LeafSlot = Arc<OnceCell<Arc<CertificateCacheEntry>>>;

pub struct CertificateAuthority {
    settings: AuthorityConfig,
    root: RwLock<Option<Arc<RootCertificate>>>,
    next_generation: AtomicU64,
    leaves: DashMap<String, LeafSlot>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    leaves_issued: AtomicU64,
    regenerations: AtomicU64,
}

impl CertificateAuthority {
    pub fn new(settings: AuthorityConfig) -> Self {
        Self {
            settings,
            root: RwLock::new(None),
            next_generation: AtomicU64::new(1),
            leaves: DashMap::new(),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            leaves_issued: AtomicU64::new(0),
            regenerations: AtomicU64::new(0),
        }
    }

    /// The root certificate, generated on first call.
    pub fn root(&self) -> Result<Arc<RootCertificate>, TlsError> {
        if let Some(root) = self.root.read().as_ref() {
            return Ok(Arc::clone(root));
        }

        let mut slot = self.root.write();
        // Another caller may have generated it while we waited for the lock.
        if let Some(root) = slot.as_ref() {
            return Ok(Arc::clone(root));
        }

        let root = Arc::new(self.generate_root()?);
        tracing::info!(
            generation = root.generation,
            fingerprint = %root.fingerprint(),
            "Generated session root CA"
        );
        *slot = Some(Arc::clone(&root));
        Ok(root)
    }

    /// Replace the root and drop every cached leaf signed by the old one.
    pub fn regenerate(&self) -> Result<Arc<RootCertificate>, TlsError> {
        let root = Arc::new(self.generate_root()?);
        {
            let mut slot = self.root.write();
            *slot = Some(Arc::clone(&root));
        }
        self.leaves.clear();
        self.regenerations.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            generation = root.generation,
            fingerprint = %root.fingerprint(),
            "Regenerated session root CA; leaf cache cleared"
        );
        Ok(root)
    }

    pub fn root_pem(&self) -> Result<String, TlsError> {
        Ok(self.root()?.pem().to_string())
    }

    /// Write the root certificate PEM so it can be installed in a client
    /// trust store.
    pub fn write_root_pem(&self, path: &Path) -> Result<(), TlsError> {
        let root = self.root()?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, root.pem())?;
        tracing::info!(path = %path.display(), "Wrote root CA certificate");
        Ok(())
    }

    /// Leaf certificate for `host`, minted on first use and reused while it
    /// stays valid under the current root.
    pub async fn leaf_for(&self, host: &str) -> Result<Arc<CertificateCacheEntry>, TlsError> {
        let host = normalize_host(host);
        if host.is_empty() {
            return Err(TlsError::mint(&host, "empty host name"));
        }

        loop {
            let root = self.root()?;
            let slot: LeafSlot = self
                .leaves
                .entry(host.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();

            let minted_here = Arc::new(AtomicBool::new(false));
            let entry = slot
                .get_or_try_init(|| {
                    let minted_here = Arc::clone(&minted_here);
                    let settings = self.settings.clone();
                    let root = Arc::clone(&root);
                    let host = host.clone();
                    async move {
                        minted_here.store(true, Ordering::Relaxed);
                        // Key generation and signing are CPU bound.
                        let minted = tokio::task::spawn_blocking({
                            let host = host.clone();
                            move || mint_leaf(&settings, &root, &host)
                        })
                        .await
                        .map_err(|e| TlsError::mint(&host, e))??;
                        Ok::<_, TlsError>(Arc::new(minted))
                    }
                })
                .await;

            let entry = match entry {
                Ok(entry) => Arc::clone(entry),
                Err(err) => {
                    tracing::warn!(host = %host, error = %err, "Leaf certificate minting failed");
                    return Err(err);
                }
            };

            let now = OffsetDateTime::now_utc();
            if minted_here.load(Ordering::Relaxed) {
                self.cache_misses.fetch_add(1, Ordering::Relaxed);
                self.leaves_issued.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(host = %host, "Minted leaf certificate");
                self.prune_stale(&host, root.generation, now);
                return Ok(entry);
            }
            if entry.is_fresh(root.generation, now) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry);
            }

            // Stale leaf: evict this exact slot (unless someone already
            // replaced it) and mint again.
            self.leaves
                .remove_if(&host, |_, current| Arc::ptr_eq(current, &slot));
        }
    }

    /// Drop every other host's leaf that has expired or belongs to an older
    /// root. Slots still minting are kept.
    fn prune_stale(&self, keep: &str, generation: u64, now: OffsetDateTime) {
        let before = self.leaves.len();
        self.leaves.retain(|host, slot| {
            host == keep || slot.get().map_or(true, |leaf| leaf.is_fresh(generation, now))
        });
        let pruned = before.saturating_sub(self.leaves.len());
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned stale leaf certificates");
        }
    }

    pub fn cached_leaf_count(&self) -> usize {
        self.leaves
            .iter()
            .filter(|slot| slot.value().initialized())
            .count()
    }

    pub fn stats(&self) -> AuthorityStats {
        AuthorityStats {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            leaves_issued: self.leaves_issued.load(Ordering::Relaxed),
            regenerations: self.regenerations.load(Ordering::Relaxed),
        }
    }

    fn generate_root(&self) -> Result<RootCertificate, TlsError> {
        let fail = |e: rcgen::Error| TlsError::mint(&self.settings.common_name, e);

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, self.settings.common_name.as_str());
        dn.push(DnType::OrganizationName, self.settings.organization.as_str());
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + self.settings.root_validity();
        let not_after = params.not_after;

        let key = KeyPair::generate().map_err(fail)?;
        let cert = params.self_signed(&key).map_err(fail)?;
        let pem = cert.pem();

        Ok(RootCertificate {
            cert,
            key,
            pem,
            not_after,
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
        })
    }
}

fn mint_leaf(
    settings: &AuthorityConfig,
    root: &RootCertificate,
    host: &str,
) -> Result<CertificateCacheEntry, TlsError> {
    let fail = |e: rcgen::Error| TlsError::mint(host, e);

    // `new` derives the SAN: an IP literal becomes an IP SAN, anything else
    // a DNS SAN.
    let mut params = CertificateParams::new(vec![host.to_string()]).map_err(fail)?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.use_authority_key_identifier_extension = true;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + settings.leaf_validity();
    let not_after = params.not_after;

    let key = KeyPair::generate().map_err(fail)?;
    let cert = params.signed_by(&key, &root.cert, &root.key).map_err(fail)?;

    let certificate = cert.der().clone();
    let private_key = PrivatePkcs8KeyDer::from(key.serialize_der());
    let chain = vec![certificate.clone(), root.der().clone()];

    let mut server_config = ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::mint(host, e))?
        .with_no_client_auth()
        .with_single_cert(chain, PrivateKeyDer::Pkcs8(private_key.clone_key()))
        .map_err(|e| TlsError::mint(host, e))?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(CertificateCacheEntry {
        host: host.to_string(),
        certificate,
        private_key,
        not_after,
        generation: root.generation,
        server_config: Arc::new(server_config),
    })
}

/// Cache key for a host: lowercase, no trailing dot, IPv6 brackets removed.
pub fn normalize_host(host: &str) -> String {
    host.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

fn sha256_hex(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;
    use x509_parser::extensions::GeneralName;
    use x509_parser::parse_x509_certificate;

    fn authority() -> CertificateAuthority {
        CertificateAuthority::new(AuthorityConfig::default())
    }

    #[test]
    fn test_root_is_generated_once() {
        let ca = authority();
        let first = ca.root().unwrap();
        let second = ca.root().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.pem().contains("BEGIN CERTIFICATE"));
        assert!(first.key_pem().contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn test_root_is_ca_and_valid_for_a_year() {
        let ca = authority();
        let root = ca.root().unwrap();
        let (_, parsed) = parse_x509_certificate(root.der()).unwrap();

        let constraints = parsed.basic_constraints().unwrap().unwrap();
        assert!(constraints.value.ca);

        let lifetime = root.not_after() - OffsetDateTime::now_utc();
        assert!(lifetime >= Duration::days(364));
    }

    #[tokio::test]
    async fn test_leaf_is_cached_per_host() {
        let ca = authority();
        let first = ca.leaf_for("api.example.test").await.unwrap();
        let second = ca.leaf_for("API.example.test.").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(
            ca.stats(),
            AuthorityStats {
                cache_hits: 1,
                cache_misses: 1,
                leaves_issued: 1,
                regenerations: 0,
            }
        );

        let other = ca.leaf_for("other.example.test").await.unwrap();
        assert_ne!(first.fingerprint(), other.fingerprint());
        assert_eq!(ca.cached_leaf_count(), 2);
    }

    #[tokio::test]
    async fn test_leaf_names_host_and_is_signed_by_root() {
        let ca = authority();
        let root = ca.root().unwrap();
        let leaf = ca.leaf_for("shop.example.test").await.unwrap();

        let (_, parsed) = parse_x509_certificate(&leaf.certificate).unwrap();
        let (_, root_parsed) = parse_x509_certificate(root.der()).unwrap();
        assert_eq!(parsed.issuer().to_string(), root_parsed.subject().to_string());

        let san = parsed.subject_alternative_name().unwrap().unwrap();
        assert!(san
            .value
            .general_names
            .iter()
            .any(|name| matches!(name, GeneralName::DNSName(dns) if *dns == "shop.example.test")));

        let lifetime = leaf.not_after - OffsetDateTime::now_utc();
        assert!(lifetime <= Duration::days(30));
        assert!(lifetime > Duration::hours(23));
    }

    #[tokio::test]
    async fn test_ip_literal_gets_ip_san() {
        let ca = authority();
        let leaf = ca.leaf_for("[::1]").await.unwrap();
        assert_eq!(leaf.host, "::1");

        let (_, parsed) = parse_x509_certificate(&leaf.certificate).unwrap();
        let san = parsed.subject_alternative_name().unwrap().unwrap();
        let expected = Ipv6Addr::LOCALHOST.octets().to_vec();
        assert!(san
            .value
            .general_names
            .iter()
            .any(|name| matches!(name, GeneralName::IPAddress(bytes) if bytes.to_vec() == expected)));
    }

    #[tokio::test]
    async fn test_concurrent_first_contact_mints_once() {
        let ca = Arc::new(authority());
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let ca = Arc::clone(&ca);
            tasks.push(tokio::spawn(async move {
                ca.leaf_for("race.example.test").await.unwrap().fingerprint()
            }));
        }

        let mut fingerprints = Vec::new();
        for task in tasks {
            fingerprints.push(task.await.unwrap());
        }
        fingerprints.dedup();
        assert_eq!(fingerprints.len(), 1);
        assert_eq!(ca.stats().leaves_issued, 1);
    }

    #[tokio::test]
    async fn test_regenerate_invalidates_leaves() {
        let ca = authority();
        let before_root = ca.root().unwrap();
        let before = ca.leaf_for("api.example.test").await.unwrap();

        let after_root = ca.regenerate().unwrap();
        assert_ne!(before_root.fingerprint(), after_root.fingerprint());
        assert!(after_root.generation() > before_root.generation());

        let after = ca.leaf_for("api.example.test").await.unwrap();
        assert_ne!(before.fingerprint(), after.fingerprint());
        assert_eq!(after.generation(), after_root.generation());
        assert_eq!(ca.stats().regenerations, 1);
    }

    #[tokio::test]
    async fn test_stale_leaves_are_pruned_on_mint() {
        // Zero-day leaves are inside the renewal margin as soon as they exist.
        let ca = CertificateAuthority::new(AuthorityConfig {
            leaf_validity_days: 0,
            ..AuthorityConfig::default()
        });

        let first = ca.leaf_for("a.example.test").await.unwrap();
        assert_eq!(first.host, "a.example.test");
        ca.leaf_for("b.example.test").await.unwrap();

        assert_eq!(ca.cached_leaf_count(), 1);
        assert_eq!(ca.stats().leaves_issued, 2);
    }

    #[test]
    fn test_write_root_pem() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("ca.crt");
        let ca = authority();
        ca.write_root_pem(&path).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written, ca.root_pem().unwrap());
    }

    #[tokio::test]
    async fn test_invalid_host_is_mint_error() {
        let ca = authority();
        assert!(matches!(
            ca.leaf_for("").await,
            Err(TlsError::CertificateMint { .. })
        ));
    }
}
