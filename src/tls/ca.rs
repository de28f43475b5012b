//! Certificate authority management
//!
//! Owns the root CA used to impersonate destinations: bootstraps or loads a
//! persisted root keypair + self-signed certificate, issues cached per-host
//! leaf certificates signed by it, and exports the root certificate for
//! installation into an external trust store.
//!
//! The root private key is persisted only inside a password-protected
//! PKCS#12 store under a fixed alias. A missing store triggers bootstrap; a
//! corrupt store is deleted and regenerated.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use log::{debug, info, warn};
use moka::future::Cache;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
    SubjectKeyIdentifier,
};
use openssl::x509::{X509, X509NameBuilder, X509NameRef};

use crate::common::{ProxyError, Result};

/// Alias of the CA entry inside the PKCS#12 store
const CA_ALIAS: &str = "tunlens_ca";
/// RSA modulus size for root and leaf keys
const KEY_BITS: u32 = 2048;
/// Root certificate validity (10 years)
const ROOT_VALIDITY_DAYS: u32 = 3650;
/// Leaf certificate validity (1 year)
const LEAF_VALIDITY_DAYS: u32 = 365;
/// Leaf cache bound
const LEAF_CACHE_CAPACITY: u64 = 1024;
/// Leaf cache TTL: half the leaf validity
const LEAF_CACHE_TTL_SECS: u64 = (LEAF_VALIDITY_DAYS as u64) * 24 * 60 * 60 / 2;

/// Root CA keypair and certificate
pub struct CaCredentials {
    pub cert: X509,
    pub key: PKey<Private>,
}

/// CA readiness: either nothing has been loaded yet, or the credentials are
/// available. No nullable fields checked ad hoc.
enum CaState {
    Uninitialized,
    Ready(Arc<CaCredentials>),
}

/// A per-host certificate signed by the root CA
pub struct LeafCertificate {
    pub hostname: String,
    pub cert: X509,
    pub key: PKey<Private>,
}

/// Certificate authority manager
///
/// One instance exists per process; it is constructed explicitly and passed
/// to consumers rather than held in global state.
pub struct CaManager {
    store_path: PathBuf,
    password: String,
    state: RwLock<CaState>,
    /// First-writer-wins guard for the bootstrap; concurrent first callers
    /// must not race to generate two different root keys.
    bootstrap: tokio::sync::Mutex<()>,
    leaf_cache: Cache<String, Arc<LeafCertificate>>,
}

impl CaManager {
    /// Create a manager in the `Uninitialized` state. No IO happens until
    /// `ensure_root` runs.
    pub fn new(store_path: impl Into<PathBuf>, password: impl Into<String>) -> Self {
        Self {
            store_path: store_path.into(),
            password: password.into(),
            state: RwLock::new(CaState::Uninitialized),
            bootstrap: tokio::sync::Mutex::new(()),
            leaf_cache: Cache::builder()
                .max_capacity(LEAF_CACHE_CAPACITY)
                .time_to_live(std::time::Duration::from_secs(LEAF_CACHE_TTL_SECS))
                .build(),
        }
    }

    fn credentials(&self) -> Option<Arc<CaCredentials>> {
        match *self.state.read().expect("CA state lock poisoned") {
            CaState::Ready(ref creds) => Some(Arc::clone(creds)),
            CaState::Uninitialized => None,
        }
    }

    /// Idempotently load or bootstrap the root CA.
    ///
    /// Loads the persisted store if present and well-formed; a corrupt
    /// store is deleted and a fresh root generated and persisted before
    /// this returns. All callers observe the same credentials.
    pub async fn ensure_root(&self) -> Result<Arc<CaCredentials>> {
        if let Some(creds) = self.credentials() {
            return Ok(creds);
        }

        let _guard = self.bootstrap.lock().await;
        // A racing caller may have finished while we waited for the guard
        if let Some(creds) = self.credentials() {
            return Ok(creds);
        }

        let store_path = self.store_path.clone();
        let password = self.password.clone();
        let creds = tokio::task::spawn_blocking(move || {
            load_or_generate_root(&store_path, &password)
        })
        .await
        .map_err(|e| ProxyError::CaInit(format!("bootstrap task failed: {}", e)))??;

        let creds = Arc::new(creds);
        *self.state.write().expect("CA state lock poisoned") =
            CaState::Ready(Arc::clone(&creds));
        Ok(creds)
    }

    /// Issue (or fetch from cache) a leaf certificate for `hostname`.
    ///
    /// Fails with `CertIssuance` when the root CA has not been initialized.
    pub async fn issue_leaf(&self, hostname: &str) -> Result<Arc<LeafCertificate>> {
        let creds = self.credentials().ok_or_else(|| {
            ProxyError::CertIssuance("root CA is not initialized".to_string())
        })?;

        let host = hostname.to_ascii_lowercase();
        let host_for_gen = host.clone();
        self.leaf_cache
            .try_get_with(host, async move {
                let leaf = tokio::task::spawn_blocking(move || {
                    generate_leaf(&creds, &host_for_gen)
                })
                .await
                .map_err(|e| ProxyError::CertIssuance(format!("issuance task failed: {}", e)))??;
                debug!("issued leaf certificate for {}", leaf.hostname);
                Ok::<_, ProxyError>(Arc::new(leaf))
            })
            .await
            .map_err(|e: Arc<ProxyError>| ProxyError::CertIssuance(e.to_string()))
    }

    /// DER encoding of the root certificate for external installation.
    pub fn export_root_der(&self) -> Result<Vec<u8>> {
        let creds = self.credentials().ok_or_else(|| {
            ProxyError::CaInit("root CA has never been initialized".to_string())
        })?;
        Ok(creds.cert.to_der()?)
    }

    /// PEM encoding of the root certificate (base64 body wrapped at 64
    /// columns between BEGIN/END CERTIFICATE lines).
    pub fn export_root_pem(&self) -> Result<String> {
        let creds = self.credentials().ok_or_else(|| {
            ProxyError::CaInit("root CA has never been initialized".to_string())
        })?;
        let pem = creds.cert.to_pem()?;
        String::from_utf8(pem)
            .map_err(|e| ProxyError::CaInit(format!("PEM is not UTF-8: {}", e)))
    }

    /// Colon-separated SHA-256 fingerprint of the root certificate.
    pub fn root_fingerprint(&self) -> Result<String> {
        let creds = self.credentials().ok_or_else(|| {
            ProxyError::CaInit("root CA has never been initialized".to_string())
        })?;
        let digest = creds.cert.digest(MessageDigest::sha256())?;
        Ok(digest
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":"))
    }
}

fn load_or_generate_root(store_path: &Path, password: &str) -> Result<CaCredentials> {
    if store_path.exists() {
        match load_store(store_path, password) {
            Ok(creds) => {
                info!("loaded root CA from {}", store_path.display());
                return Ok(creds);
            }
            Err(e) => {
                warn!(
                    "CA store {} unreadable ({}); deleting and regenerating",
                    store_path.display(),
                    e
                );
                fs::remove_file(store_path).map_err(|e| {
                    ProxyError::CaInit(format!("cannot delete corrupt CA store: {}", e))
                })?;
            }
        }
    }

    let creds = generate_root()?;
    persist_store(store_path, password, &creds)?;
    info!("generated new root CA, persisted to {}", store_path.display());
    Ok(creds)
}

fn load_store(store_path: &Path, password: &str) -> Result<CaCredentials> {
    let der = fs::read(store_path)
        .map_err(|e| ProxyError::CaInit(format!("cannot read CA store: {}", e)))?;
    let parsed = Pkcs12::from_der(&der)
        .map_err(|e| ProxyError::CaInit(format!("CA store is not PKCS#12: {}", e)))?
        .parse2(password)
        .map_err(|e| ProxyError::CaInit(format!("cannot open CA store: {}", e)))?;

    let cert = parsed
        .cert
        .ok_or_else(|| ProxyError::CaInit("CA store holds no certificate".to_string()))?;
    let key = parsed
        .pkey
        .ok_or_else(|| ProxyError::CaInit("CA store holds no private key".to_string()))?;

    Ok(CaCredentials { cert, key })
}

fn persist_store(store_path: &Path, password: &str, creds: &CaCredentials) -> Result<()> {
    let pkcs12 = Pkcs12::builder()
        .name(CA_ALIAS)
        .pkey(&creds.key)
        .cert(&creds.cert)
        .build2(password)
        .map_err(|e| ProxyError::CaInit(format!("cannot build CA store: {}", e)))?;
    let der = pkcs12
        .to_der()
        .map_err(|e| ProxyError::CaInit(format!("cannot encode CA store: {}", e)))?;

    if let Some(parent) = store_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| {
                ProxyError::CaInit(format!("cannot create CA store directory: {}", e))
            })?;
        }
    }
    fs::write(store_path, der)
        .map_err(|e| ProxyError::CaInit(format!("cannot write CA store: {}", e)))
}

fn random_serial() -> Result<openssl::asn1::Asn1Integer> {
    let mut bn = BigNum::new()?;
    bn.rand(127, MsbOption::MAYBE_ZERO, false)?;
    Ok(bn.to_asn1_integer()?)
}

fn generate_root() -> Result<CaCredentials> {
    let rsa = Rsa::generate(KEY_BITS)?;
    let key = PKey::from_rsa(rsa)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, "Tunlens Root CA")?;
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, "Tunlens")?;
    name.append_entry_by_nid(Nid::COUNTRYNAME, "US")?;
    let name = name.build();

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial = random_serial()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&key)?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(ROOT_VALIDITY_DAYS)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    builder.append_extension(
        KeyUsage::new().critical().key_cert_sign().crl_sign().build()?,
    )?;
    let skid = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
    builder.append_extension(skid)?;

    builder.sign(&key, MessageDigest::sha256())?;
    Ok(CaCredentials {
        cert: builder.build(),
        key,
    })
}

fn generate_leaf(root: &CaCredentials, hostname: &str) -> Result<LeafCertificate> {
    let rsa = Rsa::generate(KEY_BITS)?;
    let key = PKey::from_rsa(rsa)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, hostname)?;
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, "Tunlens")?;
    let name = name.build();

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial = random_serial()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(root.cert.subject_name())?;
    builder.set_pubkey(&key)?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(LEAF_VALIDITY_DAYS)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    builder.append_extension(BasicConstraints::new().build()?)?;
    builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;

    // Clients validate the SAN, not the CN; IP literals get an iPAddress
    // entry, hostnames a dNSName entry.
    let mut san = SubjectAlternativeName::new();
    if hostname.parse::<std::net::IpAddr>().is_ok() {
        san.ip(hostname);
    } else {
        san.dns(hostname);
    }
    let san = san.build(&builder.x509v3_context(Some(&root.cert), None))?;
    builder.append_extension(san)?;

    builder.sign(&root.key, MessageDigest::sha256())?;
    Ok(LeafCertificate {
        hostname: hostname.to_string(),
        cert: builder.build(),
        key,
    })
}

/// Compare two X.509 names for equality.
pub fn names_equal(a: &X509NameRef, b: &X509NameRef) -> bool {
    matches!(a.try_cmp(b), Ok(Ordering::Equal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_in(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("ca_keystore.p12")
    }

    #[tokio::test]
    async fn test_bootstrap_creates_self_signed_ca() {
        let dir = tempdir().unwrap();
        let ca = CaManager::new(store_in(&dir), "secret");

        let creds = ca.ensure_root().await.unwrap();
        assert!(store_in(&dir).exists());

        // Self-signed: subject equals issuer
        assert!(names_equal(
            creds.cert.subject_name(),
            creds.cert.issuer_name()
        ));

        // CA basic constraint present and critical
        let text = String::from_utf8(creds.cert.to_text().unwrap()).unwrap();
        assert!(text.contains("CA:TRUE"), "missing CA basic constraint:\n{}", text);
        assert!(text.contains("Certificate Sign"), "missing keyCertSign:\n{}", text);
    }

    #[tokio::test]
    async fn test_reload_returns_same_root() {
        let dir = tempdir().unwrap();
        let path = store_in(&dir);

        let first = CaManager::new(&path, "secret");
        let cert_a = first.ensure_root().await.unwrap().cert.to_der().unwrap();

        let second = CaManager::new(&path, "secret");
        let cert_b = second.ensure_root().await.unwrap().cert.to_der().unwrap();

        assert_eq!(cert_a, cert_b);
    }

    #[tokio::test]
    async fn test_corrupt_store_is_regenerated() {
        let dir = tempdir().unwrap();
        let path = store_in(&dir);
        fs::write(&path, b"this is not a keystore").unwrap();

        let ca = CaManager::new(&path, "secret");
        let creds = ca.ensure_root().await.unwrap();

        // The store was rewritten and now loads cleanly
        let reloaded = load_store(&path, "secret").unwrap();
        assert_eq!(
            creds.cert.to_der().unwrap(),
            reloaded.cert.to_der().unwrap()
        );
    }

    #[tokio::test]
    async fn test_concurrent_bootstrap_single_root() {
        let dir = tempdir().unwrap();
        let ca = Arc::new(CaManager::new(store_in(&dir), "secret"));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ca = Arc::clone(&ca);
            handles.push(tokio::spawn(async move {
                ca.ensure_root().await.unwrap().cert.to_der().unwrap()
            }));
        }

        let mut certs = Vec::new();
        for handle in handles {
            certs.push(handle.await.unwrap());
        }
        assert!(certs.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_leaf_issuance_and_cache() {
        let dir = tempdir().unwrap();
        let ca = CaManager::new(store_in(&dir), "secret");
        let root = ca.ensure_root().await.unwrap();

        let first = ca.issue_leaf("api.example.com").await.unwrap();
        let second = ca.issue_leaf("api.example.com").await.unwrap();

        // Cache hit: byte-identical certificates
        assert_eq!(
            first.cert.to_der().unwrap(),
            second.cert.to_der().unwrap()
        );

        // Issuer chain: leaf issuer equals root subject
        assert!(names_equal(
            first.cert.issuer_name(),
            root.cert.subject_name()
        ));

        let text = String::from_utf8(first.cert.to_text().unwrap()).unwrap();
        assert!(text.contains("api.example.com"));
        assert!(text.contains("DNS:api.example.com"));
    }

    #[tokio::test]
    async fn test_leaf_for_ip_literal_gets_ip_san() {
        let dir = tempdir().unwrap();
        let ca = CaManager::new(store_in(&dir), "secret");
        ca.ensure_root().await.unwrap();

        let leaf = ca.issue_leaf("127.0.0.1").await.unwrap();
        let text = String::from_utf8(leaf.cert.to_text().unwrap()).unwrap();
        assert!(text.contains("IP Address:127.0.0.1"), "{}", text);
    }

    #[tokio::test]
    async fn test_leaf_without_root_fails() {
        let dir = tempdir().unwrap();
        let ca = CaManager::new(store_in(&dir), "secret");

        match ca.issue_leaf("api.example.com").await {
            Err(ProxyError::CertIssuance(_)) => {}
            other => panic!("expected CertIssuance error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_export_root_pem() {
        let dir = tempdir().unwrap();
        let ca = CaManager::new(store_in(&dir), "secret");

        // Export before bootstrap fails
        assert!(ca.export_root_pem().is_err());

        ca.ensure_root().await.unwrap();
        let pem = ca.export_root_pem().unwrap();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(pem.trim_end().ends_with("-----END CERTIFICATE-----"));

        // PEM round-trips and matches the DER export
        let reparsed = X509::from_pem(pem.as_bytes()).unwrap();
        assert_eq!(reparsed.to_der().unwrap(), ca.export_root_der().unwrap());

        let fingerprint = ca.root_fingerprint().unwrap();
        assert!(fingerprint.contains(':'));
    }
}
