//! In-memory certificate authority and forged server contexts.
//!
//! A self-signed root CA is generated when the engine is constructed and
//! lives only in memory; embedders fetch it in PEM form to install into OS
//! trust stores. Per-host leaf certificates are forged on demand, signed by
//! the root, wrapped into ready TLS server contexts, and kept in a bounded
//! cache. Concurrent requests for the same host coalesce into a single
//! forging operation.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use moka::future::Cache;
use rand::Rng;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::error::{ProxyError, Result};

/// Leaf validity: one day of clock-skew allowance in the past, 825 days ahead
/// (the ceiling modern clients accept for leaf certificates).
const LEAF_BACKDATE_DAYS: i64 = 1;
const LEAF_VALID_DAYS: i64 = 825;

/// Root validity.
const ROOT_VALID_DAYS: i64 = 3650;

/// Bounded size of the forged-context cache.
const CONTEXT_CACHE_CAPACITY: u64 = 1024;

/// A hostname accepted as a certificate subject: a DNS name folded to
/// lowercase with any trailing dot stripped, or an IP literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HostName {
    Dns(String),
    Ip(IpAddr),
}

impl HostName {
    /// Normalizes a raw hostname. Rejects empty, oversized, or control-byte
    /// contaminated input.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim().trim_end_matches('.');
        if trimmed.is_empty() || trimmed.len() > 253 {
            return Err(ProxyError::Protocol(format!(
                "unusable hostname ({} bytes)",
                trimmed.len()
            )));
        }

        let candidate = trimmed.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = candidate.parse::<IpAddr>() {
            return Ok(Self::Ip(ip));
        }

        let folded = trimmed.to_ascii_lowercase();
        if !folded
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'-' | b'.' | b'_'))
        {
            return Err(ProxyError::Protocol(format!(
                "hostname contains forbidden bytes: {folded:?}"
            )));
        }
        Ok(Self::Dns(folded))
    }

    /// Cache key / SNI form of the host.
    pub fn to_key(&self) -> String {
        match self {
            Self::Dns(name) => name.clone(),
            Self::Ip(ip) => ip.to_string(),
        }
    }

    /// The rustls server name used when dialing upstream with this host.
    pub fn server_name(&self) -> Result<ServerName<'static>> {
        match self {
            Self::Dns(name) => ServerName::try_from(name.clone())
                .map_err(|e| ProxyError::Protocol(format!("invalid SNI name: {e}"))),
            Self::Ip(ip) => Ok(ServerName::IpAddress((*ip).into())),
        }
    }
}

impl std::fmt::Display for HostName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dns(name) => f.write_str(name),
            Self::Ip(ip) => write!(f, "{ip}"),
        }
    }
}

/// The in-memory root CA.
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    root_pem: String,
    root_der: CertificateDer<'static>,
}

impl CertificateAuthority {
    /// Generates a fresh self-signed root.
    pub fn generate() -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Warden Root CA");
        dn.push(DnType::OrganizationName, "Warden");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(LEAF_BACKDATE_DAYS);
        params.not_after = now + Duration::days(ROOT_VALID_DAYS);

        let key_pair = KeyPair::generate()
            .map_err(|e| ProxyError::TlsForge(format!("root key generation: {e}")))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| ProxyError::TlsForge(format!("root self-sign: {e}")))?;

        let root_pem = cert.pem();
        let root_der = cert.der().clone();
        let issuer = Issuer::from_ca_cert_pem(&root_pem, key_pair)
            .map_err(|e| ProxyError::TlsForge(format!("root issuer: {e}")))?;

        Ok(Self {
            issuer,
            root_pem,
            root_der,
        })
    }

    /// The root certificate in PEM form, for trust-store installation.
    pub fn root_pem(&self) -> &str {
        &self.root_pem
    }

    /// Forges a leaf for `host`: CN and SAN carry the exact normalized host,
    /// a fresh key pair and a random 128-bit serial per leaf.
    pub fn forge(
        &self,
        host: &HostName,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let mut params = CertificateParams::default();

        let mut serial = [0u8; 16];
        rand::thread_rng().fill(&mut serial);
        params.serial_number = Some(SerialNumber::from(serial.to_vec()));

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host.to_key());
        params.distinguished_name = dn;

        params.subject_alt_names = vec![match host {
            HostName::Ip(ip) => SanType::IpAddress(*ip),
            HostName::Dns(name) => SanType::DnsName(
                name.as_str()
                    .try_into()
                    .map_err(|_| ProxyError::TlsForge(format!("invalid SAN: {name}")))?,
            ),
        }];

        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(LEAF_BACKDATE_DAYS);
        params.not_after = now + Duration::days(LEAF_VALID_DAYS);

        let key_pair = KeyPair::generate()
            .map_err(|e| ProxyError::TlsForge(format!("leaf key generation: {e}")))?;
        let cert = params
            .signed_by(&key_pair, &self.issuer)
            .map_err(|e| ProxyError::TlsForge(format!("leaf signing: {e}")))?;

        let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|_| ProxyError::TlsForge("leaf key serialization".into()))?;

        Ok((vec![cert.der().clone(), self.root_der.clone()], key_der))
    }
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority").finish_non_exhaustive()
    }
}

/// Forged server contexts plus the single upstream client context.
pub struct CertificateStore {
    ca: Arc<CertificateAuthority>,
    contexts: Cache<String, Arc<ServerConfig>>,
    client_config: Arc<ClientConfig>,
}

impl CertificateStore {
    /// Builds the store: generates the root CA and assembles the upstream
    /// verification context from OS roots plus the optional CA bundle.
    pub fn new(ca_bundle: Option<&Path>) -> Result<Self> {
        let ca = Arc::new(CertificateAuthority::generate()?);
        let client_config = Arc::new(build_client_config(ca_bundle)?);

        Ok(Self {
            ca,
            contexts: Cache::builder()
                .max_capacity(CONTEXT_CACHE_CAPACITY)
                .build(),
            client_config,
        })
    }

    /// The root certificate in PEM form.
    pub fn root_pem(&self) -> &str {
        self.ca.root_pem()
    }

    /// Returns a cached or freshly forged server context for `host`.
    /// Concurrent calls for the same host share one forging operation.
    pub async fn context_for(&self, host: &HostName) -> Result<Arc<ServerConfig>> {
        let ca = self.ca.clone();
        let host = host.clone();
        self.contexts
            .try_get_with(host.to_key(), async move {
                let (chain, key) = ca.forge(&host)?;
                let config = ServerConfig::builder()
                    .with_no_client_auth()
                    .with_single_cert(chain, key)
                    .map_err(|e| ProxyError::TlsForge(format!("server context: {e}")))?;
                tracing::debug!(host = %host, "forged leaf certificate");
                Ok::<_, ProxyError>(Arc::new(config))
            })
            .await
            .map_err(|e: Arc<ProxyError>| ProxyError::TlsForge(e.to_string()))
    }

    /// The upstream client context used to verify origin servers.
    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.client_config.clone()
    }
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateStore")
            .field("cached_contexts", &self.contexts.entry_count())
            .finish()
    }
}

/// Root store = OS trust roots plus the optional PEM bundle. A configured
/// bundle that yields no certificates is a configuration error; a partially
/// unreadable OS store is only a warning.
fn build_client_config(ca_bundle: Option<&Path>) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        tracing::warn!("failed to load a native root certificate: {err}");
    }
    let (added, skipped) = roots.add_parsable_certificates(native.certs);
    tracing::debug!(added, skipped, "loaded OS trust roots");

    if let Some(path) = ca_bundle {
        let pem = std::fs::read(path)
            .map_err(|e| ProxyError::Config(format!("CA bundle {}: {e}", path.display())))?;
        let mut reader = std::io::Cursor::new(pem);
        let mut bundle_added = 0u32;
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert =
                cert.map_err(|e| ProxyError::Config(format!("CA bundle parse error: {e}")))?;
            if roots.add(cert).is_ok() {
                bundle_added += 1;
            }
        }
        if bundle_added == 0 {
            return Err(ProxyError::Config(format!(
                "CA bundle {} contains no usable certificates",
                path.display()
            )));
        }
        tracing::info!(count = bundle_added, "loaded CA bundle");
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}
