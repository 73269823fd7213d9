use crate::{
    Error,
    certificate_authority::{
        CertificateAuthority, LEAF_TTL_DAYS, ROOT_COMMON_NAME, ROOT_TTL_DAYS, SerialAllocator,
    },
};
use moka::future::Cache;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P256_SHA256, SanType,
};
use std::{fmt, sync::Arc};
use time::{Duration, OffsetDateTime};
use tokio::sync::OnceCell;
use tokio_rustls::rustls::{
    ServerConfig,
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
};
use tracing::{debug, info};

const MAX_HOSTNAME_LEN: usize = 253;

/// The self-signed certificate every leaf is issued under, together with its key pair.
pub struct RootCertificate {
    serial: u64,
    cert: Certificate,
    key_pair: KeyPair,
}

impl RootCertificate {
    /// Serial number of the root certificate.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// DER encoding of the root certificate.
    pub fn der(&self) -> &CertificateDer<'static> {
        self.cert.der()
    }

    /// PEM encoding of the root certificate: one `CERTIFICATE` block followed by a newline.
    pub fn pem(&self) -> String {
        let mut pem = self.cert.pem();
        if !pem.ends_with('\n') {
            pem.push('\n');
        }
        pem
    }
}

impl fmt::Debug for RootCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootCertificate")
            .field("serial", &self.serial)
            .finish_non_exhaustive()
    }
}

/// A certificate issued for a single hostname and signed by the [`RootCertificate`].
#[derive(Debug)]
pub struct LeafCertificate {
    hostname: String,
    serial: u64,
    der: CertificateDer<'static>,
    server_config: Arc<ServerConfig>,
}

impl LeafCertificate {
    /// The hostname this certificate was issued for.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// DER encoding of the leaf certificate.
    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    /// Server configuration presenting this certificate followed by the root.
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }
}

/// Issues certificates for use when communicating with clients.
///
/// The root certificate is generated on first use and kept for the lifetime of the authority.
/// Leaf certificates are generated per hostname, each with its own key pair, and cached in memory.
/// Concurrent requests for the same hostname share a single generation. The cache is unbounded
/// unless [`RcgenAuthority::with_cache_capacity`] is used.
///
/// All keys are ECDSA P-256, generated with the `rcgen` crate.
///
/// # Examples
///
/// ```rust
/// use certmux::{
///     certificate_authority::{RcgenAuthority, SerialAllocator},
///     rustls::crypto::aws_lc_rs,
/// };
/// use std::sync::Arc;
///
/// let ca = RcgenAuthority::new(Arc::new(SerialAllocator::new()), aws_lc_rs::default_provider());
/// ```
pub struct RcgenAuthority {
    serials: Arc<SerialAllocator>,
    root: OnceCell<RootCertificate>,
    cache: Cache<String, Arc<LeafCertificate>>,
    provider: Arc<CryptoProvider>,
}

impl RcgenAuthority {
    /// Creates a new rcgen authority drawing serial numbers from `serials`.
    pub fn new(serials: Arc<SerialAllocator>, provider: CryptoProvider) -> Self {
        Self {
            serials,
            root: OnceCell::new(),
            cache: Cache::builder().build(),
            provider: Arc::new(provider),
        }
    }

    /// Bounds the number of cached leaf certificates.
    ///
    /// Evicted hostnames get a fresh certificate, with a new serial number, the next time they
    /// are requested.
    pub fn with_cache_capacity(mut self, capacity: u64) -> Self {
        self.cache = Cache::builder().max_capacity(capacity).build();
        self
    }

    /// The allocator serial numbers are drawn from.
    pub fn serials(&self) -> &SerialAllocator {
        &self.serials
    }

    /// Whether a certificate for `hostname` is currently cached.
    pub fn is_cached(&self, hostname: &str) -> bool {
        self.cache.contains_key(hostname)
    }

    /// Returns the certificate for `hostname`, issuing it if it is not cached yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Issue`] if the certificate could not be generated. Nothing is cached in
    /// that case, so a later call for the same hostname tries again.
    pub async fn certificate_for_host(&self, hostname: &str) -> Result<Arc<LeafCertificate>, Error> {
        let entry = self
            .cache
            .entry_by_ref(hostname)
            .or_try_insert_with(async {
                let root = self.root().await?;
                self.gen_leaf(root, hostname).map(Arc::new)
            })
            .await
            .map_err(|source| Error::Issue {
                hostname: hostname.to_owned(),
                source,
            })?;

        if entry.is_fresh() {
            debug!(hostname, "Generated certificate");
        } else {
            debug!(hostname, "Using cached certificate");
        }

        Ok(entry.into_value())
    }

    fn gen_root(&self) -> Result<RootCertificate, Error> {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(Error::Root)?;
        let serial = self.serials.next();

        let mut params = CertificateParams::default();
        params.serial_number = Some(serial.into());

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, ROOT_COMMON_NAME);
        params.distinguished_name = distinguished_name;

        let not_before = OffsetDateTime::now_utc();
        params.not_before = not_before;
        params.not_after = not_before + Duration::days(ROOT_TTL_DAYS);

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign];

        let cert = params.self_signed(&key_pair).map_err(Error::Root)?;
        info!(serial, "Generated root certificate");

        Ok(RootCertificate {
            serial,
            cert,
            key_pair,
        })
    }

    fn gen_leaf(&self, root: &RootCertificate, hostname: &str) -> Result<LeafCertificate, Error> {
        validate_hostname(hostname)?;

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let serial = self.serials.next();

        let mut params = CertificateParams::default();
        params.serial_number = Some(serial.into());

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, hostname);
        params.distinguished_name = distinguished_name;

        let not_before = OffsetDateTime::now_utc();
        params.not_before = not_before;
        params.not_after = not_before + Duration::days(LEAF_TTL_DAYS);

        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params
            .subject_alt_names
            .push(SanType::DnsName(hostname.try_into()?));

        let cert = params.signed_by(&key_pair, &root.cert, &root.key_pair)?;
        let der = cert.der().clone();
        let private_key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

        let mut server_cfg = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(vec![der.clone(), root.der().clone()], private_key)?;

        server_cfg.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(LeafCertificate {
            hostname: hostname.to_owned(),
            serial,
            der,
            server_config: Arc::new(server_cfg),
        })
    }
}

impl CertificateAuthority for RcgenAuthority {
    async fn root(&self) -> Result<&RootCertificate, Error> {
        self.root.get_or_try_init(|| async { self.gen_root() }).await
    }

    async fn gen_server_config(&self, server_name: &str) -> Result<Arc<ServerConfig>, Error> {
        self.certificate_for_host(server_name)
            .await
            .map(|leaf| leaf.server_config())
    }
}

/// Rejects names that cannot be a DNS subject alternative name.
pub(crate) fn validate_hostname(hostname: &str) -> Result<(), Error> {
    let valid = !hostname.is_empty()
        && hostname.len() <= MAX_HOSTNAME_LEN
        && hostname
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'*'));

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidHostname(hostname.to_owned()))
    }
}
