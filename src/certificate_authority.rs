mod rcgen_authority;
mod serial;

use crate::Error;
use std::{future::Future, sync::Arc};
use tokio_rustls::rustls::ServerConfig;

pub use rcgen_authority::*;
pub use serial::SerialAllocator;

pub(crate) use rcgen_authority::validate_hostname;

/// Common name of the self-signed root certificate.
pub const ROOT_COMMON_NAME: &str = "certmux root authority";

/// Validity of the root certificate, in days from issuance.
pub const ROOT_TTL_DAYS: i64 = 3650;

/// Validity of leaf certificates, in days from issuance.
pub const LEAF_TTL_DAYS: i64 = 365;

/// Issues certificates for use when communicating with clients.
///
/// Clients should be configured to trust the root certificate returned by
/// [`CertificateAuthority::root`].
pub trait CertificateAuthority: Send + Sync + 'static {
    /// Returns the root certificate, generating it if this is the first call.
    ///
    /// # Errors
    ///
    /// A failure here is fatal, see [`Error::is_fatal`].
    fn root(&self) -> impl Future<Output = Result<&RootCertificate, Error>> + Send;

    /// Returns a rustls `ServerConfig` presenting the certificate issued for `server_name`.
    ///
    /// # Errors
    ///
    /// Returns an error if no certificate could be issued for `server_name`. Only the handshake
    /// that asked for it should be aborted.
    fn gen_server_config(
        &self,
        server_name: &str,
    ) -> impl Future<Output = Result<Arc<ServerConfig>, Error>> + Send;
}

impl<CA: CertificateAuthority> CertificateAuthority for Arc<CA> {
    fn root(&self) -> impl Future<Output = Result<&RootCertificate, Error>> + Send {
        CA::root(self)
    }

    fn gen_server_config(
        &self,
        server_name: &str,
    ) -> impl Future<Output = Result<Arc<ServerConfig>, Error>> + Send {
        CA::gen_server_config(self, server_name)
    }
}
