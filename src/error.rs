use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::rustls;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("failed to generate root certificate")]
    Root(#[source] rcgen::Error),
    #[error("invalid hostname {0:?}")]
    InvalidHostname(String),
    #[error("certificate generation failed")]
    Rcgen(#[from] rcgen::Error),
    #[error("invalid TLS configuration")]
    Tls(#[from] rustls::Error),
    #[error("failed to issue certificate for {hostname:?}")]
    Issue {
        hostname: String,
        #[source]
        source: Arc<Error>,
    },
    #[error("client did not send a server name")]
    MissingServerName,
    #[error("io error")]
    Io(#[from] std::io::Error),
    #[error("failed to load configuration")]
    Config(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether the service cannot continue after this error.
    ///
    /// Only a failure to produce the root certificate is fatal. Everything else is scoped to a
    /// single issuance or a single connection.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Root(_) => true,
            Self::Issue { source, .. } => source.is_fatal(),
            _ => false,
        }
    }
}
