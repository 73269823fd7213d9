use crate::{
    Config, HttpHandler,
    certificate_authority::CertificateAuthority,
    service::{
        Service,
        lifecycle::{Lifecycle, ServiceStatus},
    },
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);
const DEFAULT_FALLBACK_SERVER_NAME: &str = "localhost";

/// A builder for creating a service.
#[derive(Debug)]
pub struct ServiceBuilder<T>(T);

/// Builder state that needs either an address or a TCP listener.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WantsAddr(());

#[derive(Debug)]
pub(crate) enum AddrOrListener {
    Addr(SocketAddr),
    Listener(TcpListener),
}

impl ServiceBuilder<WantsAddr> {
    /// Create a new ServiceBuilder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address to listen on.
    pub fn with_addr(self, addr: SocketAddr) -> ServiceBuilder<WantsCa> {
        ServiceBuilder(WantsCa {
            addr_or_listener: AddrOrListener::Addr(addr),
        })
    }

    /// Set a listener to use for the service.
    pub fn with_listener(self, listener: TcpListener) -> ServiceBuilder<WantsCa> {
        ServiceBuilder(WantsCa {
            addr_or_listener: AddrOrListener::Listener(listener),
        })
    }
}

impl Default for ServiceBuilder<WantsAddr> {
    fn default() -> Self {
        ServiceBuilder(WantsAddr(()))
    }
}

/// Builder state that needs a certificate authority.
#[derive(Debug)]
pub struct WantsCa {
    addr_or_listener: AddrOrListener,
}

impl ServiceBuilder<WantsCa> {
    /// Set the certificate authority to use.
    pub fn with_ca<CA: CertificateAuthority>(self, ca: CA) -> ServiceBuilder<WantsHandler<CA>> {
        ServiceBuilder(WantsHandler {
            addr_or_listener: self.0.addr_or_listener,
            ca,
        })
    }
}

/// Builder state that needs an HTTP handler.
#[derive(Debug)]
pub struct WantsHandler<CA> {
    addr_or_listener: AddrOrListener,
    ca: CA,
}

impl<CA: CertificateAuthority> ServiceBuilder<WantsHandler<CA>> {
    /// Set the HTTP handler that serves requests on both protocols.
    pub fn with_http_handler<H: HttpHandler>(self, http_handler: H) -> ServiceBuilder<Ready<CA, H>> {
        ServiceBuilder(Ready {
            addr_or_listener: self.0.addr_or_listener,
            ca: self.0.ca,
            http_handler,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            fallback_server_name: Some(DEFAULT_FALLBACK_SERVER_NAME.into()),
        })
    }
}

/// Builder state that can take optional settings.
#[derive(Debug)]
pub struct Ready<CA, H> {
    addr_or_listener: AddrOrListener,
    ca: CA,
    http_handler: H,
    handshake_timeout: Duration,
    grace_period: Duration,
    fallback_server_name: Option<Arc<str>>,
}

impl<CA, H> ServiceBuilder<Ready<CA, H>>
where
    CA: CertificateAuthority,
    H: HttpHandler,
{
    /// How long a connection may take to be classified, and then to complete its TLS handshake.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.0.handshake_timeout = timeout;
        self
    }

    /// How long in-flight connections may keep running once shutdown starts.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.0.grace_period = grace_period;
        self
    }

    /// The certificate to present to TLS clients that do not send a server name.
    ///
    /// With `None`, such handshakes are aborted.
    pub fn with_fallback_server_name(mut self, server_name: Option<String>) -> Self {
        self.0.fallback_server_name = server_name.map(Into::into);
        self
    }

    /// Apply the timeouts and fallback server name from `config`.
    pub fn with_config(self, config: &Config) -> Self {
        self.with_handshake_timeout(config.handshake_timeout())
            .with_grace_period(config.grace_period())
            .with_fallback_server_name(config.fallback_server_name().map(str::to_owned))
    }

    /// Build the service.
    pub fn build(self) -> Service<CA, H> {
        let (router, router_rx) = Lifecycle::new("router");
        let (plain, plain_rx) = Lifecycle::new("plain");
        let (secure, secure_rx) = Lifecycle::new("secure");

        Service {
            addr_or_listener: self.0.addr_or_listener,
            ca: Arc::new(self.0.ca),
            http_handler: self.0.http_handler,
            handshake_timeout: self.0.handshake_timeout,
            grace_period: self.0.grace_period,
            fallback_server_name: self.0.fallback_server_name,
            lifecycles: [router, plain, secure],
            status: ServiceStatus {
                router: router_rx,
                plain: plain_rx,
                secure: secure_rx,
            },
        }
    }
}
