mod server;

pub mod builder;
pub mod lifecycle;

use crate::{
    Error, HttpHandler,
    certificate_authority::CertificateAuthority,
    router::{ProtocolRouter, RoutedListeners},
};
use builder::{AddrOrListener, WantsAddr};
use lifecycle::{Lifecycle, ServiceStatus};
use server::HandshakeSettings;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_graceful::Shutdown;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

pub use builder::ServiceBuilder;
pub use lifecycle::Phase;

/// Time allowed on top of the grace period for the tasks themselves to wind down.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(1);

/// Plain HTTP and HTTPS on one socket. This must be constructed with a [`ServiceBuilder`].
///
/// # Examples
///
/// ```rust
/// use certmux::{
///     Service, WebHandler,
///     certificate_authority::{CertificateAuthority, RcgenAuthority, SerialAllocator},
///     rustls::crypto::aws_lc_rs,
/// };
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() {
/// let ca = Arc::new(RcgenAuthority::new(
///     Arc::new(SerialAllocator::new()),
///     aws_lc_rs::default_provider(),
/// ));
/// let root_pem = ca.root().await.expect("Failed to generate root").pem();
///
/// let service = Service::builder()
///     .with_addr(std::net::SocketAddr::from(([127, 0, 0, 1], 0)))
///     .with_ca(ca)
///     .with_http_handler(WebHandler::new(root_pem))
///     .build();
///
/// let (stop, done) = tokio::sync::oneshot::channel();
///
/// tokio::spawn(service.start(async {
///     done.await.unwrap_or_default();
/// }));
///
/// // Do something else...
///
/// stop.send(()).unwrap();
/// # }
/// ```
pub struct Service<CA, H> {
    addr_or_listener: AddrOrListener,
    ca: Arc<CA>,
    http_handler: H,
    handshake_timeout: Duration,
    grace_period: Duration,
    fallback_server_name: Option<Arc<str>>,
    lifecycles: [Lifecycle; 3],
    status: ServiceStatus,
}

impl Service<(), ()> {
    /// Create a new [`ServiceBuilder`].
    pub fn builder() -> ServiceBuilder<WantsAddr> {
        ServiceBuilder::new()
    }
}

impl<CA, H> Service<CA, H>
where
    CA: CertificateAuthority,
    H: HttpHandler,
{
    /// Observes the phases of the service's tasks. Remains usable after [`Service::start`].
    pub fn status(&self) -> ServiceStatus {
        self.status.clone()
    }

    /// Runs the service until `shutdown_signal` completes or one of its tasks stops on its own.
    ///
    /// The root certificate is generated before the socket is served. Once stopping starts, no
    /// new connections are accepted and in-flight ones get the grace period to finish. Returns
    /// after the router and both servers have stopped.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound, if the root certificate cannot be
    /// generated, or if the router stopped because accepting connections failed.
    pub async fn start<F>(self, shutdown_signal: F) -> Result<(), Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Self {
            addr_or_listener,
            ca,
            http_handler,
            handshake_timeout,
            grace_period,
            fallback_server_name,
            lifecycles: [router_lifecycle, plain_lifecycle, secure_lifecycle],
            status: _,
        } = self;

        let root_serial = ca.root().await?.serial();
        info!(serial = root_serial, "Root certificate ready");

        let listener = match addr_or_listener {
            AddrOrListener::Addr(addr) => TcpListener::bind(addr).await?,
            AddrOrListener::Listener(listener) => listener,
        };

        let (router, RoutedListeners { plain, default }) =
            ProtocolRouter::new(listener, handshake_timeout);
        info!(addr = %router.local_addr()?, "Listening");

        let stop = CancellationToken::new();
        let shutdown = Shutdown::new({
            let stop = stop.clone();
            async move {
                tokio::select! {
                    _ = shutdown_signal => info!("Shutdown requested"),
                    _ = stop.cancelled() => info!("A service task stopped, shutting down"),
                }
            }
        });

        let router_task = shutdown.spawn_task_fn({
            let stop = stop.clone();
            move |guard| {
                async move {
                    let _stop = stop.drop_guard();
                    router
                        .serve_with(guard.cancelled(), &router_lifecycle)
                        .await
                }
                .instrument(info_span!("router"))
            }
        });

        let plain_task = shutdown.spawn_task_fn({
            let stop = stop.clone();
            let http_handler = http_handler.clone();
            move |guard| {
                async move {
                    let _stop = stop.drop_guard();
                    server::serve_plain(
                        plain,
                        http_handler,
                        grace_period,
                        guard.cancelled(),
                        &plain_lifecycle,
                    )
                    .await
                }
                .instrument(info_span!("plain"))
            }
        });

        let secure_task = shutdown.spawn_task_fn({
            let stop = stop.clone();
            let handshake = HandshakeSettings {
                timeout: handshake_timeout,
                fallback_server_name,
            };
            move |guard| {
                async move {
                    let _stop = stop.drop_guard();
                    server::serve_secure(
                        default,
                        ca,
                        http_handler,
                        handshake,
                        grace_period,
                        guard.cancelled(),
                        &secure_lifecycle,
                    )
                    .await
                }
                .instrument(info_span!("secure"))
            }
        });

        match shutdown.shutdown_with_limit(grace_period + SHUTDOWN_SLACK).await {
            Ok(elapsed) => info!(?elapsed, "Service stopped"),
            Err(e) => {
                warn!("Service tasks did not stop in time: {}", e);
                router_task.abort();
                plain_task.abort();
                secure_task.abort();
            }
        }

        for (task, res) in [("plain", plain_task.await), ("secure", secure_task.await)] {
            match res {
                Err(e) if !e.is_cancelled() => error!(task, "Task failed: {}", e),
                _ => (),
            }
        }

        match router_task.await {
            Ok(res) => res.map_err(Into::into),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => {
                error!(task = "router", "Task failed: {}", e);
                Ok(())
            }
        }
    }
}
