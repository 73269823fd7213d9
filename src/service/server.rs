use crate::{
    Error, HttpContext, HttpHandler,
    certificate_authority::CertificateAuthority,
    router::{RoutedStream, VirtualListener},
    service::lifecycle::{Lifecycle, Phase},
};
use http::uri::Scheme;
use hyper::{Request, body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use std::{convert::Infallible, future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::JoinSet,
};
use tokio_rustls::{LazyConfigAcceptor, rustls::server::Acceptor, server::TlsStream};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, instrument, warn};

/// Settings shared by the TLS server's handshakes.
#[derive(Clone, Debug)]
pub(crate) struct HandshakeSettings {
    pub(crate) timeout: Duration,
    pub(crate) fallback_server_name: Option<Arc<str>>,
}

/// Serves plaintext HTTP/1.x on `listener` until `shutdown` completes or the listener closes.
pub(crate) async fn serve_plain<H>(
    listener: VirtualListener,
    http_handler: H,
    grace_period: Duration,
    shutdown: impl Future<Output = ()>,
    lifecycle: &Lifecycle,
) where
    H: HttpHandler,
{
    accept_loop(
        listener,
        grace_period,
        shutdown,
        lifecycle,
        move |stream, client_addr, drain| {
            let ctx = HttpContext {
                client_addr,
                scheme: Scheme::HTTP,
                server_name: None,
            };
            serve_http(stream, http_handler.clone(), ctx, drain)
        },
    )
    .await
}

/// Serves HTTP/1.x over TLS on `listener`, presenting a certificate issued by `ca` for the
/// server name each client asks for.
pub(crate) async fn serve_secure<CA, H>(
    listener: VirtualListener,
    ca: Arc<CA>,
    http_handler: H,
    handshake: HandshakeSettings,
    grace_period: Duration,
    shutdown: impl Future<Output = ()>,
    lifecycle: &Lifecycle,
) where
    CA: CertificateAuthority,
    H: HttpHandler,
{
    accept_loop(
        listener,
        grace_period,
        shutdown,
        lifecycle,
        move |stream, client_addr, drain| {
            let ca = Arc::clone(&ca);
            let http_handler = http_handler.clone();
            let handshake = handshake.clone();

            async move {
                let accepted = tokio::time::timeout(
                    handshake.timeout,
                    accept_tls(stream, &*ca, handshake.fallback_server_name.as_deref()),
                )
                .await;

                let (stream, server_name) = match accepted {
                    Ok(Ok(accepted)) => accepted,
                    Ok(Err(e)) => {
                        warn!("TLS handshake failed: {}", e);
                        return;
                    }
                    Err(_) => {
                        warn!("TLS handshake did not complete within {:?}", handshake.timeout);
                        return;
                    }
                };

                let ctx = HttpContext {
                    client_addr,
                    scheme: Scheme::HTTPS,
                    server_name: Some(server_name),
                };
                serve_http(stream, http_handler, ctx, drain).await
            }
        },
    )
    .await
}

/// Accepts routed connections and runs `serve` for each one until told to stop, then drains.
///
/// Connections are signalled through the token passed to `serve` once draining starts. Whatever
/// is still running when the grace period ends is aborted.
async fn accept_loop<F, Fut>(
    mut listener: VirtualListener,
    grace_period: Duration,
    shutdown: impl Future<Output = ()>,
    lifecycle: &Lifecycle,
    mut serve: F,
) where
    F: FnMut(RoutedStream, SocketAddr, CancellationToken) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let drain = CancellationToken::new();
    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);
    lifecycle.set(Phase::Running);

    loop {
        tokio::select! {
            conn = listener.accept() => match conn {
                Some((stream, client_addr)) => {
                    let span = info_span!("connection", %client_addr);
                    connections.spawn(serve(stream, client_addr, drain.clone()).instrument(span));
                }
                None => {
                    debug!("Listener closed");
                    break;
                }
            },
            Some(res) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = res {
                    error!("Connection task failed: {}", e);
                }
            }
            _ = &mut shutdown => break,
        }
    }

    lifecycle.set(Phase::Draining);
    drop(listener);
    drain.cancel();

    let drained = tokio::time::timeout(grace_period, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            remaining = connections.len(),
            "Grace period elapsed, closing remaining connections"
        );
        connections.shutdown().await;
    }

    lifecycle.set(Phase::Stopped);
}

#[instrument(skip_all)]
async fn accept_tls<CA>(
    stream: RoutedStream,
    ca: &CA,
    fallback_server_name: Option<&str>,
) -> Result<(TlsStream<RoutedStream>, String), Error>
where
    CA: CertificateAuthority,
{
    let start = LazyConfigAcceptor::new(Acceptor::default(), stream).await?;

    let server_name = match start.client_hello().server_name() {
        Some(server_name) => server_name.to_owned(),
        None => {
            let fallback = fallback_server_name.ok_or(Error::MissingServerName)?;
            debug!(fallback, "Client did not send a server name");
            fallback.to_owned()
        }
    };

    let server_config = ca
        .gen_server_config(&server_name)
        .instrument(info_span!("gen_server_config", %server_name))
        .await?;

    let stream = start.into_stream(server_config).await?;
    Ok((stream, server_name))
}

async fn serve_http<I, H>(io: I, http_handler: H, ctx: HttpContext, drain: CancellationToken)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: HttpHandler,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let mut http_handler = http_handler.clone();
        let ctx = ctx.clone();

        async move {
            let res = http_handler
                .handle_request(&ctx, req)
                .instrument(info_span!("handle_request"))
                .await;
            Ok::<_, Infallible>(res)
        }
    });

    let conn = http1::Builder::new().serve_connection(TokioIo::new(io), service);
    tokio::pin!(conn);
    let mut draining = false;

    loop {
        tokio::select! {
            res = conn.as_mut() => {
                if let Err(e) = res {
                    debug!("Connection closed with error: {}", e);
                }
                break;
            }
            _ = drain.cancelled(), if !draining => {
                conn.as_mut().graceful_shutdown();
                draining = true;
            }
        }
    }
}
