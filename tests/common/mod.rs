use certmux::{
    Error, Service, ServiceStatus, WebHandler,
    certificate_authority::{CertificateAuthority, RcgenAuthority, SerialAllocator},
    rustls::{
        ClientConfig, RootCertStore,
        crypto::aws_lc_rs,
        pki_types::{CertificateDer, ServerName},
    },
};
use rustls_pemfile as pemfile;
use std::{io, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot::{self, Sender},
    task::JoinHandle,
};
use tokio_rustls::{TlsConnector, client::TlsStream};

pub fn build_ca() -> Arc<RcgenAuthority> {
    Arc::new(RcgenAuthority::new(
        Arc::new(SerialAllocator::new()),
        aws_lc_rs::default_provider(),
    ))
}

pub struct RunningService {
    pub addr: SocketAddr,
    pub status: ServiceStatus,
    pub stop: Sender<()>,
    pub done: JoinHandle<Result<(), Error>>,
}

pub async fn start_service<CA: CertificateAuthority>(
    ca: CA,
    root_pem: String,
    grace_period: Duration,
) -> RunningService {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();

    let service = Service::builder()
        .with_listener(listener)
        .with_ca(ca)
        .with_http_handler(WebHandler::new(root_pem))
        .with_handshake_timeout(Duration::from_secs(2))
        .with_grace_period(grace_period)
        .build();
    let status = service.status();

    let (stop, rx) = oneshot::channel();
    let done = tokio::spawn(service.start(async {
        rx.await.unwrap_or_default();
    }));

    RunningService {
        addr,
        status,
        stop,
        done,
    }
}

/// Trusts only the certificates in `root_pem`.
pub fn client_config(root_pem: &str) -> ClientConfig {
    let mut roots = RootCertStore::empty();
    for cert in pemfile::certs(&mut root_pem.as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }

    ClientConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

pub async fn connect_tls(
    addr: SocketAddr,
    config: ClientConfig,
    server_name: &str,
) -> io::Result<TlsStream<TcpStream>> {
    let server_name = ServerName::try_from(server_name.to_owned()).unwrap();
    let stream = TcpStream::connect(addr).await?;

    TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await
}

pub fn peer_certificate(stream: &TlsStream<TcpStream>) -> CertificateDer<'static> {
    let (_, conn) = stream.get_ref();
    conn.peer_certificates().unwrap()[0].clone().into_owned()
}

/// Sends a `GET` for `path` and returns the raw response.
pub async fn get<S>(stream: &mut S, host: &str, path: &str) -> String
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(req.as_bytes()).await.unwrap();

    let mut res = Vec::new();
    match stream.read_to_end(&mut res).await {
        Ok(_) => (),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => (),
        Err(e) => panic!("failed to read response: {e}"),
    }

    String::from_utf8(res).unwrap()
}
