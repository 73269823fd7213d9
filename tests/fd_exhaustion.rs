#![cfg(unix)]

use certmux::Phase;
use certmux::certificate_authority::CertificateAuthority;
use std::{net::UdpSocket, os::fd::AsRawFd, sync::Arc, time::Duration};
use tokio::net::TcpSocket;

#[allow(unused)]
mod common;

fn nofile_limit() -> libc::rlimit {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    assert_eq!(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) }, 0);
    limit
}

fn set_nofile_limit(limit: libc::rlimit) {
    assert_eq!(unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) }, 0);
}

/// Opens sockets until the process runs out of file descriptors.
fn exhaust_file_descriptors() -> Vec<UdpSocket> {
    let mut sockets = Vec::new();

    loop {
        match UdpSocket::bind("127.0.0.1:0") {
            Ok(socket) => sockets.push(socket),
            Err(e) => {
                assert_eq!(e.raw_os_error(), Some(libc::EMFILE), "{e}");
                return sockets;
            }
        }
    }
}

#[tokio::test]
async fn service_keeps_accepting_after_running_out_of_file_descriptors() {
    let ca = common::build_ca();
    let root_pem = ca.root().await.unwrap().pem();
    let mut service =
        common::start_service(Arc::clone(&ca), root_pem, Duration::from_secs(2)).await;
    service.status.wait_for(Phase::Running).await;

    // Created up front so connecting needs no new descriptor.
    let client = TcpSocket::new_v4().unwrap();

    let original = nofile_limit();
    let lowered = libc::rlimit {
        rlim_cur: (client.as_raw_fd() + 64) as libc::rlim_t,
        ..original
    };
    set_nofile_limit(lowered);
    let filler = exhaust_file_descriptors();
    assert!(!filler.is_empty());

    // Completes in the kernel, but the router cannot accept it.
    let mut stream = client.connect(service.addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(service.status.router(), Phase::Running);
    assert_eq!(service.status.plain(), Phase::Running);
    assert_eq!(service.status.secure(), Phase::Running);
    assert!(!service.done.is_finished());

    drop(filler);
    set_nofile_limit(original);

    let res = tokio::time::timeout(
        Duration::from_secs(5),
        common::get(&mut stream, "localhost", "/hello"),
    )
    .await
    .unwrap();
    assert!(res.starts_with("HTTP/1.1 200 OK"), "{res}");

    service.stop.send(()).unwrap();
    service.done.await.unwrap().unwrap();
}
