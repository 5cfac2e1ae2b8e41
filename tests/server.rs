mod common;
use common::*;

use fastcgi_host::*;

use tokio::net::{TcpStream, UnixStream};

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

fn local() -> ListenAddress {
    "tcp:127.0.0.1:0".parse().unwrap()
}

async fn started(config: ServerConfig) -> FastcgiServer {
    let server = FastcgiServer::new(local(), config, echo);
    assert!(server.start(true, 16).await.unwrap());
    server
}

async fn connect(server: &FastcgiServer) -> TcpStream {
    TcpStream::connect(server.local_addr().unwrap()).await.unwrap()
}

#[tokio::test]
async fn tcp_request() {
    let server = started(ServerConfig::default()).await;
    let mut client = connect(&server).await;

    send_request(&mut client, 1, true, &[("REQUEST_URI", "/tcp")], b"payload").await;
    let response = read_response(&mut client, 1).await;
    assert_eq!(b"/tcp|payload", response.body());
    assert_eq!(1, server.connection_count());

    server.stop().await;
    assert_eq!(0, server.connection_count());
}

#[tokio::test]
async fn connection_ceiling() {
    let server = started(ServerConfig { max_connections: 2, ..ServerConfig::default() }).await;
    assert!(server.can_accept());
    assert_eq!(2, server.max_connections());

    let first = connect(&server).await;
    let mut second = connect(&server).await;
    wait_for(|| server.connection_count() == 2, "two connections").await;
    assert!(!server.can_accept());

    // Completes the TCP handshake in the backlog but isn't served yet.
    let mut third = connect(&server).await;
    send_request(&mut third, 1, true, &[("REQUEST_URI", "/third")], b"").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(2, server.connection_count());

    // Freeing a slot lets exactly the waiting connection in.
    drop(first);
    assert_eq!(b"/third|", read_response(&mut third, 1).await.body());
    assert_eq!(2, server.connection_count());
    assert!(!server.can_accept());

    drop(third);
    wait_for(|| server.can_accept(), "a free slot").await;
    assert_eq!(1, server.connection_count());

    send_request(&mut second, 1, true, &[("REQUEST_URI", "/second")], b"").await;
    assert_eq!(b"/second|", read_response(&mut second, 1).await.body());

    server.stop().await;
}

#[tokio::test]
async fn stop_closes_everything() {
    let server = started(ServerConfig::default()).await;
    let addr = server.local_addr().unwrap();

    let mut clients = vec![];
    for _ in 0..3 {
        clients.push(connect(&server).await);
    }
    wait_for(|| server.connection_count() == 3, "three connections").await;
    // One of them mid-request.
    begin(&mut clients[0], 1, Role::Responder, true).await;

    within(server.stop()).await;
    assert_eq!(0, server.connection_count());
    assert!(!server.is_listening());
    assert!(!server.can_accept());
    within(server.closed()).await;

    for client in &mut clients {
        assert!(is_closed(client).await);
    }
    assert!(TcpStream::connect(addr).await.is_err());

    // Idempotent.
    within(server.stop()).await;
}

#[tokio::test]
async fn unix_socket_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.sock");
    let address = ListenAddress::Unix { path: path.clone(), mode: Some(0o600) };

    let server = FastcgiServer::new(address.clone(), ServerConfig::default(), echo);
    assert!(server.start(true, 16).await.unwrap());
    assert_eq!(0o600, std::fs::metadata(&path).unwrap().permissions().mode() & 0o777);

    // A second server can't take over a live socket.
    let rival = FastcgiServer::new(address, ServerConfig::default(), echo);
    match rival.start(true, 16).await {
        Err(Error::AddressInUse { .. }) => (),
        other => panic!("expected AddressInUse, got {:?}", other),
    }

    let mut client = UnixStream::connect(&path).await.unwrap();
    send_request(&mut client, 1, true, &[("REQUEST_URI", "/unix")], b"").await;
    assert_eq!(b"/unix|", read_response(&mut client, 1).await.body());

    server.stop().await;
    assert!(!path.exists());
}

#[tokio::test]
async fn start_failure_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let address = ListenAddress::Unix { path: dir.path().join("missing/dir/app.sock"), mode: None };
    let server = FastcgiServer::new(address, ServerConfig::default(), echo);
    match server.start(true, 16).await {
        Err(Error::Io(e)) => assert_eq!(io::ErrorKind::NotFound, e.kind()),
        other => panic!("expected an I/O error, got {:?}", other),
    }
    assert!(!server.is_listening());
    server.stop().await;
}

#[tokio::test]
async fn foreground_start_returns_after_stop() {
    let server = FastcgiServer::new(local(), ServerConfig::default(), echo);
    let foreground = {
        let server = server.clone();
        tokio::spawn(async move { server.start(false, 16).await })
    };
    wait_for(|| server.is_listening(), "the listener").await;
    server.stop().await;
    assert!(within(foreground).await.unwrap().unwrap());
}

#[tokio::test]
async fn set_responder_applies_to_new_connections() {
    let server = started(ServerConfig::default()).await;
    let mut before = connect(&server).await;
    wait_for(|| server.connection_count() == 1, "the first connection").await;

    server.set_responder(|_request: FastcgiRequest| async {
        let mut response = FastcgiResponse::new();
        response.body.extend_from_slice(b"replaced");
        Ok::<_, io::Error>(response)
    });

    let mut after = connect(&server).await;
    send_request(&mut after, 1, true, &[("REQUEST_URI", "/x")], b"").await;
    assert_eq!(b"replaced", read_response(&mut after, 1).await.body());

    send_request(&mut before, 1, true, &[("REQUEST_URI", "/x")], b"").await;
    assert_eq!(b"/x|", read_response(&mut before, 1).await.body());

    server.stop().await;
}

#[tokio::test]
async fn end_connection_closes_it() {
    let server = FastcgiServer::new(local(), ServerConfig::default(), echo);
    let (ours, mut theirs) = UnixStream::pair().unwrap();
    let id = server.on_accept(FastcgiStream::from(ours)).unwrap();
    assert_eq!(1, server.connection_count());

    assert!(server.end_connection(id));
    assert_eq!(0, server.connection_count());
    assert!(is_closed(&mut theirs).await);
    server.stop().await;
}

#[tokio::test]
async fn stop_waits_for_ended_connections() {
    let server = FastcgiServer::new(local(), ServerConfig::default(), echo);
    let (ours, theirs) = std::os::unix::net::UnixStream::pair().unwrap();
    ours.set_nonblocking(true).unwrap();
    let id = server.on_accept(FastcgiStream::from(UnixStream::from_std(ours).unwrap())).unwrap();

    assert!(server.end_connection(id));
    server.stop().await;

    // The socket was shut down before stop returned: no waiting needed to see EOF.
    theirs.set_nonblocking(true).unwrap();
    let mut buf = [0u8; 8];
    assert_eq!(0, io::Read::read(&mut &theirs, &mut buf).unwrap());
}
