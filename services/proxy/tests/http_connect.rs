
use std::sync::Arc;
use std::time::Duration;

use harness::{
    closed_by_peer, echo_roundtrip, handshake, wait_until, MapProvider, ProxyHandle, TcpEchoBackend,
};
use relaygate_proxy::backend::{BackendEndpoint, GroupManager, HealthCheckConfig, Method};
use relaygate_proxy::protocol::http_connect::CONNECT_ESTABLISHED;
use relaygate_proxy::proxy::{DirectConnectorProvider, GroupConnectorProvider, ProxyOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

#[tokio::test]
async fn connect_tunnel_forwards_bytes_verbatim() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let provider = Arc::new(MapProvider::new());
    provider.route("example.com:443", backend.addr);
    let proxy = ProxyHandle::spawn(provider.clone()).unwrap();

    let (mut stream, response) = handshake(
        proxy.listen_addr,
        b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n",
    )
    .await
    .unwrap();
    assert_eq!(response, CONNECT_ESTABLISHED);

    let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    assert_eq!(echo_roundtrip(&mut stream, &payload).await.unwrap(), payload);
    assert_eq!(echo_roundtrip(&mut stream, b"\r\n\r\n").await.unwrap(), b"\r\n\r\n");

    assert_eq!(provider.requests(), ["example.com:443"]);
    assert_eq!(backend.connection_count(), 1);

    let server = Arc::clone(proxy.proxy.server());
    let expected_out = (CONNECT_ESTABLISHED.len() + 4100) as u64;
    assert!(wait_until(|| server.from_remote_bytes() >= 4100).await);
    assert!(wait_until(|| server.to_remote_bytes() >= expected_out).await);
    assert_eq!(server.history_accepted_connection_count(), 1);
}

#[tokio::test]
async fn pipelined_bytes_after_request_are_forwarded() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let provider = Arc::new(MapProvider::new());
    provider.route("db.internal:5432", backend.addr);
    let proxy = ProxyHandle::spawn(provider).unwrap();

    let (mut stream, response) = handshake(
        proxy.listen_addr,
        b"connect db.internal:5432 HTTP/1.0\r\n\r\nearly",
    )
    .await
    .unwrap();

    // The echo of "early" may arrive in the same read as the 200 line.
    let mut received = response;
    while received.len() < CONNECT_ESTABLISHED.len() + 5 {
        let mut buf = [0u8; 64];
        let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "connection closed early");
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(&received[..CONNECT_ESTABLISHED.len()], CONNECT_ESTABLISHED);
    assert_eq!(&received[CONNECT_ESTABLISHED.len()..], b"early");
}

#[tokio::test]
async fn empty_host_closes_without_response() {
    let provider = Arc::new(MapProvider::new());
    let proxy = ProxyHandle::spawn(provider.clone()).unwrap();

    let (mut stream, response) = handshake(proxy.listen_addr, b"CONNECT :443 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    assert!(response.is_empty());
    assert!(closed_by_peer(&mut stream).await);
    assert!(provider.requests().is_empty());
}

#[tokio::test]
async fn out_of_range_port_closes_without_response() {
    let provider = Arc::new(MapProvider::new());
    let proxy = ProxyHandle::spawn(provider.clone()).unwrap();

    let (mut stream, response) = handshake(
        proxy.listen_addr,
        b"CONNECT example.com:99999 HTTP/1.1\r\n\r\n",
    )
    .await
    .unwrap();
    assert!(response.is_empty());
    assert!(closed_by_peer(&mut stream).await);
    assert!(provider.requests().is_empty());
}

#[tokio::test]
async fn non_connect_methods_are_rejected() {
    let provider = Arc::new(MapProvider::new());
    let proxy = ProxyHandle::spawn(provider.clone()).unwrap();

    for request in [
        &b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n"[..],
        &b"GET http://example.com/ HTTP/1.1\r\n\r\n"[..],
    ] {
        let (mut stream, response) = handshake(proxy.listen_addr, request).await.unwrap();
        assert!(response.is_empty());
        assert!(closed_by_peer(&mut stream).await);
    }
    assert!(provider.requests().is_empty());
}

#[tokio::test]
async fn provider_failure_closes_after_established() {
    let provider = Arc::new(MapProvider::new());
    let proxy = ProxyHandle::spawn(provider.clone()).unwrap();

    let (mut stream, response) = handshake(
        proxy.listen_addr,
        b"CONNECT unknown.example:443 HTTP/1.1\r\n\r\n",
    )
    .await
    .unwrap();
    assert_eq!(response, CONNECT_ESTABLISHED);
    assert!(closed_by_peer(&mut stream).await);
    assert_eq!(provider.requests(), ["unknown.example:443"]);
}

#[tokio::test]
async fn client_close_before_handshake_is_clean() {
    let provider = Arc::new(MapProvider::new());
    let proxy = ProxyHandle::spawn(provider.clone()).unwrap();

    let mut stream = tokio::net::TcpStream::connect(proxy.listen_addr).await.unwrap();
    stream.write_all(b"CONNECT exam").await.unwrap();
    drop(stream);

    let server = Arc::clone(proxy.proxy.server());
    assert!(wait_until(|| server.from_remote_bytes() == 12).await);
    assert!(provider.requests().is_empty());
}

#[tokio::test]
async fn group_provider_tunnels_to_healthy_member() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let groups = Arc::new(GroupManager::new(
        Method::WeightedRoundRobin,
        HealthCheckConfig::none(),
    ));
    groups
        .apply(&[BackendEndpoint {
            service: "echo.internal:7000".to_string(),
            alias: "echo-1".to_string(),
            addr: backend.addr,
            weight: 10,
        }])
        .await;
    let provider = Arc::new(GroupConnectorProvider::new(Arc::clone(&groups)));
    let proxy = ProxyHandle::spawn(provider).unwrap();

    let (mut stream, response) = handshake(
        proxy.listen_addr,
        b"CONNECT echo.internal:7000 HTTP/1.1\r\n\r\n",
    )
    .await
    .unwrap();
    assert_eq!(response, CONNECT_ESTABLISHED);
    assert_eq!(
        echo_roundtrip(&mut stream, b"through the group").await.unwrap(),
        b"through the group"
    );

    let member = groups.group("echo.internal:7000").await.unwrap().servers()[0].clone();
    assert_eq!(member.active_connections(), 1);
    assert!(member.stats().to_remote_bytes() >= 17);

    drop(stream);
    assert!(wait_until(|| member.active_connections() == 0).await);
    groups.close().await;
}

#[tokio::test]
async fn direct_provider_dials_target() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn_with(
        Arc::new(DirectConnectorProvider::new(Duration::from_secs(1))),
        ProxyOptions {
            idle_timeout: Some(Duration::from_secs(5)),
        },
    )
    .unwrap();

    let request = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", backend.addr.port());
    let (mut stream, response) = handshake(proxy.listen_addr, request.as_bytes()).await.unwrap();
    assert_eq!(response, CONNECT_ESTABLISHED);
    assert_eq!(echo_roundtrip(&mut stream, b"direct").await.unwrap(), b"direct");
}

#[tokio::test]
async fn paused_proxy_stops_accepting() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let provider = Arc::new(MapProvider::new());
    provider.route("example.com:443", backend.addr);
    let proxy = ProxyHandle::spawn(provider.clone()).unwrap();

    proxy.proxy.pause();
    let server = Arc::clone(proxy.proxy.server());
    assert!(!server.is_closed());
    assert!(server.event_loop().is_none());

    proxy.proxy.close();
    assert!(server.is_closed());
    // The reactor drops its own listener handle shortly after the pause.
    let mut refused = false;
    for _ in 0..50 {
        if tokio::net::TcpStream::connect(proxy.listen_addr).await.is_err() {
            refused = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(refused);
}
