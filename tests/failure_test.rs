//! Dial failures, handshake failures, and TLS resumption

mod common;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use common::{dead_addr, material, relay_config, spawn_relay, tls_connect, EchoServer};
use tlsrelay::config::RelayMode;
use tlsrelay::connection::KeepAlivePolicy;
use tlsrelay::protocol::ForwardTarget;
use tlsrelay::relay::Dialer;
use tlsrelay::tls;

async fn read_all<R: AsyncReadExt + Unpin>(conn: &mut R) -> Vec<u8> {
    let mut response = Vec::new();
    timeout(Duration::from_secs(5), conn.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

#[tokio::test]
async fn test_http_upstream_down_gets_502() {
    let material = material();
    let forward = format!("http://{}", dead_addr().await);
    let client = spawn_relay(relay_config(RelayMode::Client, forward), &material).await;

    let mut conn = TcpStream::connect(client.addr()).await.unwrap();
    let response = read_all(&mut conn).await;
    assert_eq!(response, b"HTTP/1.0 502 Bad Gateway\r\n\r\n");

    assert!(client.wait_idle(Duration::from_secs(2)).await);
    assert_eq!(client.metrics.snapshot().dial_failures, 1);
}

#[tokio::test]
async fn test_resp_upstream_down_over_tls() {
    let material = material();
    let forward = format!("resp://{}", dead_addr().await);
    let server = spawn_relay(relay_config(RelayMode::Server, forward), &material).await;

    let mut conn = tls_connect(server.addr(), &material).await.unwrap();
    let mut expected = [0u8; 18];
    timeout(Duration::from_secs(5), conn.read_exact(&mut expected))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&expected, b"-ERR bad gateway\r\n");

    assert!(server.wait_idle(Duration::from_secs(2)).await);
    assert!(server
        .metrics
        .render()
        .contains("tlsrelay_dial_failures_total{protocol=\"RESP\"} 1"));
}

#[tokio::test]
async fn test_unknown_scheme_closes_silently() {
    let material = material();
    let forward = format!("smtp://{}", dead_addr().await);
    let client = spawn_relay(relay_config(RelayMode::Client, forward), &material).await;

    let mut conn = TcpStream::connect(client.addr()).await.unwrap();
    let response = read_all(&mut conn).await;
    assert!(response.is_empty());
    assert!(client.wait_idle(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_failed_handshake_does_not_stop_listener() {
    let material = material();
    let echo = EchoServer::spawn().await.unwrap();
    let server = spawn_relay(relay_config(RelayMode::Server, echo.addr.to_string()), &material).await;

    // Plaintext where TLS is expected.
    let mut plain = TcpStream::connect(server.addr()).await.unwrap();
    plain.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let mut ignored = Vec::new();
    let _ = timeout(Duration::from_secs(5), plain.read_to_end(&mut ignored)).await;

    // A client presenting a certificate from another CA.
    let stranger = tls::KeyMaterial::self_signed("localhost").unwrap();
    let mut mixed = stranger.clone();
    mixed.ca_certs = material.ca_certs.clone();
    assert!(tls_connect_and_use(server.addr(), &mixed).await.is_err());

    assert!(common::wait_until(Duration::from_secs(2), || {
        server.metrics.snapshot().handshake_failures >= 2
    })
    .await);
    assert_eq!(echo.connections.load(std::sync::atomic::Ordering::Relaxed), 0);

    let mut conn = tls_connect(server.addr(), &material).await.unwrap();
    conn.write_all(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still here");
}

#[tokio::test]
async fn test_silent_peer_hits_handshake_timeout() {
    let material = material();
    let echo = EchoServer::spawn().await.unwrap();
    let mut config = relay_config(RelayMode::Server, echo.addr.to_string());
    config.handshake_timeout = Duration::from_millis(200);
    let server = spawn_relay(config, &material).await;

    let mut silent = TcpStream::connect(server.addr()).await.unwrap();
    let response = read_all(&mut silent).await;
    assert!(response.is_empty());

    assert!(server.wait_idle(Duration::from_secs(2)).await);
    assert_eq!(server.metrics.snapshot().handshake_failures, 1);
}

#[tokio::test]
async fn test_second_dial_resumes_tls_session() {
    let material = material();
    let echo = EchoServer::spawn().await.unwrap();
    let server = spawn_relay(relay_config(RelayMode::Server, echo.addr.to_string()), &material).await;

    let client_config = tls::client_config(&material).unwrap();
    let dialer = Dialer::tls(
        ForwardTarget::parse(&format!("localhost:{}", server.addr().port())),
        KeepAlivePolicy::disabled(),
        &client_config,
        Duration::from_secs(2),
    )
    .unwrap();

    let mut first = dialer.dial().await.unwrap();
    assert_eq!(first.resumed, Some(false));
    first.stream.write_all(b"ticket").await.unwrap();
    let mut buf = [0u8; 6];
    first.stream.read_exact(&mut buf).await.unwrap();
    drop(first);

    let mut second = dialer.dial().await.unwrap();
    assert_eq!(second.resumed, Some(true));
    second.stream.write_all(b"again!").await.unwrap();
    second.stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"again!");
}

async fn tls_connect_and_use(
    addr: std::net::SocketAddr,
    material: &tls::KeyMaterial,
) -> std::io::Result<()> {
    let mut conn = tls_connect(addr, material).await?;
    // TLS 1.3 reports client certificate rejection on the first read.
    conn.write_all(b"hello").await?;
    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).await?;
    Ok(())
}
