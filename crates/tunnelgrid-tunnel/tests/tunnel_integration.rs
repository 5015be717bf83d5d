//! Tunnel handshakes and the relay bridge against live loopback listeners.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_async;

use tunnelgrid_tunnel::{connect, BridgeConfig, TunnelConfig, TunnelKind, TunnelRelayBridge, WsStream};

fn tunnel_config(kind: TunnelKind, port: u16) -> TunnelConfig {
    let mut config: TunnelConfig = toml::from_str(&format!(
        r#"
remote_addr = "127.0.0.1"
remote_port = {}
connect_timeout_secs = 2
"#,
        port
    ))
    .unwrap();
    config.kind = kind;
    config.tls_sni = Some("localhost".into());
    config.tls_insecure_skip_verify = true;
    config
}

async fn spawn_tcp_echo() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

fn self_signed_acceptor() -> TlsAcceptor {
    let signed = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert = CertificateDer::from(signed.cert.der().to_vec());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        signed.key_pair.serialize_der(),
    ));
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

#[tokio::test]
async fn plain_tcp_tunnel_round_trips() {
    let port = spawn_tcp_echo().await;
    let mut tunnel = connect(&tunnel_config(TunnelKind::Tcp, port)).await.unwrap();
    assert_eq!(tunnel.kind(), TunnelKind::Tcp);

    tunnel.write_all(b"raw bytes").await.unwrap();
    let mut buf = [0u8; 32];
    let n = tunnel.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"raw bytes");
}

#[tokio::test]
async fn tls_tunnel_round_trips_with_self_signed_cert() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let acceptor = self_signed_acceptor();

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(tcp).await.unwrap();
        let mut buf = [0u8; 64];
        let n = tls.read(&mut buf).await.unwrap();
        tls.write_all(&buf[..n]).await.unwrap();
        tls.flush().await.unwrap();
    });

    let mut tunnel = connect(&tunnel_config(TunnelKind::Tls, port)).await.unwrap();
    tunnel.write_all(b"over tls").await.unwrap();
    let mut buf = [0u8; 32];
    let n = tunnel.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"over tls");
}

#[tokio::test]
async fn ws_tunnel_round_trips() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let ws = accept_async(tcp).await.unwrap();
        let mut stream = WsStream::new(ws);
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        stream.write_all(&buf[..n]).await.unwrap();
        stream.flush().await.unwrap();
    });

    let mut tunnel = connect(&tunnel_config(TunnelKind::Ws, port)).await.unwrap();
    tunnel.write_all(b"over ws").await.unwrap();
    let mut buf = [0u8; 32];
    let n = tunnel.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"over ws");
}

#[tokio::test]
async fn wss_tunnel_round_trips() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let acceptor = self_signed_acceptor();

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let tls = acceptor.accept(tcp).await.unwrap();
        let ws = accept_async(tls).await.unwrap();
        let mut stream = WsStream::new(ws);
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        stream.write_all(&buf[..n]).await.unwrap();
        stream.flush().await.unwrap();
    });

    let mut tunnel = connect(&tunnel_config(TunnelKind::Wss, port)).await.unwrap();
    tunnel.write_all(b"over wss").await.unwrap();
    let mut buf = [0u8; 32];
    let n = tunnel.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"over wss");
}

#[tokio::test]
async fn connect_times_out_on_black_hole() {
    // RFC 5737 TEST-NET address; nothing routes there.
    let mut config = tunnel_config(TunnelKind::Tcp, 9);
    config.remote_addr = "192.0.2.1".into();
    config.connect_timeout_secs = 1;
    let err = connect(&config).await.unwrap_err();
    let msg = err.to_string();
    assert!(
        msg.contains("timed out") || msg.contains("unreachable"),
        "unexpected error: {}",
        msg
    );
}

#[tokio::test]
async fn bridge_forwards_through_tunnel() {
    let echo_port = spawn_tcp_echo().await;
    let config = BridgeConfig {
        name: "bridge-test".into(),
        listen_addr: IpAddr::from([127, 0, 0, 1]),
        listen_port: 0,
        tunnel: tunnel_config(TunnelKind::Tcp, echo_port),
        idle_timeout_secs: 0,
        buffer_size: 0,
    };
    let bridge = Arc::new(TunnelRelayBridge::new(config));
    bridge.start().await.unwrap();
    let addr = bridge.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"through the bridge").await.unwrap();
    let mut buf = [0u8; 64];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"through the bridge");

    drop(client);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bridge.stats().total_conns(), 1);
    assert!(bridge.stats().bytes_in() >= 18);

    bridge.stop().await.unwrap();
}

#[tokio::test]
async fn bridge_counts_tunnel_dial_failures() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = unused.local_addr().unwrap().port();
    drop(unused);

    let config = BridgeConfig {
        name: "bridge-dead".into(),
        listen_addr: IpAddr::from([127, 0, 0, 1]),
        listen_port: 0,
        tunnel: tunnel_config(TunnelKind::Tcp, dead_port),
        idle_timeout_secs: 0,
        buffer_size: 0,
    };
    let bridge = Arc::new(TunnelRelayBridge::new(config));
    bridge.start().await.unwrap();
    let addr = bridge.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(bridge.stats().failed_conns(), 1);

    bridge.stop().await.unwrap();
}
