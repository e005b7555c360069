//! Tunnel-handler integration tests: drive an admitted WebSocket connection
//! frame by frame against a live UDP echo backend.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use streamsockets_server::accounts;
use streamsockets_server::auth::TokenAuthenticator;
use streamsockets_server::config::ServerConfig;
use streamsockets_server::metrics::Metrics;
use streamsockets_server::{serve, AppState};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// UDP echo: every datagram goes straight back to its sender.
async fn start_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind echo");
    let addr = socket.local_addr().expect("echo addr");
    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];
        while let Ok((len, sender)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..len], sender).await;
        }
    });
    addr
}

async fn start_server(route: &str, config: ServerConfig) -> SocketAddr {
    let yaml = format!(
        r"
accounts:
  - name: user1
    token: '123456'
    reuse: true
    routes: ['{route}']
    allowedIps: ['127.0.0.1']
"
    );
    let auth = TokenAuthenticator::from_accounts(accounts::parse(&yaml).expect("valid yaml"));
    let state = AppState::new(
        Arc::new(config),
        Arc::new(auth),
        Arc::new(Metrics::new()),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(serve(listener, state));
    addr
}

async fn connect_multi(server: SocketAddr, route: &str) -> Ws {
    let (host, port) = route.split_once(':').expect("route");
    let mut request = format!("ws://{server}/tunnel")
        .into_client_request()
        .expect("request");
    let headers = request.headers_mut();
    headers.insert("X-Auth-Type", HeaderValue::from_static("Token"));
    headers.insert("X-Auth-Token", HeaderValue::from_static("123456"));
    headers.insert("X-Route-Address", HeaderValue::from_str(host).expect("host"));
    headers.insert("X-Route-Port", HeaderValue::from_str(port).expect("port"));
    let (ws, _) = tokio_tungstenite::connect_async(request).await.expect("101");
    ws
}

async fn connect_legacy(server: SocketAddr, route: &str) -> Ws {
    let mut request = format!("ws://{server}/tunnel")
        .into_client_request()
        .expect("request");
    let headers = request.headers_mut();
    headers.insert("X-Auth-Type", HeaderValue::from_static("Token"));
    headers.insert("X-Auth-Token", HeaderValue::from_static("123456"));
    headers.insert("X-Auth-Route", HeaderValue::from_str(route).expect("route"));
    let (ws, _) = tokio_tungstenite::connect_async(request).await.expect("101");
    ws
}

/// Next data-bearing frame, skipping pings/pongs. Panics on timeout.
async fn next_frame(ws: &mut Ws, wait: Duration) -> Message {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for frame");
        let msg = tokio::time::timeout(remaining, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("read error");
        match msg {
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return other,
        }
    }
}

async fn expect_no_frame(ws: &mut Ws, wait: Duration) {
    let result = tokio::time::timeout(wait, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => return other,
            }
        }
    })
    .await;
    if let Ok(frame) = result {
        panic!("expected silence, got {frame:?}");
    }
}

#[tokio::test]
async fn first_tunnel_echoes_with_id_prefix() {
    let echo = start_echo().await;
    let route = echo.to_string();
    let server = start_server(&route, ServerConfig::default()).await;
    let mut ws = connect_multi(server, &route).await;

    match next_frame(&mut ws, Duration::from_secs(5)).await {
        Message::Text(text) => assert_eq!(text.as_str(), "SOCKET ID: 1"),
        other => panic!("expected grant, got {other:?}"),
    }

    ws.send(Message::Binary(b"\x01hello".to_vec().into()))
        .await
        .expect("send");
    match next_frame(&mut ws, Duration::from_secs(5)).await {
        Message::Binary(frame) => assert_eq!(&frame[..], b"\x01hello"),
        other => panic!("expected echo, got {other:?}"),
    }
}

#[tokio::test]
async fn new_control_frame_grants_second_tunnel() {
    let echo = start_echo().await;
    let route = echo.to_string();
    let server = start_server(&route, ServerConfig::default()).await;
    let mut ws = connect_multi(server, &route).await;
    next_frame(&mut ws, Duration::from_secs(5)).await; // SOCKET ID: 1

    ws.send(Message::Text("NEW".into())).await.expect("send");
    match next_frame(&mut ws, Duration::from_secs(5)).await {
        Message::Text(text) => assert_eq!(text.as_str(), "SOCKET ID: 2"),
        other => panic!("expected grant, got {other:?}"),
    }

    // Each tunnel keeps its own id on the return path.
    ws.send(Message::Binary(b"\x02b-side".to_vec().into()))
        .await
        .expect("send");
    match next_frame(&mut ws, Duration::from_secs(5)).await {
        Message::Binary(frame) => assert_eq!(&frame[..], b"\x02b-side"),
        other => panic!("expected echo, got {other:?}"),
    }
}

#[tokio::test]
async fn tunnel_cap_drops_new_requests_silently() {
    let echo = start_echo().await;
    let route = echo.to_string();
    let config = ServerConfig {
        max_udp_tunnels_per_client: 1,
        ..ServerConfig::default()
    };
    let server = start_server(&route, config).await;
    let mut ws = connect_multi(server, &route).await;
    next_frame(&mut ws, Duration::from_secs(5)).await; // SOCKET ID: 1

    ws.send(Message::Text("NEW".into())).await.expect("send");
    expect_no_frame(&mut ws, Duration::from_millis(500)).await;

    // The existing tunnel is unaffected.
    ws.send(Message::Binary(b"\x01still-alive".to_vec().into()))
        .await
        .expect("send");
    match next_frame(&mut ws, Duration::from_secs(5)).await {
        Message::Binary(frame) => assert_eq!(&frame[..], b"\x01still-alive"),
        other => panic!("expected echo, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_and_reserved_tunnel_ids_are_dropped() {
    let echo = start_echo().await;
    let route = echo.to_string();
    let server = start_server(&route, ServerConfig::default()).await;
    let mut ws = connect_multi(server, &route).await;
    next_frame(&mut ws, Duration::from_secs(5)).await; // SOCKET ID: 1

    ws.send(Message::Binary(b"\x09ghost".to_vec().into()))
        .await
        .expect("send");
    ws.send(Message::Binary(b"\x00reserved".to_vec().into()))
        .await
        .expect("send");
    expect_no_frame(&mut ws, Duration::from_millis(500)).await;

    // A bad frame never tears the connection down.
    ws.send(Message::Binary(b"\x01ok".to_vec().into()))
        .await
        .expect("send");
    match next_frame(&mut ws, Duration::from_secs(5)).await {
        Message::Binary(frame) => assert_eq!(&frame[..], b"\x01ok"),
        other => panic!("expected echo, got {other:?}"),
    }
}

#[tokio::test]
async fn idle_second_tunnel_is_reaped_but_first_survives() {
    let echo = start_echo().await;
    let route = echo.to_string();
    let config = ServerConfig {
        udp_tunnel_timeout: Duration::from_secs(1),
        ..ServerConfig::default()
    };
    let server = start_server(&route, config).await;
    let mut ws = connect_multi(server, &route).await;
    next_frame(&mut ws, Duration::from_secs(5)).await; // SOCKET ID: 1

    ws.send(Message::Text("NEW".into())).await.expect("send");
    next_frame(&mut ws, Duration::from_secs(5)).await; // SOCKET ID: 2

    // Tunnel 2 goes silent; the reaper closes it and says so.
    match next_frame(&mut ws, Duration::from_secs(5)).await {
        Message::Text(text) => assert_eq!(text.as_str(), "CLOSE ID: 2"),
        other => panic!("expected close, got {other:?}"),
    }

    // Tunnel 1 was just as silent but is never reaped.
    ws.send(Message::Binary(b"\x01first".to_vec().into()))
        .await
        .expect("send");
    match next_frame(&mut ws, Duration::from_secs(5)).await {
        Message::Binary(frame) => assert_eq!(&frame[..], b"\x01first"),
        other => panic!("expected echo, got {other:?}"),
    }
}

#[tokio::test]
async fn legacy_json_handshake_and_raw_echo() {
    let echo = start_echo().await;
    let route = echo.to_string();
    let server = start_server(&route, ServerConfig::default()).await;
    let mut ws = connect_legacy(server, &route).await;

    let (host, port) = route.split_once(':').expect("route");
    ws.send(Message::Text(
        format!(r#"{{"address":"{host}","port":{port}}}"#).into(),
    ))
    .await
    .expect("send");

    match next_frame(&mut ws, Duration::from_secs(5)).await {
        Message::Text(text) => {
            assert_eq!(text.as_str(), r#"{"success":true,"message":"connected"}"#);
        }
        other => panic!("expected connected reply, got {other:?}"),
    }

    ws.send(Message::Binary(b"raw-payload".to_vec().into()))
        .await
        .expect("send");
    match next_frame(&mut ws, Duration::from_secs(5)).await {
        Message::Binary(frame) => assert_eq!(&frame[..], b"raw-payload"),
        other => panic!("expected raw echo, got {other:?}"),
    }
}

#[tokio::test]
async fn legacy_frames_before_handshake_are_flushed_after_connect() {
    let echo = start_echo().await;
    let route = echo.to_string();
    let server = start_server(&route, ServerConfig::default()).await;
    let mut ws = connect_legacy(server, &route).await;

    // Binary before the JSON handshake: queued, then flushed on connect.
    ws.send(Message::Binary(b"early-bird".to_vec().into()))
        .await
        .expect("send");

    let (host, port) = route.split_once(':').expect("route");
    ws.send(Message::Text(
        format!(r#"{{"address":"{host}","port":{port}}}"#).into(),
    ))
    .await
    .expect("send");

    let mut saw_connected = false;
    let mut saw_echo = false;
    for _ in 0..2 {
        match next_frame(&mut ws, Duration::from_secs(5)).await {
            Message::Text(text) => {
                assert!(text.as_str().contains("connected"));
                saw_connected = true;
            }
            Message::Binary(frame) => {
                assert_eq!(&frame[..], b"early-bird");
                saw_echo = true;
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
    assert!(saw_connected && saw_echo);
}

#[tokio::test]
async fn legacy_disallowed_route_is_refused() {
    let echo = start_echo().await;
    let route = echo.to_string();
    let server = start_server(&route, ServerConfig::default()).await;
    let mut ws = connect_legacy(server, &route).await;

    ws.send(Message::Text(
        r#"{"address":"127.0.0.1","port":1}"#.into(),
    ))
    .await
    .expect("send");

    match next_frame(&mut ws, Duration::from_secs(5)).await {
        Message::Text(text) => {
            assert_eq!(
                text.as_str(),
                r#"{"success":false,"message":"Route is not allowed"}"#
            );
        }
        other => panic!("expected refusal, got {other:?}"),
    }
}
