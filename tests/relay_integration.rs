//! End-to-end tests for the relay router.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use camera_relay::capture::CommandSpec;
use camera_relay::config::RelayConfig;
use camera_relay::server::RelayServer;
use camera_relay::session::SessionManager;

fn relay(stream: &str, still: &str) -> (Router, Arc<SessionManager>) {
    let mut config = RelayConfig::default();
    config.capture.continuous = CommandSpec::shell(stream);
    config.capture.snapshot = CommandSpec::shell(still);
    config.capture.terminate_grace_ms = 500;

    let server = RelayServer::new(&config);
    let session = server.state().session.clone();
    (server.build_router(), session)
}

/// Serve the relay on an ephemeral port; cancel the token to stop it.
async fn listen(stream: &str, still: &str) -> (std::net::SocketAddr, CancellationToken) {
    let mut config = RelayConfig::default();
    config.capture.continuous = CommandSpec::shell(stream);
    config.capture.snapshot = CommandSpec::shell(still);
    config.capture.terminate_grace_ms = 500;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let server = RelayServer::new(&config).with_cancel(cancel.clone());
    tokio::spawn(server.serve(listener));
    (addr, cancel)
}

async fn send_get(addr: std::net::SocketAddr, path: &str) -> TcpStream {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
    socket.write_all(request.as_bytes()).await.unwrap();
    socket
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// Read from a streaming body until `len` bytes have arrived.
async fn read_exact(body: &mut axum::body::BodyDataStream, len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    while out.len() < len {
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("timed out waiting for stream data")
            .expect("stream ended early")
            .unwrap();
        out.extend_from_slice(&chunk);
    }
    out
}

async fn wait_until_stopped(session: &SessionManager) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.stats().await.running {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("capture process was not stopped");
}

#[tokio::test]
async fn test_stream_relays_raw_process_output() {
    let (app, session) = relay("printf 'H264-NAL-UNITS'; exec sleep 30", "exit 1");

    let response = app.oneshot(get("/stream")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/h264");
    assert_eq!(response.headers()[header::CONNECTION], "close");

    let stats = session.stats().await;
    assert!(stats.running);
    assert_eq!(stats.subscribers, 1);
    assert_eq!(stats.spawns, 1);

    let mut body = response.into_body().into_data_stream();
    assert_eq!(read_exact(&mut body, 14).await, b"H264-NAL-UNITS");

    drop(body);
    wait_until_stopped(&session).await;
    let stats = session.stats().await;
    assert_eq!(stats.subscribers, 0);
    assert_eq!(stats.terminations, 1);
}

#[tokio::test]
async fn test_two_subscribers_share_one_process() {
    let (app, session) = relay(
        "while :; do printf 'frame'; sleep 0.02; done",
        "exit 1",
    );

    let first = app.clone().oneshot(get("/stream")).await.unwrap();
    let second = app.oneshot(get("/stream")).await.unwrap();
    assert_eq!(session.stats().await.spawns, 1);
    assert_eq!(session.stats().await.subscribers, 2);

    let mut first = first.into_body().into_data_stream();
    let mut second = second.into_body().into_data_stream();
    read_exact(&mut first, 5).await;
    read_exact(&mut second, 5).await;

    // First client leaves; the second keeps streaming from the same process.
    drop(first);
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.stats().await.subscribers != 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let stats = session.stats().await;
    assert!(stats.running);
    assert_eq!(stats.terminations, 0);
    let more = read_exact(&mut second, 20).await;
    assert!(more.len() >= 20);

    drop(second);
    wait_until_stopped(&session).await;
    let stats = session.stats().await;
    assert_eq!(stats.spawns, 1);
    assert_eq!(stats.terminations, 1);
}

#[tokio::test]
async fn test_stream_spawn_failure_is_503() {
    let mut config = RelayConfig::default();
    config.capture.continuous = CommandSpec::new("/nonexistent/raspivid", vec![]);
    let server = RelayServer::new(&config);
    let session = server.state().session.clone();

    let response = server.build_router().oneshot(get("/stream")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(session.stats().await.subscribers, 0);
    assert!(!session.stats().await.running);
}

#[tokio::test]
async fn test_still_returns_image() {
    let (app, _session) = relay("exec sleep 30", "printf 'JFIF'; sleep 0.05; printf 'PIXELS'");

    let response = app.oneshot(get("/still")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"JFIFPIXELS");
}

#[tokio::test]
async fn test_still_diagnostic_is_error_with_verbatim_body() {
    let (app, _session) = relay(
        "exec sleep 30",
        "printf 'mmal: mmal_vc_component_create: failed to create component' >&2; exit 64",
    );

    let response = app.oneshot(get("/still")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(
        &body[..],
        b"mmal: mmal_vc_component_create: failed to create component"
    );
}

#[tokio::test]
async fn test_still_silent_exit_is_500() {
    let (app, _session) = relay("exec sleep 30", "exit 0");

    let response = app.oneshot(get("/still")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_unknown_path_is_404_without_spawning() {
    let marker_dir = tempfile::tempdir().unwrap();
    let marker = marker_dir.path().join("spawned");
    let script = format!("touch '{}'; exec sleep 30", marker.display());
    let (app, session) = relay(&script, &script);

    let response = app.oneshot(get("/index.html")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()[header::CONNECTION], "close");

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(body.is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!marker.exists());
    assert_eq!(session.stats().await.spawns, 0);
}

#[tokio::test]
async fn test_still_over_tcp_returns_whole_image() {
    let (addr, cancel) = listen("exec sleep 30", "printf 'JPEG'; sleep 0.1; printf 'MORE'").await;

    let mut socket = send_get(addr, "/still").await;
    let mut raw = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), socket.read_to_end(&mut raw))
        .await
        .unwrap()
        .unwrap();
    let raw = String::from_utf8_lossy(&raw);

    assert!(raw.starts_with("HTTP/1.1 200"), "{raw}");
    assert!(raw.to_ascii_lowercase().contains("content-type: image/jpeg"));
    assert!(raw.contains("JPEG"));
    assert!(raw.contains("MORE"));
    cancel.cancel();
}

#[tokio::test]
async fn test_still_abandoned_when_client_disconnects_before_data() {
    let marker_dir = tempfile::tempdir().unwrap();
    let marker = marker_dir.path().join("finished");
    let still = format!(
        "sleep 0.7; printf 'JPEG'; sleep 1.5; touch '{}'",
        marker.display()
    );
    let (addr, cancel) = listen("exec sleep 30", &still).await;

    let socket = send_get(addr, "/still").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(socket);

    // Past the point where an uninterrupted capture would have finished.
    tokio::time::sleep(Duration::from_millis(3000)).await;
    assert!(!marker.exists(), "capture ran to completion after disconnect");
    cancel.cancel();
}
