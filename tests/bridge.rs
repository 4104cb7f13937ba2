#![allow(
    clippy::unwrap_used,
    reason = "Do not need additional syntax for setting up tests"
)]

use std::time::Duration;

use futures_util::StreamExt as _;
use session_bridge::bridge::Bridge;
use session_bridge::config::Config;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

const TEST_DEADLINE: Duration = Duration::from_secs(10);

async fn bind_server() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://{}", listener.local_addr().unwrap());
    (listener, endpoint)
}

async fn accept_ws(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (tcp, _) = timeout(TEST_DEADLINE, listener.accept()).await.unwrap().unwrap();
    timeout(TEST_DEADLINE, tokio_tungstenite::accept_async(tcp))
        .await
        .unwrap()
        .unwrap()
}

/// Next text frame from the client, skipping liveness probes (the
/// transport answers those automatically).
async fn expect_text(ws: &mut WebSocketStream<TcpStream>, expected: &str) {
    loop {
        let message = timeout(TEST_DEADLINE, ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match message {
            Message::Text(text) => {
                assert_eq!(text.as_str(), expected);
                return;
            }
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame while waiting for {expected:?}: {other:?}"),
        }
    }
}

struct TestStdio {
    stdin_writer: DuplexStream,
    stdout_lines: tokio::io::Lines<BufReader<DuplexStream>>,
}

fn spawn_bridge(config: Config) -> (TestStdio, tokio::task::JoinHandle<session_bridge::Result<u8>>) {
    let (stdin_writer, stdin_reader) = tokio::io::duplex(64 * 1024);
    let (stdout_writer, stdout_reader) = tokio::io::duplex(64 * 1024);
    let (bridge, _handle) = Bridge::new(config, BufReader::new(stdin_reader), stdout_writer);
    let run = tokio::spawn(bridge.run());
    (
        TestStdio {
            stdin_writer,
            stdout_lines: BufReader::new(stdout_reader).lines(),
        },
        run,
    )
}

#[tokio::test]
async fn relays_both_directions_and_exits_zero_on_eof() {
    let (listener, endpoint) = bind_server().await;
    let (mut stdio, run) = spawn_bridge(Config::new(endpoint));

    let mut ws = accept_ws(&listener).await;

    stdio.stdin_writer.write_all(b"hello\n").await.unwrap();
    expect_text(&mut ws, "hello").await;

    futures_util::SinkExt::send(&mut ws, Message::Text("ping-check".into()))
        .await
        .unwrap();
    let line = timeout(TEST_DEADLINE, stdio.stdout_lines.next_line())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(line.as_deref(), Some("ping-check"));

    // Closing stdin is an orderly shutdown even with the socket open.
    drop(stdio.stdin_writer);
    let code = timeout(TEST_DEADLINE, run).await.unwrap().unwrap().unwrap();
    assert_eq!(code, 0);
}

#[tokio::test]
async fn lines_written_before_open_flush_in_order() {
    let (listener, endpoint) = bind_server().await;
    let (mut stdio, run) = spawn_bridge(Config::new(endpoint));

    // The handshake cannot complete until the server accepts, so these
    // lines land in the queue.
    stdio.stdin_writer.write_all(b"first\nsecond\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut ws = accept_ws(&listener).await;
    expect_text(&mut ws, "first").await;
    expect_text(&mut ws, "second").await;

    stdio.stdin_writer.write_all(b"third\n").await.unwrap();
    expect_text(&mut ws, "third").await;

    drop(stdio.stdin_writer);
    let code = timeout(TEST_DEADLINE, run).await.unwrap().unwrap().unwrap();
    assert_eq!(code, 0);
}

#[tokio::test]
async fn unreachable_endpoint_exits_fatal_after_connect_timeout() {
    // Reserved discard port; nothing is listening.
    let mut config = Config::new("ws://127.0.0.1:9");
    config.connect_timeout = Duration::from_millis(300);
    config.preopen_retry_delay = Duration::from_millis(50);

    let (_stdio, run) = spawn_bridge(config);
    let code = timeout(TEST_DEADLINE, run).await.unwrap().unwrap().unwrap();
    assert_eq!(code, 1, "connect deadline exceeded before first open");
}

#[tokio::test]
async fn eof_before_any_open_exits_zero() {
    let mut config = Config::new("ws://127.0.0.1:9");
    config.connect_timeout = Duration::from_secs(30);
    config.preopen_retry_delay = Duration::from_millis(50);

    let (stdio, run) = spawn_bridge(config);
    drop(stdio.stdin_writer);

    let code = timeout(TEST_DEADLINE, run).await.unwrap().unwrap().unwrap();
    assert_eq!(code, 0, "EOF is orderly even while still connecting");
}

#[tokio::test]
async fn terminate_request_exits_zero() {
    let mut config = Config::new("ws://127.0.0.1:9");
    config.connect_timeout = Duration::from_secs(30);
    config.preopen_retry_delay = Duration::from_millis(50);

    let (stdin_writer, stdin_reader) = tokio::io::duplex(1024);
    let (stdout_writer, _stdout_reader) = tokio::io::duplex(1024);
    let (bridge, handle) = Bridge::new(config, BufReader::new(stdin_reader), stdout_writer);
    let run = tokio::spawn(bridge.run());

    handle.terminate();

    let code = timeout(TEST_DEADLINE, run).await.unwrap().unwrap().unwrap();
    assert_eq!(code, 0);
    drop(stdin_writer);
}

#[tokio::test]
async fn reconnects_and_resumes_relay_after_drop() {
    let (listener, endpoint) = bind_server().await;
    let (mut stdio, run) = spawn_bridge(Config::new(endpoint));

    let mut ws = accept_ws(&listener).await;
    stdio.stdin_writer.write_all(b"before\n").await.unwrap();
    expect_text(&mut ws, "before").await;

    // Drop the server side; the bridge reconnects on its backoff schedule.
    drop(ws);
    // Give the read loop a moment to surface the close so the next line is
    // queued rather than racing the dying socket.
    tokio::time::sleep(Duration::from_millis(200)).await;
    stdio.stdin_writer.write_all(b"during\n").await.unwrap();

    let mut ws = accept_ws(&listener).await;
    expect_text(&mut ws, "during").await;

    drop(stdio.stdin_writer);
    let code = timeout(TEST_DEADLINE, run).await.unwrap().unwrap().unwrap();
    assert_eq!(code, 0);
}
