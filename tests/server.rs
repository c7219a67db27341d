use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use beam::handler::Router;
use beam::{Config, Exit, HandlerError, Reply, Server};
use serial_test::serial;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};

const TIMEOUT: Duration = Duration::from_secs(2);

fn config() -> Config {
    Config::new("127.0.0.1:0")
        .with_rw_timeout(Duration::from_millis(50))
        .with_idle_timeout(Duration::from_secs(10))
}

fn router() -> Router {
    Router::new()
        .route_fn("PING", |_| Ok(Reply::simple("PONG")))
        .route_fn("ECHO", |req| Ok(Reply::optional_bulk(req.get(1))))
        .route_fn("QUIT", |_| Err(HandlerError::Halt))
        .route_fn("FAIL", |_| Err(HandlerError::failed("boom")))
        .route_fn("PANIC", |_| panic!("handler panicked"))
        .route_fn("INCR", |req| {
            let counter = req.get_attr::<i64>("counter").copied().unwrap_or(0) + 1;
            req.set_attr("counter", counter);
            Ok(Reply::integer(counter))
        })
}

async fn serve(server: &Server) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = server.clone();
    tokio::spawn(async move { server.serve_listener(listener).await.unwrap() });

    addr
}

async fn start(config: Config) -> (Server, SocketAddr) {
    let server = Server::with_handler(config, router());
    let addr = serve(&server).await;
    (server, addr)
}

async fn send(stream: &mut TcpStream, data: &[u8]) {
    stream.write_all(data).await.unwrap();
}

async fn expect_reply(stream: &mut TcpStream, expected: &[u8]) {
    let mut buf = vec![0; expected.len()];
    timeout(TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for a reply")
        .unwrap();

    assert_eq!(
        String::from_utf8_lossy(&buf),
        String::from_utf8_lossy(expected)
    );
}

/// Reads until the server closes the connection and returns what was left to read.
async fn read_until_closed(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    match timeout(TIMEOUT, stream.read_to_end(&mut buf))
        .await
        .expect("connection was not closed")
    {
        Ok(_) => {}
        // Closing with unread client data resets the connection.
        Err(err) if err.kind() == io::ErrorKind::ConnectionReset => {}
        Err(err) => panic!("unexpected error: {}", err),
    }
    buf
}

async fn eventually(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn pipelined_commands_are_answered_in_order() {
    let (_server, addr) = start(config()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    send(
        &mut stream,
        b"*1\r\n$4\r\nPING\r\nECHO hi\r\n*2\r\n$4\r\nECHO\r\n$0\r\n\r\n\r\nINCR\n",
    )
    .await;

    expect_reply(&mut stream, b"+PONG\r\n$2\r\nhi\r\n$0\r\n\r\n:1\r\n").await;
}

#[tokio::test]
#[serial]
async fn split_frames_survive_read_timeouts() {
    let (_server, addr) = start(config()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    send(&mut stream, b"*2\r\n$4\r\nECHO\r\n$5\r\nhel").await;
    // Several read deadlines pass while the frame is incomplete.
    sleep(Duration::from_millis(200)).await;
    send(&mut stream, b"lo\r\n").await;

    expect_reply(&mut stream, b"$5\r\nhello\r\n").await;
}

#[tokio::test]
async fn protocol_error_closes_without_reply() {
    let (_server, addr) = start(config()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    send(&mut stream, b"*2\r\nhello").await;

    assert!(read_until_closed(&mut stream).await.is_empty());
}

#[tokio::test]
async fn halt_replies_then_closes() {
    let (_server, addr) = start(config()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    send(&mut stream, b"PING\r\nQUIT\r\nPING\r\n").await;

    assert_eq!(
        read_until_closed(&mut stream).await,
        b"+PONG\r\n-ERR connection is closed by the server\r\n"
    );
}

#[tokio::test]
async fn missing_handler_replies_then_closes() {
    let server = Server::new(config());
    let addr = serve(&server).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    send(&mut stream, b"PING\r\nPING\r\n").await;

    assert_eq!(
        read_until_closed(&mut stream).await,
        b"-ERR a handler must be provided\r\n"
    );
}

#[tokio::test]
async fn handler_errors_keep_the_connection_open() {
    let (_server, addr) = start(config()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    send(&mut stream, b"FAIL\r\nNOSUCHCOMMAND\r\nPING\r\n").await;
    expect_reply(
        &mut stream,
        b"-ERR internal server error\r\n-ERR internal server error\r\n+PONG\r\n",
    )
    .await;

    send(&mut stream, b"PING\r\n").await;
    expect_reply(&mut stream, b"+PONG\r\n").await;
}

#[tokio::test]
async fn attributes_are_scoped_to_the_connection() {
    let (_server, addr) = start(config()).await;
    let mut first = TcpStream::connect(addr).await.unwrap();
    let mut second = TcpStream::connect(addr).await.unwrap();

    send(&mut first, b"INCR\r\nINCR\r\n").await;
    expect_reply(&mut first, b":1\r\n:2\r\n").await;

    send(&mut second, b"INCR\r\n").await;
    expect_reply(&mut second, b":1\r\n").await;

    send(&mut first, b"INCR\r\n").await;
    expect_reply(&mut first, b":3\r\n").await;
}

#[tokio::test]
async fn oversized_command_closes_the_connection() {
    let (server, addr) = start(config().with_buffer_size(32)).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    send(&mut stream, b"*1\r\n$100\r\n").await;
    send(&mut stream, &[b'x'; 40]).await;

    assert!(read_until_closed(&mut stream).await.is_empty());
    eventually(|| server.session_count() == 0).await;
}

#[tokio::test]
async fn command_filling_the_whole_buffer_is_accepted() {
    let (_server, addr) = start(config().with_buffer_size(32)).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // 32 bytes exactly.
    send(&mut stream, b"*2\r\n$4\r\nECHO\r\n$11\r\n0123456789a\r\n").await;

    expect_reply(&mut stream, b"$11\r\n0123456789a\r\n").await;
}

#[tokio::test]
async fn panicking_handler_only_drops_its_connection() {
    let (server, addr) = start(config()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    send(&mut stream, b"PANIC\r\n").await;
    assert!(read_until_closed(&mut stream).await.is_empty());
    eventually(|| server.session_count() == 0).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    send(&mut stream, b"PING\r\n").await;
    expect_reply(&mut stream, b"+PONG\r\n").await;
}

#[tokio::test]
#[serial]
async fn idle_connections_are_closed() {
    let config = config().with_idle_timeout(Duration::from_millis(300));
    let (server, addr) = start(config).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // Read deadlines expire every 50ms without closing the connection.
    sleep(Duration::from_millis(150)).await;
    send(&mut stream, b"PING\r\n").await;
    expect_reply(&mut stream, b"+PONG\r\n").await;

    // The idle deadline restarts with every command.
    sleep(Duration::from_millis(150)).await;
    send(&mut stream, b"PING\r\n").await;
    expect_reply(&mut stream, b"+PONG\r\n").await;

    let started = Instant::now();
    assert!(read_until_closed(&mut stream).await.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(200));
    eventually(|| server.session_count() == 0).await;
}

#[tokio::test]
async fn registry_tracks_sessions() {
    let (server, addr) = start(config()).await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let client_addr = stream.local_addr().unwrap();

    send(&mut stream, b"*1\r\n$4\r\nPING\r\n").await;
    expect_reply(&mut stream, b"+PONG\r\n").await;

    let sessions = server.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].remote_addr, client_addr);

    eventually(|| {
        server
            .session(client_addr)
            .map(|info| info.stats.bytes_out == 7)
            .unwrap_or(false)
    })
    .await;
    let info = server.session(client_addr).unwrap();
    assert_eq!(info.stats.bytes_in, 14);
    assert_eq!(info.stats.commands, 1);
    assert_eq!(info.id, sessions[0].id);

    drop(stream);
    eventually(|| server.session(client_addr).is_none()).await;
    assert!(server.sessions().is_empty());
}

#[tokio::test]
#[serial]
async fn disconnect_stops_a_single_session() {
    let (server, addr) = start(config()).await;
    let mut kept = TcpStream::connect(addr).await.unwrap();
    let mut dropped = TcpStream::connect(addr).await.unwrap();

    for stream in [&mut kept, &mut dropped] {
        send(stream, b"PING\r\n").await;
        expect_reply(stream, b"+PONG\r\n").await;
    }

    let dropped_addr = dropped.local_addr().unwrap();
    assert!(server.disconnect(dropped_addr));
    assert!(read_until_closed(&mut dropped).await.is_empty());

    eventually(|| server.session_count() == 1).await;
    assert!(!server.disconnect(dropped_addr));

    send(&mut kept, b"PING\r\n").await;
    expect_reply(&mut kept, b"+PONG\r\n").await;
}

#[tokio::test]
#[serial]
async fn shutdown_drains_every_session() {
    let server = Server::with_handler(config(), router());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve_listener(listener).await })
    };

    let mut streams = Vec::new();
    for _ in 0..3 {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send(&mut stream, b"PING\r\n").await;
        expect_reply(&mut stream, b"+PONG\r\n").await;
        streams.push(stream);
    }
    assert_eq!(server.session_count(), 3);

    timeout(TIMEOUT, server.shutdown())
        .await
        .expect("sessions were not drained");
    assert_eq!(server.session_count(), 0);
    assert!(server.sessions().is_empty());

    for stream in &mut streams {
        assert!(read_until_closed(stream).await.is_empty());
    }

    timeout(TIMEOUT, serving)
        .await
        .expect("accept loop did not stop")
        .unwrap()
        .unwrap();
    assert!(TcpStream::connect(addr).await.is_err());

    // Closing again is a no-op.
    server.close();
    server.shutdown().await;
}

#[test]
fn exit_reasons_are_exported_from_the_root() {
    assert_eq!(Exit::Halted.to_string(), "halted");
    assert_eq!(Exit::Stopped.to_string(), "stopped");
}
