use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use etude::{
    Application, BoxError, BoxedStream, ConnectionFilter, ConnectionInfo, Engine, EngineError, Exchange,
    ServiceContext,
};

struct TestApp {
    started: Arc<AtomicUsize>,
}

#[etude::async_trait(?Send)]
impl Application for TestApp {
    async fn call(&self, exchange: &mut Exchange<'_>) -> Result<(), BoxError> {
        let path = exchange.path().to_string();
        let body: Vec<u8> = match path.as_str() {
            "/hello" => b"Hello, World!".to_vec(),
            "/echo" => exchange.read_to_end().await?,
            "/slow" => {
                self.started.fetch_add(1, Ordering::SeqCst);
                let ms = exchange
                    .query()
                    .and_then(|q| q.strip_prefix("ms="))
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(100);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                b"done".to_vec()
            }
            _ => {
                exchange.set_status(404)?;
                Vec::new()
            }
        };
        exchange
            .response_headers_mut()?
            .insert("Content-Length", body.len().to_string());
        exchange.write(&body).await?;
        Ok(())
    }
}

struct Harness {
    engine: Engine,
    addr: SocketAddr,
    started: Arc<AtomicUsize>,
    _server: etude::ServerHandle,
}

fn start(threads: i32) -> Harness {
    let started = Arc::new(AtomicUsize::new(0));
    let ctx = ServiceContext::builder(TestApp {
        started: started.clone(),
    })
    .build()
    .unwrap();
    let mut engine = Engine::new(ctx);
    engine.start(threads).unwrap();
    let server = engine.create_server("http://127.0.0.1:0").unwrap();
    Harness {
        addr: server.local_addr(),
        engine,
        started,
        _server: server,
    }
}

fn connect(addr: SocketAddr) -> BufReader<TcpStream> {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    BufReader::new(stream)
}

/// Read one Content-Length framed response: (head, body).
fn read_response(reader: &mut BufReader<TcpStream>) -> (String, String) {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).unwrap();
        assert!(n > 0, "connection closed mid-head: {head:?}");
        head.push_str(&line);
        if line == "\r\n" {
            break;
        }
    }
    let len = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length: "))
        .map(|v| v.trim().parse::<usize>().unwrap())
        .unwrap_or(0);
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).unwrap();
    (head, String::from_utf8(body).unwrap())
}

fn assert_closed(reader: &mut BufReader<TcpStream>) {
    let mut rest = Vec::new();
    let n = reader.read_to_end(&mut rest).unwrap_or(0);
    assert_eq!(n, 0, "unexpected trailing bytes: {:?}", String::from_utf8_lossy(&rest));
}

#[test]
fn test_keep_alive_round_trip() {
    let h = start(2);
    let mut conn = connect(h.addr);

    for _ in 0..2 {
        conn.get_mut()
            .write_all(b"GET /hello HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        let (head, body) = read_response(&mut conn);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
        assert!(head.contains("\r\nDate: "));
        assert!(head.contains("\r\nServer: etude\r\n"));
        assert!(!head.contains("Connection: close"));
        assert_eq!(body, "Hello, World!");
    }

    conn.get_mut()
        .write_all(b"GET /hello HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut conn);
    assert!(head.contains("Connection: close\r\n"), "{head}");
    assert_eq!(body, "Hello, World!");
    assert_closed(&mut conn);

    assert!(h.engine.metrics().snapshot().req_count >= 3);
}

#[test]
fn test_pipelined_requests_answer_in_order() {
    let h = start(1);
    let mut conn = connect(h.addr);
    conn.get_mut()
        .write_all(
            b"POST /echo HTTP/1.1\r\nContent-Length: 3\r\n\r\none\
              POST /echo HTTP/1.1\r\nContent-Length: 3\r\n\r\ntwo\
              GET /missing HTTP/1.1\r\n\r\n",
        )
        .unwrap();
    assert_eq!(read_response(&mut conn).1, "one");
    assert_eq!(read_response(&mut conn).1, "two");
    let (head, _) = read_response(&mut conn);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"), "{head}");
}

#[test]
fn test_chunked_body_round_trip() {
    let h = start(1);
    let mut conn = connect(h.addr);
    conn.get_mut()
        .write_all(
            b"POST /echo HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\r\n\
              4\r\ntest\r\n0\r\n\r\n",
        )
        .unwrap();
    let (head, body) = read_response(&mut conn);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert_eq!(body, "test");
}

#[test]
fn test_malformed_start_line_keeps_worker_alive() {
    let h = start(1);

    let mut bad = connect(h.addr);
    bad.get_mut().write_all(b"NOTHTTP\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut bad);
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{head}");
    assert_closed(&mut bad);

    let mut good = connect(h.addr);
    good.get_mut()
        .write_all(b"GET /hello HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut good);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert_eq!(body, "Hello, World!");
    assert_eq!(h.engine.metrics().snapshot().bad_requests, 1);
}

fn wait_for_start(started: &AtomicUsize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while started.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "application never started");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_graceful_stop_lets_in_flight_request_finish() {
    let mut h = start(1);
    let addr = h.addr;
    let client = thread::spawn(move || {
        let mut conn = connect(addr);
        conn.get_mut()
            .write_all(b"GET /slow?ms=300 HTTP/1.1\r\n\r\n")
            .unwrap();
        let response = read_response(&mut conn);
        assert_closed(&mut conn);
        response
    });

    wait_for_start(&h.started);
    h.engine.stop(Duration::from_secs(5)).unwrap();

    let (head, body) = client.join().unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
    assert!(head.contains("Connection: close\r\n"), "{head}");
    assert_eq!(body, "done");
    assert!(TcpStream::connect(addr).is_err());
}

#[test]
fn test_stop_closes_connections_after_timeout() {
    let mut h = start(1);
    let addr = h.addr;
    let client = thread::spawn(move || {
        let mut conn = connect(addr);
        conn.get_mut()
            .write_all(b"GET /slow?ms=30000 HTTP/1.1\r\n\r\n")
            .unwrap();
        let mut out = Vec::new();
        let _ = conn.read_to_end(&mut out);
        out
    });

    wait_for_start(&h.started);
    let begun = Instant::now();
    h.engine.stop(Duration::from_millis(200)).unwrap();
    let elapsed = begun.elapsed();
    assert!(elapsed >= Duration::from_millis(200), "stopped too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(10), "stop hung: {elapsed:?}");

    assert!(client.join().unwrap().is_empty());
}

#[test]
fn test_lifecycle_errors() {
    let ctx = ServiceContext::builder(TestApp {
        started: Arc::new(AtomicUsize::new(0)),
    })
    .build()
    .unwrap();
    let mut engine = Engine::new(ctx);

    assert!(matches!(
        engine.create_server("http://127.0.0.1:0"),
        Err(EngineError::Usage(_))
    ));
    assert!(matches!(engine.start(-1), Err(EngineError::Config(_))));
    engine.start(1).unwrap();
    assert!(matches!(engine.start(1), Err(EngineError::Usage(_))));
    assert!(matches!(
        engine.create_server("not a url"),
        Err(EngineError::Address { .. })
    ));
}

#[cfg(unix)]
#[test]
fn test_bind_failure_leaves_nothing_bound() {
    let h = start(2);
    let taken = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    let url = format!("http://127.0.0.1:{port}");

    match h.engine.create_server(&url) {
        Err(EngineError::Bind { address, .. }) => assert_eq!(address, url),
        other => panic!("expected a bind error, got {other:?}"),
    }

    drop(taken);
    let server = h.engine.create_server(&url).unwrap();
    assert_eq!(server.local_addr().port(), port);
}

struct CountingFilter(Arc<AtomicUsize>);

#[etude::async_trait(?Send)]
impl ConnectionFilter for CountingFilter {
    async fn apply(&self, stream: BoxedStream, info: &ConnectionInfo) -> std::io::Result<BoxedStream> {
        assert!(info.peer.ip().is_loopback());
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(stream)
    }
}

#[test]
fn test_filters_see_every_connection() {
    let seen = Arc::new(AtomicUsize::new(0));
    let ctx = ServiceContext::builder(TestApp {
        started: Arc::new(AtomicUsize::new(0)),
    })
    .filter(CountingFilter(seen.clone()))
    .build()
    .unwrap();
    let mut engine = Engine::new(ctx);
    engine.start(2).unwrap();
    let server = engine.create_server("http://localhost:0").unwrap();

    for _ in 0..3 {
        let mut conn = connect(server.local_addr());
        conn.get_mut()
            .write_all(b"GET /hello HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();
        assert_eq!(read_response(&mut conn).1, "Hello, World!");
    }
    assert_eq!(seen.load(Ordering::SeqCst), 3);
}

struct DisposeOnRequest {
    server: Arc<Mutex<Option<etude::ServerHandle>>>,
}

#[etude::async_trait(?Send)]
impl Application for DisposeOnRequest {
    async fn call(&self, exchange: &mut Exchange<'_>) -> Result<(), BoxError> {
        let server = self.server.lock().unwrap().take();
        drop(server);
        exchange.response_headers_mut()?.insert("Content-Length", "8");
        exchange.write(b"disposed").await?;
        Ok(())
    }
}

#[test]
fn test_server_dropped_inside_application() {
    let slot = Arc::new(Mutex::new(None));
    let ctx = ServiceContext::builder(DisposeOnRequest { server: slot.clone() })
        .build()
        .unwrap();
    let mut engine = Engine::new(ctx);
    engine.start(1).unwrap();
    let server = engine.create_server("http://127.0.0.1:0").unwrap();
    let addr = server.local_addr();
    *slot.lock().unwrap() = Some(server);

    let mut conn = connect(addr);
    conn.get_mut()
        .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    assert_eq!(read_response(&mut conn).1, "disposed");

    let deadline = Instant::now() + Duration::from_secs(5);
    while TcpStream::connect(addr).is_ok() {
        assert!(Instant::now() < deadline, "listener never closed");
        thread::sleep(Duration::from_millis(10));
    }
    engine.stop(Duration::from_secs(1)).unwrap();
}

#[test]
fn test_upgrade_request_body_is_not_served_as_a_request() {
    let h = start(1);
    let mut conn = connect(h.addr);
    conn.get_mut()
        .write_all(
            b"POST /hello HTTP/1.1\r\nConnection: keep-alive, upgrade\r\nContent-Length: 23\r\n\r\n\
              GET /hello HTTP/1.1\r\n\r\n",
        )
        .unwrap();
    let (head, _) = read_response(&mut conn);
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{head}");
    assert_closed(&mut conn);
    assert_eq!(h.engine.metrics().snapshot().bad_requests, 1);
}
