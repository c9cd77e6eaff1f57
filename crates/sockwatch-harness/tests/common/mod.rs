#![allow(dead_code)]

use sockwatch_harness::engine::census::{CensusSample, SocketCensus};
use sockwatch_harness::{HarnessError, ServerHandle, ServerSettings, SlowServer, TransportPolicy};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

pub struct TestServer {
    pub addr: SocketAddr,
    pub handle: ServerHandle,
    pub shutdown: CancellationToken,
}

impl TestServer {
    pub fn url(&self) -> hyper::Uri {
        format!("http://{}/", self.addr).parse().unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub fn server_settings(delay: Duration, release_on_abort: bool) -> ServerSettings {
    ServerSettings {
        listen_address: "127.0.0.1:0".to_string(),
        delay,
        keep_alive_timeout_secs: 120,
        keep_alive_max: 100,
        census_interval: Duration::from_secs(5),
        release_on_abort,
    }
}

pub async fn start_server(delay: Duration) -> TestServer {
    start_server_with(server_settings(delay, true)).await
}

pub async fn start_server_with(settings: ServerSettings) -> TestServer {
    let server = SlowServer::bind(settings).await.unwrap();
    let addr = server.local_addr();
    let handle = server.handle();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.run(shutdown.clone()));
    TestServer {
        addr,
        handle,
        shutdown,
    }
}

pub fn pooled_policy() -> TransportPolicy {
    TransportPolicy {
        keep_alive: true,
        max_idle_total: 5,
        max_idle_per_host: 2,
        idle_timeout: Some(Duration::from_secs(30)),
        request_timeout: Duration::from_secs(5),
    }
}

pub fn leaky_policy() -> TransportPolicy {
    TransportPolicy {
        keep_alive: true,
        max_idle_total: 0,
        max_idle_per_host: 2,
        idle_timeout: None,
        request_timeout: Duration::from_secs(5),
    }
}

/// An address nothing listens on.
pub async fn dead_address() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Polls `condition` every 20ms until it holds or `limit` elapses.
pub async fn wait_until<F: FnMut() -> bool>(limit: Duration, mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Opens a raw connection and writes one GET.
pub async fn raw_get(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    stream
}

/// Reads until `marker` shows up, the peer closes, or 5s pass.
pub async fn read_until(stream: &mut TcpStream, marker: &str) -> String {
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let n = match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
            Ok(Ok(n)) => n,
            _ => break,
        };
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
        if String::from_utf8_lossy(&received).contains(marker) {
            break;
        }
    }
    String::from_utf8_lossy(&received).into_owned()
}

/// Census double returning the same sample and counting calls.
pub struct FixedCensus {
    pub sample: CensusSample,
    pub calls: AtomicUsize,
}

impl FixedCensus {
    pub fn new(total: usize, established: usize) -> Self {
        Self {
            sample: CensusSample { total, established },
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SocketCensus for FixedCensus {
    fn sample(&self, _port: u16) -> Result<CensusSample, HarnessError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.sample)
    }
}

/// Census double standing in for a missing introspection tool.
pub struct FailingCensus;

impl SocketCensus for FailingCensus {
    fn sample(&self, _port: u16) -> Result<CensusSample, HarnessError> {
        Err(HarnessError::CensusUnavailable("netstat: not found".to_string()))
    }
}
