//! Slow HTTP backend.
//!
//! Every request is held for a fixed delay before it is answered, so
//! concurrent connections pile up on both ends. Each accepted connection gets
//! a cancellation token that fires when the connection ends; a request whose
//! client went away during the delay is dropped without a response.

use crate::engine::census::CensusProbe;
use crate::engine::counter::ActiveRequests;
use crate::error::{HarnessError, Result};
use hyper::header::{HeaderValue, CONNECTION, CONTENT_TYPE};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::{Body, Request, Response, StatusCode};
use sockwatch_common::ServerConfig;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const RESPONSE_BODY: &str = "Delayed response from server.";

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen_address: String,
    pub delay: Duration,
    pub keep_alive_timeout_secs: u64,
    pub keep_alive_max: u32,
    pub census_interval: Duration,
    pub release_on_abort: bool,
}

impl From<&ServerConfig> for ServerSettings {
    fn from(c: &ServerConfig) -> Self {
        Self {
            listen_address: c.listen_address.clone(),
            delay: c.delay(),
            keep_alive_timeout_secs: c.keep_alive_timeout_secs,
            keep_alive_max: c.keep_alive_max,
            census_interval: c.census_interval(),
            release_on_abort: c.release_on_abort,
        }
    }
}

impl ServerSettings {
    fn keep_alive_header(&self) -> String {
        format!(
            "timeout={}, max={}",
            self.keep_alive_timeout_secs, self.keep_alive_max
        )
    }
}

#[derive(Debug, Default)]
struct ServerCounters {
    accepted: AtomicU64,
    open: AtomicUsize,
    responded: AtomicU64,
    aborted: AtomicU64,
}

/// Snapshot of what the server has seen so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStats {
    pub accepted: u64,
    /// Connections currently open.
    pub open: usize,
    /// Requests answered after the delay.
    pub responded: u64,
    /// Requests dropped because the client left during the delay.
    pub aborted: u64,
    /// Requests currently counted in by [`ActiveRequests`].
    pub active: usize,
}

struct ServerState {
    settings: ServerSettings,
    active: Arc<ActiveRequests>,
    counters: ServerCounters,
}

/// Read-only view of a running server.
#[derive(Clone)]
pub struct ServerHandle {
    state: Arc<ServerState>,
}

impl ServerHandle {
    pub fn stats(&self) -> ServerStats {
        let counters = &self.state.counters;
        ServerStats {
            accepted: counters.accepted.load(Ordering::SeqCst),
            open: counters.open.load(Ordering::SeqCst),
            responded: counters.responded.load(Ordering::SeqCst),
            aborted: counters.aborted.load(Ordering::SeqCst),
            active: self.state.active.snapshot(),
        }
    }
}

struct OpenConnection {
    state: Arc<ServerState>,
}

impl OpenConnection {
    fn new(state: Arc<ServerState>) -> Self {
        state.counters.accepted.fetch_add(1, Ordering::SeqCst);
        state.counters.open.fetch_add(1, Ordering::SeqCst);
        Self { state }
    }
}

impl Drop for OpenConnection {
    fn drop(&mut self) {
        self.state.counters.open.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SlowServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<ServerState>,
    probe: Option<CensusProbe>,
}

impl SlowServer {
    pub async fn bind(settings: ServerSettings) -> Result<Self> {
        let bind_error = |source| HarnessError::Bind {
            addr: settings.listen_address.clone(),
            source,
        };
        let listener = TcpListener::bind(&settings.listen_address)
            .await
            .map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        Ok(Self {
            listener,
            local_addr,
            state: Arc::new(ServerState {
                settings,
                active: Arc::new(ActiveRequests::new()),
                counters: ServerCounters::default(),
            }),
            probe: None,
        })
    }

    /// Samples the census periodically while the server runs.
    pub fn with_census(mut self, probe: CensusProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Accepts connections until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(addr = %self.local_addr, "HTTP server started");

        if let Some(probe) = self.probe {
            let interval = self.state.settings.census_interval;
            let token = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = track_server_sockets(probe, interval) => {},
                    _ = token.cancelled() => {
                        debug!("Census tracker shutting down");
                    }
                }
            });
        }

        loop {
            tokio::select! {
                res = self.listener.accept() => match res {
                    Ok((socket, peer)) => {
                        let state = Arc::clone(&self.state);
                        let token = shutdown.child_token();
                        tokio::spawn(serve_connection(state, socket, peer, token));
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                    }
                },
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }
    }
}

async fn track_server_sockets(probe: CensusProbe, interval: Duration) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
    loop {
        ticker.tick().await;
        if let Some(sample) = probe.observe().await {
            info!(established = sample.established, "Active TCP connections");
        }
    }
}

async fn serve_connection(
    state: Arc<ServerState>,
    socket: TcpStream,
    peer: SocketAddr,
    closed: CancellationToken,
) {
    let _open = OpenConnection::new(Arc::clone(&state));
    let _cancel_on_close = closed.clone().drop_guard();
    debug!(peer = %peer, "Accepted connection");

    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        let closed = closed.clone();
        async move { handle_request(state, closed, req).await }
    });

    if let Err(e) = Http::new()
        .http1_only(true)
        .http1_keep_alive(true)
        .serve_connection(socket, service)
        .await
    {
        info!(peer = %peer, error = %e, "Connection ended with error");
    } else {
        debug!(peer = %peer, "Connection closed");
    }
}

async fn handle_request(
    state: Arc<ServerState>,
    closed: CancellationToken,
    _req: Request<Body>,
) -> std::result::Result<Response<Body>, Infallible> {
    // The delay runs in its own task so it completes, and settles the
    // counter, even after hyper drops this future on disconnect.
    let work = tokio::spawn(slow_response(state, closed));

    let response = match work.await {
        Ok(Some(response)) => response,
        Ok(None) => {
            let mut unavailable = Response::new(Body::empty());
            *unavailable.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
            unavailable
                .headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("close"));
            unavailable
        }
        Err(e) => {
            error!(error = %e, "Request task failed");
            let mut failed = Response::new(Body::empty());
            *failed.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            failed
        }
    };
    Ok(response)
}

/// The per-request state machine. `None` means the client is gone and
/// nothing may be written.
async fn slow_response(state: Arc<ServerState>, closed: CancellationToken) -> Option<Response<Body>> {
    let slot = state.active.enter();
    info!(active = slot.value_on_entry(), "New HTTP request received");

    tokio::time::sleep(state.settings.delay).await;

    if closed.is_cancelled() {
        state.counters.aborted.fetch_add(1, Ordering::SeqCst);
        if state.settings.release_on_abort {
            slot.release();
        } else {
            slot.leak();
        }
        info!(
            active = state.active.snapshot(),
            "Client closed connection before response, aborting write"
        );
        return None;
    }

    let mut response = Response::new(Body::from(RESPONSE_BODY));
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    match HeaderValue::try_from(state.settings.keep_alive_header()) {
        Ok(value) => {
            headers.insert("keep-alive", value);
        }
        Err(e) => warn!(error = %e, "Invalid Keep-Alive header value"),
    }
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));

    let remaining = slot.release();
    state.counters.responded.fetch_add(1, Ordering::SeqCst);
    info!(active = remaining, "Sending delayed response to client");

    Some(response)
}
