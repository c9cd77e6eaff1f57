//! Client transport with an explicit idle-connection cache.
//!
//! Connections are dialed with `hyper::client::conn`, so every socket the
//! process holds is owned by this module:
//! - a connection carrying a request belongs to the [`ResponseBody`] reading it
//! - once the body is drained, a keep-alive connection is checked back into
//!   the idle cache, bounded per host and in total
//! - idle connections expire after the policy's idle timeout and are swept by
//!   a janitor task
//!
//! A [`ClientTransport::Leaky`] transport builds a fresh pool for every
//! request and walks away from it. The abandoned pool's janitor keeps its idle
//! sockets open until they expire or the server hangs up, which is exactly the
//! socket buildup the harness is meant to show.

use crate::error::{HarnessError, Result};
use bytes::{Buf, Bytes};
use hyper::body::HttpBody;
use hyper::client::conn::{self, SendRequest};
use hyper::header::{CONNECTION, HOST};
use hyper::{Body, Method, Request, Response, Uri, Version};
use sockwatch_common::TransportConfig;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::{poll_fn, Future};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

const JANITOR_INTERVAL: Duration = Duration::from_secs(1);

/// `None` when `timeout` reaches past what `Instant` can represent, which
/// leaves the request unbounded.
fn deadline_after(timeout: Duration) -> Option<Instant> {
    Instant::now().checked_add(timeout)
}

/// Runs `fut` to completion unless `deadline` passes first.
async fn before<F: Future>(deadline: Option<Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(at) => timeout_at(at, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Connection-reuse rules of one pool. Fixed for the pool's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportPolicy {
    pub keep_alive: bool,
    /// 0 means unbounded.
    pub max_idle_total: usize,
    pub max_idle_per_host: usize,
    /// `None` keeps idle connections forever.
    pub idle_timeout: Option<Duration>,
    pub request_timeout: Duration,
}

impl From<&TransportConfig> for TransportPolicy {
    fn from(c: &TransportConfig) -> Self {
        Self {
            keep_alive: c.keep_alive,
            max_idle_total: c.max_idle_total,
            max_idle_per_host: c.max_idle_per_host,
            idle_timeout: (c.idle_timeout_secs > 0).then(|| Duration::from_secs(c.idle_timeout_secs)),
            request_timeout: Duration::from_secs(c.request_timeout_secs),
        }
    }
}

impl TransportPolicy {
    /// Per-host idle bound actually applied; never above the total bound.
    fn effective_idle_per_host(&self) -> usize {
        if self.max_idle_total > 0 && self.max_idle_per_host > self.max_idle_total {
            warn!(
                max_idle_per_host = self.max_idle_per_host,
                max_idle_total = self.max_idle_total,
                "Per-host idle limit exceeds total idle limit; clamping"
            );
            self.max_idle_total
        } else {
            self.max_idle_per_host
        }
    }
}

/// Remote host a connection is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn from_uri(uri: &Uri) -> Result<Self> {
        match uri.scheme_str() {
            Some("http") => {}
            Some(other) => {
                return Err(HarnessError::RequestBuild(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
            None => return Err(HarnessError::RequestBuild("missing scheme".to_string())),
        }

        let host = uri
            .host()
            .ok_or_else(|| HarnessError::RequestBuild("missing host".to_string()))?;

        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port: uri.port_u16().unwrap_or(80),
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

fn build_request(target: &Uri, keep_alive: bool) -> Result<Request<Body>> {
    let authority = target
        .authority()
        .ok_or_else(|| HarnessError::RequestBuild("missing authority".to_string()))?;
    let path = target.path_and_query().map(|p| p.as_str()).unwrap_or("/");

    let mut builder = Request::builder()
        .method(Method::GET)
        .uri(path)
        .header(HOST, authority.as_str());
    if !keep_alive {
        builder = builder.header(CONNECTION, "close");
    }
    Ok(builder.body(Body::empty())?)
}

/// Whether the peer left the connection open for another exchange.
fn allows_reuse(version: Version, headers: &hyper::HeaderMap) -> bool {
    let mut close = false;
    let mut keep_alive = false;
    for token in headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
    {
        let token = token.trim();
        if token.eq_ignore_ascii_case("close") {
            close = true;
        } else if token.eq_ignore_ascii_case("keep-alive") {
            keep_alive = true;
        }
    }

    match version {
        Version::HTTP_11 => !close,
        Version::HTTP_10 => keep_alive && !close,
        _ => false,
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    opened: AtomicU64,
    reused: AtomicU64,
    live: AtomicUsize,
}

/// Held by a connection's driver task for as long as its socket is open.
struct LiveConnection {
    counters: Arc<PoolCounters>,
    closed: Arc<AtomicBool>,
}

impl LiveConnection {
    fn new(counters: Arc<PoolCounters>, closed: Arc<AtomicBool>) -> Self {
        counters.live.fetch_add(1, Ordering::SeqCst);
        Self { counters, closed }
    }
}

impl Drop for LiveConnection {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
    }
}

struct PooledConn {
    id: u64,
    sender: SendRequest<Body>,
    closed: Arc<AtomicBool>,
}

impl PooledConn {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct IdleConn {
    conn: PooledConn,
    idle_since: Instant,
}

impl IdleConn {
    fn expired(&self, idle_timeout: Option<Duration>, now: Instant) -> bool {
        match idle_timeout {
            Some(limit) => now.duration_since(self.idle_since) >= limit,
            None => false,
        }
    }
}

#[derive(Default)]
struct IdleCache {
    hosts: HashMap<Endpoint, VecDeque<IdleConn>>,
    total: usize,
}

impl IdleCache {
    /// Most recently idled usable connection for `endpoint`.
    fn take(&mut self, endpoint: &Endpoint, idle_timeout: Option<Duration>) -> Option<PooledConn> {
        let now = Instant::now();
        let queue = self.hosts.get_mut(endpoint)?;
        let mut found = None;
        while let Some(idle) = queue.pop_back() {
            self.total -= 1;
            if idle.expired(idle_timeout, now) || idle.conn.is_closed() {
                debug!(conn = idle.conn.id, "Dropping stale idle connection");
                continue;
            }
            found = Some(idle.conn);
            break;
        }
        if queue.is_empty() {
            self.hosts.remove(endpoint);
        }
        found
    }

    fn host_len(&self, endpoint: &Endpoint) -> usize {
        self.hosts.get(endpoint).map(VecDeque::len).unwrap_or(0)
    }

    fn push(&mut self, endpoint: Endpoint, conn: PooledConn) {
        self.hosts.entry(endpoint).or_default().push_back(IdleConn {
            conn,
            idle_since: Instant::now(),
        });
        self.total += 1;
    }

    /// Removes the connection that has been idle the longest, across hosts.
    fn evict_oldest(&mut self) -> Option<PooledConn> {
        let endpoint = self
            .hosts
            .iter()
            .filter_map(|(ep, q)| q.front().map(|idle| (ep, idle.idle_since)))
            .min_by_key(|(_, since)| *since)
            .map(|(ep, _)| ep.clone())?;

        let queue = self.hosts.get_mut(&endpoint)?;
        let evicted = queue.pop_front();
        if queue.is_empty() {
            self.hosts.remove(&endpoint);
        }
        if evicted.is_some() {
            self.total -= 1;
        }
        evicted.map(|idle| idle.conn)
    }

    /// Drops expired and peer-closed entries, returning how many went away.
    fn retain_fresh(&mut self, idle_timeout: Option<Duration>) -> usize {
        let now = Instant::now();
        let before = self.total;
        for queue in self.hosts.values_mut() {
            queue.retain(|idle| !idle.expired(idle_timeout, now) && !idle.conn.is_closed());
        }
        self.hosts.retain(|_, q| !q.is_empty());
        self.total = self.hosts.values().map(VecDeque::len).sum();
        before - self.total
    }

    fn clear(&mut self) -> usize {
        let dropped = self.total;
        self.hosts.clear();
        self.total = 0;
        dropped
    }
}

struct PoolInner {
    policy: TransportPolicy,
    max_idle_per_host: usize,
    idle: Mutex<IdleCache>,
    counters: Arc<PoolCounters>,
    next_id: AtomicU64,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, IdleCache> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn checkin(&self, endpoint: Endpoint, conn: PooledConn) {
        if conn.is_closed() {
            return;
        }

        let mut idle = self.idle();
        if idle.host_len(&endpoint) >= self.max_idle_per_host {
            debug!(conn = conn.id, endpoint = %endpoint, "Idle slots for host full, closing connection");
            return;
        }
        if self.policy.max_idle_total > 0 && idle.total >= self.policy.max_idle_total {
            if let Some(evicted) = idle.evict_oldest() {
                debug!(conn = evicted.id, "Evicted oldest idle connection");
            }
        }
        debug!(conn = conn.id, endpoint = %endpoint, "Connection returned to idle cache");
        idle.push(endpoint, conn);
    }
}

/// Snapshot of a pool's connection accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections dialed since the pool was created.
    pub opened: u64,
    /// Requests served on a previously idle connection.
    pub reused: u64,
    /// Sockets currently open, busy or idle.
    pub live: usize,
    pub idle: usize,
}

/// Shared HTTP/1.1 client pool. Cloning shares the same cache.
///
/// Must be created inside a Tokio runtime: construction spawns the idle
/// janitor.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(policy: TransportPolicy) -> Self {
        let inner = Arc::new(PoolInner {
            max_idle_per_host: policy.effective_idle_per_host(),
            policy,
            idle: Mutex::new(IdleCache::default()),
            counters: Arc::new(PoolCounters::default()),
            next_id: AtomicU64::new(1),
        });

        tokio::spawn(run_idle_janitor(Arc::clone(&inner)));

        Self { inner }
    }

    pub fn stats(&self) -> PoolStats {
        let counters = &self.inner.counters;
        PoolStats {
            opened: counters.opened.load(Ordering::SeqCst),
            reused: counters.reused.load(Ordering::SeqCst),
            live: counters.live.load(Ordering::SeqCst),
            idle: self.inner.idle().total,
        }
    }

    /// Closes every idle connection. Busy connections are untouched.
    pub fn close_idle_connections(&self) -> usize {
        self.inner.idle().clear()
    }

    /// Issues `GET target`, bounded by the policy's request timeout.
    ///
    /// The deadline also covers reading the returned body. A failure drops
    /// every idle connection so nothing is kept towards a broken peer.
    pub async fn send(&self, target: &Uri) -> Result<Response<ResponseBody>> {
        let endpoint = Endpoint::from_uri(target)?;
        let request = build_request(target, self.inner.policy.keep_alive)?;
        let deadline = deadline_after(self.inner.policy.request_timeout);
        if deadline.is_none() {
            debug!(timeout = ?self.inner.policy.request_timeout, "Request timeout out of range, not enforced");
        }

        let result = match before(deadline, self.dispatch(&endpoint, target, request)).await {
            Some(result) => result,
            None => Err(HarnessError::ConnectionFailed(format!(
                "timed out after {:?}",
                self.inner.policy.request_timeout
            ))),
        };

        let (response, conn) = match result {
            Ok(exchange) => exchange,
            Err(e) => {
                let dropped = self.close_idle_connections();
                debug!(endpoint = %endpoint, dropped = dropped, "Discarded idle connections after failure");
                return Err(e);
            }
        };

        let (parts, body) = response.into_parts();
        let checkin = (self.inner.policy.keep_alive && allows_reuse(parts.version, &parts.headers))
            .then(|| Checkin {
                pool: Arc::clone(&self.inner),
                endpoint,
                conn,
            });

        Ok(Response::from_parts(
            parts,
            ResponseBody {
                body,
                buffered: Bytes::new(),
                deadline,
                checkin,
            },
        ))
    }

    async fn dispatch(
        &self,
        endpoint: &Endpoint,
        target: &Uri,
        request: Request<Body>,
    ) -> Result<(Response<Body>, PooledConn)> {
        let request = match self.checkout(endpoint).await {
            Some(mut conn) => match conn.sender.send_request(request).await {
                Ok(response) => {
                    self.inner.counters.reused.fetch_add(1, Ordering::SeqCst);
                    debug!(conn = conn.id, endpoint = %endpoint, "Reused idle connection");
                    return Ok((response, conn));
                }
                Err(e) => {
                    debug!(conn = conn.id, error = %e, "Reused connection failed, dialing a fresh one");
                    build_request(target, self.inner.policy.keep_alive)?
                }
            },
            None => request,
        };

        let mut conn = self.connect(endpoint).await?;
        let response = conn
            .sender
            .send_request(request)
            .await
            .map_err(|e| HarnessError::ConnectionFailed(e.to_string()))?;
        Ok((response, conn))
    }

    async fn checkout(&self, endpoint: &Endpoint) -> Option<PooledConn> {
        if !self.inner.policy.keep_alive {
            return None;
        }
        loop {
            let mut conn = self.inner.idle().take(endpoint, self.inner.policy.idle_timeout)?;
            if poll_fn(|cx| conn.sender.poll_ready(cx)).await.is_ok() {
                return Some(conn);
            }
            debug!(conn = conn.id, "Idle connection closed by peer");
        }
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<PooledConn> {
        let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|e| HarnessError::ConnectionFailed(format!("connect {}: {}", endpoint, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(endpoint = %endpoint, error = %e, "Failed to set TCP_NODELAY");
        }

        let (sender, connection) = conn::handshake(stream)
            .await
            .map_err(|e| HarnessError::ConnectionFailed(format!("handshake {}: {}", endpoint, e)))?;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.counters.opened.fetch_add(1, Ordering::SeqCst);

        let closed = Arc::new(AtomicBool::new(false));
        let live = LiveConnection::new(Arc::clone(&self.inner.counters), Arc::clone(&closed));
        tokio::spawn(async move {
            let _live = live;
            if let Err(e) = connection.await {
                debug!(conn = id, error = %e, "Connection ended with error");
            }
        });

        debug!(conn = id, endpoint = %endpoint, "Opened new connection");
        Ok(PooledConn { id, sender, closed })
    }
}

/// Sweeps expired idle connections. Exits once the pool has been dropped by
/// every user and holds nothing idle.
async fn run_idle_janitor(inner: Arc<PoolInner>) {
    let mut interval = tokio::time::interval(JANITOR_INTERVAL);

    loop {
        interval.tick().await;

        let (removed, remaining) = {
            let mut idle = inner.idle();
            let removed = idle.retain_fresh(inner.policy.idle_timeout);
            (removed, idle.total)
        };
        if removed > 0 {
            debug!(removed = removed, remaining = remaining, "Janitor closed idle connections");
        }

        if remaining == 0 && Arc::strong_count(&inner) == 1 {
            break;
        }
    }
}

struct Checkin {
    pool: Arc<PoolInner>,
    endpoint: Endpoint,
    conn: PooledConn,
}

/// Body of a response obtained through a [`ConnectionPool`].
///
/// The connection goes back to the idle cache when the body has been read to
/// its end; dropping the body early closes it instead.
pub struct ResponseBody {
    body: Body,
    buffered: Bytes,
    deadline: Option<Instant>,
    checkin: Option<Checkin>,
}

impl ResponseBody {
    /// Reads up to `buf.len()` bytes. `Ok(0)` marks the end of the body.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        while self.buffered.is_empty() {
            match before(self.deadline, self.body.data()).await {
                None => {
                    return Err(HarnessError::StreamRead(
                        "request timeout exceeded while reading body".to_string(),
                    ))
                }
                Some(None) => {
                    self.finish();
                    return Ok(0);
                }
                Some(Some(Err(e))) => return Err(HarnessError::StreamRead(e.to_string())),
                Some(Some(Ok(chunk))) => self.buffered = chunk,
            }
        }

        let n = buf.len().min(self.buffered.len());
        buf[..n].copy_from_slice(&self.buffered[..n]);
        self.buffered.advance(n);
        Ok(n)
    }

    /// Reads the remaining body into memory.
    pub async fn to_bytes(mut self) -> Result<Bytes> {
        let mut collected = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return Ok(Bytes::from(collected));
            }
            collected.extend_from_slice(&chunk[..n]);
        }
    }

    fn finish(&mut self) {
        if let Some(checkin) = self.checkin.take() {
            checkin.pool.checkin(checkin.endpoint, checkin.conn);
        }
    }
}

/// How request tasks obtain their connections.
#[derive(Clone)]
pub enum ClientTransport {
    /// A new pool, and therefore a new socket, for every request.
    Leaky(TransportPolicy),
    /// One pool shared by every request.
    Shared(ConnectionPool),
}

impl ClientTransport {
    pub fn mode(&self) -> &'static str {
        match self {
            ClientTransport::Leaky(_) => "leaky",
            ClientTransport::Shared(_) => "pooled",
        }
    }

    pub async fn send(&self, target: &Uri) -> Result<Response<ResponseBody>> {
        match self {
            ClientTransport::Leaky(policy) => ConnectionPool::new(policy.clone()).send(target).await,
            ClientTransport::Shared(pool) => pool.send(target).await,
        }
    }

    /// Closes the shared pool's idle connections; a leaky transport has no
    /// pool to close.
    pub fn close_idle_connections(&self) -> usize {
        match self {
            ClientTransport::Leaky(_) => 0,
            ClientTransport::Shared(pool) => pool.close_idle_connections(),
        }
    }
}
