//! Socket census: best-effort counts of TCP connections on a port.
//!
//! The census is an observability probe only. Every backend may fail (tool
//! missing, procfs absent on this platform); callers go through
//! [`CensusProbe::observe`], which logs the failure and skips the sample.

use crate::error::{HarnessError, Result};
use crate::parser::{netstat, procfs};
use sockwatch_common::CensusBackend;
use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Point-in-time connection counts for one port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CensusSample {
    /// Every non-listening socket with the port on either end.
    pub total: usize,
    pub established: usize,
}

/// A source of socket counts. Implementations are blocking.
pub trait SocketCensus: Send + Sync {
    fn sample(&self, port: u16) -> Result<CensusSample>;
}

/// Reads the kernel socket tables directly. Linux only.
pub struct ProcNetCensus {
    tables: Vec<PathBuf>,
}

impl ProcNetCensus {
    pub fn new() -> Self {
        Self::with_tables(vec![
            PathBuf::from("/proc/net/tcp"),
            PathBuf::from("/proc/net/tcp6"),
        ])
    }

    pub fn with_tables(tables: Vec<PathBuf>) -> Self {
        Self { tables }
    }
}

impl Default for ProcNetCensus {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketCensus for ProcNetCensus {
    fn sample(&self, port: u16) -> Result<CensusSample> {
        let mut sample = CensusSample::default();
        let mut readable = 0;

        for table in &self.tables {
            match std::fs::read_to_string(table) {
                Ok(content) => {
                    readable += 1;
                    let part = procfs::parse_tcp_table(&content, port);
                    sample.total += part.total;
                    sample.established += part.established;
                }
                // tcp6 is absent on kernels without IPv6
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(table = %table.display(), "Socket table not present");
                }
                Err(e) => {
                    return Err(HarnessError::CensusUnavailable(format!(
                        "{}: {}",
                        table.display(),
                        e
                    )));
                }
            }
        }

        if readable == 0 {
            return Err(HarnessError::CensusUnavailable(
                "no socket table could be read".to_string(),
            ));
        }
        Ok(sample)
    }
}

/// Shells out to `netstat -tn`.
pub struct NetstatCensus;

impl SocketCensus for NetstatCensus {
    fn sample(&self, port: u16) -> Result<CensusSample> {
        let output = Command::new("netstat")
            .arg("-tn")
            .output()
            .map_err(|e| HarnessError::CensusUnavailable(format!("netstat: {}", e)))?;

        if !output.status.success() {
            return Err(HarnessError::CensusUnavailable(format!(
                "netstat exited with {}",
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(netstat::parse_netstat(&stdout, port))
    }
}

pub fn census_for(backend: CensusBackend) -> Arc<dyn SocketCensus> {
    match backend {
        CensusBackend::Procfs => Arc::new(ProcNetCensus::new()),
        CensusBackend::Netstat => Arc::new(NetstatCensus),
    }
}

/// Port the census watches for a role listening on or targeting `role_port`.
///
/// An explicit `configured` port wins, with a warning when it points away from
/// the role's own traffic.
pub fn census_port(configured: Option<u16>, role_port: u16) -> u16 {
    match configured {
        Some(port) if port != role_port => {
            warn!(
                census_port = port,
                role_port = role_port,
                "Census port differs from the port this role uses"
            );
            port
        }
        Some(port) => port,
        None => role_port,
    }
}

/// Serializes census reads within a process and absorbs their failures.
#[derive(Clone)]
pub struct CensusProbe {
    census: Arc<dyn SocketCensus>,
    port: u16,
    lock: Arc<Mutex<()>>,
}

impl CensusProbe {
    pub fn new(census: Arc<dyn SocketCensus>, port: u16) -> Self {
        Self {
            census,
            port,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Takes one sample, or `None` when the census failed.
    pub async fn observe(&self) -> Option<CensusSample> {
        let _guard = self.lock.lock().await;

        let census = Arc::clone(&self.census);
        let port = self.port;
        let result = match tokio::task::spawn_blocking(move || census.sample(port)).await {
            Ok(result) => result,
            Err(e) => Err(HarnessError::CensusUnavailable(e.to_string())),
        };

        match result {
            Ok(sample) => Some(sample),
            Err(e) => {
                warn!(port = port, error = %e, "Socket census skipped");
                None
            }
        }
    }
}
