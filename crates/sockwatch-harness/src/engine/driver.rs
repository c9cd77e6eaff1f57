//! Load generator: concurrent GETs whose responses are held open while the
//! socket census is sampled.

use crate::engine::census::CensusProbe;
use crate::engine::pool::ClientTransport;
use crate::engine::traffic::TrafficShape;
use crate::error::{HarnessError, Result};
use hyper::{StatusCode, Uri};
use sockwatch_common::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub target: Uri,
    pub interval: Duration,
    pub read_pause: Duration,
    pub chunk_size: usize,
    pub close_idle_on_stream_end: bool,
    /// `None` leaves the fan-out unbounded.
    pub max_in_flight: Option<usize>,
}

impl DriverSettings {
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let target = config
            .target_url
            .parse::<Uri>()
            .map_err(|e| HarnessError::RequestBuild(format!("{}: {}", config.target_url, e)))?;

        Ok(Self {
            target,
            interval: config.interval(),
            read_pause: config.read_pause(),
            chunk_size: config.chunk_size.max(1),
            close_idle_on_stream_end: config.close_idle_on_stream_end,
            max_in_flight: config.max_in_flight,
        })
    }
}

/// How a single request task ended.
#[derive(Debug)]
pub enum IssueEnd {
    /// The body was read to its end.
    Drained,
    ReadFailed(HarnessError),
    SendFailed(HarnessError),
}

#[derive(Debug)]
pub struct IssueReport {
    pub label: String,
    pub status: Option<StatusCode>,
    pub bytes_read: usize,
    pub end: IssueEnd,
}

struct DriverInner {
    settings: DriverSettings,
    transport: ClientTransport,
    probe: CensusProbe,
    admission: Option<Arc<Semaphore>>,
}

#[derive(Clone)]
pub struct RequestDriver {
    inner: Arc<DriverInner>,
}

impl RequestDriver {
    pub fn new(settings: DriverSettings, transport: ClientTransport, probe: CensusProbe) -> Self {
        let admission = settings
            .max_in_flight
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));

        Self {
            inner: Arc::new(DriverInner {
                settings,
                transport,
                probe,
                admission,
            }),
        }
    }

    /// Logs one census sample from the client's point of view.
    pub async fn log_census(&self) {
        let Some(sample) = self.inner.probe.observe().await else {
            return;
        };
        if sample.total == 0 {
            info!(port = self.inner.probe.port(), "No open TCP connections on port");
        } else {
            info!(
                port = self.inner.probe.port(),
                total = sample.total,
                established = sample.established,
                "TCP connection census"
            );
        }
    }

    /// Sends one GET and drains the response, sampling the census after every
    /// chunk. Never retries.
    pub async fn issue(&self, label: &str) -> IssueReport {
        let settings = &self.inner.settings;
        let mut report = IssueReport {
            label: label.to_string(),
            status: None,
            bytes_read: 0,
            end: IssueEnd::Drained,
        };

        let _permit = match &self.inner.admission {
            Some(semaphore) => Arc::clone(semaphore).acquire_owned().await.ok(),
            None => None,
        };

        info!(label = label, url = %settings.target, "Sending request");

        let response = match self.inner.transport.send(&settings.target).await {
            Ok(response) => response,
            Err(e) => {
                warn!(label = label, error = %e, "Request failed");
                report.end = IssueEnd::SendFailed(e);
                return report;
            }
        };

        report.status = Some(response.status());
        info!(
            label = label,
            status = response.status().as_u16(),
            "Connection established, monitoring TCP connections"
        );

        let mut body = response.into_body();
        let mut chunk = vec![0u8; settings.chunk_size];
        loop {
            match body.read(&mut chunk).await {
                Ok(0) => {
                    info!(label = label, bytes = report.bytes_read, "Server closed the stream");
                    break;
                }
                Ok(n) => {
                    report.bytes_read += n;
                    self.log_census().await;
                    tokio::time::sleep(settings.read_pause).await;
                }
                Err(e) => {
                    info!(label = label, error = %e, "Server closed connection or read error");
                    report.end = IssueEnd::ReadFailed(e);
                    break;
                }
            }
        }
        drop(body);

        if settings.close_idle_on_stream_end {
            self.inner.transport.close_idle_connections();
        }
        report
    }

    pub fn spawn_issue(&self, label: &str) -> JoinHandle<IssueReport> {
        let driver = self.clone();
        let label = label.to_string();
        tokio::spawn(async move { driver.issue(&label).await })
    }

    /// One round of traffic: a census sample, a "Main" request and, when the
    /// shape asks for it, a delayed "Extra" request.
    pub async fn run_round(&self, shape: &mut dyn TrafficShape) -> Vec<JoinHandle<IssueReport>> {
        self.log_census().await;

        let mut launched = vec![self.spawn_issue("Main")];
        if let Some(delay) = shape.next_extra() {
            tokio::time::sleep(delay).await;
            info!(delay_secs = delay.as_secs(), "Sending an additional request");
            launched.push(self.spawn_issue("Extra"));
        }
        launched
    }

    /// Runs rounds until the process is stopped. Request tasks are detached.
    pub async fn run_forever(&self, mut shape: Box<dyn TrafficShape>) {
        info!(mode = self.inner.transport.mode(), target = %self.inner.settings.target, "Request driver started");
        loop {
            self.run_round(shape.as_mut()).await;
            tokio::time::sleep(self.inner.settings.interval).await;
        }
    }
}
