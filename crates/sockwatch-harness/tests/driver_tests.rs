mod common;

use common::{dead_address, leaky_policy, pooled_policy, start_server, FailingCensus, FixedCensus};
use hyper::StatusCode;
use sockwatch_harness::engine::traffic::{FixedShape, RandomShape, TrafficShape};
use sockwatch_harness::{
    CensusProbe, ClientTransport, ConnectionPool, DriverSettings, HarnessError, IssueEnd,
    RequestDriver, RESPONSE_BODY,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn settings(target: hyper::Uri) -> DriverSettings {
    DriverSettings {
        target,
        interval: Duration::from_millis(50),
        read_pause: Duration::from_millis(10),
        chunk_size: 8,
        close_idle_on_stream_end: false,
        max_in_flight: None,
    }
}

fn shared() -> (ConnectionPool, ClientTransport) {
    let pool = ConnectionPool::new(pooled_policy());
    let transport = ClientTransport::Shared(pool.clone());
    (pool, transport)
}

#[tokio::test]
async fn test_issue_drains_body_sampling_census_per_chunk() {
    let server = start_server(Duration::from_millis(100)).await;
    let census = Arc::new(FixedCensus::new(3, 2));
    let (_, transport) = shared();
    let driver = RequestDriver::new(
        settings(server.url()),
        transport,
        CensusProbe::new(census.clone(), server.addr.port()),
    );

    let report = driver.issue("Main").await;

    assert_eq!(report.label, "Main");
    assert_eq!(report.status, Some(StatusCode::OK));
    assert_eq!(report.bytes_read, RESPONSE_BODY.len());
    assert!(matches!(report.end, IssueEnd::Drained));
    // 29 bytes in chunks of 8
    assert_eq!(census.calls(), 4);
}

#[tokio::test]
async fn test_issue_survives_census_failure() {
    let server = start_server(Duration::from_millis(50)).await;
    let (_, transport) = shared();
    let driver = RequestDriver::new(
        settings(server.url()),
        transport,
        CensusProbe::new(Arc::new(FailingCensus), server.addr.port()),
    );

    let report = driver.issue("Main").await;
    assert_eq!(report.bytes_read, RESPONSE_BODY.len());
    assert!(matches!(report.end, IssueEnd::Drained));
}

#[tokio::test]
async fn test_send_failure_ends_issue_without_retry() {
    let target: hyper::Uri = format!("http://{}/", dead_address().await).parse().unwrap();
    let (pool, transport) = shared();
    let driver = RequestDriver::new(
        settings(target),
        transport,
        CensusProbe::new(Arc::new(FixedCensus::new(0, 0)), 8080),
    );

    let report = driver.issue("Extra").await;
    assert!(report.status.is_none());
    assert!(matches!(
        report.end,
        IssueEnd::SendFailed(HarnessError::ConnectionFailed(_))
    ));
    assert_eq!(pool.stats().opened, 0);
}

#[tokio::test]
async fn test_stream_end_closes_idle_connections_when_configured() {
    let server = start_server(Duration::from_millis(50)).await;
    let census = Arc::new(FixedCensus::new(1, 1));

    let (keeping_pool, transport) = shared();
    let driver = RequestDriver::new(
        settings(server.url()),
        transport,
        CensusProbe::new(census.clone(), server.addr.port()),
    );
    driver.issue("Main").await;
    assert_eq!(keeping_pool.stats().idle, 1);

    let (closing_pool, transport) = shared();
    let driver = RequestDriver::new(
        DriverSettings {
            close_idle_on_stream_end: true,
            ..settings(server.url())
        },
        transport,
        CensusProbe::new(census, server.addr.port()),
    );
    driver.issue("Main").await;
    assert_eq!(closing_pool.stats().idle, 0);
}

#[tokio::test]
async fn test_run_round_launches_main_and_extra() {
    let server = start_server(Duration::from_millis(50)).await;
    let census = Arc::new(FixedCensus::new(2, 2));
    let driver = RequestDriver::new(
        settings(server.url()),
        ClientTransport::Leaky(leaky_policy()),
        CensusProbe::new(census.clone(), server.addr.port()),
    );
    let mut shape = FixedShape::always(Duration::from_millis(10));

    let handles = driver.run_round(&mut shape).await;
    assert_eq!(handles.len(), 2);

    let mut labels = Vec::new();
    for handle in handles {
        let report = handle.await.unwrap();
        assert_eq!(report.status, Some(StatusCode::OK));
        labels.push(report.label);
    }
    labels.sort();
    assert_eq!(labels, vec!["Extra".to_string(), "Main".to_string()]);
    assert_eq!(server.handle.stats().accepted, 2);
}

#[tokio::test]
async fn test_run_round_without_extra_sends_one_request() {
    let server = start_server(Duration::from_millis(20)).await;
    let census = Arc::new(FixedCensus::new(0, 0));
    let (_, transport) = shared();
    let driver = RequestDriver::new(
        settings(server.url()),
        transport,
        CensusProbe::new(census.clone(), server.addr.port()),
    );

    let handles = driver.run_round(&mut FixedShape::never()).await;
    assert_eq!(handles.len(), 1);
    for handle in handles {
        handle.await.unwrap();
    }
    // one round sample plus one per chunk
    assert_eq!(census.calls(), 1 + 4);
}

#[tokio::test]
async fn test_admission_limit_serializes_requests() {
    let server = start_server(Duration::from_millis(300)).await;
    let (_, transport) = shared();
    let driver = RequestDriver::new(
        DriverSettings {
            max_in_flight: Some(1),
            ..settings(server.url())
        },
        transport,
        CensusProbe::new(Arc::new(FixedCensus::new(0, 0)), server.addr.port()),
    );

    let started = Instant::now();
    let first = driver.spawn_issue("Main");
    let second = driver.spawn_issue("Extra");
    first.await.unwrap();
    second.await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(600));
}

#[tokio::test]
async fn test_unbounded_fan_out_overlaps_requests() {
    let server = start_server(Duration::from_millis(300)).await;
    let driver = RequestDriver::new(
        settings(server.url()),
        ClientTransport::Leaky(leaky_policy()),
        CensusProbe::new(Arc::new(FixedCensus::new(0, 0)), server.addr.port()),
    );

    let handles: Vec<_> = (0..4).map(|_| driver.spawn_issue("Main")).collect();
    assert!(common::wait_until(Duration::from_secs(2), || server.handle.stats().active == 4).await);
    for handle in handles {
        handle.await.unwrap();
    }
}

#[test]
fn test_random_shape_honors_probability_bounds() {
    let mut never = RandomShape::seeded(0.0, 20, 7);
    assert!((0..100).all(|_| never.next_extra().is_none()));

    let mut always = RandomShape::seeded(1.0, 20, 7);
    for _ in 0..100 {
        let delay = always.next_extra().expect("extra request expected");
        assert!(delay < Duration::from_secs(20));
        assert_eq!(delay.subsec_nanos(), 0);
    }

    let mut immediate = RandomShape::seeded(1.0, 0, 7);
    assert_eq!(immediate.next_extra(), Some(Duration::ZERO));
}

#[test]
fn test_random_shape_is_reproducible_with_seed() {
    let mut a = RandomShape::seeded(0.5, 20, 42);
    let mut b = RandomShape::seeded(0.5, 20, 42);
    for _ in 0..50 {
        assert_eq!(a.next_extra(), b.next_extra());
    }
}

#[test]
fn test_driver_settings_reject_malformed_target() {
    let config = sockwatch_common::ClientConfig {
        target_url: "http://exa mple.com".to_string(),
        ..Default::default()
    };
    assert!(matches!(
        DriverSettings::from_config(&config),
        Err(HarnessError::RequestBuild(_))
    ));
}
