use sockwatch_common::{Config, LoggingConfig};
use sockwatch_harness::engine::census::{census_for, census_port, CensusProbe};
use sockwatch_harness::engine::traffic::RandomShape;
use sockwatch_harness::{
    ClientTransport, ConnectionPool, DriverSettings, RequestDriver, ServerSettings, SlowServer,
    TransportPolicy,
};
use std::env;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const USAGE: &str = "usage: sockwatch <server|leaky-client|pooled-client> [config.yaml]";

enum Role {
    Server,
    LeakyClient,
    PooledClient,
}

impl Role {
    fn parse(arg: &str) -> Option<Self> {
        match arg {
            "server" => Some(Role::Server),
            "leaky-client" => Some(Role::LeakyClient),
            "pooled-client" => Some(Role::PooledClient),
            _ => None,
        }
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if config.json {
        registry.with(fmt::layer().json().with_target(true)).init();
        info!("Structured logging initialized (JSON)");
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = env::args().skip(1);
    let role = args.next().as_deref().and_then(Role::parse).ok_or(USAGE)?;
    let config = match args.next() {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };

    init_logging(&config.logging);

    let census = census_for(config.census.backend);

    match role {
        Role::Server => {
            let server = SlowServer::bind(ServerSettings::from(&config.server))
                .await
                .map_err(|e| {
                    error!(error = %e, "Cannot start server");
                    e
                })?;
            let port = census_port(config.census.port, server.local_addr().port());
            let server = server.with_census(CensusProbe::new(census, port));

            let shutdown = CancellationToken::new();
            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    signal_token.cancel();
                }
            });

            server.run(shutdown).await;
        }
        Role::LeakyClient | Role::PooledClient => {
            let transport = match role {
                Role::LeakyClient => {
                    ClientTransport::Leaky(TransportPolicy::from(&config.client.leaky_transport))
                }
                _ => ClientTransport::Shared(ConnectionPool::new(TransportPolicy::from(
                    &config.client.pooled_transport,
                ))),
            };
            let settings = DriverSettings::from_config(&config.client)?;
            let port = census_port(
                config.census.port,
                settings.target.port_u16().unwrap_or(80),
            );
            let driver = RequestDriver::new(settings, transport, CensusProbe::new(census, port));
            let shape = Box::new(RandomShape::new(
                config.client.extra_probability,
                config.client.extra_max_delay_secs,
            ));

            tokio::select! {
                _ = driver.run_forever(shape) => {},
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                }
            }
        }
    }

    Ok(())
}
