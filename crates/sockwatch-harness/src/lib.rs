pub mod engine;
pub mod error;
pub mod parser;

pub use engine::census::{CensusProbe, CensusSample, SocketCensus};
pub use engine::counter::ActiveRequests;
pub use engine::driver::{DriverSettings, IssueEnd, IssueReport, RequestDriver};
pub use engine::pool::{ClientTransport, ConnectionPool, PoolStats, TransportPolicy};
pub use engine::server::{ServerHandle, ServerSettings, ServerStats, SlowServer, RESPONSE_BODY};
pub use error::{HarnessError, Result};
