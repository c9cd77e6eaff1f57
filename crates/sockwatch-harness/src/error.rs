/// Failures surfaced by the client transport, the slow server and the
/// socket census.
///
/// Client-side variants are terminal for the single request task that hit
/// them; the driver never retries.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("request creation failed: {0}")]
    RequestBuild(String),

    #[error("request failed: {0}")]
    ConnectionFailed(String),

    /// Includes the normal end of a drain when the peer hangs up.
    #[error("stream read failed: {0}")]
    StreamRead(String),

    #[error("socket census unavailable: {0}")]
    CensusUnavailable(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<hyper::http::Error> for HarnessError {
    fn from(e: hyper::http::Error) -> Self {
        HarnessError::RequestBuild(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
