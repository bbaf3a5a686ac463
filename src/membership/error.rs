use thiserror::Error;

/// Errors raised by the gossip membership layer.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Underlying socket failure.
    #[error("cluster transport error: {0}")]
    Io(#[from] std::io::Error),
    /// Encoding or decoding of a gossip/stream message failed.
    #[error("cluster serialization error: {0}")]
    Serialization(String),
    /// A stream frame exceeded the allowed size.
    #[error("cluster message too large: {0} bytes")]
    MessageTooLarge(usize),
    /// The remote side closed the stream before answering.
    #[error("stream closed by {0} before a reply was received")]
    StreamClosed(String),
    /// A connect or exchange did not finish in time.
    #[error("timed out talking to {0}")]
    Timeout(String),
    /// None of the join targets could be contacted.
    #[error("failed to join any of {attempted} peer(s): {last_error}")]
    JoinFailed {
        /// Number of addresses tried.
        attempted: usize,
        /// Error reported by the last failing address.
        last_error: String,
    },
    /// The service was shut down.
    #[error("membership service is shut down")]
    Shutdown,
}

impl From<bincode::Error> for ClusterError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
