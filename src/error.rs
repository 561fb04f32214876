use std::sync::Arc;
use thiserror::Error;

use crate::record::Rcode;

pub type Result<T> = std::result::Result<T, ResolveError>;

/// Unified error type for the resolver core.
///
/// NXDOMAIN is deliberately absent: a name that does not exist is an
/// authoritative answer and completes a lookup with an empty record list.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    /// Transaction id already in flight on the target socket.
    #[error("transaction id already in flight")]
    IdCollision,

    #[error("query timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(Arc<std::io::Error>),

    /// DNS error rcode other than NXDOMAIN (SERVFAIL, REFUSED, FORMERR, ...).
    #[error("server returned {0}")]
    Server(Rcode),

    /// Single-result lookup found no records.
    #[error("no records found")]
    Empty,

    /// The channel was retired while the query was in flight.
    #[error("server retired")]
    ServerRetired,

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Response had the TC bit set; TCP retry is out of scope.
    #[error("truncated response")]
    Truncated,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no upstream servers configured")]
    NoServers,

    /// The in-flight lookup was cancelled before completion.
    #[error("lookup cancelled")]
    Cancelled,
}

impl ResolveError {
    /// Errors that trigger failover to the next server in the pool.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ResolveError::Timeout
                | ResolveError::Transport(_)
                | ResolveError::Server(_)
                | ResolveError::ServerRetired
        )
    }
}

impl From<std::io::Error> for ResolveError {
    fn from(err: std::io::Error) -> Self {
        ResolveError::Transport(Arc::new(err))
    }
}
