use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Possible errors when interacting with `netpace_lib`
///
/// Errors are cheap to clone, because a single outcome is handed to the
/// completion callback of an [`Operation`](crate::Operation) and to every
/// caller awaiting the matching [`DeferredResult`](crate::DeferredResult).
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Network error while executing a request
    #[error("Network error while executing the request")]
    NetworkRequest(#[source] Arc<reqwest::Error>),

    /// The response arrived, but its body could not be read
    #[error("Error reading response body: {0}")]
    ReadResponseBody(#[source] Arc<reqwest::Error>),

    /// The HTTP client of a lane could not be created
    #[error("Error creating request client: {0}")]
    BuildRequestClient(#[source] Arc<reqwest::Error>),

    /// The request descriptor of an operation could not be produced
    #[error("Cannot build request: {0}")]
    InvalidRequest(String),

    /// The wait queue of a dispatcher is full; the submission was rejected
    #[error("Wait queue is full (capacity {capacity}), request rejected")]
    Overflow {
        /// Capacity of the rejecting queue
        capacity: usize,
    },

    /// The operation was cancelled before it produced a result
    #[error("Operation was cancelled")]
    Cancelled,

    /// Waiting for a result took longer than allowed
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The operation left the wait queue, but no lane accepted it
    #[error("Operation could not be handed to a lane")]
    NotDispatched,

    /// A dispatcher needs at least one lane
    #[error("A dispatcher needs at least one lane")]
    NoLanes,

    /// A wait queue needs room for at least one entry
    #[error("Queue capacity must be greater than zero")]
    InvalidCapacity,

    /// Only `ws` and `wss` targets can be supervised
    #[error("Unsupported scheme `{0}`, expected `ws` or `wss`")]
    UnsupportedScheme(String),

    /// The target URI cannot be parsed or has no host
    #[error("Invalid URI `{0}`")]
    InvalidUri(String),

    /// Connecting the socket of a connection failed
    #[error("Cannot connect to {target}: {source}")]
    Connect {
        /// Host and port that were dialed
        target: String,
        /// Underlying I/O error
        #[source]
        source: Arc<std::io::Error>,
    },

    /// The WebSocket handshake or a frame exchange failed
    #[error("WebSocket error: {0}")]
    Handshake(#[source] Arc<tokio_tungstenite::tungstenite::Error>),

    /// A TLS connector could not be created
    #[error("Cannot create TLS connector: {0}")]
    Tls(#[source] Arc<native_tls::Error>),

    /// There is no open channel to write to
    #[error("Connection `{0}` is not connected")]
    NotConnected(String),

    /// The channel was closed while a message was being handed over
    #[error("Channel closed, message not sent")]
    Send,
}

impl ErrorKind {
    /// Return the underlying `reqwest` error, if any
    #[must_use]
    pub fn reqwest_error(&self) -> Option<&reqwest::Error> {
        match self {
            Self::NetworkRequest(e) | Self::ReadResponseBody(e) | Self::BuildRequestClient(e) => {
                Some(e.as_ref())
            }
            _ => None,
        }
    }

    /// True if the error was caused by a full wait queue
    #[must_use]
    pub const fn is_overflow(&self) -> bool {
        matches!(self, Self::Overflow { .. })
    }

    /// True if the error was caused by cancellation
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl PartialEq for ErrorKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::NetworkRequest(e1), Self::NetworkRequest(e2))
            | (Self::ReadResponseBody(e1), Self::ReadResponseBody(e2))
            | (Self::BuildRequestClient(e1), Self::BuildRequestClient(e2)) => {
                e1.to_string() == e2.to_string()
            }
            (Self::InvalidRequest(s1), Self::InvalidRequest(s2))
            | (Self::UnsupportedScheme(s1), Self::UnsupportedScheme(s2))
            | (Self::InvalidUri(s1), Self::InvalidUri(s2))
            | (Self::NotConnected(s1), Self::NotConnected(s2)) => s1 == s2,
            (Self::Overflow { capacity: c1 }, Self::Overflow { capacity: c2 }) => c1 == c2,
            (Self::Timeout(d1), Self::Timeout(d2)) => d1 == d2,
            (
                Self::Connect {
                    target: t1,
                    source: s1,
                },
                Self::Connect {
                    target: t2,
                    source: s2,
                },
            ) => t1 == t2 && s1.kind() == s2.kind(),
            (Self::Handshake(e1), Self::Handshake(e2)) => e1.to_string() == e2.to_string(),
            (Self::Tls(e1), Self::Tls(e2)) => e1.to_string() == e2.to_string(),
            (Self::Cancelled, Self::Cancelled)
            | (Self::NotDispatched, Self::NotDispatched)
            | (Self::NoLanes, Self::NoLanes)
            | (Self::InvalidCapacity, Self::InvalidCapacity)
            | (Self::Send, Self::Send) => true,
            _ => false,
        }
    }
}

impl Eq for ErrorKind {}

impl Hash for ErrorKind {
    fn hash<H>(&self, state: &mut H)
    where
        H: std::hash::Hasher,
    {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::NetworkRequest(e) | Self::ReadResponseBody(e) | Self::BuildRequestClient(e) => {
                e.to_string().hash(state);
            }
            Self::InvalidRequest(s)
            | Self::UnsupportedScheme(s)
            | Self::InvalidUri(s)
            | Self::NotConnected(s) => s.hash(state),
            Self::Overflow { capacity } => capacity.hash(state),
            Self::Timeout(d) => d.hash(state),
            Self::Connect { target, source } => (target, source.kind()).hash(state),
            Self::Handshake(e) => e.to_string().hash(state),
            Self::Tls(e) => e.to_string().hash(state),
            Self::Cancelled
            | Self::NotDispatched
            | Self::NoLanes
            | Self::InvalidCapacity
            | Self::Send => {}
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ErrorKind {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Handshake(Arc::new(e))
    }
}

impl From<native_tls::Error> for ErrorKind {
    fn from(e: native_tls::Error) -> Self {
        Self::Tls(Arc::new(e))
    }
}

impl From<url::ParseError> for ErrorKind {
    fn from(e: url::ParseError) -> Self {
        Self::InvalidUri(e.to_string())
    }
}
