//! Error types for the connection engine

use std::io;

use thiserror::Error;

/// Result type for link operations
pub type LinkResult<T> = Result<T, LinkError>;

/// Which of the two per-link state machines rejected an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Machine {
    /// The lock-free `RequestState` cell
    Request,
    /// The phase machine `LinkState`
    Link,
}

impl Machine {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Machine::Request => "request-state",
            Machine::Link => "link-state",
        }
    }
}

/// A transition that the state table does not allow.
///
/// Always a concurrency bug in the caller: the owner and a waker disagree
/// about who holds the link. Logged at `error` and surfaced to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal {} transition: {event} from {from}", machine.as_str())]
pub struct IllegalTransition {
    pub machine: Machine,
    pub from: &'static str,
    pub event: &'static str,
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A field failed validation
    #[error("invalid configuration: {0}")]
    InvalidValue(&'static str),

    /// The bind address could not be parsed
    #[error("invalid bind address: {0}")]
    InvalidAddress(String),
}

/// Errors raised while servicing a link
#[derive(Debug, Error)]
pub enum LinkError {
    /// Transient socket failure; closes this connection only
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Peer went away mid-request; counted, not a failure
    #[error("client disconnect: {0}")]
    ClientDisconnect(io::Error),

    /// The request handler reported a failure
    #[error("handler failed: {0}")]
    Handler(String),

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    /// Process-wide resource exhaustion; escalates to shutdown
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("port closed")]
    PortClosed,

    /// `to_comet` after the async cycle already requested completion
    #[error("comet requested after complete")]
    CometAfterComplete,

    /// Owner-only operation invoked from a thread not bound to the link
    #[error("link is not owned by the calling thread")]
    NotOwner,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl LinkError {
    /// Wrap an I/O error, classifying peer hang-ups as client disconnects
    pub fn from_io(err: io::Error) -> Self {
        if is_disconnect_kind(err.kind()) {
            LinkError::ClientDisconnect(err)
        } else {
            LinkError::Io(err)
        }
    }

    /// True when the peer closed or reset the connection
    pub fn is_client_disconnect(&self) -> bool {
        match self {
            LinkError::ClientDisconnect(_) => true,
            LinkError::Io(e) => is_disconnect_kind(e.kind()),
            _ => false,
        }
    }

    /// Errors that must escalate beyond the current link
    pub fn is_fatal(&self) -> bool {
        matches!(self, LinkError::ResourceExhausted(_))
    }

    /// Convenience for handlers reporting their own failures
    pub fn handler(msg: impl Into<String>) -> Self {
        LinkError::Handler(msg.into())
    }
}

fn is_disconnect_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = LinkError::IllegalTransition(IllegalTransition {
            machine: Machine::Request,
            from: "SUSPEND",
            event: "to_keepalive",
        });
        assert_eq!(
            e.to_string(),
            "illegal request-state transition: to_keepalive from SUSPEND"
        );
    }

    #[test]
    fn test_disconnect_classification() {
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(LinkError::from_io(reset).is_client_disconnect());

        let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
        assert!(matches!(LinkError::from_io(eof), LinkError::ClientDisconnect(_)));

        let other = io::Error::from(io::ErrorKind::PermissionDenied);
        let e = LinkError::from_io(other);
        assert!(!e.is_client_disconnect());
        assert!(matches!(e, LinkError::Io(_)));

        // Io built through `?` still classifies by kind
        let e: LinkError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert!(e.is_client_disconnect());
    }

    #[test]
    fn test_fatal() {
        assert!(LinkError::ResourceExhausted("worker spawn").is_fatal());
        assert!(!LinkError::PortClosed.is_fatal());
    }
}
