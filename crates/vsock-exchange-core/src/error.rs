//! Error types for the exchange.
//!
//! Every failing step of either endpoint maps to its own variant so callers
//! and tests can tell *which* step failed. At the process boundary all of
//! them collapse to the same outcome: see [`ExchangeError::exit_code`] and
//! [`outcome_code`].

use crate::address::AddressDescriptor;
use crate::socket::SocketState;
use std::fmt;
use thiserror::Error;

/// Main error type for the exchange.
#[derive(Debug, Error)]
pub enum ExchangeError {
    // Socket lifecycle errors
    #[error("Failed to create socket: {source}")]
    Socket {
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: AddressDescriptor,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to listen on {addr} (backlog {backlog}): {source}")]
    Listen {
        addr: AddressDescriptor,
        backlog: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to accept on {addr}: {source}")]
    Accept {
        addr: AddressDescriptor,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: AddressDescriptor,
        #[source]
        source: std::io::Error,
    },

    // Data transfer errors
    #[error("Failed to send to {addr}: {source}")]
    Send {
        addr: AddressDescriptor,
        #[source]
        source: std::io::Error,
    },

    #[error("Send to {addr} transferred no bytes")]
    NothingSent { addr: AddressDescriptor },

    #[error("Short send to {addr}: {sent} of {expected} bytes")]
    ShortSend {
        addr: AddressDescriptor,
        sent: usize,
        expected: usize,
    },

    #[error("Failed to receive from {addr}: {source}")]
    Recv {
        addr: AddressDescriptor,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to shut down connection with {addr}: {source}")]
    Shutdown {
        addr: AddressDescriptor,
        #[source]
        source: std::io::Error,
    },

    // Usage errors
    #[error("Operation '{op}' is not permitted in state {state}")]
    IllegalState { op: &'static str, state: SocketState },

    #[error("Invalid address descriptor: {reason}")]
    InvalidDescriptor { reason: String },
}

/// Result type alias for exchange operations.
pub type Result<T> = std::result::Result<T, ExchangeError>;

/// The step of an endpoint run that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Socket,
    Bind,
    Listen,
    Accept,
    Connect,
    Send,
    Recv,
    Shutdown,
    /// Not tied to a transport call (state or descriptor validation).
    Usage,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Socket => "socket",
            Step::Bind => "bind",
            Step::Listen => "listen",
            Step::Accept => "accept",
            Step::Connect => "connect",
            Step::Send => "send",
            Step::Recv => "recv",
            Step::Shutdown => "shutdown",
            Step::Usage => "usage",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ExchangeError {
    /// Which step failed.
    pub fn step(&self) -> Step {
        match self {
            ExchangeError::Socket { .. } => Step::Socket,
            ExchangeError::Bind { .. } => Step::Bind,
            ExchangeError::Listen { .. } => Step::Listen,
            ExchangeError::Accept { .. } => Step::Accept,
            ExchangeError::Connect { .. } => Step::Connect,
            ExchangeError::Send { .. }
            | ExchangeError::NothingSent { .. }
            | ExchangeError::ShortSend { .. } => Step::Send,
            ExchangeError::Recv { .. } => Step::Recv,
            ExchangeError::Shutdown { .. } => Step::Shutdown,
            ExchangeError::IllegalState { .. } | ExchangeError::InvalidDescriptor { .. } => {
                Step::Usage
            }
        }
    }

    /// Process-boundary status for a failed run.
    ///
    /// Every failure maps to `-1`; the variant only matters to callers that
    /// inspect it.
    pub fn exit_code(&self) -> i32 {
        -1
    }

    /// The underlying OS error, if the failure came from a transport call.
    pub fn io_error(&self) -> Option<&std::io::Error> {
        match self {
            ExchangeError::Socket { source }
            | ExchangeError::Bind { source, .. }
            | ExchangeError::Listen { source, .. }
            | ExchangeError::Accept { source, .. }
            | ExchangeError::Connect { source, .. }
            | ExchangeError::Send { source, .. }
            | ExchangeError::Recv { source, .. }
            | ExchangeError::Shutdown { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Collapse an endpoint result to the flat `0` / `-1` status.
pub fn outcome_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.exit_code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn refused() -> io::Error {
        io::Error::from(io::ErrorKind::ConnectionRefused)
    }

    #[test]
    fn test_error_display() {
        let err = ExchangeError::ShortSend {
            addr: AddressDescriptor::remote(2, 1234),
            sent: 3,
            expected: 5,
        };
        assert_eq!(err.to_string(), "Short send to cid: 2 port: 1234: 3 of 5 bytes");
    }

    #[test]
    fn test_step_mapping() {
        let addr = AddressDescriptor::remote(2, 1234);
        assert_eq!(
            ExchangeError::Connect { addr, source: refused() }.step(),
            Step::Connect
        );
        assert_eq!(ExchangeError::NothingSent { addr }.step(), Step::Send);
        assert_eq!(
            ExchangeError::IllegalState { op: "recv", state: SocketState::Listening }.step(),
            Step::Usage
        );
    }

    #[test]
    fn test_every_failure_is_minus_one() {
        let addr = AddressDescriptor::bind(33, 1234);
        let errors = [
            ExchangeError::Socket { source: refused() },
            ExchangeError::Bind { addr, source: refused() },
            ExchangeError::Shutdown { addr, source: refused() },
            ExchangeError::InvalidDescriptor { reason: "x".into() },
        ];
        for err in &errors {
            assert_eq!(err.exit_code(), -1);
        }
    }

    #[test]
    fn test_outcome_code() {
        let ok: Result<()> = Ok(());
        assert_eq!(outcome_code(&ok), 0);

        let failed: Result<()> = Err(ExchangeError::NothingSent {
            addr: AddressDescriptor::remote(2, 1234),
        });
        assert_eq!(outcome_code(&failed), -1);
    }

    #[test]
    fn test_io_error_access() {
        let err = ExchangeError::Bind {
            addr: AddressDescriptor::bind(33, 1234),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert_eq!(err.io_error().map(|e| e.kind()), Some(io::ErrorKind::AddrInUse));
        assert!(ExchangeError::InvalidDescriptor { reason: "x".into() }
            .io_error()
            .is_none());
    }
}
