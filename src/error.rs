//! Error types for the tunnel client.

use thiserror::Error;

/// Result type alias for tunnel client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while multiplexing flows over tunnels.
#[derive(Error, Debug)]
pub enum Error {
    /// No free flow slot is left in the flow table
    #[error("flow table exhausted")]
    Exhausted,

    /// Every tunnel in the pool is disconnected
    #[error("no tunnel available")]
    NoTunnelAvailable,

    /// Slot is unused or was recycled since the reference was taken
    #[error("stale flow reference {index}:{generation}")]
    StaleReference {
        /// Slot index
        index: u16,
        /// Generation the reference carried
        generation: u16,
    },

    /// Dial, read or write failure on a tunnel connection
    #[error("transport error: {0}")]
    Transport(String),

    /// Read, write or timeout failure on a flow's local socket
    #[error("local socket error: {0}")]
    LocalSocket(#[source] std::io::Error),

    /// Malformed tunnel frame
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Malformed or unsupported SOCKS5 request
    #[error("socks5 error: {0}")]
    Socks(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
}

impl Error {
    /// Create a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Create a new frame error
    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        Error::InvalidFrame(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Check if this error means a new flow could not be admitted.
    ///
    /// The caller should close the local connection without a reply.
    pub fn is_admission_failure(&self) -> bool {
        matches!(self, Error::Exhausted | Error::NoTunnelAvailable)
    }

    /// Check if this error is a stale slot reference
    pub fn is_stale(&self) -> bool {
        matches!(self, Error::StaleReference { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Exhausted;
        assert_eq!(err.to_string(), "flow table exhausted");

        let err = Error::StaleReference {
            index: 3,
            generation: 7,
        };
        assert_eq!(err.to_string(), "stale flow reference 3:7");
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::Exhausted.is_admission_failure());
        assert!(Error::NoTunnelAvailable.is_admission_failure());
        assert!(!Error::transport("reset").is_admission_failure());

        let stale = Error::StaleReference {
            index: 0,
            generation: 1,
        };
        assert!(stale.is_stale());
        assert!(!stale.is_admission_failure());
    }
}
