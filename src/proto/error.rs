use std::io;

use thiserror::Error;

/// Result type alias for sentimux operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to sentinels or the master.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An IO error occurred on an established connection.
    #[error("IO error: {source}")]
    Io {
        /// The underlying IO error.
        #[from]
        source: io::Error,
    },

    /// The TCP connection could not be established.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        /// The address that was dialed.
        address: String,
        /// The underlying IO error.
        source: io::Error,
    },

    /// Malformed wire data. Fatal to the session that received it.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the error.
        message: String,
    },

    /// The server returned an error reply.
    #[error("server error: {message}")]
    Server {
        /// Error message from server.
        message: String,
    },

    /// Every sentinel was tried and none reported a master.
    #[error("no master available for '{master_name}' after {attempts} sentinel(s)")]
    NoMasterAvailable {
        /// The logical service name that was looked up.
        master_name: String,
        /// Number of sentinels that were tried.
        attempts: usize,
    },

    /// The connection was closed while the operation was pending, or before
    /// it was issued.
    #[error("connection closed")]
    ConnectionClosed,

    /// The client was explicitly closed and can no longer be used.
    #[error("client closed")]
    ClientClosed,

    /// An operation did not finish before its deadline.
    #[error("timed out: {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: &'static str,
    },

    /// The node reported by the sentinels is not a master.
    #[error("node {address} reports role '{role}', expected master")]
    RoleMismatch {
        /// Address of the node.
        address: String,
        /// The role the node reported.
        role: String,
    },

    /// Authentication failed.
    #[error("authentication failed")]
    Auth,

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of invalid argument.
        message: String,
    },
}

impl Error {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    /// Returns true if this error means the connection is gone.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Error::ConnectionClosed | Error::ClientClosed)
    }
}
