//! Error types for pg-logical-replication.
//!
//! Everything surfaced by this crate is an [`Error`]. The variants split
//! along the boundaries callers react to differently: slot-lifecycle
//! conflicts ([`Error::SlotBusy`], [`Error::WalGone`]) call for operator or
//! snapshot intervention, transport loss ([`Error::ConnectionLost`])
//! typically means "restart the session", and server rejections carry the
//! original PostgreSQL message plus SQLSTATE.

use thiserror::Error;

use crate::lsn::ParseLsnError;

/// A PostgreSQL `ErrorResponse`, reduced to the fields the client acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// Human-readable message (`M` field).
    pub message: String,
    /// SQLSTATE code (`C` field), when present.
    pub sqlstate: Option<String>,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.sqlstate {
            Some(c) => write!(f, "{} (SQLSTATE {c})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Error type for all pg-logical-replication operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed LSN text.
    #[error(transparent)]
    BadLsnFormat(#[from] ParseLsnError),

    /// The slot exists and already has an active consumer.
    ///
    /// A logical slot supports at most one consumer; callers must wait for
    /// the other consumer to detach or pick another slot name.
    #[error("replication slot '{slot}' is already active on the server")]
    SlotBusy { slot: String },

    /// The slot disappeared between introspection calls.
    #[error("replication slot '{slot}' does not exist")]
    SlotNotFound { slot: String },

    /// `IDENTIFY_SYSTEM` returned no row - the connection was not opened
    /// in replication mode.
    #[error("the connection is not a valid replication connection")]
    NotAReplicationConnection,

    /// The requested start position has fallen behind the server's WAL
    /// retention. Unrecoverable at this layer; the caller must take a new
    /// snapshot.
    #[error(
        "the WAL position to resume from has been removed from the server; \
         a new snapshot is required"
    )]
    WalGone,

    /// The server rejected a plugin option. Handled internally by the
    /// option-downgrade path; only surfaced when no fallback remains.
    #[error("server rejected a decoder option: {0}")]
    DecoderOptionRejected(ServerError),

    /// Transport failure while streaming or connecting.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// PostgreSQL returned an error response.
    #[error("server error: {0}")]
    Server(ServerError),

    /// Authentication failed or the server asked for an unsupported method.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Malformed message or unexpected response on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Control-plane (non-replication SQL) failure.
    #[error("control connection error: {0}")]
    Control(#[from] tokio_postgres::Error),

    /// Invalid session configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Bug in the library or a state that should be unreachable.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns `true` if this error is likely transient and the session can
    /// simply be rebuilt against the same slot.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ConnectionLost(_) | Error::SlotBusy { .. })
    }

    /// Returns `true` if this is a server `ErrorResponse`.
    #[inline]
    pub fn is_server(&self) -> bool {
        matches!(self, Error::Server(_))
    }
}

// Transport failures during streaming surface as ConnectionLost; io::Error
// carries no finer-grained meaning at this layer.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::ConnectionLost(err.to_string())
    }
}

/// Result type alias for pg-logical-replication operations.
pub type Result<T> = std::result::Result<T, Error>;
