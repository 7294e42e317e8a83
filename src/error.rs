//! Crate level errors.
//!
//! Every fallible operation in the crate returns [`Result`]. The variants fall
//! into three groups:
//!
//! ## Routing and ownership signals
//!
//! [`Error::NeedAllocation`] and [`Error::AlreadyOwned`] are not failures. They
//! carry the information the client needs to redirect (ask the cluster leader
//! for an allocation) or to back off (someone else holds the lead role). The
//! client's lookup/connect logic handles these locally.
//!
//! ## Retryable conditions
//!
//! - [`Error::Timeout`] is retried by the redo wrapper up to its budget, after
//!   which it becomes [`Error::MaxRedoExceeded`].
//! - [`Error::Conflict`] means an optimistic-concurrency check failed. The
//!   caller must re-read and recompute; it must never blindly retry with the
//!   state it already holds.
//!
//! ## Everything else
//!
//! Propagates to the application unchanged.
//!
//! Errors cross the wire as an [`ErrorCode`] plus message, see
//! [`crate::protocol::WireError`].

use num_derive::FromPrimitive;
use std::{io, result};
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

/// Broker, store and client errors.
#[derive(Clone, Debug, ThisError, PartialEq, Eq)]
pub enum Error {
    /// A deadline elapsed on an RPC or a wait.
    #[error("operation timed out")]
    Timeout,

    /// Compare-and-swap failed: the stored version moved on.
    #[error("version conflict: {0}")]
    Conflict(String),

    /// A subscription already exists with a different mode.
    #[error("subscription mode conflict: {0}")]
    ModeConflict(String),

    /// The lead role (or exclusive membership) is held by someone else.
    #[error("already owned: {0}")]
    AlreadyOwned(String),

    /// The bundle has no owner; ask the leader at `leader_url` to allocate it.
    #[error("bundle unowned, request allocation from {leader_url}")]
    NeedAllocation { leader_url: String },

    /// A topic, partition, subscription, message, node or connection is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// The redo budget of a wrapped call ran out.
    #[error("max redo exceeded: {0}")]
    MaxRedoExceeded(String),

    /// The subscriber's receive buffer has no room left.
    #[error("receive buffer full")]
    BufferFull,

    /// A create hit an existing node.
    #[error("node already exists: {0}")]
    NodeExists(String),

    /// A client name collided and renaming is disabled.
    #[error("name already in use: {0}")]
    NameConflict(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The enclosing request context was canceled.
    #[error("operation canceled")]
    Canceled,

    /// Log store or coordination store failure.
    #[error("store error: {0}")]
    Store(String),

    /// Connection-level failure talking to a peer.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serde(String),

    #[error("IO error: {0:?}")]
    Io(io::ErrorKind),
}

impl Error {
    /// Deadline exceeded; the only kind the redo wrapper retries.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    /// True when the caller may try again (after re-reading state for `Conflict`).
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Timeout | Error::Conflict(_))
    }

    /// Routing/ownership signals that carry redirect information.
    pub fn is_routing_signal(&self) -> bool {
        matches!(self, Error::NeedAllocation { .. } | Error::AlreadyOwned(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Stable wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Timeout => ErrorCode::Timeout,
            Error::Conflict(_) => ErrorCode::Conflict,
            Error::ModeConflict(_) => ErrorCode::ModeConflict,
            Error::AlreadyOwned(_) => ErrorCode::AlreadyOwned,
            Error::NeedAllocation { .. } => ErrorCode::NeedAllocation,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::MaxRedoExceeded(_) => ErrorCode::MaxRedoExceeded,
            Error::BufferFull => ErrorCode::BufferFull,
            Error::NodeExists(_) => ErrorCode::NodeExists,
            Error::NameConflict(_) => ErrorCode::NameConflict,
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Error::Canceled => ErrorCode::Canceled,
            Error::Store(_) => ErrorCode::Store,
            Error::Transport(_) => ErrorCode::Transport,
            Error::Config(_) => ErrorCode::Config,
            Error::Serde(_) => ErrorCode::Serde,
            Error::Io(_) => ErrorCode::Io,
        }
    }

    /// Rebuild a typed error from its wire representation.
    ///
    /// `leader_url` is only meaningful for [`ErrorCode::NeedAllocation`].
    pub fn from_wire(code: ErrorCode, message: String, leader_url: Option<String>) -> Self {
        match code {
            ErrorCode::Timeout => Error::Timeout,
            ErrorCode::Conflict => Error::Conflict(message),
            ErrorCode::ModeConflict => Error::ModeConflict(message),
            ErrorCode::AlreadyOwned => Error::AlreadyOwned(message),
            ErrorCode::NeedAllocation => Error::NeedAllocation {
                leader_url: leader_url.unwrap_or_default(),
            },
            ErrorCode::NotFound => Error::NotFound(message),
            ErrorCode::MaxRedoExceeded => Error::MaxRedoExceeded(message),
            ErrorCode::BufferFull => Error::BufferFull,
            ErrorCode::NodeExists => Error::NodeExists(message),
            ErrorCode::NameConflict => Error::NameConflict(message),
            ErrorCode::InvalidArgument => Error::InvalidArgument(message),
            ErrorCode::Canceled => Error::Canceled,
            ErrorCode::Store => Error::Store(message),
            ErrorCode::Config => Error::Config(message),
            ErrorCode::Serde => Error::Serde(message),
            ErrorCode::Transport | ErrorCode::Io | ErrorCode::Unknown | ErrorCode::None => {
                Error::Transport(message)
            }
        }
    }

    /// The payload string carried on the wire for this error.
    pub fn wire_message(&self) -> String {
        match self {
            Error::Conflict(m)
            | Error::ModeConflict(m)
            | Error::AlreadyOwned(m)
            | Error::NotFound(m)
            | Error::MaxRedoExceeded(m)
            | Error::NodeExists(m)
            | Error::NameConflict(m)
            | Error::InvalidArgument(m)
            | Error::Store(m)
            | Error::Transport(m)
            | Error::Config(m)
            | Error::Serde(m) => m.clone(),
            other => other.to_string(),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.kind())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serde(e.to_string())
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Self {
        match e {
            object_store::Error::NotFound { path, .. } => Error::NotFound(path),
            other => Error::Store(other.to_string()),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

/// Error codes carried in RPC replies.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, Default)]
#[repr(i16)]
pub enum ErrorCode {
    /// An unexpected server error.
    Unknown = -1,
    #[default]
    None = 0,
    Timeout = 1,
    Conflict = 2,
    ModeConflict = 3,
    AlreadyOwned = 4,
    NeedAllocation = 5,
    NotFound = 6,
    MaxRedoExceeded = 7,
    BufferFull = 8,
    NodeExists = 9,
    NameConflict = 10,
    InvalidArgument = 11,
    Canceled = 12,
    Store = 13,
    Transport = 14,
    Config = 15,
    Serde = 16,
    Io = 17,
}
