//! Error types for usenet-engine
//!
//! Domain errors are split by subsystem: connection transport, yEnc decode,
//! disk persistence, and queue edits. The top-level [`Error`] chains them
//! with `#[from]` so call sites can use `?` throughout.

use std::path::PathBuf;
use thiserror::Error;

use crate::types::{FileId, NzbId};

/// Result type alias for usenet-engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for usenet-engine
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "article_cache")
        key: Option<String>,
    },

    /// NNTP connection or transport error
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// yEnc decode error
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Queue edit refused or failed
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Disk write/read failure while persisting article data
    #[error("disk error at {path}: {source}")]
    DiskIo {
        /// Path of the file being written or read
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Generic I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// URL placeholder fetch failed after all retries
    #[error("url fetch error: {0}")]
    UrlFetch(#[from] reqwest::Error),

    /// Serialization error (persisted state)
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Transport errors raised by [`crate::nntp::Connection`]
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Hostname could not be resolved
    #[error("DNS resolution failed for {host}")]
    DnsFailure {
        /// Host that failed to resolve
        host: String,
    },

    /// TCP connect was refused or failed
    #[error("connection to {host}:{port} refused: {reason}")]
    ConnectRefused {
        /// Server host
        host: String,
        /// Server port
        port: u16,
        /// OS-level reason
        reason: String,
    },

    /// An operation exceeded its configured timeout
    #[error("operation timed out after {seconds}s")]
    Timeout {
        /// The timeout that elapsed
        seconds: u64,
    },

    /// TLS handshake failed
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// The connection was cancelled from another task
    #[error("connection cancelled")]
    Cancelled,

    /// The peer closed the connection
    #[error("connection closed by peer")]
    PeerClosed,

    /// Other socket-level I/O error
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// Server sent an unparseable or out-of-protocol response
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server rejected the AUTHINFO exchange
    #[error("authentication rejected ({code})")]
    AuthRejected {
        /// NNTP response code
        code: u16,
    },

    /// GROUP command failed (411/412)
    #[error("group {group} not available ({code})")]
    GroupFailed {
        /// The group that was requested
        group: String,
        /// NNTP response code
        code: u16,
    },

    /// BODY returned 430: the server does not carry the article
    #[error("no such article: {message_id}")]
    ArticleNotFound {
        /// The Message-ID that was requested
        message_id: String,
    },
}

impl ConnectionError {
    /// Whether reconnecting and retrying on the same server makes sense.
    ///
    /// Transient transport failures count against `article_retries`;
    /// server-logical rejections skip straight to the next server.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectionError::Timeout { .. }
                | ConnectionError::PeerClosed
                | ConnectionError::Io(_)
                | ConnectionError::ConnectRefused { .. }
                | ConnectionError::Protocol(_)
        )
    }
}

/// Decode failures raised by [`crate::yenc`]
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum DecodeError {
    /// The body ended without a `=ybegin` header
    #[error("missing =ybegin header")]
    MissingYBegin,

    /// The body ended without a `=yend` trailer
    #[error("missing =yend trailer")]
    MissingYEnd,

    /// A header line could not be parsed
    #[error("malformed line: {0}")]
    MalformedLine(String),

    /// Decoded size differs from the declared size
    #[error("size mismatch: declared {declared}, decoded {decoded}")]
    SizeMismatch {
        /// Size declared in the =yend trailer
        declared: u64,
        /// Size actually produced by the decoder
        decoded: u64,
    },

    /// Computed CRC32 differs from the declared pcrc32
    #[error("crc mismatch: declared {declared:08x}, computed {computed:08x}")]
    CrcMismatch {
        /// CRC declared in the =yend trailer
        declared: u32,
        /// CRC computed over the decoded bytes
        computed: u32,
    },
}

/// Queue edit and lifecycle errors
#[derive(Debug, Error)]
pub enum QueueError {
    /// The referenced NZB does not exist in the queue
    #[error("nzb {id} not found")]
    NzbNotFound {
        /// The missing queue entry
        id: NzbId,
    },

    /// The referenced file does not exist in the queue
    #[error("file {id} not found")]
    FileNotFound {
        /// The missing file
        id: FileId,
    },

    /// Merge refused (post-processing or URL placeholder involved)
    #[error("cannot merge nzb {id}: {reason}")]
    MergeRefused {
        /// The entry that blocked the merge
        id: NzbId,
        /// Why the merge was refused
        reason: String,
    },

    /// Split refused (no files selected, or files not in the source group)
    #[error("cannot split nzb {id}: {reason}")]
    SplitRefused {
        /// The source entry
        id: NzbId,
        /// Why the split was refused
        reason: String,
    },

    /// Relocating completed files failed; the edit was rolled back
    #[error("failed to move files of nzb {id}: {reason}")]
    MoveFailed {
        /// The entry whose files could not be moved
        id: NzbId,
        /// Why the relocation failed
        reason: String,
    },
}
