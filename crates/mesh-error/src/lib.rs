//! Shared error taxonomy for the messaging fabric and blob transfer pipeline.
//!
//! Every fallible operation in this workspace returns `Result<T, MeshError>`.
//! `MeshError` carries a POSIX-flavoured [`ErrorCode`], a human message, and a
//! small bag of string annotations, which lets a `ServerError` response frame
//! be built directly from the error without re-deriving its fields, and lets
//! a caller (e.g. CLI tooling built on top of this crate) opt into printing
//! [`MeshError::user_friendly`] messages without a special-cased variant.

use std::collections::BTreeMap;
use std::fmt;

use mesh_ids::PeerId;
use serde::{Deserialize, Serialize};

/// POSIX-flavoured numeric error codes carried on the wire in a command
/// block's `errorCode` field and in broker-protocol response annotations.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    InvalidArgument = 1,
    PermissionDenied = 2,
    ProtocolNotSupported = 3,
    NoSuchFileOrDirectory = 4,
    TargetPeerNotFound = 5,
    TargetPeerQueueFull = 6,
    ProtocolValidationFailed = 7,
    Aborted = 8,
    NotConnected = 9,
    IntegrityMismatch = 10,
    Internal = 11,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which of the seven propagation buckets in the error handling design an
/// error falls into. Used by the transport and protocol-engine crates to
/// decide log level and whether the error is serialised into a response
/// frame or propagated to the caller.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Category {
    /// Explicit cancellation. Always expected, logged at trace.
    Aborted,
    /// `NotConnected`/`ConnectionReset`/`BrokenPipe`/`TimedOut`/
    /// `HostUnreachable`/`Eof`-shaped transport failure. Logged at trace.
    TransportExpected,
    /// Target peer not found / queue full / not connected to broker. The
    /// caller may retry through a different dispatch.
    BrokerRetryable,
    /// Invalid argument, permission denied, protocol not supported,
    /// no-such-file-or-directory. Serialised into the next response frame,
    /// never thrown across a task boundary.
    ServerToClient,
    /// Anything else. Closes the connection; may terminate the owning
    /// pipeline when configured to do so.
    FatalServer,
    /// Per-chunk or file-level CRC mismatch, non-contiguous chunks, size
    /// mismatch. Fails the entry and surfaces to the caller.
    Integrity,
}

/// Implemented by error types so call sites can decide log level and
/// propagation without a big match on `ErrorCode` at every site.
pub trait Retryable {
    fn category(&self) -> Category;

    fn is_expected(&self) -> bool {
        matches!(self.category(), Category::Aborted | Category::TransportExpected)
    }
}

/// The error type returned by every fallible operation in this workspace.
///
/// Mirrors the teacher's opaque "this would be a critical corruption bug if
/// it ever triggered" pattern for [`Category::Integrity`] and
/// [`Category::FatalServer`] errors: those are logged at `error` level
/// wherever they're created, since by the time they reach a caller the
/// precise call stack that produced them is gone.
#[derive(Clone, Eq, PartialEq, Debug, thiserror::Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct MeshError {
    pub code: ErrorCode,
    pub message: String,
    pub annotations: BTreeMap<String, String>,
    user_friendly: bool,
}

impl MeshError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), annotations: BTreeMap::new(), user_friendly: false }
    }

    /// A server error destined for a response frame's `errorCode`, not a
    /// thrown/propagated error: invalid argument, permission denied,
    /// protocol not supported, no such file or directory.
    pub fn server(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(code, message)
    }

    /// Anything not covered by the other buckets. Closes the connection.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Per-chunk/file CRC mismatch, non-contiguous chunks, size mismatch.
    pub fn integrity(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::IntegrityMismatch, message)
    }

    /// Explicit cancellation.
    pub fn aborted() -> Self {
        Self::new(ErrorCode::Aborted, "operation aborted")
    }

    pub fn target_peer_not_found(peer: PeerId) -> Self {
        Self::new(ErrorCode::TargetPeerNotFound, format!("no dispatch for peer {peer}"))
    }

    pub fn target_peer_queue_full(peer: PeerId) -> Self {
        Self::new(ErrorCode::TargetPeerQueueFull, format!("queue full for peer {peer}"))
    }

    /// Marks this error as safe to surface verbatim to an end user (e.g. CLI
    /// tooling built on top of this crate), per the "user-friendly" category
    /// in the error handling design.
    pub fn with_user_friendly(mut self, user_friendly: bool) -> Self {
        self.user_friendly = user_friendly;
        self
    }

    pub fn is_user_friendly(&self) -> bool {
        self.user_friendly
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }
}

impl Retryable for MeshError {
    fn category(&self) -> Category {
        match self.code {
            ErrorCode::Aborted => Category::Aborted,
            ErrorCode::NotConnected => Category::TransportExpected,
            ErrorCode::TargetPeerNotFound | ErrorCode::TargetPeerQueueFull => {
                Category::BrokerRetryable
            }
            ErrorCode::InvalidArgument
            | ErrorCode::PermissionDenied
            | ErrorCode::ProtocolNotSupported
            | ErrorCode::NoSuchFileOrDirectory
            | ErrorCode::ProtocolValidationFailed => Category::ServerToClient,
            ErrorCode::IntegrityMismatch => Category::Integrity,
            ErrorCode::Ok | ErrorCode::Internal => Category::FatalServer,
        }
    }
}

/// Classifies a raw `std::io::ErrorKind` into the "transport expected"
/// bucket (§7.2) so connection tasks can decide to log at trace instead of
/// warn without re-deriving the classification at every call site.
pub fn io_error_is_expected(kind: std::io::ErrorKind) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        kind,
        NotConnected
            | ConnectionAborted
            | ConnectionReset
            | ConnectionRefused
            | BrokenPipe
            | TimedOut
            | HostUnreachable
            | UnexpectedEof
    )
}

pub type Result<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorizes_per_taxonomy() {
        assert_eq!(MeshError::aborted().category(), Category::Aborted);
        assert_eq!(
            MeshError::target_peer_not_found(PeerId::new()).category(),
            Category::BrokerRetryable
        );
        assert_eq!(
            MeshError::server(ErrorCode::PermissionDenied, "no").category(),
            Category::ServerToClient
        );
        assert_eq!(MeshError::integrity("crc mismatch").category(), Category::Integrity);
        assert_eq!(MeshError::fatal("boom").category(), Category::FatalServer);
    }

    #[test]
    fn expected_errors_are_aborted_or_transport() {
        assert!(MeshError::aborted().is_expected());
        assert!(!MeshError::fatal("boom").is_expected());
    }

    #[test]
    fn annotations_round_trip_through_serde() {
        let err = MeshError::server(ErrorCode::InvalidArgument, "bad chunk id")
            .with_annotation("chunkId", "00000000-0000-0000-0000-000000000000");
        let json = serde_json::to_string(&err).expect("serialize");
        let back: MeshError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, err);
    }

    #[test]
    fn io_error_expected_classification_matches_taxonomy() {
        assert!(io_error_is_expected(std::io::ErrorKind::TimedOut));
        assert!(io_error_is_expected(std::io::ErrorKind::UnexpectedEof));
        assert!(!io_error_is_expected(std::io::ErrorKind::Other));
    }
}
