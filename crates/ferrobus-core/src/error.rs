//! Core subsystem errors.
//!
//! Each subsystem has a small enum of named kinds the caller handles; the
//! `Internal` variants fold everything non-semantic and terminate the
//! dispatch loop when they surface. The driver maps the named kinds onto
//! wire errors per the routing contract (quota → `LimitsExceeded`,
//! invalid rules → `MatchRuleInvalid`, protocol violations → disconnect
//! without a reply, EOF → graceful goodbye).

use crate::user::UserSlot;
use ferrobus_types::ErrorCode;
use thiserror::Error;

/// Accounting failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UserError {
    /// The per-user limit for a slot would be exceeded.
    #[error("quota exceeded for {slot:?}")]
    Quota { slot: UserSlot },
}

impl ErrorCode for UserError {
    fn code(&self) -> &'static str {
        match self {
            Self::Quota { .. } => "USER_QUOTA",
        }
    }
    fn is_recoverable(&self) -> bool {
        true
    }
}

/// Match-rule subsystem failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatchError {
    #[error("invalid match rule")]
    Invalid,
    #[error("match quota exceeded")]
    Quota,
    #[error("no such match rule")]
    NotFound,
}

impl From<UserError> for MatchError {
    fn from(_: UserError) -> Self {
        MatchError::Quota
    }
}

impl ErrorCode for MatchError {
    fn code(&self) -> &'static str {
        match self {
            Self::Invalid => "MATCH_INVALID",
            Self::Quota => "MATCH_QUOTA",
            Self::NotFound => "MATCH_NOT_FOUND",
        }
    }
    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Quota)
    }
}

/// Name-registry failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("name quota exceeded")]
    Quota,
    #[error("name not found")]
    NotFound,
    #[error("name not owned by peer")]
    NotOwner,
}

impl From<UserError> for NameError {
    fn from(_: UserError) -> Self {
        NameError::Quota
    }
}

impl ErrorCode for NameError {
    fn code(&self) -> &'static str {
        match self {
            Self::Quota => "NAME_QUOTA",
            Self::NotFound => "NAME_NOT_FOUND",
            Self::NotOwner => "NAME_NOT_OWNER",
        }
    }
    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Quota)
    }
}

/// Reply-slot failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplyError {
    /// The (caller, serial) pair already has an outstanding slot.
    #[error("serial already awaiting a reply")]
    Exists,
    #[error("reply quota exceeded")]
    Quota,
}

impl From<UserError> for ReplyError {
    fn from(_: UserError) -> Self {
        ReplyError::Quota
    }
}

impl ErrorCode for ReplyError {
    fn code(&self) -> &'static str {
        match self {
            Self::Exists => "REPLY_EXISTS",
            Self::Quota => "REPLY_QUOTA",
        }
    }
    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Quota)
    }
}

/// Transport seam failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Orderly end of stream.
    #[error("end of stream")]
    Eof,
    /// The outbound queue would exceed its bound.
    #[error("outbound quota exceeded")]
    Quota,
    /// I/O failure underneath the codec.
    #[error("connection i/o: {0}")]
    Io(String),
}

impl ErrorCode for ConnectionError {
    fn code(&self) -> &'static str {
        match self {
            Self::Eof => "CONNECTION_EOF",
            Self::Quota => "CONNECTION_QUOTA",
            Self::Io(_) => "CONNECTION_IO",
        }
    }
    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Quota)
    }
}

/// Peer and router level failures.
///
/// This is the enum the dispatch loop acts on: `Eof` turns into a graceful
/// goodbye, `ProtocolViolation` into an abrupt disconnect, and `Internal`
/// terminates the loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    #[error("peer quota exceeded")]
    Quota,
    #[error("connection refused by policy")]
    ConnectionRefused,
    #[error("peer hung up")]
    Eof,
    #[error("protocol violation")]
    ProtocolViolation,
    #[error("reply without a matching outstanding call")]
    UnexpectedReply,
    #[error("duplicate serial on an outstanding call")]
    ReplyExists,
    #[error("send denied by policy")]
    SendDenied,
    #[error("receive denied by policy")]
    ReceiveDenied,
    #[error("internal: {0}")]
    Internal(String),
}

impl From<ConnectionError> for PeerError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Eof => PeerError::Eof,
            ConnectionError::Quota => PeerError::Quota,
            ConnectionError::Io(msg) => PeerError::Internal(msg),
        }
    }
}

impl ErrorCode for PeerError {
    fn code(&self) -> &'static str {
        match self {
            Self::Quota => "PEER_QUOTA",
            Self::ConnectionRefused => "PEER_CONNECTION_REFUSED",
            Self::Eof => "PEER_EOF",
            Self::ProtocolViolation => "PEER_PROTOCOL_VIOLATION",
            Self::UnexpectedReply => "PEER_UNEXPECTED_REPLY",
            Self::ReplyExists => "PEER_REPLY_EXISTS",
            Self::SendDenied => "PEER_SEND_DENIED",
            Self::ReceiveDenied => "PEER_RECEIVE_DENIED",
            Self::Internal(_) => "PEER_INTERNAL",
        }
    }
    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Quota)
    }
}

/// Driver-level outcome of a method handler: a wire error to reply with,
/// or a condition the dispatch layer must act on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// Reply with the named wire error.
    #[error("wire error {name}: {text}")]
    Wire { name: &'static str, text: String },
    /// Disconnect the peer without a reply.
    #[error("protocol violation")]
    Violation,
    /// Terminate the dispatch loop.
    #[error("internal: {0}")]
    Internal(String),
}

impl DriverError {
    pub(crate) fn wire(name: &'static str, text: impl Into<String>) -> Self {
        Self::Wire {
            name,
            text: text.into(),
        }
    }
}

impl ErrorCode for DriverError {
    fn code(&self) -> &'static str {
        match self {
            Self::Wire { .. } => "DRIVER_WIRE_ERROR",
            Self::Violation => "DRIVER_PROTOCOL_VIOLATION",
            Self::Internal(_) => "DRIVER_INTERNAL",
        }
    }
    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Wire { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrobus_types::{assert_error_code, assert_error_codes};

    #[test]
    fn all_codes_are_well_formed() {
        assert_error_code(&UserError::Quota { slot: UserSlot::Bytes }, "USER_");
        assert_error_codes(
            &[MatchError::Invalid, MatchError::Quota, MatchError::NotFound],
            "MATCH_",
        );
        assert_error_codes(
            &[NameError::Quota, NameError::NotFound, NameError::NotOwner],
            "NAME_",
        );
        assert_error_codes(&[ReplyError::Exists, ReplyError::Quota], "REPLY_");
        assert_error_codes(
            &[
                ConnectionError::Eof,
                ConnectionError::Quota,
                ConnectionError::Io("x".into()),
            ],
            "CONNECTION_",
        );
        assert_error_codes(
            &[
                PeerError::Quota,
                PeerError::ConnectionRefused,
                PeerError::Eof,
                PeerError::ProtocolViolation,
                PeerError::UnexpectedReply,
                PeerError::ReplyExists,
                PeerError::SendDenied,
                PeerError::ReceiveDenied,
                PeerError::Internal("x".into()),
            ],
            "PEER_",
        );
    }

    #[test]
    fn quota_folds_across_layers() {
        assert_eq!(
            MatchError::from(UserError::Quota { slot: UserSlot::Matches }),
            MatchError::Quota
        );
        assert_eq!(
            PeerError::from(ConnectionError::Quota),
            PeerError::Quota
        );
        assert_eq!(PeerError::from(ConnectionError::Eof), PeerError::Eof);
    }
}
