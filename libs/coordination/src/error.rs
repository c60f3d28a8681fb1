//! Error codes for coordination-service operations.
//!
//! The variants mirror the fixed result-code table of the coordination
//! service so callers can match on them and, where needed, recover the stable
//! numeric code via [`ZkError::code`].

use thiserror::Error;

/// Result code of a failed coordination-service operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum ZkError {
    /// Generic system error; never returned by the server itself.
    #[error("system error")]
    SystemError,
    /// A runtime inconsistency was found.
    #[error("runtime inconsistency")]
    RuntimeInconsistency,
    /// A data inconsistency was found.
    #[error("data inconsistency")]
    DataInconsistency,
    /// Connection to the server has been lost.
    #[error("connection loss")]
    ConnectionLoss,
    /// Error while marshalling or unmarshalling data.
    #[error("marshalling error")]
    MarshallingError,
    /// Operation is unimplemented.
    #[error("unimplemented")]
    Unimplemented,
    /// Operation timed out.
    #[error("operation timeout")]
    OperationTimeout,
    /// Invalid arguments.
    #[error("bad arguments")]
    BadArguments,
    /// Invalid handle state.
    #[error("invalid state")]
    InvalidState,
    /// The coordination host list could not be resolved.
    #[error("dns failure")]
    DnsFailure,
    /// Generic API error.
    #[error("api error")]
    ApiError,
    /// Node does not exist.
    #[error("no node")]
    NoNode,
    /// Not authenticated.
    #[error("not authenticated")]
    NoAuth,
    /// Version conflict.
    #[error("bad version")]
    BadVersion,
    /// Ephemeral nodes may not have children.
    #[error("no children for ephemerals")]
    NoChildrenForEphemerals,
    /// The node already exists.
    #[error("node exists")]
    NodeExists,
    /// The node has children.
    #[error("not empty")]
    NotEmpty,
    /// The session has been expired by the server.
    #[error("session expired")]
    SessionExpired,
    /// Invalid callback specified.
    #[error("invalid callback")]
    InvalidCallback,
    /// Invalid ACL specified.
    #[error("invalid acl")]
    InvalidAcl,
    /// Client authentication failed.
    #[error("auth failed")]
    AuthFailed,
    /// The session is closing or closed.
    #[error("closing")]
    Closing,
    /// Not an error: no server responses to process.
    #[error("nothing")]
    Nothing,
    /// Session moved to another server, so the operation is ignored.
    #[error("session moved")]
    SessionMoved,
    /// Quota exceeded.
    #[error("quota exceeded")]
    NoQuota,
    /// Server overloaded.
    #[error("server overload")]
    ServerOverload,
    /// Digest encryption failed.
    #[error("digest encrypt failed")]
    EncryptFailed,
}

const CODES: &[(ZkError, i32)] = &[
    (ZkError::SystemError, -1),
    (ZkError::RuntimeInconsistency, -2),
    (ZkError::DataInconsistency, -3),
    (ZkError::ConnectionLoss, -4),
    (ZkError::MarshallingError, -5),
    (ZkError::Unimplemented, -6),
    (ZkError::OperationTimeout, -7),
    (ZkError::BadArguments, -8),
    (ZkError::InvalidState, -9),
    (ZkError::DnsFailure, -10),
    (ZkError::ApiError, -100),
    (ZkError::NoNode, -101),
    (ZkError::NoAuth, -102),
    (ZkError::BadVersion, -103),
    (ZkError::NoChildrenForEphemerals, -108),
    (ZkError::NodeExists, -110),
    (ZkError::NotEmpty, -111),
    (ZkError::SessionExpired, -112),
    (ZkError::InvalidCallback, -113),
    (ZkError::InvalidAcl, -114),
    (ZkError::AuthFailed, -115),
    (ZkError::Closing, -116),
    (ZkError::Nothing, -117),
    (ZkError::SessionMoved, -118),
    (ZkError::NoQuota, -119),
    (ZkError::ServerOverload, -120),
    (ZkError::EncryptFailed, -200),
];

impl ZkError {
    /// Stable numeric result code.
    pub fn code(&self) -> i32 {
        CODES
            .iter()
            .find(|(err, _)| err == self)
            .map(|(_, code)| *code)
            .unwrap_or(-1)
    }

    /// Map a numeric result code back to an error. `0` (ok) and unknown codes
    /// yield `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        CODES
            .iter()
            .find(|(_, c)| *c == code)
            .map(|(err, _)| *err)
    }

    /// Transient I/O failure: the session may still be alive and the
    /// operation can be retried once the connection comes back.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            ZkError::ConnectionLoss | ZkError::DnsFailure | ZkError::OperationTimeout
        )
    }

    /// Server-confirmed loss of the session; drives full recovery.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, ZkError::SessionExpired)
    }

    /// Returns true if retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        self.is_connection_loss() || matches!(self, ZkError::ServerOverload)
    }

    /// Returns true for server-side protocol/data errors that only concern
    /// the immediate caller (node exists, no node, bad version, ...).
    pub fn is_api_error(&self) -> bool {
        let code = self.code();
        code <= ZkError::ApiError.code()
            && code > ZkError::EncryptFailed.code()
            && !self.is_session_fatal()
    }
}

/// Shorthand result alias for coordination operations.
pub type ZkResult<T> = Result<T, ZkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ZkError::ConnectionLoss.is_connection_loss());
        assert!(ZkError::DnsFailure.is_connection_loss());
        assert!(ZkError::ConnectionLoss.is_retryable());
        assert!(!ZkError::ConnectionLoss.is_session_fatal());

        assert!(ZkError::SessionExpired.is_session_fatal());
        assert!(!ZkError::SessionExpired.is_retryable());
        assert!(!ZkError::SessionExpired.is_api_error());

        assert!(ZkError::NodeExists.is_api_error());
        assert!(ZkError::NoAuth.is_api_error());
        assert!(!ZkError::NodeExists.is_retryable());
        assert!(!ZkError::ConnectionLoss.is_api_error());
        assert!(!ZkError::EncryptFailed.is_api_error());
    }

    #[test]
    fn test_codes_match_result_table() {
        for (err, code) in CODES {
            assert_eq!(err.code(), *code);
            assert_eq!(ZkError::from_code(*code), Some(*err));
        }
        assert_eq!(ZkError::from_code(0), None);
    }

    #[test]
    fn test_dns_failure_is_distinct_from_connection_loss() {
        assert_ne!(ZkError::DnsFailure, ZkError::ConnectionLoss);
        assert_ne!(ZkError::DnsFailure.code(), ZkError::ConnectionLoss.code());
        assert_eq!(format!("{}", ZkError::DnsFailure), "dns failure");
    }
}
