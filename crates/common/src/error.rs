//! Common error types shared across crates.

use thiserror::Error;

/// A structured JSON-schema violation found while validating a KMS response.
///
/// The request engine only cares that validation failed; these variants exist
/// so trace events can say *what* failed without string matching.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaViolation {
    /// The body is not parseable JSON.
    #[error("response body is not valid JSON")]
    InvalidJson,

    /// A required field is absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// A field is present but has the wrong JSON type.
    #[error("field {field} has wrong type, expected {expected}")]
    WrongType {
        /// Offending field name.
        field: &'static str,
        /// Expected JSON type.
        expected: &'static str,
    },

    /// The response carries the reserved invalid wire version.
    #[error("response version is the reserved invalid version")]
    InvalidVersion,

    /// The response version is newer than this process supports.
    #[error("response version {version} exceeds max supported {max}")]
    UnsupportedVersion {
        /// Version found in the response.
        version: i64,
        /// Newest version this process understands.
        max: u32,
    },
}

/// Top-level connector error type.
///
/// Each variant maps to a distinct reportable error code on the RPC wire.
/// [`ConnectorError::is_reply_safe`] decides whether a worker may send the
/// error back to the caller or must let it tear the connector down.
#[derive(Debug, Clone, Error)]
pub enum ConnectorError {
    /// Discovery source or token source missing or malformed at bootstrap.
    #[error("invalid KMS configuration: {0}")]
    InvalidKmsConfig(String),

    /// Generic protocol violation (non-string URL, malformed token tuple).
    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// A configured file could not be found.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// Short read or other I/O failure on a configured file.
    #[error("i/o error: {0}")]
    IoError(String),

    /// A validation-token file exceeds the per-token size bound.
    #[error("token file {path} is {size} bytes, exceeds max {max}")]
    FileTooLarge {
        /// Path of the oversized file.
        path: String,
        /// Observed file size in bytes.
        size: u64,
        /// Configured per-token maximum.
        max: u64,
    },

    /// The combined validation-token payload exceeds its size bound.
    #[error("total token payload exceeds max {max} bytes")]
    ValueTooLarge {
        /// Configured total payload maximum.
        max: u64,
    },

    /// HTTP status other than 200, or a non-connectivity transport failure.
    #[error("HTTP request failed: {0}")]
    HttpRequestFailed(String),

    /// The transport could not reach the endpoint.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The transport-level per-call timeout fired.
    #[error("request timed out")]
    TimedOut,

    /// The KMS response failed JSON schema or version validation.
    #[error("malformed KMS response: {0}")]
    MalformedResponse(#[from] SchemaViolation),

    /// A returned base cipher exceeds the allowed length.
    #[error("base cipher is {len} bytes, exceeds max {max}")]
    MaxBaseCipherLen {
        /// Observed cipher length.
        len: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Every endpoint was exhausted, or the KMS returned an explicit error.
    #[error("failed to fetch encryption keys from KMS")]
    KeysFetchFailed,

    /// A configured mode has no implementation.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
}

impl ConnectorError {
    /// Whether this error may be sent back over an RPC reply channel.
    ///
    /// Anything outside this set is a bug or invariant violation, never a
    /// routine failure, and must instead propagate out of the worker and
    /// terminate the connector.
    pub fn is_reply_safe(&self) -> bool {
        matches!(
            self,
            ConnectorError::InvalidKmsConfig(_)
                | ConnectorError::OperationFailed(_)
                | ConnectorError::FileNotFound(_)
                | ConnectorError::IoError(_)
                | ConnectorError::FileTooLarge { .. }
                | ConnectorError::ValueTooLarge { .. }
                | ConnectorError::HttpRequestFailed(_)
                | ConnectorError::ConnectionFailed(_)
                | ConnectorError::TimedOut
                | ConnectorError::MalformedResponse(_)
                | ConnectorError::KeysFetchFailed
        )
    }

    /// Whether this error means the KMS endpoint is unreachable (as opposed
    /// to reachable but misbehaving). The request engine propagates these
    /// immediately on its second pass: re-running discovery will not help.
    pub fn is_kms_unreachable(&self) -> bool {
        matches!(
            self,
            ConnectorError::TimedOut | ConnectorError::ConnectionFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_safe_set() {
        assert!(ConnectorError::InvalidKmsConfig("x".into()).is_reply_safe());
        assert!(ConnectorError::KeysFetchFailed.is_reply_safe());
        assert!(ConnectorError::TimedOut.is_reply_safe());
        assert!(
            ConnectorError::MalformedResponse(SchemaViolation::MissingField("version"))
                .is_reply_safe()
        );

        // Oversized ciphers and unimplemented modes are fail-fast.
        assert!(!ConnectorError::MaxBaseCipherLen { len: 97, max: 96 }.is_reply_safe());
        assert!(!ConnectorError::NotImplemented("vault").is_reply_safe());
    }

    #[test]
    fn unreachable_errors() {
        assert!(ConnectorError::TimedOut.is_kms_unreachable());
        assert!(ConnectorError::ConnectionFailed("refused".into()).is_kms_unreachable());
        assert!(!ConnectorError::HttpRequestFailed("status 503".into()).is_kms_unreachable());
        assert!(!ConnectorError::KeysFetchFailed.is_kms_unreachable());
    }

    #[test]
    fn display_includes_detail() {
        let e = ConnectorError::FileTooLarge {
            path: "/tmp/token".into(),
            size: 2048,
            max: 1024,
        };
        let msg = e.to_string();
        assert!(msg.contains("/tmp/token"));
        assert!(msg.contains("2048"));
    }
}
