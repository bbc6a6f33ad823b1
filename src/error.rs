use serde::Serialize;
use std::fmt;

/// Classification of a failed upstream call. Transport kinds
/// (`Timeout`, `Connection`) are retriable and feed the circuit breaker;
/// the rest describe protocol or gateway-side failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Timeout,
    Connection,
    BadStatus,
    PolicyViolation,
    Internal,
}

impl UpstreamErrorKind {
    pub fn is_transport(self) -> bool {
        matches!(self, UpstreamErrorKind::Timeout | UpstreamErrorKind::Connection)
    }
}

impl fmt::Display for UpstreamErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamErrorKind::Timeout => write!(f, "timeout"),
            UpstreamErrorKind::Connection => write!(f, "connection"),
            UpstreamErrorKind::BadStatus => write!(f, "bad status"),
            UpstreamErrorKind::PolicyViolation => write!(f, "policy violation"),
            UpstreamErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// Error attached to a single `UpstreamResponse`. Never aborts sibling
/// upstream calls; the aggregator maps it to a client-visible `JsonError`.
#[derive(Debug, Clone)]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    message: String,
}

impl UpstreamError {
    pub fn new(kind: UpstreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Timeout, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Connection, message)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Fold a policy violation into an existing error, keeping the original
    /// kind. Used by the dispatcher when a response both failed and violated
    /// its upstream policy.
    pub fn push_violation(&mut self, violation: &str) {
        self.message.push_str("; ");
        self.message.push_str(violation);
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for UpstreamError {}

/// Why a dispatch produced no upstream responses at all.
#[derive(Debug)]
pub enum DispatchError {
    /// The inbound body exceeded the configured cap.
    BodyTooLarge,
    /// The inbound body could not be read.
    BodyRead(String),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::BodyTooLarge => write!(f, "request body too large"),
            DispatchError::BodyRead(msg) => write!(f, "cannot read request body: {}", msg),
        }
    }
}

impl std::error::Error for DispatchError {}

pub const ERROR_CODE_RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
pub const ERROR_CODE_PAYLOAD_TOO_LARGE: &str = "PAYLOAD_TOO_LARGE";
pub const ERROR_CODE_UPSTREAM_UNAVAILABLE: &str = "UPSTREAM_UNAVAILABLE";
pub const ERROR_CODE_UPSTREAM_ERROR: &str = "UPSTREAM_ERROR";
pub const ERROR_CODE_INTERNAL: &str = "INTERNAL";

/// Client-visible error envelope. Serialized both standalone (top-level
/// error responses) and inside the aggregation envelope's `errors` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JsonError {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl JsonError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            request_id: None,
        }
    }
}

/// Map an `UpstreamError` to the envelope the client is allowed to see.
/// Internal detail (addresses, reqwest messages) never leaks through here.
pub fn map_upstream_error(err: &UpstreamError) -> JsonError {
    match err.kind {
        UpstreamErrorKind::Timeout | UpstreamErrorKind::Connection => JsonError::new(
            ERROR_CODE_UPSTREAM_UNAVAILABLE,
            "service temporarily unavailable",
        ),
        UpstreamErrorKind::BadStatus => JsonError::new(ERROR_CODE_UPSTREAM_ERROR, "upstream error"),
        _ => JsonError::new(ERROR_CODE_INTERNAL, "internal error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_violation_keeps_kind() {
        let mut err = UpstreamError::timeout("deadline exceeded");
        err.push_violation("empty body not allowed by upstream policy");
        assert_eq!(err.kind, UpstreamErrorKind::Timeout);
        assert!(err.message().contains("deadline exceeded"));
        assert!(err.message().contains("empty body"));
    }

    #[test]
    fn test_map_upstream_error_taxonomy() {
        let timeout = UpstreamError::timeout("t");
        assert_eq!(map_upstream_error(&timeout).code, ERROR_CODE_UPSTREAM_UNAVAILABLE);

        let conn = UpstreamError::connection("c");
        assert_eq!(map_upstream_error(&conn).code, ERROR_CODE_UPSTREAM_UNAVAILABLE);

        let bad = UpstreamError::new(UpstreamErrorKind::BadStatus, "503");
        assert_eq!(map_upstream_error(&bad).code, ERROR_CODE_UPSTREAM_ERROR);

        let policy = UpstreamError::new(UpstreamErrorKind::PolicyViolation, "p");
        assert_eq!(map_upstream_error(&policy).code, ERROR_CODE_INTERNAL);
    }

    #[test]
    fn test_json_error_omits_absent_request_id() {
        let err = JsonError::new(ERROR_CODE_INTERNAL, "internal error");
        let s = serde_json::to_string(&err).unwrap();
        assert!(!s.contains("request_id"));
    }
}
