//! Two error vocabularies live here, deliberately kept separate:
//!
//! - [`AppError`] is the process-exit-level error used while the server is
//!   still starting up (bad CLI args, unreadable config, no browser found).
//! - [`CoreError`] is the taxonomy from the design: every subsystem below
//!   the tool layer (connection, gateway, telemetry, session manager)
//!   returns one of these `kind`s, and the JSON-RPC layer turns it into a
//!   structured `{reason, suggestion, details?}` payload rather than a raw
//!   stack trace.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    ConnectionError = 2,
    ConfigError = 3,
    TimeoutError = 4,
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::GeneralError => write!(f, "general error"),
            Self::ConnectionError => write!(f, "connection error"),
            Self::ConfigError => write!(f, "config error"),
            Self::TimeoutError => write!(f, "timeout error"),
        }
    }
}

/// Startup-level error: printed once to stderr as JSON and turned into a
/// process exit code. Never surfaced mid-session — by the time the JSON-RPC
/// loop is running, failures flow through [`CoreError`] instead.
#[derive(Debug)]
pub struct AppError {
    pub message: String,
    pub code: ExitCode,
    /// Extra structured payload merged into the stderr JSON object, used by
    /// callers that want to surface more than a flat message (e.g. a
    /// `CoreError`'s `{reason, suggestion, details}` shape).
    pub custom_json: Option<Value>,
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

impl AppError {
    #[must_use]
    pub fn new(code: ExitCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            custom_json: None,
        }
    }

    #[must_use]
    pub fn with_json(mut self, value: Value) -> Self {
        self.custom_json = Some(value);
        self
    }

    #[must_use]
    pub fn to_json(&self) -> String {
        let mut output = serde_json::json!({ "error": self.message, "code": self.code as u8 });
        if let Some(extra) = &self.custom_json {
            if let Value::Object(map) = extra {
                if let Value::Object(out) = &mut output {
                    for (k, v) in map {
                        out.insert(k.clone(), v.clone());
                    }
                }
            } else {
                output["details"] = extra.clone();
            }
        }
        serde_json::to_string(&output)
            .unwrap_or_else(|_| format!(r#"{{"error":"{}","code":{}}}"#, self.message, self.code as u8))
    }

    pub fn print_json_stderr(&self) {
        eprintln!("{}", self.to_json());
    }
}

impl From<CoreError> for AppError {
    fn from(e: CoreError) -> Self {
        let code = match e.kind {
            ErrorKind::Timeout | ErrorKind::StateBrick => ExitCode::TimeoutError,
            ErrorKind::TransportFailure => ExitCode::ConnectionError,
            ErrorKind::NotConfigured | ErrorKind::PolicyViolation | ErrorKind::ValidationError => {
                ExitCode::ConfigError
            }
            ErrorKind::ProtocolViolation | ErrorKind::NotFound => ExitCode::GeneralError,
        };
        Self::new(code, e.reason.clone()).with_json(e.to_json())
    }
}

/// The taxonomy of *kinds* (not concrete types) described by the design:
/// each variant maps to a documented propagation policy rather than to a
/// single subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Socket closed, refused, or shut down mid-operation.
    TransportFailure,
    /// Wall-clock deadline exceeded (CDP response, RPC, peer hello, bind).
    Timeout,
    /// Malformed JSON, missing required field, wrong `type`, unknown
    /// extension id, protocol-version mismatch.
    ProtocolViolation,
    /// CDP calls begin timing out despite the transport appearing alive;
    /// surfaced to callers as `Timeout` but triggers soft recovery upstream.
    StateBrick,
    /// Extension mode with no connected extension; strict policy with no
    /// allow-list configured.
    NotConfigured,
    /// Forbidden scheme/host for `http`, cookie mutation in strict mode,
    /// sensitive literal without explicit allow.
    PolicyViolation,
    /// Unknown artifact id, unknown tab id.
    NotFound,
    /// Invalid id regex, invalid key, value too large.
    ValidationError,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransportFailure => "transport_failure",
            Self::Timeout => "timeout",
            Self::ProtocolViolation => "protocol_violation",
            Self::StateBrick => "state_brick",
            Self::NotConfigured => "not_configured",
            Self::PolicyViolation => "policy_violation",
            Self::NotFound => "not_found",
            Self::ValidationError => "validation_error",
        }
    }
}

/// A structured error carrying enough context for an agent to act on
/// without reading a stack trace: a short `reason`, an actionable
/// `suggestion`, and an optional `details` object. Never carries raw
/// secrets or absolute filesystem paths unless the caller opts in.
#[derive(Debug, Clone)]
pub struct CoreError {
    pub kind: ErrorKind,
    pub reason: String,
    pub suggestion: String,
    pub details: Option<Value>,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.reason)
    }
}

impl std::error::Error for CoreError {}

impl CoreError {
    #[must_use]
    pub fn new(kind: ErrorKind, reason: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            suggestion: suggestion.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    #[must_use]
    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Timeout,
            reason,
            "retry the call, or recover the session before retrying",
        )
    }

    #[must_use]
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::TransportFailure,
            reason,
            "the underlying connection closed; re-establish the session",
        )
    }

    #[must_use]
    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, reason, "check the id and try again")
    }

    #[must_use]
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::ValidationError,
            reason,
            "fix the argument and retry",
        )
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut obj = serde_json::json!({
            "reason": self.reason,
            "kind": self.kind.as_str(),
            "suggestion": self.suggestion,
        });
        if let Some(details) = &self.details {
            obj["details"] = details.clone();
        }
        obj
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_error_json_roundtrip() {
        let err = AppError::new(ExitCode::ConnectionError, "no chrome found");
        let json = err.to_json();
        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["error"], "no chrome found");
        assert_eq!(parsed["code"], 2);
    }

    #[test]
    fn core_error_to_json_includes_details() {
        let err = CoreError::timeout("CDP timed out").with_details(serde_json::json!({"tabId": "t1"}));
        let json = err.to_json();
        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["details"]["tabId"], "t1");
    }

    #[test]
    fn error_kind_as_str_matches_taxonomy() {
        assert_eq!(ErrorKind::StateBrick.as_str(), "state_brick");
        assert_eq!(ErrorKind::NotConfigured.as_str(), "not_configured");
    }
}
