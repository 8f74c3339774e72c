use std::fmt;

use serde::{Deserialize, Serialize};

/// Machine-readable error codes for caller-side decision making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    WriteConflict,
    ValidationRejected,
    TransportFailed,
    BulkResponseIncomplete,
    WriteFailedUnknown,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1002",
            Self::WriteConflict => "E4001",
            Self::ValidationRejected => "E4002",
            Self::TransportFailed => "E4003",
            Self::BulkResponseIncomplete => "E4004",
            Self::WriteFailedUnknown => "E4009",
        }
    }

    /// Short human-facing summary for logs and banners.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::WriteConflict => "Record changed on the server",
            Self::ValidationRejected => "Server rejected the values",
            Self::TransportFailed => "Could not reach the server",
            Self::BulkResponseIncomplete => "Bulk write response missing an entity",
            Self::WriteFailedUnknown => "Write failed",
        }
    }

    /// Optional remediation hint that can be surfaced to the user.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in .roster/config.toml and retry."),
            Self::WriteConflict => None,
            Self::ValidationRejected => Some("Correct the highlighted values and save again."),
            Self::TransportFailed => Some("Check your connection and retry."),
            Self::BulkResponseIncomplete => Some("Reload the grid; the row may not have saved."),
            Self::WriteFailedUnknown => Some("Retry once. If persistent, reload the page."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

// ---------------------------------------------------------------------------
// Write failures
// ---------------------------------------------------------------------------

/// Why a write did not commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureReason {
    /// The attached version token no longer matches the server (HTTP 412).
    Conflict,
    /// The server rejected the field values.
    Validation,
    /// Transport failure or timeout.
    Network,
    /// Anything else.
    Unknown,
}

impl FailureReason {
    #[must_use]
    pub const fn code(self) -> ErrorCode {
        match self {
            Self::Conflict => ErrorCode::WriteConflict,
            Self::Validation => ErrorCode::ValidationRejected,
            Self::Network => ErrorCode::TransportFailed,
            Self::Unknown => ErrorCode::WriteFailedUnknown,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::Validation => "validation",
            Self::Network => "network",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure of a single- or multi-entity write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {reason} write failure{detail}", code = .reason.code(), detail = detail_suffix(.message.as_deref()))]
pub struct WriteFailure {
    pub reason: FailureReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WriteFailure {
    #[must_use]
    pub const fn new(reason: FailureReason) -> Self {
        Self {
            reason,
            message: None,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub const fn conflict() -> Self {
        Self::new(FailureReason::Conflict)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureReason::Validation).with_message(message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FailureReason::Network).with_message(message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(FailureReason::Unknown).with_message(message)
    }

    /// A bulk response that carried no result for `entity_id`.
    pub fn missing_from_bulk(entity_id: impl fmt::Display) -> Self {
        Self::unknown(format!(
            "{} ({}): {entity_id}",
            ErrorCode::BulkResponseIncomplete.message(),
            ErrorCode::BulkResponseIncomplete.code()
        ))
    }

    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.reason.code()
    }

    /// Whether the caller should surface this failure to the user.
    ///
    /// Conflicts are reconciled by a background refetch and stay quiet.
    #[must_use]
    pub const fn should_notify(&self) -> bool {
        !matches!(self.reason, FailureReason::Conflict)
    }

    /// Whether a user-initiated retry has a chance of succeeding as-is.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.reason, FailureReason::Network)
    }
}

fn detail_suffix(message: Option<&str>) -> String {
    message.map(|m| format!(": {m}")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::{ErrorCode, FailureReason, WriteFailure};
    use std::collections::HashSet;

    #[test]
    fn all_codes_are_unique() {
        let all = [
            ErrorCode::ConfigParseError,
            ErrorCode::WriteConflict,
            ErrorCode::ValidationRejected,
            ErrorCode::TransportFailed,
            ErrorCode::BulkResponseIncomplete,
            ErrorCode::WriteFailedUnknown,
        ];

        let mut seen = HashSet::new();
        for code in all {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn code_format_is_machine_friendly() {
        let code = ErrorCode::WriteConflict.code();
        assert_eq!(code.len(), 5);
        assert!(code.starts_with('E'));
        assert!(code.chars().skip(1).all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn conflicts_are_silent() {
        assert!(!WriteFailure::conflict().should_notify());
        assert!(WriteFailure::validation("hours must be >= 0").should_notify());
        assert!(WriteFailure::network("timeout").should_notify());
        assert!(WriteFailure::unknown("boom").should_notify());
    }

    #[test]
    fn only_network_failures_are_retryable() {
        assert!(WriteFailure::network("reset").is_retryable());
        assert!(!WriteFailure::conflict().is_retryable());
        assert!(!WriteFailure::validation("bad").is_retryable());
    }

    #[test]
    fn display_includes_code_and_message() {
        let failure = WriteFailure::validation("hours must be >= 0");
        assert_eq!(
            failure.to_string(),
            "E4002: validation write failure: hours must be >= 0"
        );
        assert_eq!(WriteFailure::conflict().to_string(), "E4001: conflict write failure");
    }

    #[test]
    fn missing_bulk_result_is_unknown_with_code() {
        let failure = WriteFailure::missing_from_bulk("a9");
        assert_eq!(failure.reason, FailureReason::Unknown);
        let message = failure.message.expect("message");
        assert!(message.contains("E4004"));
        assert!(message.ends_with("a9"));
    }

    #[test]
    fn reason_serializes_lowercase() {
        let json = serde_json::to_string(&FailureReason::Conflict).expect("serialize");
        assert_eq!(json, "\"conflict\"");
    }
}
