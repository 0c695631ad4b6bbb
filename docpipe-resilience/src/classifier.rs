//! Retryability rules for collaborator failures.

use docpipe_core::ServiceError;
use std::collections::HashSet;

/// Codes that describe a request that will never succeed as sent.
pub const DEFAULT_DENIED_CODES: [&str; 5] = [
    "ValidationException",
    "MalformedRequest",
    "AccessDenied",
    "ConditionalCheckFailed",
    "InvalidParameter",
];

/// 4xx codes that mean "slow down" rather than "wrong request".
pub const DEFAULT_ALLOWED_CODES: [&str; 5] = [
    "Throttling",
    "ThrottlingException",
    "TooManyRequests",
    "RequestLimitExceeded",
    "ProvisionedThroughputExceeded",
];

/// 4xx statuses that are worth retrying.
pub const DEFAULT_ALLOWED_STATUSES: [u16; 2] = [408, 429];

/// Decides whether a [`ServiceError`] is worth another attempt.
///
/// Rules are evaluated in order:
/// 1. a denied code is never retryable
/// 2. transport failures (timeout, reset, refused) are retryable
/// 3. status >= 500 is retryable
/// 4. status 400-499 is retryable only if the status or code is allow-listed
/// 5. everything else is retryable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationRules {
    denied_codes: HashSet<String>,
    allowed_codes: HashSet<String>,
    allowed_statuses: HashSet<u16>,
}

impl Default for ClassificationRules {
    fn default() -> Self {
        Self {
            denied_codes: DEFAULT_DENIED_CODES.iter().map(|c| c.to_string()).collect(),
            allowed_codes: DEFAULT_ALLOWED_CODES.iter().map(|c| c.to_string()).collect(),
            allowed_statuses: DEFAULT_ALLOWED_STATUSES.into_iter().collect(),
        }
    }
}

impl ClassificationRules {
    /// Rules with empty lists: every 4xx is final, everything else retries.
    pub fn empty() -> Self {
        Self {
            denied_codes: HashSet::new(),
            allowed_codes: HashSet::new(),
            allowed_statuses: HashSet::new(),
        }
    }

    pub fn with_denied_code(mut self, code: impl Into<String>) -> Self {
        self.denied_codes.insert(code.into());
        self
    }

    pub fn with_allowed_code(mut self, code: impl Into<String>) -> Self {
        self.allowed_codes.insert(code.into());
        self
    }

    pub fn with_allowed_status(mut self, status: u16) -> Self {
        self.allowed_statuses.insert(status);
        self
    }

    pub fn is_retryable(&self, error: &ServiceError) -> bool {
        if let Some(code) = error.code.as_deref() {
            if self.denied_codes.contains(code) {
                return false;
            }
        }

        if error.kind.is_transport() {
            return true;
        }

        match error.status_code() {
            Some(status) if status >= 500 => true,
            Some(status) if (400..500).contains(&status) => {
                self.allowed_statuses.contains(&status)
                    || error
                        .code
                        .as_deref()
                        .is_some_and(|code| self.allowed_codes.contains(code))
            }
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> ClassificationRules {
        ClassificationRules::default()
    }

    #[test]
    fn test_denied_code_wins_over_everything() {
        let err = ServiceError::status("metadata-store", 503, "unavailable")
            .with_code("ValidationException");
        assert!(!rules().is_retryable(&err));

        let timeout = ServiceError::timeout("metadata-store", "slow").with_code("AccessDenied");
        assert!(!rules().is_retryable(&timeout));
    }

    #[test]
    fn test_transport_failures_retry() {
        assert!(rules().is_retryable(&ServiceError::timeout("s", "t")));
        assert!(rules().is_retryable(&ServiceError::connection_reset("s", "r")));
        assert!(rules().is_retryable(&ServiceError::new(
            "s",
            docpipe_core::FailureKind::ConnectionRefused,
            "refused"
        )));
    }

    #[test]
    fn test_server_errors_retry() {
        for status in [500, 502, 503, 504, 599] {
            assert!(rules().is_retryable(&ServiceError::status("s", status, "x")));
        }
    }

    #[test]
    fn test_client_errors_need_allow_list() {
        assert!(!rules().is_retryable(&ServiceError::status("s", 400, "bad")));
        assert!(!rules().is_retryable(&ServiceError::status("s", 404, "missing")));
        assert!(rules().is_retryable(&ServiceError::status("s", 408, "timeout")));
        assert!(rules().is_retryable(&ServiceError::status("s", 429, "slow down")));

        let throttled =
            ServiceError::status("s", 400, "throttled").with_code("ThrottlingException");
        assert!(rules().is_retryable(&throttled));
    }

    #[test]
    fn test_unclassified_fails_open() {
        assert!(rules().is_retryable(&ServiceError::other("s", "mystery")));
        assert!(rules().is_retryable(&ServiceError::status("s", 302, "redirect")));
    }

    #[test]
    fn test_builder_extends_lists() {
        let custom = ClassificationRules::empty()
            .with_allowed_status(409)
            .with_allowed_code("SlowDown")
            .with_denied_code("Fatal");

        assert!(custom.is_retryable(&ServiceError::status("s", 409, "conflict")));
        assert!(custom.is_retryable(&ServiceError::status("s", 403, "x").with_code("SlowDown")));
        assert!(!custom.is_retryable(&ServiceError::status("s", 429, "slow")));
        assert!(!custom.is_retryable(&ServiceError::status("s", 500, "x").with_code("Fatal")));
    }
}
